use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::WardenError;
use crate::{ConnectionId, RequestId, RunId, ThreadId, UserId};

/// Sentinel values that must never appear as an identity field. These show
/// up when an upstream caller forwards an unauthenticated default instead
/// of a resolved identity.
const FORBIDDEN_IDENTITY_VALUES: &[&str] = &["placeholder", "unknown", "anonymous", "none", "null"];

/// Well-known `agent_context` key naming the agent type a run should execute.
pub const AGENT_TYPE_KEY: &str = "agent_type";

/// Well-known `audit_metadata` key recording the operation name of a child
/// context.
pub const OPERATION_KEY: &str = "operation";

/// Immutable identity and lineage of one unit of work.
///
/// A context is created once per top-level request via [`ExecutionContext::root`]
/// and derived for sub-operations via [`ExecutionContext::child`]. No method
/// mutates a context in place; derivation and augmentation return new values.
/// Contexts are freely shareable across task boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    user_id: UserId,
    thread_id: ThreadId,
    run_id: RunId,
    request_id: RequestId,
    parent_request_id: Option<RequestId>,
    operation_depth: u32,
    agent_context: HashMap<String, serde_json::Value>,
    audit_metadata: HashMap<String, String>,
    connection_id: Option<ConnectionId>,
}

impl ExecutionContext {
    /// Create a root context for a top-level request.
    ///
    /// Identity fields must be non-empty, not whitespace-only, and not one
    /// of the forbidden placeholder sentinels. Fails with
    /// [`WardenError::InvalidContext`] before any engine is built.
    pub fn root(
        user_id: impl Into<UserId>,
        thread_id: impl Into<ThreadId>,
        run_id: impl Into<RunId>,
        request_id: impl Into<RequestId>,
        agent_context: HashMap<String, serde_json::Value>,
        audit_metadata: HashMap<String, String>,
    ) -> Result<Self, WardenError> {
        let user_id = user_id.into();
        let thread_id = thread_id.into();
        let run_id = run_id.into();
        let request_id = request_id.into();

        validate_identity_field("user_id", &user_id)?;
        validate_identity_field("thread_id", &thread_id)?;
        validate_identity_field("run_id", &run_id)?;
        validate_identity_field("request_id", &request_id)?;

        Ok(Self {
            user_id,
            thread_id,
            run_id,
            request_id,
            parent_request_id: None,
            operation_depth: 0,
            agent_context,
            audit_metadata,
            connection_id: None,
        })
    }

    /// Derive a child context for a nested sub-operation.
    ///
    /// Preserves `user_id`/`thread_id`/`run_id`, generates a fresh
    /// `request_id`, links `parent_request_id` to this context's request id,
    /// and increments `operation_depth` by one. `additional_agent_context`
    /// keys win over the parent's on conflict.
    pub fn child(
        &self,
        operation_name: &str,
        additional_agent_context: HashMap<String, serde_json::Value>,
    ) -> Self {
        let mut agent_context = self.agent_context.clone();
        agent_context.extend(additional_agent_context);

        let mut audit_metadata = self.audit_metadata.clone();
        audit_metadata.insert(OPERATION_KEY.to_string(), operation_name.to_string());

        Self {
            user_id: self.user_id.clone(),
            thread_id: self.thread_id.clone(),
            run_id: self.run_id.clone(),
            request_id: uuid::Uuid::new_v4().to_string(),
            parent_request_id: Some(self.request_id.clone()),
            operation_depth: self.operation_depth + 1,
            agent_context,
            audit_metadata,
            connection_id: self.connection_id,
        }
    }

    /// Return a copy of this context with the given connection attached.
    pub fn with_connection(&self, connection_id: ConnectionId) -> Self {
        let mut next = self.clone();
        next.connection_id = Some(connection_id);
        next
    }

    /// Return a copy of this context with additional agent-context entries,
    /// new keys winning on conflict.
    pub fn with_agent_context(
        &self,
        additional: HashMap<String, serde_json::Value>,
    ) -> Self {
        let mut next = self.clone();
        next.agent_context.extend(additional);
        next
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn parent_request_id(&self) -> Option<&str> {
        self.parent_request_id.as_deref()
    }

    pub fn operation_depth(&self) -> u32 {
        self.operation_depth
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection_id
    }

    pub fn agent_context(&self) -> &HashMap<String, serde_json::Value> {
        &self.agent_context
    }

    pub fn audit_metadata(&self) -> &HashMap<String, String> {
        &self.audit_metadata
    }

    /// The agent type this run should execute, if the caller supplied one.
    pub fn agent_type(&self) -> Option<&str> {
        self.agent_context.get(AGENT_TYPE_KEY).and_then(|v| v.as_str())
    }

    /// Structural isolation predicate, used as defense-in-depth in tests.
    ///
    /// A context owns its maps outright and links to other executions by id
    /// only, so aliasing another context's storage is impossible in safe
    /// code. What remains observable: identity fields are valid and the
    /// depth/lineage fields are consistent with each other.
    pub fn verify_isolation(&self) -> bool {
        let ids_valid = [
            &self.user_id,
            &self.thread_id,
            &self.run_id,
            &self.request_id,
        ]
        .iter()
        .all(|id| validate_identity_field("id", id).is_ok());

        let lineage_consistent = match (&self.parent_request_id, self.operation_depth) {
            (None, 0) => true,
            (Some(parent), depth) => depth > 0 && parent != &self.request_id,
            (None, _) => false,
        };

        ids_valid && lineage_consistent
    }
}

fn validate_identity_field(field: &str, value: &str) -> Result<(), WardenError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(WardenError::InvalidContext(format!(
            "{field} must not be empty"
        )));
    }
    if FORBIDDEN_IDENTITY_VALUES
        .iter()
        .any(|forbidden| trimmed.eq_ignore_ascii_case(forbidden))
    {
        return Err(WardenError::InvalidContext(format!(
            "{field} must not be the placeholder value '{trimmed}'"
        )));
    }
    Ok(())
}
