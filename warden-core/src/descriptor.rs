use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::ExecutionContext;
use crate::error::WardenError;

/// One step of agent progress, as reported to the driving engine.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentStep {
    /// The agent is reasoning; surfaced as a `thinking` event.
    Thinking { text: String },
    /// The agent wants a tool invoked; surfaced as `tool_executing` /
    /// `tool_completed` events around [`Agent::run_tool`].
    ToolCall {
        tool: String,
        arguments: serde_json::Value,
    },
    /// The agent is done; surfaced as the terminal `completed` event.
    Finish { summary: String },
}

/// Capability contract every registrable agent type must satisfy.
///
/// The engine owns the lifecycle state machine; an implementation only
/// reports steps and executes its own tools. Errors returned here are
/// caught at the engine boundary and become a terminal `error` event for
/// that run alone.
#[async_trait]
pub trait Agent: Send {
    /// Produce the next step for this run.
    async fn next_step(&mut self, context: &ExecutionContext) -> Result<AgentStep, WardenError>;

    /// Execute a tool previously announced via [`AgentStep::ToolCall`].
    async fn run_tool(
        &mut self,
        context: &ExecutionContext,
        tool: &str,
        arguments: &serde_json::Value,
    ) -> Result<serde_json::Value, WardenError>;
}

/// Builds a fresh agent instance for one run. Constructors must not capture
/// mutable state shared across runs.
pub type AgentConstructor = Arc<dyn Fn() -> Box<dyn Agent> + Send + Sync>;

/// Registered description of one agent type.
///
/// Immutable once the registry is frozen. The capability check the
/// registry used to need at runtime is carried by the [`Agent`] bound on
/// the constructor instead.
#[derive(Clone)]
pub struct AgentDescriptor {
    pub name: String,
    pub description: String,
    pub version: String,
    pub dependencies: Vec<String>,
    pub metadata: HashMap<String, String>,
    constructor: AgentConstructor,
}

impl AgentDescriptor {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        constructor: AgentConstructor,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            version: "1.0.0".to_string(),
            dependencies: Vec::new(),
            metadata: HashMap::new(),
            constructor,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Declare dependencies on other agent types, preserving declaration
    /// order and dropping duplicates.
    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = Vec::new();
        for dep in dependencies {
            let dep = dep.into();
            if !seen.contains(&dep) {
                seen.push(dep);
            }
        }
        self.dependencies = seen;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Build a fresh, independent agent instance.
    pub fn construct(&self) -> Box<dyn Agent> {
        (self.constructor)()
    }

    /// Whether re-registering `other` under this descriptor's name is a
    /// no-op. Field equality plus pointer equality on the constructor; a
    /// matching descriptor with a different constructor closure is a
    /// conflict.
    pub fn same_registration(&self, other: &Self) -> bool {
        self.name == other.name
            && self.description == other.description
            && self.version == other.version
            && self.dependencies == other.dependencies
            && self.metadata == other.metadata
            && Arc::ptr_eq(&self.constructor, &other.constructor)
    }
}

impl fmt::Debug for AgentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentDescriptor")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("version", &self.version)
            .field("dependencies", &self.dependencies)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullAgent;

    #[async_trait]
    impl Agent for NullAgent {
        async fn next_step(
            &mut self,
            _context: &ExecutionContext,
        ) -> Result<AgentStep, WardenError> {
            Ok(AgentStep::Finish {
                summary: "done".to_string(),
            })
        }

        async fn run_tool(
            &mut self,
            _context: &ExecutionContext,
            _tool: &str,
            _arguments: &serde_json::Value,
        ) -> Result<serde_json::Value, WardenError> {
            Ok(serde_json::Value::Null)
        }
    }

    fn null_constructor() -> AgentConstructor {
        Arc::new(|| Box::new(NullAgent))
    }

    #[test]
    fn defaults() {
        let descriptor = AgentDescriptor::new("triage", "routes work", null_constructor());
        assert_eq!(descriptor.version, "1.0.0");
        assert!(descriptor.dependencies.is_empty());
        assert!(descriptor.metadata.is_empty());
    }

    #[test]
    fn dependencies_dedup_preserves_order() {
        let descriptor = AgentDescriptor::new("data", "fetches", null_constructor())
            .with_dependencies(["triage", "search", "triage"]);
        assert_eq!(descriptor.dependencies, vec!["triage", "search"]);
    }

    #[test]
    fn same_registration_requires_same_constructor() {
        let constructor = null_constructor();
        let a = AgentDescriptor::new("triage", "routes work", constructor.clone());
        let b = AgentDescriptor::new("triage", "routes work", constructor);
        let c = AgentDescriptor::new("triage", "routes work", null_constructor());

        assert!(a.same_registration(&b));
        assert!(!a.same_registration(&c));
    }

    #[test]
    fn same_registration_compares_fields() {
        let constructor = null_constructor();
        let a = AgentDescriptor::new("triage", "routes work", constructor.clone());
        let b = AgentDescriptor::new("triage", "routes work", constructor.clone())
            .with_version("2.0.0");
        assert!(!a.same_registration(&b));
    }
}
