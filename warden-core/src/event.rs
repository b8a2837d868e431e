use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::ExecutionContext;
use crate::error::WardenError;
use crate::{RunId, ThreadId, UserId};

/// Lifecycle event vocabulary. `completed` and `error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Started,
    Thinking,
    ToolExecuting,
    ToolCompleted,
    Completed,
    Error,
}

impl EventKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Thinking => "thinking",
            Self::ToolExecuting => "tool_executing",
            Self::ToolCompleted => "tool_completed",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

/// A typed, sequenced notification describing progress of one run.
///
/// Events can only be built from an [`ExecutionContext`], so every event's
/// identity fields are bound to the context that produced it. Events are
/// owned values; publishing clones them per connection, never aliases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub user_id: UserId,
    pub thread_id: ThreadId,
    pub run_id: RunId,
    pub sequence_number: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl LifecycleEvent {
    /// Build an event carrying the identity of `context`.
    pub fn for_context(
        context: &ExecutionContext,
        kind: EventKind,
        sequence_number: u64,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            user_id: context.user_id().to_string(),
            thread_id: context.thread_id().to_string(),
            run_id: context.run_id().to_string(),
            sequence_number,
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Seam between engines and the delivery layer.
///
/// Engines announce run ownership before the first event, publish owned
/// event values while running, and release ownership during cleanup. The
/// delivery side rejects events whose identity does not match a live run.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Record that `run_id` is owned by `user_id` for the duration of one
    /// execution.
    async fn register_run(&self, run_id: &str, user_id: &str);

    /// Deliver one event to the owning user's connections.
    async fn publish(&self, event: LifecycleEvent) -> Result<(), WardenError>;

    /// Drop the run ownership record. Called exactly once from engine
    /// cleanup.
    async fn release_run(&self, run_id: &str);
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn event_binds_context_identity() {
        let ctx = ExecutionContext::root(
            "alice",
            "thread-9",
            "run-42",
            "req-1",
            HashMap::new(),
            HashMap::new(),
        )
        .unwrap();

        let event =
            LifecycleEvent::for_context(&ctx, EventKind::Started, 1, serde_json::json!({}));
        assert_eq!(event.user_id, "alice");
        assert_eq!(event.thread_id, "thread-9");
        assert_eq!(event.run_id, "run-42");
        assert_eq!(event.sequence_number, 1);
    }

    #[test]
    fn wire_shape_uses_snake_case_kinds() {
        let ctx = ExecutionContext::root(
            "alice",
            "t",
            "r",
            "q",
            HashMap::new(),
            HashMap::new(),
        )
        .unwrap();
        let event = LifecycleEvent::for_context(
            &ctx,
            EventKind::ToolExecuting,
            3,
            serde_json::json!({"tool": "search"}),
        );

        let wire: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["type"], "tool_executing");
        assert_eq!(wire["sequence_number"], 3);
        assert_eq!(wire["payload"]["tool"], "search");
    }
}
