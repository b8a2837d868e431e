use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use warden_core::config::EngineConfig;
use warden_core::{AgentStep, EventKind, EventSink, ExecutionContext, LifecycleEvent, WardenError};

use crate::factory::CancelRegistry;
use crate::registry::AgentClassRegistry;

/// Lifecycle status of one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl EngineStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

enum DriveOutcome {
    Finished { summary: String },
    Cancelled,
}

/// Owns all mutable state for one execution.
///
/// Exactly one engine exists per context, created by the factory and
/// driven end-to-end by one task. `execution_state` is private to this
/// instance and never handed out by reference; everything the outside
/// world sees leaves as an owned [`LifecycleEvent`].
pub struct ExecutionEngine {
    context: ExecutionContext,
    registry: Arc<AgentClassRegistry>,
    sink: Arc<dyn EventSink>,
    cancels: Arc<CancelRegistry>,
    cancel_rx: watch::Receiver<bool>,
    execution_state: HashMap<String, serde_json::Value>,
    status: EngineStatus,
    sequence: u64,
    last_error: Option<String>,
    max_steps: u32,
    run_timeout: Duration,
    cleaned_up: bool,
}

impl ExecutionEngine {
    pub(crate) fn new(
        context: ExecutionContext,
        registry: Arc<AgentClassRegistry>,
        sink: Arc<dyn EventSink>,
        cancels: Arc<CancelRegistry>,
        cancel_rx: watch::Receiver<bool>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            context,
            registry,
            sink,
            cancels,
            cancel_rx,
            execution_state: HashMap::new(),
            status: EngineStatus::Pending,
            sequence: 0,
            last_error: None,
            max_steps: config.max_steps,
            run_timeout: Duration::from_secs(config.run_timeout_secs),
            cleaned_up: false,
        }
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn status(&self) -> EngineStatus {
        self.status
    }

    /// Human-readable failure description, if the run ended in `error`.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Number of lifecycle events emitted so far.
    pub fn events_emitted(&self) -> u64 {
        self.sequence
    }

    /// Drive the agent named by the context through its lifecycle.
    ///
    /// Every failure is contained here: agent errors, a registry miss, the
    /// step ceiling, the run timeout, and cancellation all end in a
    /// terminal `error` event for this run alone. The caller is still
    /// responsible for [`cleanup`](Self::cleanup) on every exit path.
    pub async fn run(&mut self) -> EngineStatus {
        if self.status != EngineStatus::Pending {
            warn!(run_id = %self.context.run_id(), "run() called on a non-pending engine");
            return self.status;
        }

        self.sink
            .register_run(self.context.run_id(), self.context.user_id())
            .await;
        self.status = EngineStatus::Running;

        let outcome = tokio::time::timeout(self.run_timeout, self.drive()).await;
        match outcome {
            Ok(Ok(DriveOutcome::Finished { summary })) => {
                debug!(
                    run_id = %self.context.run_id(),
                    events = self.sequence,
                    summary = %summary,
                    "run completed"
                );
                self.status = EngineStatus::Completed;
            }
            Ok(Ok(DriveOutcome::Cancelled)) => {
                warn!(run_id = %self.context.run_id(), "run cancelled");
                self.fail("run cancelled", Some("cancelled")).await;
                self.status = EngineStatus::Cancelled;
            }
            Ok(Err(err)) => {
                warn!(run_id = %self.context.run_id(), error = %err, "run failed");
                self.fail(&err.to_string(), None).await;
                self.status = EngineStatus::Failed;
            }
            Err(_elapsed) => {
                warn!(
                    run_id = %self.context.run_id(),
                    timeout_secs = self.run_timeout.as_secs(),
                    "run timed out"
                );
                self.fail(
                    &format!("run timed out after {}s", self.run_timeout.as_secs()),
                    Some("timeout"),
                )
                .await;
                self.status = EngineStatus::Failed;
            }
        }
        self.status
    }

    async fn drive(&mut self) -> Result<DriveOutcome, WardenError> {
        let agent_type = self
            .context
            .agent_type()
            .map(str::to_string)
            .ok_or_else(|| {
                WardenError::AgentNotFound("context carries no agent_type".to_string())
            })?;
        let descriptor = self
            .registry
            .get(&agent_type)
            .ok_or_else(|| WardenError::AgentNotFound(agent_type.clone()))?;
        let mut agent = descriptor.construct();

        self.emit(EventKind::Started, json!({ "agent_type": agent_type }))
            .await?;

        let mut steps = 0u32;
        loop {
            // Cancellation is observed between steps; the run timeout bounds
            // a step that never returns.
            if *self.cancel_rx.borrow() {
                return Ok(DriveOutcome::Cancelled);
            }

            steps += 1;
            if steps > self.max_steps {
                return Err(WardenError::EngineExecutionFailure(format!(
                    "step ceiling of {} exceeded",
                    self.max_steps
                )));
            }

            match agent.next_step(&self.context).await? {
                AgentStep::Thinking { text } => {
                    self.execution_state
                        .insert("last_thought".to_string(), json!(text));
                    self.emit(EventKind::Thinking, json!({ "text": text }))
                        .await?;
                }
                AgentStep::ToolCall { tool, arguments } => {
                    self.emit(
                        EventKind::ToolExecuting,
                        json!({ "tool": tool, "arguments": arguments }),
                    )
                    .await?;
                    let result = agent.run_tool(&self.context, &tool, &arguments).await?;
                    self.execution_state
                        .insert(format!("tool:{tool}"), result.clone());
                    self.emit(
                        EventKind::ToolCompleted,
                        json!({ "tool": tool, "result": result }),
                    )
                    .await?;
                }
                AgentStep::Finish { summary } => {
                    self.emit(EventKind::Completed, json!({ "summary": summary }))
                        .await?;
                    return Ok(DriveOutcome::Finished { summary });
                }
            }
        }
    }

    /// Emit the terminal `error` event. A failure to publish at this point
    /// is logged, not propagated; the run is already failing.
    async fn fail(&mut self, message: &str, reason: Option<&str>) {
        self.last_error = Some(message.to_string());
        let mut payload = json!({ "message": message });
        if let Some(reason) = reason {
            payload["reason"] = json!(reason);
        }
        if let Err(err) = self.emit(EventKind::Error, payload).await {
            error!(
                run_id = %self.context.run_id(),
                error = %err,
                "failed to publish terminal error event"
            );
        }
    }

    async fn emit(&mut self, kind: EventKind, payload: serde_json::Value) -> Result<(), WardenError> {
        self.sequence += 1;
        let event = LifecycleEvent::for_context(&self.context, kind, self.sequence, payload);
        self.sink.publish(event).await
    }

    /// Release engine-owned registrations. Must run exactly once per
    /// engine on every exit path; a second call is a logged no-op.
    pub async fn cleanup(&mut self) {
        if self.cleaned_up {
            warn!(run_id = %self.context.run_id(), "cleanup() called more than once");
            return;
        }
        self.cleaned_up = true;
        self.sink.release_run(self.context.run_id()).await;
        self.cancels.release(self.context.run_id());
        self.execution_state.clear();
        debug!(run_id = %self.context.run_id(), "engine cleaned up");
    }
}
