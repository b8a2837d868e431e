use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{debug, info};

use warden_core::config::EngineConfig;
use warden_core::{EventSink, ExecutionContext, RunId};

use crate::engine::ExecutionEngine;
use crate::registry::AgentClassRegistry;

/// Cancellation signals keyed by run id.
///
/// Cancelling a run flips that run's watch channel and nothing else; no
/// other run's engine observes it.
pub struct CancelRegistry {
    senders: Mutex<HashMap<RunId, watch::Sender<bool>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self {
            senders: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn register(&self, run_id: &str) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        self.senders
            .lock()
            .expect("cancel registry lock poisoned")
            .insert(run_id.to_string(), tx);
        rx
    }

    /// Signal the owning engine to stop at its next safe point. Returns
    /// whether the run was known.
    pub fn cancel(&self, run_id: &str) -> bool {
        let senders = self.senders.lock().expect("cancel registry lock poisoned");
        match senders.get(run_id) {
            Some(tx) => {
                tx.send_replace(true);
                info!(run_id = %run_id, "run cancellation requested");
                true
            }
            None => false,
        }
    }

    pub(crate) fn release(&self, run_id: &str) {
        self.senders
            .lock()
            .expect("cancel registry lock poisoned")
            .remove(run_id);
    }

    pub fn active_runs(&self) -> usize {
        self.senders
            .lock()
            .expect("cancel registry lock poisoned")
            .len()
    }

    /// Signal every live run to stop. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let senders = self.senders.lock().expect("cancel registry lock poisoned");
        for tx in senders.values() {
            tx.send_replace(true);
        }
        senders.len()
    }
}

impl Default for CancelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds one fresh [`ExecutionEngine`] per context.
///
/// Two calls, even for contexts sharing a user id, yield engines with no
/// shared mutable storage; the only shared references handed out are the
/// frozen registry and the event sink.
pub struct ExecutionEngineFactory {
    registry: Arc<AgentClassRegistry>,
    sink: Arc<dyn EventSink>,
    cancels: Arc<CancelRegistry>,
    config: EngineConfig,
}

impl ExecutionEngineFactory {
    pub fn new(
        registry: Arc<AgentClassRegistry>,
        sink: Arc<dyn EventSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            sink,
            cancels: Arc::new(CancelRegistry::new()),
            config,
        }
    }

    /// Build exactly one new engine bound to `context`. The context is
    /// moved in; the engine owns it exclusively for the run's lifetime.
    pub fn create_for_context(&self, context: ExecutionContext) -> ExecutionEngine {
        let cancel_rx = self.cancels.register(context.run_id());
        debug!(
            run_id = %context.run_id(),
            user_id = %context.user_id(),
            "execution engine created"
        );
        ExecutionEngine::new(
            context,
            self.registry.clone(),
            self.sink.clone(),
            self.cancels.clone(),
            cancel_rx,
            &self.config,
        )
    }

    /// Cancel a run by id. Returns whether the run was known.
    pub fn cancel(&self, run_id: &str) -> bool {
        self.cancels.cancel(run_id)
    }

    /// Signal every live run to stop. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        self.cancels.cancel_all()
    }

    /// Number of runs that have not yet released their cancel channel.
    pub fn active_runs(&self) -> usize {
        self.cancels.active_runs()
    }

    pub fn registry(&self) -> &Arc<AgentClassRegistry> {
        &self.registry
    }
}
