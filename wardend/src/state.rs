use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use warden_engine::{AgentClassRegistry, ExecutionEngineFactory};
use warden_gateway::{ConnectionRegistry, EventRouter};

/// Terminal-or-running summary of one submitted run.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub run_id: String,
    pub user_id: String,
    pub thread_id: String,
    pub agent_type: String,
    pub status: String,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Shared state for the HTTP layer.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<AgentClassRegistry>,
    pub factory: Arc<ExecutionEngineFactory>,
    pub connections: Arc<ConnectionRegistry>,
    pub router: Arc<EventRouter>,
    /// Run index for `GET /runs/{id}`. Bounded: finished records beyond
    /// `run_index_capacity` are evicted oldest-first.
    pub runs: Arc<RwLock<HashMap<String, RunRecord>>>,
    pub run_index_capacity: usize,
    pub started_at: Instant,
}

/// Evict the oldest finished records once more than `cap` of them exist.
/// Live runs are never evicted.
pub fn prune_finished_runs(runs: &mut HashMap<String, RunRecord>, cap: usize) {
    let mut finished: Vec<(String, DateTime<Utc>)> = runs
        .iter()
        .filter_map(|(run_id, record)| record.finished_at.map(|at| (run_id.clone(), at)))
        .collect();
    if finished.len() <= cap {
        return;
    }
    finished.sort_by_key(|(_, finished_at)| *finished_at);
    let excess = finished.len() - cap;
    for (run_id, _) in finished.into_iter().take(excess) {
        runs.remove(&run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(run_id: &str, finished_at: Option<DateTime<Utc>>) -> RunRecord {
        RunRecord {
            run_id: run_id.to_string(),
            user_id: "alice".to_string(),
            thread_id: "thread-1".to_string(),
            agent_type: "triage".to_string(),
            status: if finished_at.is_some() {
                "completed"
            } else {
                "running"
            }
            .to_string(),
            submitted_at: Utc::now(),
            finished_at,
            error: None,
        }
    }

    #[test]
    fn prune_evicts_oldest_finished_only() {
        let now = Utc::now();
        let mut runs = HashMap::new();
        runs.insert(
            "old".to_string(),
            record("old", Some(now - chrono::Duration::minutes(10))),
        );
        runs.insert("recent".to_string(), record("recent", Some(now)));
        runs.insert("live".to_string(), record("live", None));

        prune_finished_runs(&mut runs, 1);

        assert!(!runs.contains_key("old"));
        assert!(runs.contains_key("recent"));
        assert!(runs.contains_key("live"));
    }

    #[test]
    fn prune_under_cap_keeps_everything() {
        let now = Utc::now();
        let mut runs = HashMap::new();
        runs.insert("a".to_string(), record("a", Some(now)));
        runs.insert("b".to_string(), record("b", None));

        prune_finished_runs(&mut runs, 8);
        assert_eq!(runs.len(), 2);
    }
}
