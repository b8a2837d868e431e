use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use async_trait::async_trait;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, warn};

use warden_core::config::GatewayConfig;
use warden_core::{EventSink, LifecycleEvent, RunId, UserId, WardenError};

use crate::connections::ConnectionRegistry;

struct BufferedEvent {
    event: LifecycleEvent,
    buffered_at: Instant,
}

/// Delivers lifecycle events to exactly the connections of the user that
/// owns the originating run.
///
/// Backpressure policy, applied uniformly: each connection's queue is
/// bounded; a publish waits up to the configured delivery timeout on a
/// full queue, then drops that event for that connection only. A user with
/// no live connection gets a bounded reconnect buffer (drop-oldest, TTL-
/// pruned) drained in order when a connection attaches. Nothing in the
/// router grows without bound.
pub struct EventRouter {
    connections: Arc<ConnectionRegistry>,
    /// Ownership of live runs; the leakage check validates every event
    /// against this before delivery.
    run_owners: RwLock<HashMap<RunId, UserId>>,
    buffers: Mutex<HashMap<UserId, VecDeque<BufferedEvent>>>,
    buffer_capacity: usize,
    buffer_ttl: Duration,
    delivery_timeout: Duration,
    dropped: AtomicU64,
}

impl EventRouter {
    pub fn new(connections: Arc<ConnectionRegistry>, config: &GatewayConfig) -> Self {
        Self {
            connections,
            run_owners: RwLock::new(HashMap::new()),
            buffers: Mutex::new(HashMap::new()),
            buffer_capacity: config.buffer_capacity.max(1),
            buffer_ttl: Duration::from_secs(config.buffer_ttl_secs),
            delivery_timeout: Duration::from_millis(config.delivery_timeout_ms),
            dropped: AtomicU64::new(0),
        }
    }

    /// Total events dropped so far, across full queues and buffer
    /// overflow.
    pub fn events_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub async fn live_runs(&self) -> usize {
        self.run_owners.read().await.len()
    }

    pub async fn buffered_for(&self, user_id: &str) -> usize {
        self.buffers
            .lock()
            .await
            .get(user_id)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Drain the reconnect buffer for `user_id` through the normal
    /// delivery path, in buffered order. Call after a connection attaches.
    ///
    /// Holds the buffer lock for the whole drain, so a concurrent publish
    /// for the same user queues behind the buffered events instead of
    /// overtaking them.
    pub async fn flush_user(&self, user_id: &str) -> usize {
        let mut buffers = self.buffers.lock().await;
        let Some(mut queue) = buffers.remove(user_id) else {
            return 0;
        };
        self.prune_expired(&mut queue);
        let count = queue.len();
        if count > 0 {
            debug!(user_id = %user_id, count, "draining reconnect buffer");
        }
        for buffered in queue {
            if self.send_to_connections(&buffered.event).await {
                self.buffer_locked(&mut buffers, buffered.event);
            }
        }
        count
    }

    async fn deliver(&self, event: LifecycleEvent) {
        let mut buffers = self.buffers.lock().await;
        // Anything still buffered for this user is older than `event`;
        // sending directly here would reorder the stream.
        if buffers
            .get(&event.user_id)
            .is_some_and(|queue| !queue.is_empty())
        {
            self.buffer_locked(&mut buffers, event);
            return;
        }
        if self.send_to_connections(&event).await {
            self.buffer_locked(&mut buffers, event);
        }
    }

    /// Send one event to every live connection of its user. Returns true
    /// when the user should be treated as disconnected and the event
    /// buffered for reconnect.
    async fn send_to_connections(&self, event: &LifecycleEvent) -> bool {
        let senders = self.connections.senders_for(&event.user_id).await;
        if senders.is_empty() {
            return true;
        }

        let mut delivered = 0usize;
        let mut timed_out = 0usize;
        for (connection_id, sender) in senders {
            match sender
                .send_timeout(event.clone(), self.delivery_timeout)
                .await
            {
                Ok(()) => {
                    delivered += 1;
                    self.connections.touch(connection_id).await;
                }
                Err(SendTimeoutError::Timeout(_)) => {
                    timed_out += 1;
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        user_id = %event.user_id,
                        connection_id = %connection_id,
                        run_id = %event.run_id,
                        sequence = event.sequence_number,
                        "connection queue full, event dropped for this connection"
                    );
                }
                Err(SendTimeoutError::Closed(_)) => {
                    debug!(
                        connection_id = %connection_id,
                        "connection closed mid-delivery, removing"
                    );
                    let _ = self.connections.remove(connection_id).await;
                }
            }
        }

        // Every known connection turned out to be closed: treat the user
        // as disconnected.
        delivered == 0 && timed_out == 0
    }

    fn buffer_locked(
        &self,
        buffers: &mut HashMap<UserId, VecDeque<BufferedEvent>>,
        event: LifecycleEvent,
    ) {
        let queue = buffers.entry(event.user_id.clone()).or_default();
        self.prune_expired(queue);
        if queue.len() >= self.buffer_capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(user_id = %event.user_id, "reconnect buffer full, oldest event dropped");
        }
        queue.push_back(BufferedEvent {
            event,
            buffered_at: Instant::now(),
        });
    }

    fn prune_expired(&self, queue: &mut VecDeque<BufferedEvent>) {
        let now = Instant::now();
        while let Some(front) = queue.front() {
            if now.duration_since(front.buffered_at) > self.buffer_ttl {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            } else {
                break;
            }
        }
    }
}

#[async_trait]
impl EventSink for EventRouter {
    async fn register_run(&self, run_id: &str, user_id: &str) {
        let mut owners = self.run_owners.write().await;
        if let Some(previous) = owners.insert(run_id.to_string(), user_id.to_string()) {
            if previous != user_id {
                error!(
                    run_id = %run_id,
                    previous_owner = %previous,
                    new_owner = %user_id,
                    "run re-registered under a different user"
                );
            }
        }
    }

    /// Deliver one event to the owning user's connections.
    ///
    /// An event whose user does not match the registered owner of its run
    /// (or that names no live run at all) means the isolation invariant is
    /// broken upstream: fatal-and-alerted, never delivered.
    async fn publish(&self, event: LifecycleEvent) -> Result<(), WardenError> {
        {
            let owners = self.run_owners.read().await;
            match owners.get(&event.run_id) {
                Some(owner) if *owner == event.user_id => {}
                Some(owner) => {
                    error!(
                        run_id = %event.run_id,
                        event_user = %event.user_id,
                        owner = %owner,
                        "cross-user leakage detected, event rejected"
                    );
                    return Err(WardenError::CrossUserLeakageDetected {
                        run_id: event.run_id.clone(),
                        event_user: event.user_id.clone(),
                        owner: owner.clone(),
                    });
                }
                None => {
                    error!(
                        run_id = %event.run_id,
                        event_user = %event.user_id,
                        "event for unknown run, rejected"
                    );
                    return Err(WardenError::CrossUserLeakageDetected {
                        run_id: event.run_id.clone(),
                        event_user: event.user_id.clone(),
                        owner: "<no live run>".to_string(),
                    });
                }
            }
        }

        self.deliver(event).await;
        Ok(())
    }

    async fn release_run(&self, run_id: &str) {
        self.run_owners.write().await.remove(run_id);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as StdHashMap;

    use warden_core::context::AGENT_TYPE_KEY;
    use warden_core::{EventKind, ExecutionContext};

    use super::*;

    fn context_for(user: &str, run: &str) -> ExecutionContext {
        ExecutionContext::root(
            user,
            format!("{user}-thread"),
            run,
            uuid::Uuid::new_v4().to_string(),
            StdHashMap::from([(AGENT_TYPE_KEY.to_string(), serde_json::json!("triage"))]),
            StdHashMap::new(),
        )
        .unwrap()
    }

    fn event(ctx: &ExecutionContext, kind: EventKind, sequence: u64) -> LifecycleEvent {
        LifecycleEvent::for_context(ctx, kind, sequence, serde_json::json!({}))
    }

    fn router_with(config: GatewayConfig) -> (Arc<ConnectionRegistry>, EventRouter) {
        let connections = Arc::new(ConnectionRegistry::new(config.connection_queue_capacity));
        let router = EventRouter::new(connections.clone(), &config);
        (connections, router)
    }

    #[tokio::test]
    async fn delivers_only_to_the_owning_user() {
        let (connections, router) = router_with(GatewayConfig::default());
        let alice_ctx = context_for("alice", "run-a");
        let bob_ctx = context_for("bob", "run-b");
        router.register_run("run-a", "alice").await;
        router.register_run("run-b", "bob").await;

        let mut alice = connections.add("alice").await;
        let mut bob = connections.add("bob").await;

        router
            .publish(event(&alice_ctx, EventKind::ToolExecuting, 1))
            .await
            .unwrap();
        router
            .publish(event(&bob_ctx, EventKind::ToolExecuting, 1))
            .await
            .unwrap();

        let got = bob.events.recv().await.unwrap();
        assert_eq!(got.user_id, "bob");
        assert_eq!(got.run_id, "run-b");
        // Bob's queue holds nothing further; Alice's event never reached it.
        assert!(bob.events.try_recv().is_err());

        let got = alice.events.recv().await.unwrap();
        assert_eq!(got.user_id, "alice");
    }

    #[tokio::test]
    async fn per_run_order_is_preserved() {
        let (connections, router) = router_with(GatewayConfig::default());
        let ctx = context_for("alice", "run-a");
        router.register_run("run-a", "alice").await;
        let mut handle = connections.add("alice").await;

        for sequence in 1..=5 {
            router
                .publish(event(&ctx, EventKind::Thinking, sequence))
                .await
                .unwrap();
        }

        for expected in 1..=5 {
            let got = handle.events.recv().await.unwrap();
            assert_eq!(got.sequence_number, expected);
        }
    }

    #[tokio::test]
    async fn mismatched_user_is_rejected_as_leakage() {
        let (_connections, router) = router_with(GatewayConfig::default());
        router.register_run("run-a", "alice").await;

        // A forged event: bob's identity on alice's run.
        let forged_ctx = context_for("bob", "run-a");
        let result = router
            .publish(event(&forged_ctx, EventKind::Completed, 1))
            .await;
        assert!(matches!(
            result,
            Err(WardenError::CrossUserLeakageDetected { ref owner, .. }) if owner == "alice"
        ));
    }

    #[tokio::test]
    async fn unknown_run_is_rejected() {
        let (_connections, router) = router_with(GatewayConfig::default());
        let ctx = context_for("alice", "run-ghost");
        let result = router.publish(event(&ctx, EventKind::Started, 1)).await;
        assert!(matches!(
            result,
            Err(WardenError::CrossUserLeakageDetected { .. })
        ));
    }

    #[tokio::test]
    async fn buffers_while_disconnected_and_drains_on_reconnect() {
        let (connections, router) = router_with(GatewayConfig::default());
        let ctx = context_for("alice", "run-a");
        router.register_run("run-a", "alice").await;

        for sequence in 1..=3 {
            router
                .publish(event(&ctx, EventKind::Thinking, sequence))
                .await
                .unwrap();
        }
        assert_eq!(router.buffered_for("alice").await, 3);

        let mut handle = connections.add("alice").await;
        assert_eq!(router.flush_user("alice").await, 3);
        assert_eq!(router.buffered_for("alice").await, 0);

        for expected in 1..=3 {
            let got = handle.events.recv().await.unwrap();
            assert_eq!(got.sequence_number, expected);
        }
    }

    #[tokio::test]
    async fn publish_between_attach_and_drain_stays_ordered() {
        let (connections, router) = router_with(GatewayConfig::default());
        let ctx = context_for("alice", "run-a");
        router.register_run("run-a", "alice").await;

        for sequence in 1..=2 {
            router
                .publish(event(&ctx, EventKind::Thinking, sequence))
                .await
                .unwrap();
        }

        // A connection attaches and a publish lands before the buffer is
        // drained; it must queue behind the older buffered events.
        let mut handle = connections.add("alice").await;
        router
            .publish(event(&ctx, EventKind::Thinking, 3))
            .await
            .unwrap();
        assert_eq!(router.flush_user("alice").await, 3);

        for expected in 1..=3 {
            let got = handle.events.recv().await.unwrap();
            assert_eq!(got.sequence_number, expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn expired_buffered_events_are_pruned() {
        let config = GatewayConfig {
            buffer_ttl_secs: 60,
            ..GatewayConfig::default()
        };
        let (connections, router) = router_with(config);
        let ctx = context_for("alice", "run-a");
        router.register_run("run-a", "alice").await;

        for sequence in 1..=2 {
            router
                .publish(event(&ctx, EventKind::Thinking, sequence))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_secs(61)).await;

        // The next publish prunes the stale events before buffering itself.
        router
            .publish(event(&ctx, EventKind::Thinking, 3))
            .await
            .unwrap();
        assert_eq!(router.buffered_for("alice").await, 1);
        assert_eq!(router.events_dropped(), 2);

        let mut handle = connections.add("alice").await;
        assert_eq!(router.flush_user("alice").await, 1);
        assert_eq!(handle.events.recv().await.unwrap().sequence_number, 3);
    }

    #[tokio::test]
    async fn reconnect_buffer_drops_oldest_on_overflow() {
        let config = GatewayConfig {
            buffer_capacity: 2,
            ..GatewayConfig::default()
        };
        let (connections, router) = router_with(config);
        let ctx = context_for("alice", "run-a");
        router.register_run("run-a", "alice").await;

        for sequence in 1..=3 {
            router
                .publish(event(&ctx, EventKind::Thinking, sequence))
                .await
                .unwrap();
        }
        assert_eq!(router.buffered_for("alice").await, 2);
        assert_eq!(router.events_dropped(), 1);

        let mut handle = connections.add("alice").await;
        router.flush_user("alice").await;
        assert_eq!(handle.events.recv().await.unwrap().sequence_number, 2);
        assert_eq!(handle.events.recv().await.unwrap().sequence_number, 3);
    }

    #[tokio::test]
    async fn full_connection_queue_drops_for_that_connection_only() {
        let config = GatewayConfig {
            connection_queue_capacity: 1,
            delivery_timeout_ms: 10,
            ..GatewayConfig::default()
        };
        let (connections, router) = router_with(config);
        let ctx = context_for("alice", "run-a");
        router.register_run("run-a", "alice").await;
        let mut handle = connections.add("alice").await;

        // First event fills the queue; the second times out and is dropped.
        router
            .publish(event(&ctx, EventKind::Started, 1))
            .await
            .unwrap();
        router
            .publish(event(&ctx, EventKind::Thinking, 2))
            .await
            .unwrap();
        assert_eq!(router.events_dropped(), 1);

        assert_eq!(handle.events.recv().await.unwrap().sequence_number, 1);
        assert!(handle.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_connection_is_pruned_and_event_buffered() {
        let (connections, router) = router_with(GatewayConfig::default());
        let ctx = context_for("alice", "run-a");
        router.register_run("run-a", "alice").await;

        let handle = connections.add("alice").await;
        drop(handle);

        router
            .publish(event(&ctx, EventKind::Started, 1))
            .await
            .unwrap();
        assert!(connections.connections_for("alice").await.is_empty());
        assert_eq!(router.buffered_for("alice").await, 1);
    }

    #[tokio::test]
    async fn release_run_forgets_ownership() {
        let (_connections, router) = router_with(GatewayConfig::default());
        router.register_run("run-a", "alice").await;
        assert_eq!(router.live_runs().await, 1);

        router.release_run("run-a").await;
        assert_eq!(router.live_runs().await, 0);

        let ctx = context_for("alice", "run-a");
        let result = router.publish(event(&ctx, EventKind::Completed, 9)).await;
        assert!(matches!(
            result,
            Err(WardenError::CrossUserLeakageDetected { .. })
        ));
    }
}
