use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use warden_core::{AgentDescriptor, WardenError};

struct RegistryInner {
    descriptors: HashMap<String, AgentDescriptor>,
    frozen_at: Option<DateTime<Utc>>,
}

/// Process-wide catalogue of agent types.
///
/// Mutable only before [`freeze`](Self::freeze); the freeze transition
/// happens exactly once, after which every operation is read-only and the
/// read lock is never contended by a writer again. No per-user state lives
/// here.
pub struct AgentClassRegistry {
    inner: RwLock<RegistryInner>,
    frozen_tx: watch::Sender<bool>,
}

impl AgentClassRegistry {
    pub fn new() -> Self {
        let (frozen_tx, _) = watch::channel(false);
        Self {
            inner: RwLock::new(RegistryInner {
                descriptors: HashMap::new(),
                frozen_at: None,
            }),
            frozen_tx,
        }
    }

    /// Register an agent type.
    ///
    /// Re-registering an identical descriptor is a no-op. The same name
    /// with a different descriptor is a [`WardenError::DuplicateConflict`];
    /// any registration after freeze is a [`WardenError::FrozenViolation`].
    /// Startup should treat either as fatal rather than proceed with a
    /// partial catalogue.
    pub fn register(&self, descriptor: AgentDescriptor) -> Result<(), WardenError> {
        if descriptor.name.trim().is_empty() {
            return Err(WardenError::InvalidArgument(
                "agent type name must not be empty".to_string(),
            ));
        }

        let mut inner = self.inner.write().expect("registry lock poisoned");

        if let Some(frozen_at) = inner.frozen_at {
            return Err(WardenError::FrozenViolation {
                name: descriptor.name,
                frozen_at,
            });
        }

        match inner.descriptors.get(&descriptor.name) {
            Some(existing) if existing.same_registration(&descriptor) => {
                debug!(name = %descriptor.name, "duplicate identical registration ignored");
                Ok(())
            }
            Some(_) => Err(WardenError::DuplicateConflict {
                name: descriptor.name,
            }),
            None => {
                info!(
                    name = %descriptor.name,
                    version = %descriptor.version,
                    dependencies = descriptor.dependencies.len(),
                    "agent type registered"
                );
                inner
                    .descriptors
                    .insert(descriptor.name.clone(), descriptor);
                Ok(())
            }
        }
    }

    /// Transition to read-only. Idempotent; the timestamp is recorded on
    /// the first call only.
    pub fn freeze(&self) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        if inner.frozen_at.is_none() {
            inner.frozen_at = Some(Utc::now());
            info!(agents = inner.descriptors.len(), "agent registry frozen");
        }
        drop(inner);
        self.frozen_tx.send_replace(true);
    }

    pub fn is_frozen(&self) -> bool {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .frozen_at
            .is_some()
    }

    pub fn frozen_at(&self) -> Option<DateTime<Utc>> {
        self.inner.read().expect("registry lock poisoned").frozen_at
    }

    /// Look up a descriptor by name. Safe from any number of concurrent
    /// readers, before or after freeze.
    pub fn get(&self, name: &str) -> Option<AgentDescriptor> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .descriptors
            .get(name)
            .cloned()
    }

    /// Per registered name, the declared dependencies that are not
    /// themselves registered. Names with no missing dependencies are
    /// omitted.
    pub fn validate_dependencies(&self) -> HashMap<String, Vec<String>> {
        let inner = self.inner.read().expect("registry lock poisoned");
        let mut missing = HashMap::new();
        for (name, descriptor) in &inner.descriptors {
            let absent: Vec<String> = descriptor
                .dependencies
                .iter()
                .filter(|dep| !inner.descriptors.contains_key(*dep))
                .cloned()
                .collect();
            if !absent.is_empty() {
                warn!(name = %name, missing = ?absent, "agent type has unregistered dependencies");
                missing.insert(name.clone(), absent);
            }
        }
        missing
    }

    /// All registered names in sorted order.
    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .read()
            .expect("registry lock poisoned")
            .descriptors
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .descriptors
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until startup registration has frozen the registry, bounded
    /// by `timeout`. Returns whether the registry is frozen.
    pub async fn wait_frozen(&self, timeout: Duration) -> bool {
        let mut rx = self.frozen_tx.subscribe();
        let wait = async {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    return false;
                }
            }
            true
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }
}

impl Default for AgentClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}
