//! Shared value types for the warden execution runtime.
//!
//! Everything in this crate is either an immutable value (contexts, events,
//! descriptors) or pure data (config, errors). All mutable runtime state
//! lives in `warden-engine` and `warden-gateway`.

pub mod config;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod event;

pub use context::ExecutionContext;
pub use descriptor::{Agent, AgentDescriptor, AgentStep};
pub use error::WardenError;
pub use event::{EventKind, EventSink, LifecycleEvent};

/// Tenant identity, supplied by the auth collaborator.
pub type UserId = String;
/// Conversation thread identity.
pub type ThreadId = String;
/// One execution run. Cancellation is keyed by this.
pub type RunId = String;
/// One request within a run; child contexts get a fresh one.
pub type RequestId = String;
/// A live outbound connection.
pub type ConnectionId = uuid::Uuid;
