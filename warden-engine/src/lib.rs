//! Agent type registry and per-run execution engines.
//!
//! The registry is written once during startup, frozen, and read-only for
//! the rest of the process lifetime. Every incoming request gets its own
//! [`ExecutionEngine`] from the factory; engines share nothing mutable with
//! each other and talk to the outside world only through owned
//! [`warden_core::LifecycleEvent`] values.

mod engine;
mod factory;
mod registry;
pub mod scripted;

pub use engine::{EngineStatus, ExecutionEngine};
pub use factory::{CancelRegistry, ExecutionEngineFactory};
pub use registry::AgentClassRegistry;
