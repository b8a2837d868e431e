//! Per-user connection registry and lifecycle event routing.
//!
//! The registry tracks which outbound connections belong to which user;
//! the router consumes engine events and delivers each one only to the
//! connections of the user that owns the originating run.

mod connections;
mod router;

pub use connections::{ConnectionHandle, ConnectionRecord, ConnectionRegistry};
pub use router::EventRouter;
