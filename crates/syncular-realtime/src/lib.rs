//! Realtime connection registry: scope-keyed WebSocket fan-out with
//! presence, bounded connection limits, and a cross-instance broadcaster
//! seam.

pub mod broadcast;
pub mod registry;

pub use broadcast::{Broadcaster, NoopBroadcaster};
pub use registry::{ConnectionHandle, ConnectionRegistry, NotifyOptions, RegistryLimits};
