//! Cross-instance broadcaster boundary.
//!
//! This module defines **only** the publish trait and the no-op default.
//! Concrete transports (a message bus, a database NOTIFY bridge) live with
//! the deployment that wires them in; the daemon subscribes to inbound
//! events and replays them into the registry after dropping its own echoes.

use anyhow::Result;
use async_trait::async_trait;

use syncular_schemas::InstanceEvent;

#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn publish(&self, event: InstanceEvent) -> Result<()>;
}

/// Single-instance deployments broadcast into the void.
pub struct NoopBroadcaster;

#[async_trait]
impl Broadcaster for NoopBroadcaster {
    async fn publish(&self, _event: InstanceEvent) -> Result<()> {
        Ok(())
    }
}
