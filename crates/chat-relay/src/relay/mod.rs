//! Per-node delivery: connection registry and cross-node broadcast bus.

pub mod bus;
pub mod registry;

pub use bus::BroadcastBus;
pub use registry::{ConnectionHandle, ConnectionMailbox, ConnectionRegistry, DeliveryResult, MailboxEvent};
