//! Gateways to the external persistence and query services.
//!
//! Neither gateway sits on the realtime path: persistence is a background
//! queue drained by one dispatch task, and history replay runs on a
//! transient task per join. Failures are logged and abandoned.
//!
//! - **[`upstream`]**: the two service seams ([`PersistSink`],
//!   [`HistorySource`]) and their HTTP clients, plus [`LocalHistory`] which
//!   serves replay from this node's own History Store.
//! - **[`persist`]**: [`PersistenceGateway`], bounded queue with
//!   bounded-retry-then-drop forwarding.
//! - **[`replay`]**: [`HistoryGateway`], fetch a user's backlog and replay it
//!   through the connection registry.

pub mod persist;
pub mod replay;
pub mod upstream;

pub use persist::{PersistenceGateway, RetryPolicy};
pub use replay::HistoryGateway;
pub use upstream::{HistorySource, LocalHistory, PersistClient, PersistSink, QueryClient};
