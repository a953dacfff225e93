//! palantir-relay: rendezvous and forwarding node for Palantir peers
//!
//! Every client authenticates with the relay, which then announces peers to
//! each other and forwards addressed data frames without reading their payload.

pub mod admission;
pub mod config;
pub mod forwarder;
pub mod metrics;
pub mod server;
pub mod sessions;

pub use admission::RelayAdmission;
pub use config::{ConfigError, RelayConfig};
pub use forwarder::{ForwardError, Forwarder};
pub use metrics::RelayMetrics;
pub use server::{ConnectionState, RelayServer, ServerError};
pub use sessions::{Outbound, SessionError, SessionTable};
