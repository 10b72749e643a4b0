//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! ServerOptions → listener.rs (plan + bind, connection limits)
//!     → mux.rs (accept loop)
//!     → sniff.rs (TLS / h2c / HTTP/1 from a peek buffer)
//!     → h2c.rs (HTTP/1.1 → HTTP/2 upgrade)
//!     → connection.rs (tracking, drain on shutdown)
//!     → Hand off to HTTP layer
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - Protocol is decided once per connection, then a fixed dispatch table

pub mod connection;
pub mod h2c;
pub mod listener;
pub mod mux;
pub mod sniff;

pub use listener::{
    parse_bind_address, plan_listeners, ListenerError, ListenerSpec, ProtocolClass, Role,
};
pub use mux::{ConnectionError, Multiplexer, MuxSettings, PeerCertificates, ServingIdentity};
pub use sniff::Protocol;
