//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events (certificate source, rotations, handshakes)
//!     → spans per connection (connection id, peer)
//!     → request IDs on every HTTP/gRPC request (tower-http)
//!
//! Consumers:
//!     → logging.rs subscriber (stdout, text or JSON)
//! ```

pub mod logging;
