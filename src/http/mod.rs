//! HTTP and gRPC request handling.
//!
//! # Data Flow
//! ```text
//! Connection (h1, h2c, or TLS with ALPN)
//!     → net::mux (hyper connection, ConnectInfo + peer certificates attached)
//!     → server.rs RouteTable (gRPC by content type, otherwise HTTP)
//!     → request.rs (request ID) → handler
//! ```

pub mod request;
pub mod server;

pub use request::{is_grpc, X_REQUEST_ID};
pub use server::{grpc_router, http_router, Readiness, RouteTable, Routers};
