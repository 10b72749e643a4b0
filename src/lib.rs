//! Bootstrap identity and secure transport for a mesh control plane.
//!
//! Decides where the serving certificate comes from, keeps it current as files
//! rotate or the CA reissues it, and serves plaintext HTTP, h2c, HTTPS, and
//! gRPC (plain and mutually authenticated) on one or more listeners.
//!
//! # Architecture Overview
//!
//! ```text
//!                  ┌──────────────────────────────────────────────────────┐
//!                  │                    mesh-bootstrap                     │
//!                  │                                                       │
//!   cert files ────┼─▶ certs::watcher ─┐                                   │
//!                  │                   ├─▶ certs::cache ──┐                │
//!   CA ────────────┼─▶ certs::loader ──┘   (atomic swap)  │                │
//!                  │         ▲                            ▼                │
//!                  │   certs::resolver            tls::acceptor            │
//!                  │   (picks one writer)         (tls::policy)            │
//!                  │                                      │                │
//!   Client ────────┼─▶ net::listener ─▶ net::sniff ─▶ net::mux ─▶ http     │
//!                  │                   (tls/h2c/h1)               routers  │
//!                  │                                                       │
//!                  │  config · auth::jwt · lifecycle · observability       │
//!                  └──────────────────────────────────────────────────────┘
//! ```

pub mod auth;
pub mod certs;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod tls;

pub use config::BootstrapConfig;
pub use lifecycle::{BootstrapError, Server, Shutdown};
