//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Validate → Authenticators → Certificate source → Bind listeners → Serve
//!
//! Shutdown (shutdown.rs):
//!     Trigger → Watcher stops → Listeners stop accepting → Drain → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then certificates, then listeners
//! - Ordered shutdown: stop accept, drain, close
//! - Draining has a deadline: connections are aborted after the grace period

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use signals::{shutdown_signal, spawn_signal_handler};
pub use startup::{BootstrapError, Server};
