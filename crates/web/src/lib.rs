//! Flint web server
//!
//! Passphrase and API key authentication, per-client rate limiting, the
//! serial console and VNC WebSocket relays, and the static web UI.

pub mod auth;
pub mod console;
pub mod pty;
pub mod server;
pub mod static_files;
pub mod vnc_proxy;

pub use server::{shutdown_signal, WebServer, WebState};
