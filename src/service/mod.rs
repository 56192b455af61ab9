//! # Service Layer
//!
//! The runnable proxy: a TCP listener that performs the CONNECT handshake and
//! routes each connection to its proxy session.
//!
//! ## Shutdown
//! `start_server` stops on CTRL+C; `start_server_with_shutdown` stops when its
//! channel fires. Either way every session is shut down and the server waits
//! up to `server.shutdown_timeout` for them to finish.

pub mod proxy_server;

pub use proxy_server::{start_server, start_server_with_shutdown, ProxyServer};
