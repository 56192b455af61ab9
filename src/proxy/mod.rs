//! # Clustering Proxy
//!
//! Presents any number of client connections that share one client identity
//! to the broker as a single MQTT client.
//!
//! ## Components
//! - **Session**: the per-identity state machine (broker channel, client
//!   channels, identifier remapping, backpressure, load balancing)
//! - **Handle**: runs a session on its own task and feeds it connections
//! - **Registry**: client id to session routing
//! - **Inflight**: broker identifier allocation
//! - **Validate**: CONNECT compatibility checks for joining clients

pub mod handle;
pub mod inflight;
pub mod registry;
pub mod session;
pub mod validate;


pub use handle::SessionHandle;
pub use inflight::{PendingAck, PendingAckTable};
pub use registry::SessionRegistry;
pub use session::{ConnectionState, ProxySession, SessionOptions};
pub use validate::validate_connect;
