//! # MQTT Cluster Proxy
//!
//! An MQTT 3.1/3.1.1 wire codec and a proxy that lets many physical client
//! connections sharing one client identity appear to an upstream broker as a
//! single MQTT client, while each connection keeps its own acknowledgment
//! stream.
//!
//! ## Layers
//! - [`core`]: typed messages, frame parsing and encoding, a tokio-util codec
//! - [`channel`]: framed, flow-controlled connections reporting to an event stream
//! - [`proxy`]: per-identity sessions, identifier remapping, the session registry
//! - [`service`]: the TCP accept loop with CONNECT handshake and graceful shutdown
//! - [`config`], [`error`], [`utils`]: configuration, errors, logging and metrics
//!
//! ## Example
//! ```rust
//! use mqtt_cluster_proxy::core::codec::{encode, parse};
//! use mqtt_cluster_proxy::core::message::{Message, QoS};
//!
//! let message = Message::publish("sensors/1", &b"21.5"[..], QoS::AtLeastOnce, 7);
//! let bytes = encode(&message).expect("encodable");
//! assert_eq!(parse(&bytes).expect("parseable"), message);
//! ```

pub mod channel;
pub mod config;
pub mod core;
pub mod error;
pub mod proxy;
pub mod service;
pub mod utils;

pub use crate::config::ProxyConfig;
pub use crate::error::{ProtocolError, Result};
