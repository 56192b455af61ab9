//! Outbound connection establishment.
//!
//! A [`Connector`] hands back a channel immediately and completes the
//! connection in the background, reporting `Opened` or `Closed` on the sink.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::channel::{ChannelRef, EventSink, TcpChannel};
use crate::core::codec::MqttCodec;
use crate::error::{ProtocolError, Result};
use crate::utils::metrics::global_metrics;
use crate::utils::timeout::with_timeout_error;

/// Opens channels to a fixed upstream endpoint
pub trait Connector: Send + Sync {
    /// Start connecting. Events for the returned channel go to `sink`.
    ///
    /// `keep_alive` is the idle interval after which the channel pings its peer.
    fn connect(&self, sink: EventSink, keep_alive: Option<Duration>) -> Result<ChannelRef>;
}

/// Connects to a broker over TCP
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
    connect_timeout: Duration,
    codec: MqttCodec,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            connect_timeout,
            codec: MqttCodec::new(),
        }
    }

    pub fn with_codec(mut self, codec: MqttCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl Connector for TcpConnector {
    fn connect(&self, sink: EventSink, keep_alive: Option<Duration>) -> Result<ChannelRef> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ProtocolError::TransportError(format!("No async runtime: {e}")))?;

        let channel = TcpChannel::connecting(sink, keep_alive);
        let pending = Arc::clone(&channel);
        let address = self.address.clone();
        let connect_timeout = self.connect_timeout;
        let codec = self.codec;

        runtime.spawn(async move {
            let connected = with_timeout_error(
                async { TcpStream::connect(&address).await.map_err(ProtocolError::from) },
                connect_timeout,
            )
            .await;

            match connected {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    debug!(address = %address, "Broker connection established");
                    pending.opened(stream, codec);
                }
                Err(e) => {
                    global_metrics().connection_error();
                    warn!(address = %address, error = %e, "Broker connection failed");
                    pending.fail(format!("connect to {address} failed: {e}"));
                }
            }
        });

        Ok(channel)
    }
}
