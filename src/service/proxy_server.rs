//! Client-facing TCP listener.
//!
//! Each accepted connection must open with a CONNECT within the handshake
//! timeout. Connections that do are wrapped in a [`TcpChannel`] and handed to
//! the [`SessionRegistry`]; everything else is dropped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, instrument, warn};

use crate::channel::{Channel, Connector, TcpChannel, TcpConnector};
use crate::config::ProxyConfig;
use crate::core::codec::MqttCodec;
use crate::core::message::{Body, Connect, ConnectReturnCode, Message};
use crate::error::{constants, ProtocolError, Result};
use crate::proxy::{SessionHandle, SessionOptions, SessionRegistry};
use crate::utils::metrics::{global_metrics, Timer};
use crate::utils::timeout::with_timeout_error;

/// Accept loop plus the registry it feeds
pub struct ProxyServer {
    config: ProxyConfig,
    codec: MqttCodec,
    registry: Arc<SessionRegistry>,
}

impl ProxyServer {
    /// A server whose sessions connect to `config.broker.address`
    pub fn new(config: ProxyConfig) -> Self {
        let codec = MqttCodec::with_max_remaining_length(config.transport.max_remaining_length);
        let connector = TcpConnector::new(config.broker.address.clone(), config.broker.connect_timeout)
            .with_codec(codec);
        Self::with_connector(config, Arc::new(connector))
    }

    pub fn with_connector(config: ProxyConfig, connector: Arc<dyn Connector>) -> Self {
        let codec = MqttCodec::with_max_remaining_length(config.transport.max_remaining_length);
        let options = SessionOptions {
            max_in_flight_messages: config.broker.max_in_flight_messages,
            broker_keep_alive: config.transport.broker_keep_alive,
        };
        Self {
            registry: Arc::new(SessionRegistry::new(connector, options)),
            codec,
            config,
        }
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Bind the configured listen address
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.config.server.address).await?;
        info!(address = %self.config.server.address, "Listening for MQTT clients");
        Ok(listener)
    }

    /// Serve until a message arrives on `shutdown_rx` (or its sender is dropped),
    /// then shut every session down and wait up to the shutdown timeout for
    /// them to finish.
    #[instrument(skip_all, fields(address = ?listener.local_addr().ok()))]
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Shutting down proxy. Waiting for sessions to close...");
                    let sessions = self.registry.shutdown_all();
                    self.wait_for_sessions(sessions).await;
                    global_metrics().log_metrics();
                    return Ok(());
                }

                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => self.accept(stream, peer),
                        Err(e) => {
                            error!(error = %e, "Error accepting connection");
                        }
                    }
                }
            }
        }
    }

    async fn wait_for_sessions(&self, sessions: Vec<SessionHandle>) {
        let timeout = tokio::time::sleep(self.config.server.shutdown_timeout);
        tokio::pin!(timeout);

        loop {
            tokio::select! {
                _ = &mut timeout => {
                    warn!("Shutdown timeout reached, forcing exit");
                    break;
                }
                _ = tokio::time::sleep(Duration::from_millis(100)) => {
                    let running = sessions.iter().filter(|s| !s.is_finished()).count();
                    debug!(running, "Waiting for sessions to close");
                    if running == 0 {
                        info!("All sessions closed, shutting down");
                        break;
                    }
                }
            }
        }
    }

    fn accept(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let active = global_metrics().snapshot().connections_active;
        if active >= self.config.server.max_connections as u64 {
            warn!(peer = %peer, active, "Connection limit reached, dropping connection");
            return;
        }
        global_metrics().connection_established();
        let _ = stream.set_nodelay(true);

        let server = Arc::clone(self);
        tokio::spawn(async move {
            if !server.handshake(stream, peer).await {
                global_metrics().connection_closed();
            }
        });
    }

    /// Read the opening CONNECT and route the connection. Returns whether a
    /// channel now owns the connection.
    async fn handshake(&self, stream: TcpStream, peer: SocketAddr) -> bool {
        let _timer = Timer::start("client_handshake");
        global_metrics().handshake_attempt();

        let mut framed = Framed::new(stream, self.codec);
        let connect = match read_connect(&mut framed, self.config.server.handshake_timeout).await {
            Ok(connect) => connect,
            Err(e) => {
                global_metrics().handshake_failed();
                debug!(peer = %peer, error = %e, "Dropping connection without a valid CONNECT");
                return false;
            }
        };

        if let Err(code) = admit(&connect) {
            global_metrics().handshake_failed();
            global_metrics().connect_rejected();
            info!(
                peer = %peer,
                client_id = %connect.client_id,
                return_code = code.value(),
                "Rejecting client CONNECT"
            );
            if let Err(e) = framed.send(Message::connack(code)).await {
                debug!(peer = %peer, error = %e, "Failed to write CONNACK rejection");
            }
            return false;
        }

        global_metrics().handshake_success();
        debug!(peer = %peer, client_id = %connect.client_id, "Client handshake complete");

        let channel = TcpChannel::from_framed(framed);
        channel.track_client_connection();
        if !self.registry.dispatch(channel.clone(), connect) {
            channel.close();
        }
        true
    }
}

/// Read the first message of a connection, which must be a CONNECT
pub async fn read_connect(
    framed: &mut Framed<TcpStream, MqttCodec>,
    handshake_timeout: Duration,
) -> Result<Connect> {
    let message = with_timeout_error(
        async {
            framed
                .next()
                .await
                .ok_or(ProtocolError::ConnectionClosed)?
        },
        handshake_timeout,
    )
    .await
    .map_err(|e| match e {
        ProtocolError::Timeout => {
            ProtocolError::TransportError(constants::ERR_HANDSHAKE_TIMEOUT.to_string())
        }
        other => other,
    })?;

    match message.body {
        Body::Connect(connect) => Ok(connect),
        _ => Err(ProtocolError::TransportError(constants::ERR_NOT_CONNECT.to_string())),
    }
}

/// Requirements every clustered connection has to meet before it reaches a
/// session. `Err` carries the CONNACK return code to answer with.
pub fn admit(connect: &Connect) -> std::result::Result<(), ConnectReturnCode> {
    if connect.client_id.is_empty() {
        return Err(ConnectReturnCode::IdentifierRejected);
    }
    // Sessions are shared, so none of them can be discarded on request
    if connect.clean_session {
        return Err(ConnectReturnCode::OTHER);
    }
    Ok(())
}

/// Run a proxy for `config` until CTRL+C
#[instrument(skip(config), fields(address = %config.server.address))]
pub async fn start_server(config: ProxyConfig) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            info!("Received CTRL+C signal, shutting down");
            let _ = shutdown_tx.send(()).await;
        }
    });

    start_server_with_shutdown(config, shutdown_rx).await
}

/// Run a proxy for `config` with an external shutdown channel
pub async fn start_server_with_shutdown(
    config: ProxyConfig,
    shutdown_rx: mpsc::Receiver<()>,
) -> Result<()> {
    config.validate_strict()?;
    let server = Arc::new(ProxyServer::new(config));
    let listener = server.bind().await?;
    server.serve(listener, shutdown_rx).await
}
