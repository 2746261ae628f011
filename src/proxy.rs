use crate::container::ContainerController;
use crate::dial::await_dial;
use crate::error::{DialError, DisconnectReason, ProtocolError};
use crate::protocol::{read_packet, write_packet, Handshake, Intention, LoginStart, Packet};
use crate::relay::relay;
use crate::status::{respond_to_ping, ListingProvider};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// How long a connecting player is stalled while the backend boots
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(25);

/// How long a client may take to send each pre-login packet
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-connection handling shared by every connection task
pub struct Gateway {
    backend_endpoint: String,
    dial_timeout: Duration,
    handshake_timeout: Duration,
    controller: Arc<ContainerController>,
    listing: Arc<dyn ListingProvider>,
}

impl Gateway {
    pub fn new(
        backend_endpoint: impl Into<String>,
        controller: Arc<ContainerController>,
        listing: Arc<dyn ListingProvider>,
    ) -> Self {
        Self {
            backend_endpoint: backend_endpoint.into(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            controller,
            listing,
        }
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn backend_endpoint(&self) -> &str {
        &self.backend_endpoint
    }

    /// Drive one client connection from handshake to relay or disconnect.
    ///
    /// Read and decode errors are returned; the caller logs them and the
    /// connection closes without a message. Only a failed start and a backend
    /// that stays unreachable produce a client-visible disconnect.
    pub async fn handle_connection(
        &self,
        mut stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), ProtocolError> {
        let handshake = Handshake::decode(self.read_client_packet(&mut stream).await?)?;

        if let Err(e) = self.controller.refresh().await {
            warn!(container = %self.controller.name(), error = %e, "Failed to refresh container state");
        }

        match handshake.intention {
            Intention::Status => {
                debug!(addr = %addr, protocol = handshake.protocol_version, "Got status request");

                // A live backend answers with real player counts
                if self.controller.is_running() {
                    match self.splice(&mut stream, addr, vec![handshake.packet().clone()]).await {
                        Ok(()) => return Ok(()),
                        Err(e) if e.is_timeout() => {
                            debug!(addr = %addr, "Backend not reachable, answering status locally");
                        }
                        Err(e) => {
                            warn!(addr = %addr, error = %e, "Failed to proxy status request");
                            return Ok(());
                        }
                    }
                }

                respond_to_ping(&mut stream, self.listing.as_ref(), handshake.protocol_version).await;
                Ok(())
            }
            Intention::Login => {
                let login = LoginStart::decode(self.read_client_packet(&mut stream).await?)?;
                info!(
                    addr = %addr,
                    player = %login.player_name,
                    uuid = %login.player_id,
                    "Player connecting"
                );

                if !self.controller.is_running() {
                    if let Err(e) = self.controller.start().await {
                        error!(container = %self.controller.name(), error = %e, "Failed to start container");
                        self.disconnect(&mut stream, addr, DisconnectReason::StartFailed).await;
                        return Ok(());
                    }
                }

                let replay = vec![handshake.packet().clone(), login.packet().clone()];
                match self.splice(&mut stream, addr, replay).await {
                    Ok(()) => {}
                    Err(e) if e.is_timeout() => {
                        info!(
                            addr = %addr,
                            player = %login.player_name,
                            timeout_secs = self.dial_timeout.as_secs(),
                            "Backend still booting, sending player away"
                        );
                        self.disconnect(&mut stream, addr, DisconnectReason::StillBooting).await;
                    }
                    Err(e) => {
                        warn!(addr = %addr, error = %e, "Failed to proxy login");
                    }
                }
                Ok(())
            }
        }
    }

    async fn read_client_packet(&self, stream: &mut TcpStream) -> Result<Packet, ProtocolError> {
        tokio::time::timeout(self.handshake_timeout, read_packet(stream))
            .await
            .map_err(|_| ProtocolError::ReadTimeout(self.handshake_timeout))?
    }

    /// Dial the backend within the bounded wait and relay until both sides
    /// are done. Only dial failures are returned.
    async fn splice(
        &self,
        stream: &mut TcpStream,
        addr: SocketAddr,
        replay: Vec<Packet>,
    ) -> Result<(), DialError> {
        let backend = await_dial(&self.backend_endpoint, self.dial_timeout).await?;

        match relay(stream, backend, &replay).await {
            Ok(stats) => {
                debug!(
                    addr = %addr,
                    client_to_backend = stats.client_to_backend,
                    backend_to_client = stats.backend_to_client,
                    total = stats.total(),
                    "Done proxying"
                );
            }
            Err(e) => {
                warn!(addr = %addr, error = %e, "Failed to replay handshake to backend");
            }
        }
        Ok(())
    }

    async fn disconnect(&self, stream: &mut TcpStream, addr: SocketAddr, reason: DisconnectReason) {
        if let Err(e) = write_packet(stream, &reason.to_packet()).await {
            debug!(addr = %addr, reason = reason.as_log_value(), error = %e, "Failed to send disconnect");
        }
    }
}

/// Accept loop for the game port
pub struct GatewayServer {
    gateway: Arc<Gateway>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    pub fn new(gateway: Gateway, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            gateway: Arc::new(gateway),
            shutdown_rx,
        }
    }

    /// Serve connections from an already bound listener until shutdown.
    /// Binding is left to the caller so a bind failure can abort startup.
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(
            addr = %listener.local_addr()?,
            backend = %self.gateway.backend_endpoint(),
            "Gateway listening"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gateway = Arc::clone(&self.gateway);
                            tokio::spawn(async move {
                                if let Err(e) = gateway.handle_connection(stream, addr).await {
                                    if e.is_eof() {
                                        debug!(addr = %addr, "Client closed connection during handshake");
                                    } else if matches!(e, ProtocolError::ReadTimeout(_)) {
                                        debug!(addr = %addr, error = %e, "Dropping idle connection");
                                    } else {
                                        warn!(addr = %addr, error = %e, "Dropping connection");
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}
