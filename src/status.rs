//! Server list ping: the synthetic "booting" listing and the backend query
//! used to copy the real server's details into it

use crate::dial::await_dial;
use crate::error::ProtocolError;
use crate::protocol::{
    packet_id, read_packet, write_packet, Handshake, Intention, Packet, TextComponent,
    MAX_PACKET_LEN,
};
use bytes::{Buf, Bytes};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Details shown to clients pinging the server
///
/// Implementations must be safe to read from every connection task at once.
pub trait ListingProvider: Send + Sync {
    /// Version name, e.g. "1.21.4"
    fn name(&self) -> String;

    /// Protocol number reported to a client that asked with `client_protocol`.
    /// A server accepting several protocol numbers may echo the client's.
    fn protocol(&self, client_protocol: i32) -> i32;

    /// Message of the day as a chat component
    fn description(&self) -> Value;

    /// `data:image/png;base64,...` or `None` for no icon
    fn favicon(&self) -> Option<String>;

    /// Replace everything at once, e.g. with details learned from the backend
    fn update_details(&self, details: ListingDetails);
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListingDetails {
    pub name: String,
    pub protocol_version: i32,
    pub description: Value,
    pub favicon: Option<String>,
}

impl From<&StatusResponse> for ListingDetails {
    fn from(status: &StatusResponse) -> Self {
        Self {
            name: status.version.name.clone(),
            protocol_version: status.version.protocol,
            description: status.description.clone(),
            favicon: status.favicon.clone(),
        }
    }
}

/// Listing with fixed details that can be swapped out wholesale
pub struct ServerListing {
    details: RwLock<ListingDetails>,
}

impl ServerListing {
    pub fn new(name: &str, protocol_version: i32, motd: &TextComponent, favicon: Option<String>) -> Self {
        Self {
            details: RwLock::new(ListingDetails {
                name: name.to_string(),
                protocol_version,
                description: serde_json::to_value(motd).unwrap_or(Value::Null),
                favicon,
            }),
        }
    }

    pub fn details(&self) -> ListingDetails {
        self.details.read().clone()
    }
}

impl ListingProvider for ServerListing {
    fn name(&self) -> String {
        self.details.read().name.clone()
    }

    fn protocol(&self, _client_protocol: i32) -> i32 {
        self.details.read().protocol_version
    }

    fn description(&self) -> Value {
        self.details.read().description.clone()
    }

    fn favicon(&self) -> Option<String> {
        self.details.read().favicon.clone()
    }

    fn update_details(&self, details: ListingDetails) {
        *self.details.write() = details;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSample {
    pub name: String,
    pub id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusVersion {
    pub name: String,
    pub protocol: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusPlayers {
    pub max: i32,
    pub online: i32,
    #[serde(default)]
    pub sample: Vec<PlayerSample>,
}

/// JSON body of a status response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: StatusVersion,
    #[serde(default)]
    pub players: StatusPlayers,
    #[serde(default)]
    pub description: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favicon: Option<String>,
}

/// Serialize the current listing. Player counts are always zero: nobody can
/// be online while the gateway answers on the backend's behalf.
pub fn build_listing(
    provider: &dyn ListingProvider,
    client_protocol: i32,
) -> serde_json::Result<String> {
    let response = StatusResponse {
        version: StatusVersion {
            name: provider.name(),
            protocol: provider.protocol(client_protocol),
        },
        players: StatusPlayers::default(),
        description: provider.description(),
        favicon: provider.favicon(),
    };
    serde_json::to_string(&response)
}

/// Answer the status sub-protocol locally.
///
/// Reads at most two packets (a status request and a ping). Any error ends
/// the exchange silently; the caller then drops the connection.
pub async fn respond_to_ping<S>(stream: &mut S, provider: &dyn ListingProvider, client_protocol: i32)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    for _ in 0..2 {
        let packet = match read_packet(stream).await {
            Ok(packet) => packet,
            Err(e) => {
                if !e.is_eof() {
                    debug!(error = %e, "Failed to read status packet");
                }
                return;
            }
        };

        let result = match packet.id {
            packet_id::STATUS_REQUEST => match build_listing(provider, client_protocol) {
                Ok(json) => write_packet(stream, &Packet::status_response(&json)).await,
                Err(e) => {
                    warn!(error = %e, "Failed to serialize server listing");
                    return;
                }
            },
            packet_id::PING => write_packet(stream, &packet).await,
            other => {
                debug!(packet_id = other, "Ignoring unexpected status packet");
                Ok(())
            }
        };

        if let Err(e) = result {
            debug!(error = %e, "Failed to answer status packet");
            return;
        }
    }
}

/// Run a status query against a backend and measure the ping round trip
pub async fn query_status<S>(
    stream: &mut S,
    server_address: &str,
    server_port: u16,
    protocol_version: i32,
) -> Result<(StatusResponse, Duration), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let handshake = Handshake::new(protocol_version, server_address, server_port, Intention::Status);
    write_packet(stream, handshake.packet()).await?;
    write_packet(stream, &Packet::new(packet_id::STATUS_REQUEST, Bytes::new())).await?;

    let response = read_packet(stream).await?;
    if response.id != packet_id::STATUS_RESPONSE {
        return Err(ProtocolError::WrongPacket {
            expect: packet_id::STATUS_RESPONSE,
            get: response.id,
        });
    }
    let json = response.read_string(MAX_PACKET_LEN / 3)?;
    let status: StatusResponse = serde_json::from_str(&json)?;

    let token = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default();
    let sent = Instant::now();
    write_packet(stream, &Packet::new(packet_id::PING, token.to_be_bytes().to_vec())).await?;

    let pong = read_packet(stream).await?;
    let delay = sent.elapsed();
    if pong.id != packet_id::PING {
        return Err(ProtocolError::WrongPacket {
            expect: packet_id::PING,
            get: pong.id,
        });
    }
    let mut payload = pong.payload.clone();
    if payload.remaining() < 8 {
        return Err(ProtocolError::Truncated);
    }
    if payload.get_i64() != token {
        debug!("Backend answered ping with a different payload");
    }

    Ok((status, delay))
}

/// Query the live backend and copy its name, protocol, description and icon
/// into `provider`. Returns the measured ping.
pub async fn sync_from_backend(
    provider: &dyn ListingProvider,
    endpoint: &str,
    server_address: &str,
    server_port: u16,
    timeout: Duration,
) -> anyhow::Result<Duration> {
    let mut stream = await_dial(endpoint, timeout)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to reach backend at {}: {}", endpoint, e))?;

    let protocol = provider.protocol(-1);
    let (status, delay) = query_status(&mut stream, server_address, server_port, protocol)
        .await
        .map_err(|e| anyhow::anyhow!("Status query against {} failed: {}", endpoint, e))?;

    info!(
        name = %status.version.name,
        protocol = status.version.protocol,
        online = status.players.online,
        max = status.players.max,
        ping_ms = delay.as_millis() as u64,
        "Copied server listing from backend"
    );
    provider.update_details(ListingDetails::from(&status));
    Ok(delay)
}
