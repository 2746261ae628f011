//! Minecraft Java Edition packet framing and the few packets the gateway reads
//!
//! Only the handshake, status and login-start packets are ever decoded. A
//! decoded packet keeps its wire frame so it can be replayed to the
//! backend byte for byte; everything after that is relayed untouched.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Largest frame accepted (a three byte VarInt length)
pub const MAX_PACKET_LEN: usize = 2_097_151;

/// Limits from the protocol, in characters
const MAX_ADDRESS_CHARS: usize = 255;
const MAX_NAME_CHARS: usize = 16;
pub const MAX_JSON_CHARS: usize = 32_767;

/// Packet ids used before the connection is spliced
pub mod packet_id {
    pub const HANDSHAKE: i32 = 0x00;
    pub const STATUS_REQUEST: i32 = 0x00;
    pub const STATUS_RESPONSE: i32 = 0x00;
    pub const PING: i32 = 0x01;
    pub const LOGIN_START: i32 = 0x00;
    pub const LOGIN_DISCONNECT: i32 = 0x00;
}

/// A single uncompressed packet together with its wire frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    /// Fields following the packet id
    pub payload: Bytes,
    frame: Bytes,
}

impl Packet {
    /// Build a packet and its frame from an id and already encoded fields
    pub fn new(id: i32, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        let body_len = varint_len(id) + payload.len();

        let mut frame = BytesMut::with_capacity(varint_len(body_len as i32) + body_len);
        put_varint(&mut frame, body_len as i32);
        put_varint(&mut frame, id);
        frame.put_slice(&payload);

        Self {
            id,
            payload,
            frame: frame.freeze(),
        }
    }

    /// Packet carrying a single string field (status response, disconnect)
    pub fn with_string(id: i32, value: &str) -> Self {
        let mut payload = BytesMut::new();
        put_string(&mut payload, value);
        Self::new(id, payload)
    }

    pub fn status_response(json: &str) -> Self {
        Self::with_string(packet_id::STATUS_RESPONSE, json)
    }

    pub fn login_disconnect(reason: &TextComponent) -> Self {
        Self::with_string(packet_id::LOGIN_DISCONNECT, &reason.to_json())
    }

    /// The exact bytes this packet occupied on the wire
    pub fn frame(&self) -> &Bytes {
        &self.frame
    }

    /// Read the first string field of the payload
    pub fn read_string(&self, max_chars: usize) -> Result<String, ProtocolError> {
        let mut payload = self.payload.clone();
        get_string(&mut payload, max_chars)
    }
}

/// Read one frame without buffering past its end, so nothing that follows
/// is lost when the stream is later handed to the relay.
pub async fn read_packet<R>(reader: &mut R) -> Result<Packet, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let (length, header) = read_varint(reader).await?;
    if length <= 0 || length as usize > MAX_PACKET_LEN {
        return Err(ProtocolError::BadLength(length));
    }

    let mut frame = BytesMut::with_capacity(header.len() + length as usize);
    frame.put_slice(&header);
    frame.resize(header.len() + length as usize, 0);
    reader.read_exact(&mut frame[header.len()..]).await?;
    let frame = frame.freeze();

    let mut body = frame.slice(header.len()..);
    let id = get_varint(&mut body)?;

    Ok(Packet {
        id,
        payload: body,
        frame,
    })
}

pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(packet.frame()).await?;
    writer.flush().await
}

async fn read_varint<R>(reader: &mut R) -> Result<(i32, Vec<u8>), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut raw = Vec::with_capacity(3);
    let mut value: u32 = 0;
    for i in 0..5 {
        let byte = reader.read_u8().await?;
        raw.push(byte);
        value |= ((byte & 0x7f) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value as i32, raw));
        }
    }
    Err(ProtocolError::VarIntTooLong)
}

pub fn get_varint(buf: &mut impl Buf) -> Result<i32, ProtocolError> {
    let mut value: u32 = 0;
    for i in 0..5 {
        if !buf.has_remaining() {
            return Err(ProtocolError::Truncated);
        }
        let byte = buf.get_u8();
        value |= ((byte & 0x7f) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value as i32);
        }
    }
    Err(ProtocolError::VarIntTooLong)
}

pub fn put_varint(buf: &mut BytesMut, value: i32) {
    let mut value = value as u32;
    loop {
        if value & !0x7f == 0 {
            buf.put_u8(value as u8);
            return;
        }
        buf.put_u8((value & 0x7f) as u8 | 0x80);
        value >>= 7;
    }
}

pub fn varint_len(value: i32) -> usize {
    let value = value as u32;
    match value {
        0..=0x7f => 1,
        0x80..=0x3fff => 2,
        0x4000..=0x1f_ffff => 3,
        0x20_0000..=0xfff_ffff => 4,
        _ => 5,
    }
}

/// Strings are limited in UTF-16 units; a unit takes at most three UTF-8 bytes
pub fn get_string(buf: &mut impl Buf, max_chars: usize) -> Result<String, ProtocolError> {
    let len = get_varint(buf)?;
    if len < 0 {
        return Err(ProtocolError::BadLength(len));
    }
    let len = len as usize;
    let max = max_chars * 3;
    if len > max {
        return Err(ProtocolError::StringTooLong { len, max });
    }
    if buf.remaining() < len {
        return Err(ProtocolError::Truncated);
    }
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
}

pub fn put_string(buf: &mut BytesMut, value: &str) {
    put_varint(buf, value.len() as i32);
    buf.put_slice(value.as_bytes());
}

pub fn get_u16(buf: &mut impl Buf) -> Result<u16, ProtocolError> {
    if buf.remaining() < 2 {
        return Err(ProtocolError::Truncated);
    }
    Ok(buf.get_u16())
}

pub fn get_uuid(buf: &mut impl Buf) -> Result<Uuid, ProtocolError> {
    if buf.remaining() < 16 {
        return Err(ProtocolError::Truncated);
    }
    Ok(Uuid::from_u128(buf.get_u128()))
}

pub fn put_uuid(buf: &mut BytesMut, id: &Uuid) {
    buf.put_u128(id.as_u128());
}

/// What the client wants to do after the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intention {
    Status,
    Login,
}

impl Intention {
    pub fn as_i32(self) -> i32 {
        match self {
            Intention::Status => 1,
            Intention::Login => 2,
        }
    }
}

impl TryFrom<i32> for Intention {
    type Error = ProtocolError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Intention::Status),
            2 => Ok(Intention::Login),
            other => Err(ProtocolError::UnknownIntention(other)),
        }
    }
}

/// First packet of every connection
#[derive(Debug, Clone)]
pub struct Handshake {
    pub protocol_version: i32,
    pub server_address: String,
    pub server_port: u16,
    pub intention: Intention,
    packet: Packet,
}

impl Handshake {
    pub fn new(
        protocol_version: i32,
        server_address: &str,
        server_port: u16,
        intention: Intention,
    ) -> Self {
        let mut payload = BytesMut::new();
        put_varint(&mut payload, protocol_version);
        put_string(&mut payload, server_address);
        payload.put_u16(server_port);
        put_varint(&mut payload, intention.as_i32());

        Self {
            protocol_version,
            server_address: server_address.to_string(),
            server_port,
            intention,
            packet: Packet::new(packet_id::HANDSHAKE, payload),
        }
    }

    pub fn decode(packet: Packet) -> Result<Self, ProtocolError> {
        if packet.id != packet_id::HANDSHAKE {
            return Err(ProtocolError::WrongPacket {
                expect: packet_id::HANDSHAKE,
                get: packet.id,
            });
        }

        let mut buf = packet.payload.clone();
        let protocol_version = get_varint(&mut buf)?;
        let server_address = get_string(&mut buf, MAX_ADDRESS_CHARS)?;
        let server_port = get_u16(&mut buf)?;
        let intention = Intention::try_from(get_varint(&mut buf)?)?;

        Ok(Self {
            protocol_version,
            server_address,
            server_port,
            intention,
            packet,
        })
    }

    pub fn packet(&self) -> &Packet {
        &self.packet
    }
}

/// First packet of the login sequence (1.20.2+ layout: name then UUID)
#[derive(Debug, Clone)]
pub struct LoginStart {
    pub player_name: String,
    pub player_id: Uuid,
    packet: Packet,
}

impl LoginStart {
    pub fn new(player_name: &str, player_id: Uuid) -> Self {
        let mut payload = BytesMut::new();
        put_string(&mut payload, player_name);
        put_uuid(&mut payload, &player_id);

        Self {
            player_name: player_name.to_string(),
            player_id,
            packet: Packet::new(packet_id::LOGIN_START, payload),
        }
    }

    pub fn decode(packet: Packet) -> Result<Self, ProtocolError> {
        if packet.id != packet_id::LOGIN_START {
            return Err(ProtocolError::WrongPacket {
                expect: packet_id::LOGIN_START,
                get: packet.id,
            });
        }

        let mut buf = packet.payload.clone();
        let player_name = get_string(&mut buf, MAX_NAME_CHARS)?;
        let player_id = get_uuid(&mut buf)?;

        Ok(Self {
            player_name,
            player_id,
            packet,
        })
    }

    pub fn packet(&self) -> &Packet {
        &self.packet
    }
}

/// Chat text component, the JSON form used by MOTDs and disconnect screens
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextComponent {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra: Vec<TextComponent>,
}

impl TextComponent {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn colored(text: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            color: Some(color.into()),
            extra: Vec::new(),
        }
    }

    pub fn append(mut self, other: TextComponent) -> Self {
        self.extra.push(other);
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"text":"{}"}}"#, self.text.replace('"', "\\\""))
        })
    }
}
