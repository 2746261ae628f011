//! Error types and client-facing disconnect reasons for the gateway

use crate::protocol::{Packet, TextComponent};
use std::time::Duration;
use thiserror::Error;

/// Malformed or out-of-sequence data received from a client (or a backend
/// during a status query). Always terminates only the affected connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("packet length {0} is out of range")]
    BadLength(i32),

    #[error("VarInt is too long")]
    VarIntTooLong,

    #[error("packet ended before all fields were read")]
    Truncated,

    #[error("string of {len} bytes exceeds the limit of {max}")]
    StringTooLong { len: usize, max: usize },

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    #[error("unknown handshake intention {0}")]
    UnknownIntention(i32),

    #[error("wrong packet id: expect {expect:#04X}, get {get:#04X}")]
    WrongPacket { expect: i32, get: i32 },

    #[error("client sent nothing within {0:?}")]
    ReadTimeout(Duration),

    #[error("invalid status response: {0}")]
    InvalidStatus(#[from] serde_json::Error),
}

impl ProtocolError {
    /// True when the peer simply went away
    pub fn is_eof(&self) -> bool {
        matches!(self, ProtocolError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

/// Failure of [`crate::dial::await_dial`]
#[derive(Debug, Error)]
pub enum DialError {
    /// The overall deadline elapsed while the endpoint kept refusing or timing out
    #[error("backend not reachable after {attempts} attempts in {elapsed:?}")]
    Timeout { attempts: u32, elapsed: Duration },

    /// The attempt cap was hit before the deadline
    #[error("gave up dialing after {0} attempts")]
    TooManyAttempts(u32),

    /// A dial error that retrying will not fix
    #[error("dial failed: {0}")]
    Io(#[from] std::io::Error),
}

impl DialError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, DialError::Timeout { .. })
    }
}

/// Reasons the gateway tells a logging-in client to go away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The container runtime refused to start the backend
    StartFailed,
    /// The backend did not accept connections within the dial timeout
    StillBooting,
}

impl DisconnectReason {
    /// Chat message shown on the client's disconnect screen
    pub fn message(&self) -> TextComponent {
        match self {
            DisconnectReason::StartFailed => TextComponent::colored("Remote Server Error:", "red")
                .append(TextComponent::colored(" Failed to start server.", "white")),
            DisconnectReason::StillBooting => TextComponent::colored(
                "Server is starting. Please reconnect in a moment.\n\n\
                 If the server never starts, there may be a server issue.",
                "yellow",
            ),
        }
    }

    /// Short value used in log fields
    pub fn as_log_value(&self) -> &'static str {
        match self {
            DisconnectReason::StartFailed => "start_failed",
            DisconnectReason::StillBooting => "still_booting",
        }
    }

    /// Encode as a login-state Disconnect packet
    pub fn to_packet(&self) -> Packet {
        Packet::login_disconnect(&self.message())
    }
}
