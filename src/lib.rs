//! mcwake - A Minecraft front-end that wakes its backend container on demand
//!
//! The gateway sits on the game port in front of a server running in a
//! Docker container. It:
//! - Answers server list pings with a configurable "booting" listing while
//!   the backend is down
//! - Starts the container when a player tries to log in
//! - Holds the player's connection until the backend accepts connections,
//!   then replays the handshake and relays bytes unmodified

pub mod admin;
pub mod config;
pub mod container;
pub mod dial;
pub mod docker;
pub mod error;
pub mod protocol;
pub mod proxy;
pub mod relay;
pub mod status;
