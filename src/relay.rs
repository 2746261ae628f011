//! Splicing a client connection onto the backend

use crate::protocol::Packet;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::warn;

/// Bytes moved in each direction once the relay has finished
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
}

impl RelayStats {
    pub fn total(&self) -> u64 {
        self.client_to_backend + self.backend_to_client
    }
}

/// Replay the packets already consumed from the client, then copy bytes both
/// ways until each direction reaches end of stream or fails.
///
/// Replayed frames are written verbatim and uncompressed. End of stream in
/// one direction shuts down the write side of the other peer; an error in
/// one direction does not stop the other. The backend is closed when this
/// returns, the client stays with the caller. Only a failed replay is
/// returned as an error.
pub async fn relay<C, B>(client: &mut C, mut backend: B, replay: &[Packet]) -> std::io::Result<RelayStats>
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    for packet in replay {
        backend.write_all(packet.frame()).await?;
    }
    backend.flush().await?;

    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    let upstream = async {
        let copied = tokio::io::copy(&mut client_read, &mut backend_write).await;
        let _ = backend_write.shutdown().await;
        copied
    };

    let downstream = async {
        let copied = tokio::io::copy(&mut backend_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        copied
    };

    let (upstream, downstream) = tokio::join!(upstream, downstream);

    let client_to_backend = upstream.unwrap_or_else(|e| {
        warn!(error = %e, "Failed to proxy client -> backend");
        0
    });
    let backend_to_client = downstream.unwrap_or_else(|e| {
        warn!(error = %e, "Failed to proxy backend -> client");
        0
    });

    Ok(RelayStats {
        client_to_backend,
        backend_to_client,
    })
}
