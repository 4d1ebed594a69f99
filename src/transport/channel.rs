//! The single blocking primitive the control plane uses: one `send`/`recv` per
//! logical message over a timeout-bounded TCP socket (§5). No length prefix or
//! framing beyond "one read call is one message", matching
//! `socket.recv(SOCKET_BUFFER_SIZE)` in the historical source.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::codec::ControlMessage;
use crate::crypto::CryptoEngine;
use crate::error::TransportError;

/// A TCP control socket plus the read timeout and buffer size negotiated for it.
pub struct TcpChannel {
    stream: TcpStream,
    buffer_size: usize,
    read_timeout: Duration,
}

impl TcpChannel {
    pub fn new(stream: TcpStream, buffer_size: usize, read_timeout: Duration) -> Self {
        Self {
            stream,
            buffer_size,
            read_timeout,
        }
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    /// One `recv` call, bounded by the channel's read timeout. A zero-length read
    /// means the peer closed the socket; surfaced as recoverable so the base loop
    /// reconnects rather than treating it as fatal.
    pub async fn recv_raw(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; self.buffer_size];
        let read = tokio::time::timeout(self.read_timeout, self.stream.read(&mut buf))
            .await
            .map_err(|_| TransportError::Recoverable("control socket read timed out".into()))??;

        if read == 0 {
            return Err(TransportError::Recoverable("peer closed the control socket".into()));
        }

        buf.truncate(read);
        Ok(buf)
    }

    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}

/// Sends a message RSA-encrypted, plaintext-handshake style (before session keys
/// exist).
pub async fn send_rsa(channel: &mut TcpChannel, crypto: &CryptoEngine, msg: &ControlMessage) -> Result<(), TransportError> {
    let bytes = msg.encode()?;
    let ciphertext = crypto.encrypt_asym(&bytes)?;
    channel.send_raw(&ciphertext).await
}

/// Receives and RSA-decrypts a handshake-phase message.
pub async fn recv_rsa(channel: &mut TcpChannel, crypto: &CryptoEngine) -> Result<ControlMessage, TransportError> {
    let raw = channel.recv_raw().await?;
    let plaintext = crypto.decrypt_asym(&raw)?;
    Ok(ControlMessage::decode(&plaintext)?)
}

/// Sends a message through the post-handshake `seal` pipeline (§4.1): every
/// control-plane message after authentication is sealed on the same terms as a
/// data-plane frame.
pub async fn send_sealed(channel: &mut TcpChannel, crypto: &CryptoEngine, msg: &ControlMessage) -> Result<(), TransportError> {
    let bytes = msg.encode()?;
    let sealed = crypto.seal(&bytes)?;
    channel.send_raw(&sealed).await
}

/// Receives and `open`s a post-handshake control-plane message.
pub async fn recv_sealed(channel: &mut TcpChannel, crypto: &CryptoEngine) -> Result<ControlMessage, TransportError> {
    let raw = channel.recv_raw().await?;
    let opened = crypto.open(&raw)?;
    Ok(ControlMessage::decode(&opened)?)
}
