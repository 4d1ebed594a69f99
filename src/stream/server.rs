//! Server Streamer (C7): pulls PCM blocks from a [`CapturePort`], submits them to
//! a bounded worker pool for sealing, and emits one UDP datagram per block to the
//! authenticated peer. Grounded on `echowarp/streamer/audio_server.py`'s
//! `ServerStreamer`, with the `ThreadPoolExecutor.submit`-per-frame pattern
//! translated into a fixed pool of `tokio::task`s fed by a bounded `mpsc` channel
//! (SPEC_FULL.md §4.7).

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::warn;

use crate::crypto::CryptoEngine;
use crate::error::StreamError;
use crate::ports::CapturePort;
use crate::transport::{ControlPhase, PhaseWatcher};

/// Depth of the capture-to-worker channel. One in-flight block per worker plus a
/// little slack keeps the capture loop from stalling on a transient burst of
/// crypto/IO latency without letting an unbounded backlog build up.
const CHANNEL_SLACK: usize = 2;

pub struct ServerStreamer<C: CapturePort> {
    capture: C,
    socket: Arc<UdpSocket>,
    peer_addr: SocketAddr,
    crypto: Arc<CryptoEngine>,
    phase: PhaseWatcher,
    workers: usize,
}

impl<C: CapturePort + 'static> ServerStreamer<C> {
    pub fn new(
        capture: C,
        socket: Arc<UdpSocket>,
        peer_addr: SocketAddr,
        crypto: Arc<CryptoEngine>,
        phase: PhaseWatcher,
        workers: usize,
    ) -> Self {
        Self {
            capture,
            socket,
            peer_addr,
            crypto,
            phase,
            workers: workers.max(1),
        }
    }

    /// Runs until the control plane transitions to [`ControlPhase::Stopping`].
    pub async fn run(mut self) -> Result<(), StreamError> {
        let (tx, rx) = mpsc::channel::<Vec<u8>>(self.workers + CHANNEL_SLACK);
        let rx = Arc::new(AsyncMutex::new(rx));

        let mut workers = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            workers.push(tokio::spawn(seal_and_send_worker(
                rx.clone(),
                self.socket.clone(),
                self.peer_addr,
                self.crypto.clone(),
            )));
        }

        loop {
            if self.phase.wait_while_paused().await == ControlPhase::Stopping {
                break;
            }

            let block = self.capture.read_block().await?;
            if tx.send(block).await.is_err() {
                break;
            }
        }

        drop(tx);
        for worker in workers {
            let _ = worker.await;
        }
        Ok(())
    }
}

async fn seal_and_send_worker(
    rx: Arc<AsyncMutex<mpsc::Receiver<Vec<u8>>>>,
    socket: Arc<UdpSocket>,
    peer_addr: SocketAddr,
    crypto: Arc<CryptoEngine>,
) {
    loop {
        let block = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };
        let Some(block) = block else {
            return;
        };

        match crypto.seal(&block) {
            Ok(sealed) => {
                if let Err(e) = socket.send_to(&sealed, peer_addr).await {
                    warn!(error = %e, "failed to send audio datagram");
                }
            }
            Err(e) => warn!(error = %e, "failed to seal audio frame"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::test_support::ChannelCapture;
    use crate::transport::phase_channel;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn streams_captured_blocks_as_sealed_datagrams() {
        let (capture_tx, capture_rx) = mpsc::channel(4);
        let capture = ChannelCapture {
            rx: capture_rx,
            sample_rate: 48_000,
            channels: 2,
        };

        let server_socket = Arc::new(UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap());
        let listener = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let peer_addr = listener.local_addr().unwrap();

        let crypto = Arc::new(CryptoEngine::new(true, true, true));
        let (handle, watcher) = phase_channel(ControlPhase::Running);
        let _keep_handle = handle;

        let streamer = ServerStreamer::new(capture, server_socket, peer_addr, crypto.clone(), watcher.clone(), 2);
        let run = tokio::spawn(streamer.run());

        capture_tx.send(vec![1, 2, 3, 4]).await.unwrap();

        let mut buf = [0u8; 256];
        let (n, _) = listener.recv_from(&mut buf).await.unwrap();
        let opened = crypto.open(&buf[..n]).unwrap();
        assert_eq!(opened, vec![1, 2, 3, 4]);

        drop(capture_tx);
        let _ = run.await;
    }
}
