//! Client Receiver (C8): reads UDP datagrams, submits them to a bounded worker
//! pool for `open`, and writes the recovered PCM to a [`PlaybackPort`]. Grounded
//! on `echowarp/streamer/audio_client.py`'s `ClientStreamReceiver`.

use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::Duration;
use tracing::warn;

use crate::crypto::CryptoEngine;
use crate::error::StreamError;
use crate::ports::PlaybackPort;
use crate::transport::{ControlPhase, PhaseWatcher};

const CHANNEL_SLACK: usize = 2;
/// Bounds the blocking `recvfrom` so a paused/stopping phase is observed promptly
/// even with no datagrams arriving (§5).
const RECV_POLL: Duration = Duration::from_secs(1);

pub struct ClientReceiver<P: PlaybackPort> {
    playback: P,
    socket: Arc<UdpSocket>,
    crypto: Arc<CryptoEngine>,
    phase: PhaseWatcher,
    socket_buffer_size: usize,
    workers: usize,
}

impl<P: PlaybackPort + 'static> ClientReceiver<P> {
    pub fn new(
        playback: P,
        socket: Arc<UdpSocket>,
        crypto: Arc<CryptoEngine>,
        phase: PhaseWatcher,
        socket_buffer_size: usize,
        workers: usize,
    ) -> Self {
        Self {
            playback,
            socket,
            crypto,
            phase,
            socket_buffer_size,
            workers: workers.max(1),
        }
    }

    /// Runs until the control plane transitions to [`ControlPhase::Stopping`].
    pub async fn run(self) -> Result<(), StreamError> {
        let Self {
            playback,
            socket,
            crypto,
            mut phase,
            socket_buffer_size,
            workers,
        } = self;

        let (tx, rx) = mpsc::channel::<Vec<u8>>(workers + CHANNEL_SLACK);
        let rx = Arc::new(AsyncMutex::new(rx));

        let mut worker_handles = Vec::with_capacity(workers);
        let (playback_tx, mut playback_rx) = mpsc::channel::<Vec<u8>>(workers + CHANNEL_SLACK);
        for _ in 0..workers {
            worker_handles.push(tokio::spawn(open_worker(rx.clone(), crypto.clone(), playback_tx.clone())));
        }
        drop(playback_tx);

        let playback_task = tokio::spawn(async move {
            let mut playback = playback;
            while let Some(block) = playback_rx.recv().await {
                if let Err(e) = playback.write_block(&block).await {
                    warn!(error = %e, "failed to write decoded audio to playback device");
                }
            }
        });

        let mut buf = vec![0u8; socket_buffer_size];
        loop {
            if phase.wait_while_paused().await == ControlPhase::Stopping {
                break;
            }

            match tokio::time::timeout(RECV_POLL, socket.recv(&mut buf)).await {
                Ok(Ok(n)) => {
                    if tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "failed to read audio datagram");
                }
                Err(_) => continue,
            }
        }

        drop(tx);
        for worker in worker_handles {
            let _ = worker.await;
        }
        let _ = playback_task.await;
        Ok(())
    }
}

async fn open_worker(
    rx: Arc<AsyncMutex<mpsc::Receiver<Vec<u8>>>>,
    crypto: Arc<CryptoEngine>,
    playback_tx: mpsc::Sender<Vec<u8>>,
) {
    loop {
        let datagram = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };
        let Some(datagram) = datagram else {
            return;
        };

        match crypto.open(&datagram) {
            Ok(pcm) => {
                if playback_tx.send(pcm).await.is_err() {
                    return;
                }
            }
            Err(e) => warn!(error = %e, "failed to open audio frame"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::test_support::ChannelPlayback;
    use crate::transport::phase_channel;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn decodes_received_datagrams_to_playback() {
        let client_socket = Arc::new(UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap());
        let sender_socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        sender_socket.connect(client_socket.local_addr().unwrap()).await.unwrap();

        let crypto = Arc::new(CryptoEngine::new(true, true, true));
        let (playback_tx, mut playback_rx) = mpsc::channel(4);
        let playback = ChannelPlayback { tx: playback_tx };

        let (handle, watcher) = phase_channel(ControlPhase::Running);

        let receiver = ClientReceiver::new(playback, client_socket, crypto.clone(), watcher, 6144, 2);
        let run = tokio::spawn(receiver.run());

        let sealed = crypto.seal(b"decoded pcm").unwrap();
        sender_socket.send(&sealed).await.unwrap();

        let received = playback_rx.recv().await.unwrap();
        assert_eq!(received, b"decoded pcm");

        handle.set(ControlPhase::Stopping);
        let _ = run.await;
    }
}
