//! Composition root (ambient C0): gathers already-resolved [`Settings`] from the
//! command line, wires the crypto/codec/ledger primitives into a transport role,
//! and drives the control loop alongside the matching data-plane loop.
//!
//! Real audio device I/O is an external collaborator (§1) the core never touches;
//! this binary stands in a pair of PCM-shaped stubs (silence in, discard out) so
//! the whole protocol can be exercised end-to-end without a sound card.

use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

use echowarp::ports::{CapturePort, PlaybackPort};
use echowarp::settings::{DEFAULT_BAN_LIST_FILE, DEFAULT_BUFFER_SIZE, DEFAULT_PORT, DEFAULT_RECONNECT_ATTEMPT, DEFAULT_SHUTDOWN_GRACE, DEFAULT_WORKERS};
use echowarp::{
    establish, phase_channel, run_transport_loop, BanLedger, ClientReceiver, ClientRole, ControlPhase, ServerRole,
    ServerStreamer, Settings, StreamError,
};

#[derive(Parser)]
#[command(name = "echowarp", about = "Authenticated PCM audio streaming over TCP+UDP")]
struct Cli {
    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand)]
enum Role {
    /// Listen for one client and stream captured audio to it.
    Server {
        #[arg(long, default_value_t = DEFAULT_PORT)]
        udp_port: u16,
        #[arg(long)]
        password: Option<String>,
        #[arg(long)]
        encrypt: bool,
        #[arg(long)]
        integrity: bool,
        #[arg(long, default_value_t = DEFAULT_RECONNECT_ATTEMPT)]
        reconnect_attempts: u32,
        #[arg(long, default_value_t = DEFAULT_WORKERS)]
        workers: usize,
    },
    /// Connect to a server and play back the audio it streams.
    Client {
        #[arg(long)]
        server_address: String,
        #[arg(long, default_value_t = DEFAULT_PORT)]
        udp_port: u16,
        #[arg(long)]
        password: Option<String>,
        #[arg(long, default_value_t = DEFAULT_WORKERS)]
        workers: usize,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    match cli.role {
        Role::Server {
            udp_port,
            password,
            encrypt,
            integrity,
            reconnect_attempts,
            workers,
        } => {
            let mut settings = Settings::server(udp_port);
            settings.password = password;
            settings.is_encrypt = encrypt;
            settings.is_integrity_control = integrity;
            settings.reconnect_attempt = reconnect_attempts;
            settings.workers = workers;
            run_server(settings, shutdown_rx).await
        }
        Role::Client {
            server_address,
            udp_port,
            password,
            workers,
        } => {
            let mut settings = Settings::client(udp_port, server_address);
            settings.password = password;
            settings.workers = workers;
            run_client(settings, shutdown_rx).await
        }
    }
}

async fn run_server(settings: Settings, shutdown_rx: watch::Receiver<bool>) -> Result<(), Box<dyn std::error::Error>> {
    let ledger = Arc::new(BanLedger::load(settings.reconnect_attempt, DEFAULT_BAN_LIST_FILE)?);
    let workers = settings.workers;
    let mut role = ServerRole::new(settings, ledger, shutdown_rx.clone());

    let established = establish(&mut role).await?;
    let (phase_handle, phase_watcher) = phase_channel(ControlPhase::Paused);

    let socket = role
        .udp_socket()
        .expect("init_socket populates the UDP socket before established_connection returns");
    let peer_addr = role.peer_addr().expect("established_connection populates the peer address");

    let streamer = ServerStreamer::new(SilenceCapture::default(), socket, peer_addr, established.crypto.clone(), phase_watcher, workers);
    tokio::spawn(async move {
        if let Err(e) = streamer.run().await {
            error!(error = %e, "streamer exited");
        }
    });

    run_transport_loop(&mut role, established, phase_handle, shutdown_rx, DEFAULT_SHUTDOWN_GRACE).await?;
    Ok(())
}

async fn run_client(settings: Settings, shutdown_rx: watch::Receiver<bool>) -> Result<(), Box<dyn std::error::Error>> {
    let workers = settings.workers;
    let socket_buffer_size = settings.socket_buffer_size;
    let mut role = ClientRole::new(settings, shutdown_rx.clone());

    let established = establish(&mut role).await?;
    let (phase_handle, phase_watcher) = phase_channel(ControlPhase::Paused);

    let socket = role
        .udp_socket()
        .expect("init_socket populates the UDP socket before established_connection returns");

    let receiver = ClientReceiver::new(
        DiscardPlayback,
        socket,
        established.crypto.clone(),
        phase_watcher,
        socket_buffer_size.max(DEFAULT_BUFFER_SIZE),
        workers,
    );
    tokio::spawn(async move {
        if let Err(e) = receiver.run().await {
            error!(error = %e, "receiver exited");
        }
    });

    run_transport_loop(&mut role, established, phase_handle, shutdown_rx, DEFAULT_SHUTDOWN_GRACE).await?;
    Ok(())
}

/// Stands in for a real capture device: yields one block of digital silence per
/// call, paced so the data plane doesn't spin a CPU core flooding the socket.
#[derive(Default)]
struct SilenceCapture;

#[async_trait]
impl CapturePort for SilenceCapture {
    async fn read_block(&mut self) -> Result<Vec<u8>, StreamError> {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        Ok(vec![0u8; 1024 * 2])
    }

    fn sample_rate(&self) -> u32 {
        48_000
    }

    fn channels(&self) -> u16 {
        1
    }
}

/// Stands in for a real playback device: drops every decoded block.
struct DiscardPlayback;

#[async_trait]
impl PlaybackPort for DiscardPlayback {
    async fn write_block(&mut self, _data: &[u8]) -> Result<(), StreamError> {
        Ok(())
    }
}
