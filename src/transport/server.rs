//! Transport Server (C5): specialization of the base loop that listens, accepts,
//! authenticates, and delivers session config. Grounded on
//! `echowarp/auth_and_heartbeat/transport_server.py`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::codec::{response_code, ControlMessage};
use crate::crypto::CryptoEngine;
use crate::error::TransportError;
use crate::ledger::BanLedger;
use crate::settings::{Settings, COMPARABILITY_VERSION, DEFAULT_HEARTBEAT_PERIOD, DEFAULT_READ_TIMEOUT};

use super::base::{EstablishedSession, HeartbeatOutcome, Session, TransportRole};
use super::channel::{recv_rsa, recv_sealed, send_rsa, send_sealed, TcpChannel};

/// How often `accept` is re-polled to observe a shutdown signal, mirroring the
/// source's `settimeout(5.0)` on the listening socket.
const ACCEPT_POLL: Duration = Duration::from_secs(5);

pub struct ServerRole {
    settings: Settings,
    ledger: Arc<BanLedger>,
    shutdown: watch::Receiver<bool>,
    listener: Option<TcpListener>,
    udp_socket: Option<Arc<UdpSocket>>,
    channel: Option<TcpChannel>,
    crypto: Option<Arc<CryptoEngine>>,
    peer_addr: Option<SocketAddr>,
}

impl ServerRole {
    pub fn new(settings: Settings, ledger: Arc<BanLedger>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            settings,
            ledger,
            shutdown,
            listener: None,
            udp_socket: None,
            channel: None,
            crypto: None,
            peer_addr: None,
        }
    }

    /// The UDP socket the streamer (C7) sends frames on, once [`TransportRole::init_socket`]
    /// has run.
    pub fn udp_socket(&self) -> Option<Arc<UdpSocket>> {
        self.udp_socket.clone()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Authentication handshake (§4.5 steps a-g). RSA-only; no `seal`/`open` yet.
    async fn authenticate(
        &self,
        channel: &mut TcpChannel,
        crypto: &mut CryptoEngine,
        peer_ip: &str,
    ) -> Result<Session, TransportError> {
        channel.send_raw(crypto.serialized_public_key()?.as_bytes()).await?;

        let peer_pem_bytes = channel.recv_raw().await?;
        let peer_pem = String::from_utf8(peer_pem_bytes)
            .map_err(|_| TransportError::Fatal("client public key was not valid UTF-8".into()))?;
        crypto.load_peer_public_key(&peer_pem)?;

        let client_hello = recv_rsa(channel, crypto).await?;
        let failed = self
            .ledger
            .peer_state(peer_ip)
            .map(|s| s.total_failures())
            .unwrap_or(0);

        let expected_message = self
            .settings
            .password
            .as_deref()
            .map(|p| BASE64.encode(p.as_bytes()))
            .unwrap_or_default();

        if client_hello.message != expected_message || client_hello.response_code != response_code::OK {
            let reply = ControlMessage::encode_status(
                "Unauthorized",
                response_code::UNAUTHORIZED,
                COMPARABILITY_VERSION,
                failed,
                self.settings.reconnect_attempt,
            );
            let _ = send_rsa(channel, crypto, &reply).await;
            return Err(TransportError::Fatal(format!(
                "client {peer_ip} failed password authentication"
            )));
        }

        if client_hello.comparability_version != COMPARABILITY_VERSION {
            let reply = ControlMessage::encode_status(
                "Conflict",
                response_code::CONFLICT,
                COMPARABILITY_VERSION,
                failed,
                self.settings.reconnect_attempt,
            );
            let _ = send_rsa(channel, crypto, &reply).await;
            return Err(TransportError::Fatal(format!(
                "client {peer_ip} version {} does not match server version {COMPARABILITY_VERSION}",
                client_hello.comparability_version
            )));
        }

        if self.ledger.is_banned(peer_ip) {
            let reply = ControlMessage::encode_status(
                "Forbidden",
                response_code::FORBIDDEN,
                COMPARABILITY_VERSION,
                failed,
                self.settings.reconnect_attempt,
            );
            let _ = send_rsa(channel, crypto, &reply).await;
            return Err(TransportError::Fatal(format!("client {peer_ip} is banned")));
        }

        let key_b64 = crypto
            .aes_key_base64()
            .ok_or_else(|| TransportError::Fatal("server engine missing session key material".into()))?;
        let iv_b64 = crypto
            .aes_iv_base64()
            .ok_or_else(|| TransportError::Fatal("server engine missing session IV material".into()))?;

        let reply = ControlMessage::encode_auth_ok(
            COMPARABILITY_VERSION,
            self.settings.is_encrypt,
            self.settings.is_integrity_control,
            key_b64,
            iv_b64,
            failed,
            self.settings.reconnect_attempt,
        );
        send_rsa(channel, crypto, &reply).await?;
        info!(peer = %peer_ip, "client authenticated");

        Ok(Session {
            peer_ip: peer_ip.to_string(),
            comparability_version: COMPARABILITY_VERSION.to_string(),
            reconnect_budget: self.settings.reconnect_attempt,
            socket_buffer_size: self.settings.socket_buffer_size,
            heartbeat_period: DEFAULT_HEARTBEAT_PERIOD,
        })
    }
}

#[async_trait]
impl TransportRole for ServerRole {
    fn is_server(&self) -> bool {
        true
    }

    async fn init_socket(&mut self) -> Result<(), TransportError> {
        let tcp_addr = format!("0.0.0.0:{}", self.settings.tcp_port());
        let listener = TcpListener::bind(&tcp_addr).await?;
        info!(addr = %tcp_addr, "TCP control listener bound");

        let udp_addr = format!("0.0.0.0:{}", self.settings.udp_port);
        let udp_socket = UdpSocket::bind(&udp_addr).await?;
        info!(addr = %udp_addr, "UDP data socket bound");

        self.listener = Some(listener);
        self.udp_socket = Some(Arc::new(udp_socket));
        Ok(())
    }

    async fn established_connection(&mut self, _is_reconnect: bool) -> Result<EstablishedSession, TransportError> {
        loop {
            if *self.shutdown.borrow() {
                return Err(TransportError::Fatal(
                    "shutdown requested before a client connected".into(),
                ));
            }

            let accept_result = {
                let listener = self
                    .listener
                    .as_ref()
                    .ok_or_else(|| TransportError::Fatal("listener not initialized".into()))?;
                tokio::time::timeout(ACCEPT_POLL, listener.accept()).await
            };

            let (stream, addr): (TcpStream, SocketAddr) = match accept_result {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => continue,
            };

            let peer_ip = addr.ip().to_string();
            info!(peer = %peer_ip, "client connected");
            self.ledger.register(&peer_ip);

            if self.ledger.is_banned(&peer_ip) {
                // A banned peer's first contact since the ban still falls through to
                // the handshake so it gets a real 403 (§4.5.2/§4.5.3f); only later
                // attempts are dropped silently.
                if !self.ledger.is_first_time_message(&peer_ip) {
                    continue;
                }
                warn!(peer = %peer_ip, "banned peer's first contact since ban; replying via handshake");
            }

            let mut channel = TcpChannel::new(stream, self.settings.socket_buffer_size, DEFAULT_READ_TIMEOUT);
            let mut crypto = CryptoEngine::new(true, self.settings.is_encrypt, self.settings.is_integrity_control);

            match self.authenticate(&mut channel, &mut crypto, &peer_ip).await {
                Ok(session) => {
                    self.ledger.record_success(&peer_ip);
                    let crypto = Arc::new(crypto);
                    self.peer_addr = Some(addr);
                    self.channel = Some(channel);
                    self.crypto = Some(crypto.clone());
                    return Ok(EstablishedSession { session, crypto });
                }
                Err(e) => {
                    self.ledger.record_failure(&peer_ip);
                    warn!(peer = %peer_ip, error = %e, "authentication failed; awaiting next connection");
                }
            }
        }
    }

    async fn heartbeat_round(&mut self, send_locked: bool) -> Result<HeartbeatOutcome, TransportError> {
        let crypto = self
            .crypto
            .clone()
            .ok_or_else(|| TransportError::Fatal("heartbeat attempted before handshake".into()))?;
        let channel = self
            .channel
            .as_mut()
            .ok_or_else(|| TransportError::Fatal("heartbeat attempted before handshake".into()))?;

        // Server phase order (§4.4): receive+validate, then send status.
        let incoming = recv_sealed(channel, &crypto).await?;
        if incoming.response_code == response_code::LOCKED {
            return Ok(HeartbeatOutcome::PeerLocked);
        }

        let reply = if send_locked {
            ControlMessage::new("Locked", response_code::LOCKED, COMPARABILITY_VERSION)
        } else {
            ControlMessage::new("Accepted", response_code::ACCEPTED, COMPARABILITY_VERSION)
        };
        send_sealed(channel, &crypto, &reply).await?;
        Ok(HeartbeatOutcome::Ok)
    }

    async fn cleanup(&mut self) {
        self.channel = None;
        self.crypto = None;
        self.peer_addr = None;
    }
}
