//! Transport Client (C6): specialization of the base loop that connects,
//! authenticates, and receives session config. Grounded on
//! `echowarp/auth_and_heartbeat/transport_client.py`.
//!
//! Per SPEC_FULL.md §9's decision on the source's UDP-bind behavior: the data
//! socket binds `0.0.0.0:P` and is `connect()`-ed to the server's address, rather
//! than bound directly to it (the latter fails on most platforms whenever the
//! server address isn't also a local interface address).

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::codec::{response_code, ControlMessage};
use crate::crypto::CryptoEngine;
use crate::error::TransportError;
use crate::settings::{Settings, COMPARABILITY_VERSION, DEFAULT_HEARTBEAT_PERIOD, DEFAULT_READ_TIMEOUT};

use super::base::{EstablishedSession, HeartbeatOutcome, Session, TransportRole};
use super::channel::{recv_rsa, recv_sealed, send_rsa, send_sealed, TcpChannel};

pub struct ClientRole {
    settings: Settings,
    shutdown: watch::Receiver<bool>,
    udp_socket: Option<Arc<UdpSocket>>,
    channel: Option<TcpChannel>,
    crypto: Option<Arc<CryptoEngine>>,
}

impl ClientRole {
    pub fn new(settings: Settings, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            settings,
            shutdown,
            udp_socket: None,
            channel: None,
            crypto: None,
        }
    }

    /// The UDP socket the receiver (C8) reads frames from, once
    /// [`TransportRole::init_socket`] has run.
    pub fn udp_socket(&self) -> Option<Arc<UdpSocket>> {
        self.udp_socket.clone()
    }

    /// Handshake (§4.6 steps 1-5). RSA-only; no `seal`/`open` yet.
    async fn authenticate(&self, channel: &mut TcpChannel, crypto: &mut CryptoEngine) -> Result<Session, TransportError> {
        channel.send_raw(crypto.serialized_public_key()?.as_bytes()).await?;

        let server_pem_bytes = channel.recv_raw().await?;
        let server_pem = String::from_utf8(server_pem_bytes)
            .map_err(|_| TransportError::Fatal("server public key was not valid UTF-8".into()))?;
        crypto.load_peer_public_key(&server_pem)?;

        let password_b64 = self
            .settings
            .password
            .as_deref()
            .map(|p| BASE64.encode(p.as_bytes()))
            .unwrap_or_default();
        let hello = ControlMessage::new(password_b64, response_code::OK, COMPARABILITY_VERSION);
        send_rsa(channel, crypto, &hello).await?;

        let response = recv_rsa(channel, crypto).await?;

        if response.response_code == response_code::OK {
            let config = response
                .config
                .ok_or_else(|| TransportError::Fatal("auth-success message was missing its config record".into()))?;
            crypto.install_session(
                &config.aes_key,
                &config.aes_iv,
                config.is_encrypt,
                config.is_integrity_control,
            )?;
            info!("authenticated with server");
            return Ok(Session {
                peer_ip: self.settings.server_address.clone().unwrap_or_default(),
                comparability_version: response.comparability_version,
                reconnect_budget: response.reconnect_attempts.unwrap_or(0),
                socket_buffer_size: self.settings.socket_buffer_size,
                heartbeat_period: DEFAULT_HEARTBEAT_PERIOD,
            });
        }

        Err(match response.response_code {
            code if code == response_code::UNAUTHORIZED => {
                TransportError::Fatal("server rejected our password".into())
            }
            code if code == response_code::FORBIDDEN => TransportError::Fatal("this client is banned".into()),
            code if code == response_code::CONFLICT => TransportError::Fatal(format!(
                "version mismatch: server said {}",
                response.message
            )),
            _ => TransportError::Fatal(format!(
                "unexpected authentication response: {} {}",
                response.response_code, response.message
            )),
        })
    }
}

#[async_trait]
impl TransportRole for ClientRole {
    fn is_server(&self) -> bool {
        false
    }

    async fn init_socket(&mut self) -> Result<(), TransportError> {
        let server_address = self
            .settings
            .server_address
            .clone()
            .ok_or_else(|| TransportError::Fatal("client settings are missing a server_address".into()))?;

        let udp_socket = UdpSocket::bind(("0.0.0.0", self.settings.udp_port)).await?;
        udp_socket
            .connect(format!("{server_address}:{}", self.settings.udp_port))
            .await?;
        self.udp_socket = Some(Arc::new(udp_socket));
        Ok(())
    }

    async fn established_connection(&mut self, _is_reconnect: bool) -> Result<EstablishedSession, TransportError> {
        let server_address = self
            .settings
            .server_address
            .clone()
            .ok_or_else(|| TransportError::Fatal("client settings are missing a server_address".into()))?;
        let tcp_addr = format!("{server_address}:{}", self.settings.tcp_port());

        let stream = loop {
            if *self.shutdown.borrow() {
                return Err(TransportError::Fatal("shutdown requested before connecting".into()));
            }
            match TcpStream::connect(&tcp_addr).await {
                Ok(stream) => break stream,
                Err(e) => {
                    warn!(addr = %tcp_addr, error = %e, "connect attempt failed, retrying");
                    tokio::time::sleep(DEFAULT_HEARTBEAT_PERIOD).await;
                }
            }
        };
        info!(addr = %tcp_addr, "connected to server");

        let mut channel = TcpChannel::new(stream, self.settings.socket_buffer_size, DEFAULT_READ_TIMEOUT);
        let mut crypto = CryptoEngine::new(false, self.settings.is_encrypt, self.settings.is_integrity_control);

        let session = self.authenticate(&mut channel, &mut crypto).await?;
        let crypto = Arc::new(crypto);
        self.channel = Some(channel);
        self.crypto = Some(crypto.clone());
        Ok(EstablishedSession { session, crypto })
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

        // Client phase order (§4.4): send status, then receive+validate.
        let outgoing = if send_locked {
            ControlMessage::new("Locked", response_code::LOCKED, COMPARABILITY_VERSION)
        } else {
            ControlMessage::new("Accepted", response_code::ACCEPTED, COMPARABILITY_VERSION)
        };
        send_sealed(channel, &crypto, &outgoing).await?;

        let incoming = recv_sealed(channel, &crypto).await?;
        if incoming.response_code == response_code::LOCKED {
            return Ok(HeartbeatOutcome::PeerLocked);
        }
        Ok(HeartbeatOutcome::Ok)
    }

    async fn cleanup(&mut self) {
        self.channel = None;
        self.crypto = None;
    }
}
