//! Transport Base (C4): the heartbeat/reconnect/shutdown state machine shared by
//! the server and client roles. Grounded on
//! `echowarp/auth_and_heartbeat/transport_base.py`'s `_heartbeat_and_reconnect`
//! loop, generalized the way the teacher generalizes its handshake driver over a
//! `HandshakeTransport` trait (`src/handshake/transport.rs`,
//! `AlnpSession::connect`/`accept` in `src/session/mod.rs`).
//!
//! The historical source drives this loop with two independent
//! `threading.Event`s, `stop_util` (terminal) and `stop_stream` (paused/running).
//! This crate collapses them into one three-state [`ControlPhase`] carried on a
//! `tokio::sync::watch` channel, per SPEC_FULL.md §4.4's redesign note: a terminal
//! shutdown is always also a pause, so two booleans admit a state
//! (`stop_util=true, stop_stream=false`) the source never actually uses.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::crypto::CryptoEngine;
use crate::error::TransportError;
use std::sync::Arc;

/// The data plane's run state, driven by the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPhase {
    /// Streamer/receiver runs normally.
    Running,
    /// Streamer/receiver blocks at its barrier; the control loop is reconnecting.
    Paused,
    /// Terminal: streamer/receiver must drain and exit.
    Stopping,
}

/// The write side of a `ControlPhase` watch channel, held by the transport base.
#[derive(Clone)]
pub struct PhaseHandle {
    tx: watch::Sender<ControlPhase>,
}

impl PhaseHandle {
    pub fn set(&self, phase: ControlPhase) {
        self.tx.send_replace(phase);
    }

    pub fn get(&self) -> ControlPhase {
        *self.tx.borrow()
    }

    pub fn watcher(&self) -> PhaseWatcher {
        PhaseWatcher {
            rx: self.tx.subscribe(),
        }
    }
}

/// The read side, held by the streamer/receiver (C7/C8).
#[derive(Clone)]
pub struct PhaseWatcher {
    rx: watch::Receiver<ControlPhase>,
}

impl PhaseWatcher {
    pub fn get(&self) -> ControlPhase {
        *self.rx.borrow()
    }

    /// Blocks until the phase matches `target`. Used by the streamer/receiver to
    /// implement "block on `stop_stream` until running" (§4.7/§4.8).
    pub async fn wait_for(&mut self, target: ControlPhase) {
        let _ = self.rx.wait_for(|phase| *phase == target).await;
    }

    /// Blocks while paused, returning the phase that ended the wait. Used instead
    /// of `wait_for(Running)` so a streamer/receiver blocked during a reconnect
    /// also wakes up (instead of hanging) when the session shuts down outright.
    pub async fn wait_while_paused(&mut self) -> ControlPhase {
        let _ = self.rx.wait_for(|phase| *phase != ControlPhase::Paused).await;
        self.get()
    }
}

pub fn phase_channel(initial: ControlPhase) -> (PhaseHandle, PhaseWatcher) {
    let (tx, rx) = watch::channel(initial);
    (PhaseHandle { tx }, PhaseWatcher { rx })
}

/// Session metadata established by a handshake (§3). Immutable and shared,
/// read-only, with the streamer/receiver once built; the key/IV themselves live
/// in the [`CryptoEngine`], not here.
#[derive(Debug, Clone)]
pub struct Session {
    pub peer_ip: String,
    pub comparability_version: String,
    pub reconnect_budget: u32,
    pub socket_buffer_size: usize,
    pub heartbeat_period: Duration,
}

/// The product of a successful (re)handshake: a session description plus the
/// crypto engine now carrying installed session key material.
pub struct EstablishedSession {
    pub session: Session,
    pub crypto: Arc<CryptoEngine>,
}

/// One heartbeat round's outcome.
pub enum HeartbeatOutcome {
    Ok,
    /// The peer sent `423 Locked`.
    PeerLocked,
}

/// The abstract hooks a transport role (server or client) must provide. This
/// replaces the source's `TransportBase` abstract-method pair
/// (`_initialize_socket`, `_established_connection`) with a trait so the
/// heartbeat/reconnect/shutdown state machine in [`run_transport_loop`] can be
/// written once and shared, the way the teacher's
/// `ClientHandshake`/`ServerHandshake` drivers share one `run` body over a
/// `HandshakeTransport` implementation.
#[async_trait]
pub trait TransportRole: Send {
    fn is_server(&self) -> bool;

    /// (Re)creates the underlying socket(s), called before the first handshake
    /// attempt and again at the start of every reconnect.
    async fn init_socket(&mut self) -> Result<(), TransportError>;

    /// Performs `accept`+handshake (server) or `connect`+handshake (client),
    /// producing a fresh established session. `is_reconnect` selects the source's
    /// retry-until-success connect loop on the client, and a single blocking
    /// accept on the server.
    async fn established_connection(&mut self, is_reconnect: bool) -> Result<EstablishedSession, TransportError>;

    /// One heartbeat round over the current control channel. `send_locked`
    /// requests the terminal `423 Locked` body instead of the usual `202
    /// Accepted` one.
    async fn heartbeat_round(&mut self, send_locked: bool) -> Result<HeartbeatOutcome, TransportError>;

    /// Tears down the control (and, for the server role, listening) socket(s),
    /// swallowing socket errors per the shutdown sequence (§4.4 step 4).
    async fn cleanup(&mut self);
}

/// Runs a role's socket init and first handshake, without entering the
/// heartbeat loop. Split out from [`run_transport_loop`] so a caller can stand up
/// the data plane (which needs the session's crypto and peer address) before
/// handing the role over to the long-running control loop.
pub async fn establish<R: TransportRole>(role: &mut R) -> Result<EstablishedSession, TransportError> {
    role.init_socket().await?;
    role.established_connection(false).await
}

/// Drives the heartbeat/reconnect/shutdown state machine described in §4.4,
/// generic over the role-specific handshake/heartbeat mechanics. `established` is
/// the session produced by a prior call to [`establish`]. Returns once the
/// session has shut down (`Ok`) or a fatal error has propagated (`Err`).
pub async fn run_transport_loop<R: TransportRole>(
    role: &mut R,
    mut established: EstablishedSession,
    phase: PhaseHandle,
    mut shutdown: watch::Receiver<bool>,
    shutdown_grace: Duration,
) -> Result<(), TransportError> {
    phase.set(ControlPhase::Running);
    info!(peer = %established.session.peer_ip, "control session established");

    loop {
        if *shutdown.borrow() {
            return shut_down(role, &phase, shutdown_grace).await;
        }

        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return shut_down(role, &phase, shutdown_grace).await;
                }
            }
            result = role.heartbeat_round(false) => {
                match result {
                    Ok(HeartbeatOutcome::Ok) => {
                        tokio::time::sleep(established.session.heartbeat_period).await;
                    }
                    Ok(HeartbeatOutcome::PeerLocked) => {
                        if role.is_server() {
                            // A client that locks may simply be restarting; the
                            // server reconnects rather than exiting (§4.4).
                            warn!("peer sent Locked; reconnecting");
                            match reconnect(role, &phase, &mut established).await {
                                Ok(()) => {}
                                Err(e) => {
                                    phase.set(ControlPhase::Stopping);
                                    role.cleanup().await;
                                    return Err(e);
                                }
                            }
                        } else {
                            info!("server sent Locked; shutting down");
                            phase.set(ControlPhase::Stopping);
                            role.cleanup().await;
                            return Ok(());
                        }
                    }
                    Err(TransportError::Fatal(reason)) => {
                        phase.set(ControlPhase::Stopping);
                        role.cleanup().await;
                        return Err(TransportError::Fatal(reason));
                    }
                    Err(_recoverable) => {
                        match reconnect(role, &phase, &mut established).await {
                            Ok(()) => {}
                            Err(e) => {
                                phase.set(ControlPhase::Stopping);
                                role.cleanup().await;
                                return Err(e);
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Reconnection sequence (§4.4 steps 1-5): pause the data plane, try one in-place
/// heartbeat, and fall back to a full socket teardown + re-handshake, retried up to
/// `R` consecutive failures (unbounded when `R == 0`) before giving up.
async fn reconnect<R: TransportRole>(
    role: &mut R,
    phase: &PhaseHandle,
    established: &mut EstablishedSession,
) -> Result<(), TransportError> {
    phase.set(ControlPhase::Paused);

    if let Ok(HeartbeatOutcome::Ok) = role.heartbeat_round(false).await {
        phase.set(ControlPhase::Running);
        return Ok(());
    }

    let budget = established.session.reconnect_budget;
    let mut attempts: u32 = 0;

    loop {
        role.cleanup().await;

        if let Err(e) = role.init_socket().await {
            attempts += 1;
            warn!(attempts, error = %e, "reconnect: socket init failed");
            if budget > 0 && attempts >= budget {
                return Err(e);
            }
            continue;
        }

        match role.established_connection(true).await {
            Ok(new_established) => {
                *established = new_established;
                phase.set(ControlPhase::Running);
                info!(peer = %established.session.peer_ip, "reconnected");
                return Ok(());
            }
            Err(e) => {
                attempts += 1;
                warn!(attempts, error = %e, "reconnect: handshake failed");
                if budget > 0 && attempts >= budget {
                    return Err(e);
                }
            }
        }
    }
}

/// Shutdown sequence (§4.4): emit one `Locked` heartbeat, pause the data plane,
/// sleep the grace period, then tear down sockets.
async fn shut_down<R: TransportRole>(
    role: &mut R,
    phase: &PhaseHandle,
    shutdown_grace: Duration,
) -> Result<(), TransportError> {
    phase.set(ControlPhase::Stopping);
    let _ = role.heartbeat_round(true).await;
    tokio::time::sleep(shutdown_grace).await;
    role.cleanup().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn watcher_observes_phase_changes() {
        let (handle, mut watcher) = phase_channel(ControlPhase::Paused);
        assert_eq!(watcher.get(), ControlPhase::Paused);

        handle.set(ControlPhase::Running);
        watcher.wait_for(ControlPhase::Running).await;
        assert_eq!(watcher.get(), ControlPhase::Running);
    }

    #[tokio::test]
    async fn watcher_cloned_from_handle_sees_same_stream() {
        let (handle, _keep) = phase_channel(ControlPhase::Running);
        let mut watcher_a = handle.watcher();
        let mut watcher_b = handle.watcher();

        handle.set(ControlPhase::Stopping);
        watcher_a.wait_for(ControlPhase::Stopping).await;
        watcher_b.wait_for(ControlPhase::Stopping).await;
    }
}
