//! Transport Base/Server/Client (C4/C5/C6): the TCP control-plane state machine.

mod base;
mod channel;
mod client;
mod server;

pub use base::{
    establish, phase_channel, run_transport_loop, ControlPhase, EstablishedSession, HeartbeatOutcome, PhaseHandle,
    PhaseWatcher, Session, TransportRole,
};
pub use channel::TcpChannel;
pub use client::ClientRole;
pub use server::ServerRole;
