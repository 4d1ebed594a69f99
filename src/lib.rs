//! EchoWarp: authenticated PCM audio streaming over a TCP control plane and a
//! UDP data plane.
//!
//! A session has two coupled halves: a [`transport`] control plane (RSA-OAEP
//! handshake, heartbeat, reconnect, ban accounting) that negotiates a session key,
//! and a [`stream`] data plane that seals/opens PCM blocks with that key and
//! moves them over UDP. [`crypto`] and [`codec`] are the primitives both halves
//! share; [`ledger`] is the per-peer trust state the control plane consults.
//! [`ports`] and [`settings`] are this crate's boundary with the outside world:
//! audio device I/O and already-resolved configuration, respectively.

pub mod codec;
pub mod crypto;
pub mod error;
pub mod ledger;
pub mod ports;
pub mod settings;
pub mod stream;
pub mod transport;

pub use codec::{ControlMessage, SessionConfig};
pub use crypto::CryptoEngine;
pub use error::{CodecError, CryptoError, EchoWarpError, LedgerError, StreamError, TransportError};
pub use ledger::{BanLedger, PeerState};
pub use ports::{CapturePort, PlaybackPort};
pub use settings::Settings;
pub use stream::{ClientReceiver, ServerStreamer};
pub use transport::{
    establish, phase_channel, run_transport_loop, ClientRole, ControlPhase, ServerRole, Session, TransportRole,
};
