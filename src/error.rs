//! Error taxonomy shared across the crate.
//!
//! Each component owns a focused error enum; [`EchoWarpError`] composes them at the
//! outermost boundary (the binary, or any external caller driving [`crate::transport`]).

use thiserror::Error;

/// Failures raised by the crypto engine (C1).
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("malformed peer public key")]
    BadKey,
    #[error("plaintext exceeds the RSA-OAEP block size for this key")]
    AsymSize,
    #[error("asymmetric decryption failed")]
    Decrypt,
    #[error("operation requires session material that has not been installed")]
    State,
    #[error("integrity check failed: recovered hash does not match data")]
    Integrity,
    #[error("symmetric cipher error: {0}")]
    Symmetric(String),
}

/// Failures raised by the message codec (C2).
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("missing required field: {0}")]
    Schema(&'static str),
    #[error("field {0} had an unexpected type or value")]
    Type(&'static str),
    #[error("serialization failure: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Failures raised by the ban/retry ledger (C3). Largely infallible in memory; the
/// only failure mode is the durable file round-trip.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("failed to read ban list file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write ban list file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// The three-way disposition a transport-level failure is classified into, per
/// SPEC_FULL.md §4.4.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Recoverable: decode error, integrity failure, network timeout. Drives a
    /// reconnect, never a shutdown.
    #[error("recoverable transport error: {0}")]
    Recoverable(String),
    /// The peer sent `423 Locked`: an orderly shutdown notification.
    #[error("peer signaled shutdown (423 Locked)")]
    PeerLocked,
    /// Not recoverable: reconnect budget exhausted, socket setup failure, version
    /// mismatch, banned peer, bad password.
    #[error("fatal transport error: {0}")]
    Fatal(String),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures raised by the streamer/receiver (C7/C8).
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("capture device error: {0}")]
    Capture(String),
    #[error("playback device error: {0}")]
    Playback(String),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Crate-level error composing every component's failure type, for callers that do
/// not need to distinguish the source component.
#[derive(Debug, Error)]
pub enum EchoWarpError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Stream(#[from] StreamError),
}
