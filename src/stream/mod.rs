//! Server Streamer / Client Receiver (C7/C8): the data-plane loops built on top
//! of `CapturePort`/`PlaybackPort` and the `Transport*Role`-established session.

mod client;
mod server;

pub use client::ClientReceiver;
pub use server::ServerStreamer;
