//! External-collaborator interfaces for audio device I/O (§1). Device enumeration,
//! opening, and teardown are out of core scope; the core only needs a source of
//! 16-bit PCM blocks and a sink for them. Shaped after the teacher's
//! `FrameTransport` trait (`crate::stream::FrameTransport` in the source tree).

use async_trait::async_trait;

use crate::error::StreamError;

/// Yields PCM blocks from whatever captures audio (microphone, loopback, a test
/// fixture). One `read_block` call corresponds to one ~1024-sample block (§3).
#[async_trait]
pub trait CapturePort: Send + Sync {
    async fn read_block(&mut self) -> Result<Vec<u8>, StreamError>;
    fn sample_rate(&self) -> u32;
    fn channels(&self) -> u16;
}

/// Consumes PCM blocks for playback (speaker, loopback, a test fixture).
#[async_trait]
pub trait PlaybackPort: Send + Sync {
    async fn write_block(&mut self, data: &[u8]) -> Result<(), StreamError>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tokio::sync::mpsc;

    /// A capture port fed by a channel, for streamer tests that don't touch real
    /// audio hardware.
    pub struct ChannelCapture {
        pub rx: mpsc::Receiver<Vec<u8>>,
        pub sample_rate: u32,
        pub channels: u16,
    }

    #[async_trait]
    impl CapturePort for ChannelCapture {
        async fn read_block(&mut self) -> Result<Vec<u8>, StreamError> {
            self.rx
                .recv()
                .await
                .ok_or_else(|| StreamError::Capture("capture channel closed".into()))
        }

        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }

        fn channels(&self) -> u16 {
            self.channels
        }
    }

    /// A playback port that forwards every block onto a channel for assertions.
    pub struct ChannelPlayback {
        pub tx: mpsc::Sender<Vec<u8>>,
    }

    #[async_trait]
    impl PlaybackPort for ChannelPlayback {
        async fn write_block(&mut self, data: &[u8]) -> Result<(), StreamError> {
            self.tx
                .send(data.to_vec())
                .await
                .map_err(|_| StreamError::Playback("playback channel closed".into()))
        }
    }
}
