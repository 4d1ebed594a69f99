//! The resolved configuration record the core accepts (§6). Gathering it from a
//! CLI, a config file, or an interactive prompt is out of core scope; this crate
//! only consumes the result.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ports::{CapturePort, PlaybackPort};

pub const DEFAULT_PORT: u16 = 4415;
pub const DEFAULT_WORKERS: usize = 1;
pub const DEFAULT_RECONNECT_ATTEMPT: u32 = 5;
pub const DEFAULT_BUFFER_SIZE: usize = 6144;
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_secs(2);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_BAN_LIST_FILE: &str = "echowarp_ban_list.txt";
pub const COMPARABILITY_VERSION: &str = "1";

/// Resolved, already-validated settings. Everything upstream of this (argument
/// parsing, interactive prompts, config file persistence) is an external
/// collaborator's job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub is_server: bool,
    pub udp_port: u16,
    pub server_address: Option<String>,
    pub reconnect_attempt: u32,
    pub is_encrypt: bool,
    pub is_integrity_control: bool,
    pub workers: usize,
    pub password: Option<String>,
    pub socket_buffer_size: usize,
    #[serde(with = "duration_secs")]
    pub shutdown_grace: Duration,
    pub ban_list_path: String,
}

impl Settings {
    /// TCP control port is always one below the UDP data port (§6).
    pub fn tcp_port(&self) -> u16 {
        self.udp_port - 1
    }

    pub fn server(udp_port: u16) -> Self {
        Self {
            is_server: true,
            udp_port,
            server_address: None,
            reconnect_attempt: DEFAULT_RECONNECT_ATTEMPT,
            is_encrypt: false,
            is_integrity_control: false,
            workers: DEFAULT_WORKERS,
            password: None,
            socket_buffer_size: DEFAULT_BUFFER_SIZE,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            ban_list_path: DEFAULT_BAN_LIST_FILE.to_string(),
        }
    }

    pub fn client(udp_port: u16, server_address: impl Into<String>) -> Self {
        Self {
            is_server: false,
            udp_port,
            server_address: Some(server_address.into()),
            reconnect_attempt: DEFAULT_RECONNECT_ATTEMPT,
            is_encrypt: false,
            is_integrity_control: false,
            workers: DEFAULT_WORKERS,
            password: None,
            socket_buffer_size: DEFAULT_BUFFER_SIZE,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            ban_list_path: DEFAULT_BAN_LIST_FILE.to_string(),
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Handles supplied by the caller, not deserialized: audio device I/O is an
/// external collaborator (§1).
pub struct DeviceHandles {
    pub capture: Option<Box<dyn CapturePort>>,
    pub playback: Option<Box<dyn PlaybackPort>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_port_is_one_below_udp_port() {
        let settings = Settings::server(DEFAULT_PORT);
        assert_eq!(settings.tcp_port(), DEFAULT_PORT - 1);
    }

    #[test]
    fn settings_round_trip_through_json() {
        let settings = Settings::client(DEFAULT_PORT, "192.0.2.10");
        let json = serde_json::to_string(&settings).unwrap();
        let back: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(back.udp_port, settings.udp_port);
        assert_eq!(back.server_address, settings.server_address);
        assert_eq!(back.shutdown_grace, settings.shutdown_grace);
    }
}
