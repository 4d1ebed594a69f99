//! Ban/Retry Ledger (C3): per-peer-IP counters and the ban predicate, with durable
//! persistence of the banned set. Grounded on `echowarp/models/ban_list.py`.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use parking_lot::Mutex;
use tracing::error;

use crate::error::LedgerError;

/// Per-IP state tracked by the ledger. Mirrors `ClientStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerState {
    banned: bool,
    first_time_message: bool,
    consecutive_failures: u32,
    total_failures: u32,
    successes: u32,
}

impl PeerState {
    fn known() -> Self {
        Self {
            banned: false,
            first_time_message: true,
            consecutive_failures: 0,
            total_failures: 0,
            successes: 0,
        }
    }

    /// Constructs an entry already in the banned state, as loaded from the ban
    /// list file at startup: both counters preloaded to `reconnect_attempts`.
    fn loaded_banned(reconnect_attempts: u32) -> Self {
        Self {
            banned: true,
            first_time_message: true,
            consecutive_failures: reconnect_attempts,
            total_failures: reconnect_attempts,
            successes: 0,
        }
    }

    pub fn is_banned(&self) -> bool {
        self.banned
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn total_failures(&self) -> u32 {
        self.total_failures
    }

    pub fn successes(&self) -> u32 {
        self.successes
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.successes += 1;
        self.banned = false;
        self.first_time_message = true;
    }

    /// Once banned, failure counters freeze: only a fresh success re-arms them.
    fn record_failure(&mut self, reconnect_attempts: u32) {
        if !self.banned {
            self.consecutive_failures += 1;
            self.total_failures += 1;
        }
        if reconnect_attempts > 0 && self.consecutive_failures >= reconnect_attempts {
            self.banned = true;
        }
    }

    fn take_first_time_message(&mut self) -> bool {
        if self.first_time_message {
            self.first_time_message = false;
            true
        } else {
            false
        }
    }
}

/// Tracks every contacted peer IP and persists the banned subset to a text file.
/// A simple mutex is sufficient: mutated only from C5's accept/authenticate path
/// (§5).
pub struct BanLedger {
    entries: Mutex<HashMap<String, PeerState>>,
    reconnect_attempts: u32,
    ban_list_path: PathBuf,
}

impl BanLedger {
    /// Loads the persisted banned set (only when `reconnect_attempts > 0` and the
    /// file exists) and returns a ledger ready to track peers.
    pub fn load(reconnect_attempts: u32, ban_list_path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let ban_list_path = ban_list_path.into();
        let mut entries = HashMap::new();

        if reconnect_attempts > 0 && ban_list_path.is_file() {
            let contents = fs::read_to_string(&ban_list_path).map_err(|source| LedgerError::Read {
                path: ban_list_path.display().to_string(),
                source,
            })?;
            for line in contents.lines() {
                let ip = line.trim();
                if !ip.is_empty() {
                    entries.insert(ip.to_string(), PeerState::loaded_banned(reconnect_attempts));
                }
            }
        }

        Ok(Self {
            entries: Mutex::new(entries),
            reconnect_attempts,
            ban_list_path,
        })
    }

    /// Registers a peer IP on first contact, if not already known. Idempotent.
    pub fn register(&self, ip: &str) {
        self.entries
            .lock()
            .entry(ip.to_string())
            .or_insert_with(PeerState::known);
    }

    /// Returns `false` for a peer that has never been registered (P4).
    pub fn is_banned(&self, ip: &str) -> bool {
        self.entries.lock().get(ip).map(PeerState::is_banned).unwrap_or(false)
    }

    /// Read-once notice: `true` for an unregistered peer or the first query after a
    /// fresh ban; `false` on every subsequent query until the next success re-arms
    /// it.
    pub fn is_first_time_message(&self, ip: &str) -> bool {
        match self.entries.lock().get_mut(ip) {
            Some(state) => state.take_first_time_message(),
            None => true,
        }
    }

    /// Records a successful authentication and persists the ledger if the banned
    /// set changed. No-op for an unregistered peer.
    pub fn record_success(&self, ip: &str) {
        let changed = {
            let mut guard = self.entries.lock();
            match guard.get_mut(ip) {
                Some(state) => {
                    let was_banned = state.is_banned();
                    state.record_success();
                    was_banned
                }
                None => false,
            }
        };
        if changed {
            self.persist();
        }
    }

    /// Records a failed authentication and persists the ledger if the peer just
    /// crossed the ban threshold. No-op for an unregistered peer.
    pub fn record_failure(&self, ip: &str) {
        let changed = {
            let mut guard = self.entries.lock();
            match guard.get_mut(ip) {
                Some(state) => {
                    let was_banned = state.is_banned();
                    state.record_failure(self.reconnect_attempts);
                    !was_banned && state.is_banned()
                }
                None => false,
            }
        };
        if changed {
            self.persist();
        }
    }

    pub fn peer_state(&self, ip: &str) -> Option<PeerState> {
        self.entries.lock().get(ip).copied()
    }

    /// Overwrites the ban list file with every currently-banned IP, one per line.
    /// No-ops when `reconnect_attempts == 0` or the banned set is empty, matching
    /// `update_ban_list_file`.
    fn persist(&self) {
        if self.reconnect_attempts == 0 {
            return;
        }
        let banned: Vec<String> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, state)| state.is_banned())
            .map(|(ip, _)| ip.clone())
            .collect();

        if banned.is_empty() {
            return;
        }

        if let Err(source) = fs::write(&self.ban_list_path, banned.join("\n")) {
            let err = LedgerError::Write {
                path: self.ban_list_path.display().to_string(),
                source,
            };
            error!(target: "echowarp::ledger", error = %err, "failed to update ban list file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile_path::scratch_path;

    mod tempfile_path {
        use std::path::PathBuf;
        use std::sync::atomic::{AtomicU64, Ordering};

        static COUNTER: AtomicU64 = AtomicU64::new(0);

        pub fn scratch_path(name: &str) -> PathBuf {
            let n = COUNTER.fetch_add(1, Ordering::Relaxed);
            std::env::temp_dir().join(format!("echowarp_ledger_test_{name}_{n}.txt"))
        }
    }

    #[test]
    fn unknown_peer_is_not_banned_and_reports_first_time() {
        let ledger = BanLedger::load(5, scratch_path("unknown")).unwrap();
        assert!(!ledger.is_banned("10.0.0.1"));
        assert!(ledger.is_first_time_message("10.0.0.1"));
    }

    #[test]
    fn bans_after_r_consecutive_failures() {
        let ledger = BanLedger::load(3, scratch_path("bans")).unwrap();
        ledger.register("10.0.0.2");
        for _ in 0..2 {
            ledger.record_failure("10.0.0.2");
            assert!(!ledger.is_banned("10.0.0.2"));
        }
        ledger.record_failure("10.0.0.2");
        assert!(ledger.is_banned("10.0.0.2"));
    }

    #[test]
    fn failures_freeze_once_banned() {
        let ledger = BanLedger::load(2, scratch_path("freeze")).unwrap();
        ledger.register("10.0.0.3");
        ledger.record_failure("10.0.0.3");
        ledger.record_failure("10.0.0.3");
        assert!(ledger.is_banned("10.0.0.3"));
        ledger.record_failure("10.0.0.3");
        let state = ledger.peer_state("10.0.0.3").unwrap();
        assert_eq!(state.consecutive_failures(), 2);
        assert_eq!(state.total_failures(), 2);
    }

    #[test]
    fn success_clears_ban_and_rearms_first_time_message() {
        let ledger = BanLedger::load(1, scratch_path("rearm")).unwrap();
        ledger.register("10.0.0.4");
        ledger.record_failure("10.0.0.4");
        assert!(ledger.is_banned("10.0.0.4"));
        assert!(ledger.is_first_time_message("10.0.0.4"));
        assert!(!ledger.is_first_time_message("10.0.0.4"));

        ledger.record_success("10.0.0.4");
        assert!(!ledger.is_banned("10.0.0.4"));
        assert!(ledger.is_first_time_message("10.0.0.4"));
    }

    #[test]
    fn r_zero_never_bans_but_still_counts() {
        let ledger = BanLedger::load(0, scratch_path("unlimited")).unwrap();
        ledger.register("10.0.0.5");
        for _ in 0..50 {
            ledger.record_failure("10.0.0.5");
        }
        assert!(!ledger.is_banned("10.0.0.5"));
        let state = ledger.peer_state("10.0.0.5").unwrap();
        assert_eq!(state.total_failures(), 50);
    }

    #[test]
    fn persists_and_reloads_banned_set() {
        let path = scratch_path("persist");
        {
            let ledger = BanLedger::load(1, &path).unwrap();
            ledger.register("10.0.0.6");
            ledger.record_failure("10.0.0.6");
            assert!(ledger.is_banned("10.0.0.6"));
        }

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), "10.0.0.6");

        let reloaded = BanLedger::load(1, &path).unwrap();
        assert!(reloaded.is_banned("10.0.0.6"));
        let state = reloaded.peer_state("10.0.0.6").unwrap();
        assert_eq!(state.consecutive_failures(), 1);
        assert_eq!(state.total_failures(), 1);

        fs::remove_file(&path).ok();
    }
}
