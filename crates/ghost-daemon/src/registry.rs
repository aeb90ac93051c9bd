//! Peer registry (C6): a keyed map of `PeerRecord`s shared by the
//! communication server and the supervisor, guarded by `DashMap`'s internal
//! per-shard locking the same way the teacher's queue manager shares its
//! in-flight message map across tasks.
//!
//! `PeerStatus::Connected` does not exist as a separate variant (see
//! `ghost_common::PeerStatus`): a peer resuming metrics after being marked
//! `Disconnected` is treated as `Running` again, since a process actively
//! reporting in is running from the supervisor's point of view regardless of
//! whether the daemon itself spawned it.

use dashmap::DashMap;
use ghost_common::{MetricsReport, PeerRecord, PeerStatus, ProcessInfo};
use tracing::{info, warn};

pub const DAEMON_SELF_ID: &str = "ghost-daemon";

/// Peers with no message for longer than this are marked `Disconnected`
/// (§4.6, §8 property 7).
pub const STALENESS_THRESHOLD_SECS: i64 = 120;

#[derive(Default)]
pub struct PeerRegistry {
    peers: DashMap<String, PeerRecord>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<PeerRecord> {
        self.peers.get(id).map(|r| r.clone())
    }

    pub fn list(&self) -> Vec<PeerRecord> {
        self.peers.iter().map(|e| e.value().clone()).collect()
    }

    pub fn status(&self, id: &str) -> Option<PeerStatus> {
        self.peers.get(id).map(|r| r.status)
    }

    pub fn set_status(&self, id: &str, status: PeerStatus) {
        self.peers.entry(id.to_string()).and_modify(|r| r.status = status);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.peers.contains_key(id)
    }

    /// `process.registered` handler: insert or update from decoded
    /// `ProcessInfo` (§4.6).
    pub fn upsert_registered(&self, info: ProcessInfo) {
        let id = info.id.clone();
        self.peers
            .entry(id.clone())
            .and_modify(|r| {
                r.metadata = info.clone();
                r.status = PeerStatus::Registered;
                r.last_seen = chrono::Utc::now();
            })
            .or_insert_with(|| PeerRecord::new(id, info));
    }

    pub fn mark_stopped(&self, id: &str) {
        self.set_status(id, PeerStatus::Stopped);
    }

    pub fn mark_crashed(&self, id: &str) {
        self.set_status(id, PeerStatus::Crashed);
    }

    /// Returns `true` if `id` was previously unknown and has just been
    /// auto-registered (§4.6 step 4).
    fn ensure_known(&self, id: &str, app_type: &str) -> bool {
        if self.peers.contains_key(id) {
            return false;
        }
        info!(peer_id = id, app_type, "auto-registering unknown peer");
        self.peers
            .insert(id.to_string(), PeerRecord::auto_register(id, app_type));
        true
    }

    /// Record an inbound heartbeat/health/metrics message from `id`.
    /// Reconnects a `Disconnected` peer back to `Running` regardless of
    /// which of the three kinds arrived (§9 open question decision: any
    /// signal from a peer proves it's no longer silent, not just metrics).
    /// Returns `true` if the peer just reconnected, so the caller can emit
    /// `connection.connected`.
    pub fn record_message(&self, id: &str, app_type_hint: &str, metrics: Option<MetricsReport>) -> bool {
        self.ensure_known(id, app_type_hint);
        let mut reconnected = false;
        if let Some(mut record) = self.peers.get_mut(id) {
            record.last_seen = chrono::Utc::now();
            record.last_message = Some(chrono::Utc::now());
            if record.status == PeerStatus::Disconnected {
                record.status = PeerStatus::Running;
                reconnected = true;
            }
            if let Some(m) = metrics {
                record.last_metrics = Some(m);
            }
        }
        reconnected
    }

    /// Staleness scan (§4.6): peers silent for more than the threshold are
    /// marked `Disconnected`, except the daemon's own self-record. Returns
    /// the ids that were just transitioned, so the caller can emit
    /// `connection.disconnected` for each.
    pub fn scan_stale(&self, threshold_secs: i64) -> Vec<String> {
        let now = chrono::Utc::now();
        let mut newly_stale = Vec::new();
        for mut entry in self.peers.iter_mut() {
            if entry.key() == DAEMON_SELF_ID {
                continue;
            }
            if entry.status == PeerStatus::Disconnected {
                continue;
            }
            let silent_for = now.signed_duration_since(entry.last_seen).num_seconds();
            if silent_for > threshold_secs {
                entry.status = PeerStatus::Disconnected;
                newly_stale.push(entry.key().clone());
                warn!(peer_id = %entry.key(), silent_for, "peer marked stale");
            }
        }
        newly_stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ghost_common::ProcessInfo;
    use std::collections::HashMap;

    fn info(id: &str) -> ProcessInfo {
        ProcessInfo {
            id: id.to_string(),
            name: id.to_string(),
            process_type: "worker".to_string(),
            version: "1.0".to_string(),
            executable_path: String::new(),
            args: vec![],
            working_dir: String::new(),
            environment: HashMap::new(),
            configuration: HashMap::new(),
        }
    }

    #[test]
    fn unknown_peer_auto_registers_on_first_message() {
        let registry = PeerRegistry::new();
        assert!(!registry.contains("svc-1"));
        registry.record_message("svc-1", "worker", None);
        assert!(registry.contains("svc-1"));
        assert_eq!(registry.status("svc-1"), Some(PeerStatus::Registered));
    }

    #[test]
    fn resuming_messages_after_disconnect_reconnects() {
        let registry = PeerRegistry::new();
        registry.upsert_registered(info("svc-1"));
        registry.set_status("svc-1", PeerStatus::Disconnected);
        let reconnected = registry.record_message("svc-1", "worker", None);
        assert!(reconnected);
        assert_eq!(registry.status("svc-1"), Some(PeerStatus::Running));
    }

    #[test]
    fn stale_peer_is_marked_disconnected_but_self_is_exempt() {
        let registry = PeerRegistry::new();
        registry.upsert_registered(info("svc-1"));
        registry.peers.get_mut("svc-1").unwrap().last_seen =
            chrono::Utc::now() - chrono::Duration::seconds(200);
        registry.upsert_registered(info(DAEMON_SELF_ID));
        registry.peers.get_mut(DAEMON_SELF_ID).unwrap().last_seen =
            chrono::Utc::now() - chrono::Duration::seconds(999);

        let stale = registry.scan_stale(STALENESS_THRESHOLD_SECS);
        assert_eq!(stale, vec!["svc-1".to_string()]);
        assert_eq!(registry.status(DAEMON_SELF_ID), Some(PeerStatus::Registered));
    }
}
