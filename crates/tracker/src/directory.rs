use dashmap::DashMap;
use shoal_core::PeerId;
use shoal_core::clock::now_ms;
use shoal_tracker_comms::{FileSet, PeerEntry};

/// The tracker's view of the swarm. Per-peer mutations are atomic; a file-set
/// replacement is never observed half-applied.
#[derive(Default)]
pub struct PeerDirectory {
    peers: DashMap<PeerId, PeerEntry>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Default::default()
    }

    /// REGISTER: fresh entry with an empty file set. Registering twice
    /// leaves exactly one entry.
    pub fn register(&self, peer_id: PeerId) {
        self.peers.insert(
            peer_id,
            PeerEntry {
                peer_id,
                last_seen: now_ms(),
                files: FileSet::new(),
            },
        );
    }

    /// UPDATE: replace the file set and refresh liveness, creating the entry
    /// if the peer skipped REGISTER.
    pub fn update(&self, peer_id: PeerId, files: FileSet) {
        let mut entry = self.peers.entry(peer_id).or_insert_with(|| PeerEntry {
            peer_id,
            last_seen: 0,
            files: FileSet::new(),
        });
        entry.files = files;
        entry.last_seen = now_ms();
    }

    /// HEARTBEAT: refresh liveness only; a no-op for unknown peers.
    pub fn heartbeat(&self, peer_id: PeerId) -> bool {
        match self.peers.get_mut(&peer_id) {
            Some(mut entry) => {
                entry.last_seen = now_ms();
                true
            }
            None => false,
        }
    }

    pub fn unregister(&self, peer_id: PeerId) -> bool {
        self.peers.remove(&peer_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Drops every entry not seen for longer than `timeout_ms`. Returns how
    /// many were evicted.
    pub fn evict_stale(&self, now: u64, timeout_ms: u64) -> usize {
        let before = self.peers.len();
        self.peers
            .retain(|_, entry| now.saturating_sub(entry.last_seen) <= timeout_ms);
        before - self.peers.len()
    }

    /// Directory snapshot for a PEERS_LIST response: never contains the
    /// requester, never contains an entry already past the timeout.
    pub fn snapshot_excluding(&self, requester: PeerId, now: u64, timeout_ms: u64) -> Vec<PeerEntry> {
        self.peers
            .iter()
            .filter(|entry| {
                entry.peer_id != requester
                    && now.saturating_sub(entry.last_seen) <= timeout_ms
            })
            .map(|entry| entry.value().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(s: &str) -> PeerId {
        s.parse().unwrap()
    }

    #[test]
    fn test_register_is_idempotent() {
        let dir = PeerDirectory::new();
        let a = peer("10.0.0.1:9001");
        dir.register(a);
        dir.register(a);
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_register_resets_files() {
        let dir = PeerDirectory::new();
        let a = peer("10.0.0.1:9001");
        dir.update(a, shoal_tracker_comms::parse_files_info("f.bin,0,1"));
        dir.register(a);
        let snap = dir.snapshot_excluding(peer("10.0.0.9:1"), now_ms(), 120_000);
        assert_eq!(snap.len(), 1);
        assert!(snap[0].files.is_empty());
    }

    #[test]
    fn test_update_creates_unknown_peer() {
        let dir = PeerDirectory::new();
        let a = peer("10.0.0.1:9001");
        dir.update(a, shoal_tracker_comms::parse_files_info("f.bin,0"));
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_update_replaces_not_merges() {
        let dir = PeerDirectory::new();
        let a = peer("10.0.0.1:9001");
        dir.update(a, shoal_tracker_comms::parse_files_info("f.bin,0,1;;g.txt,0"));
        dir.update(a, shoal_tracker_comms::parse_files_info("h.iso,3"));
        let snap = dir.snapshot_excluding(peer("10.0.0.9:1"), now_ms(), 120_000);
        assert_eq!(snap[0].files.len(), 1);
        assert!(snap[0].files.contains_key("h.iso"));
    }

    #[test]
    fn test_heartbeat_unknown_is_noop() {
        let dir = PeerDirectory::new();
        assert!(!dir.heartbeat(peer("10.0.0.1:9001")));
        assert!(dir.is_empty());
    }

    #[test]
    fn test_snapshot_excludes_requester() {
        let dir = PeerDirectory::new();
        let a = peer("10.0.0.1:9001");
        let b = peer("10.0.0.2:9002");
        dir.register(a);
        dir.register(b);
        let snap = dir.snapshot_excluding(a, now_ms(), 120_000);
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].peer_id, b);
    }

    #[test]
    fn test_eviction() {
        let dir = PeerDirectory::new();
        let a = peer("10.0.0.1:9001");
        let b = peer("10.0.0.2:9002");
        dir.register(a);
        dir.register(b);
        dir.heartbeat(b);

        let now = now_ms() + 130_000;
        // a and b are both stale from the future's point of view.
        assert_eq!(dir.evict_stale(now, 120_000), 2);
        assert!(dir.is_empty());
    }

    #[test]
    fn test_stale_entry_not_returned_before_sweep() {
        let dir = PeerDirectory::new();
        let a = peer("10.0.0.1:9001");
        dir.register(a);
        let future = now_ms() + 130_000;
        let snap = dir.snapshot_excluding(peer("10.0.0.9:1"), future, 120_000);
        assert!(snap.is_empty());
    }
}
