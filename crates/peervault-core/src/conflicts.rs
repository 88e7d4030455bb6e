//! Concurrent-edit detection.
//!
//! The tracker observes `(path, peer)` edit events and flags a path as
//! conflicted when two or more distinct peers touched it within a short
//! wall-clock window. Detection is advisory: the CRDT merge already
//! converged, this only tells the user a file is being edited from more
//! than one device at once.

use crate::events::{EventBus, Subscription};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Two peers editing the same path within this window is a conflict.
pub const CONCURRENT_WINDOW_MS: u64 = 60_000;
/// Bound on the number of paths with retained edit history.
pub const MAX_TRACKED_FILES: usize = 1000;
/// Bound on retained conflict records (resolved ones included).
pub const MAX_CONFLICTS: usize = 500;
/// Per-path bound on retained recent edits.
const MAX_EDITS_PER_PATH: usize = 20;

/// One observed edit.
#[derive(Debug, Clone)]
struct EditRecord {
    peer_id: String,
    peer_name: Option<String>,
    timestamp: u64,
}

/// A detected multi-peer edit on one path.
#[derive(Debug, Clone)]
pub struct ConflictRecord {
    pub path: String,
    /// Distinct peers seen inside the window, in first-seen order.
    pub peer_ids: Vec<String>,
    /// Advertised names for peers that have one.
    pub peer_names: HashMap<String, String>,
    /// When this conflict was first flagged (ms since epoch).
    pub first_detected: u64,
    /// Timestamps of the edits that contributed to the conflict.
    pub edit_timestamps: Vec<u64>,
    /// Set by `resolve_conflict`; resolved entries are kept for audit.
    pub resolved: bool,
}

#[derive(Default)]
struct TrackerState {
    recent_edits: HashMap<String, VecDeque<EditRecord>>,
    conflicts: HashMap<String, ConflictRecord>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Sliding-window detector for multi-peer edits on the same path.
pub struct ConflictTracker {
    state: RwLock<TrackerState>,
    bus: Arc<EventBus<ConflictRecord>>,
}

impl Default for ConflictTracker {
    fn default() -> Self {
        Self {
            state: RwLock::new(TrackerState::default()),
            bus: Arc::new(EventBus::new()),
        }
    }
}

impl ConflictTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an edit to `path` by `peer_id`. `timestamp` defaults to now.
    ///
    /// If the path now has edits from two or more distinct peers within
    /// [`CONCURRENT_WINDOW_MS`] of the current time, a conflict is created
    /// (or refreshed) and listeners are notified.
    pub fn record_edit(
        &self,
        path: &str,
        peer_id: &str,
        peer_name: Option<&str>,
        timestamp: Option<u64>,
    ) {
        let now = now_ms();
        let timestamp = timestamp.unwrap_or(now);
        let mut notify: Option<ConflictRecord> = None;

        {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());

            let edits = state.recent_edits.entry(path.to_string()).or_default();
            edits.push_back(EditRecord {
                peer_id: peer_id.to_string(),
                peer_name: peer_name.map(str::to_string),
                timestamp,
            });
            // Prune stale entries; double the window so a late second peer
            // still sees the first edit.
            let horizon = now.saturating_sub(2 * CONCURRENT_WINDOW_MS);
            while let Some(front) = edits.front() {
                if front.timestamp < horizon || edits.len() > MAX_EDITS_PER_PATH {
                    edits.pop_front();
                } else {
                    break;
                }
            }

            let window_start = now.saturating_sub(CONCURRENT_WINDOW_MS);
            let mut peer_ids: Vec<String> = Vec::new();
            let mut peer_names: HashMap<String, String> = HashMap::new();
            let mut edit_timestamps: Vec<u64> = Vec::new();
            for edit in edits.iter().filter(|e| e.timestamp >= window_start) {
                if !peer_ids.contains(&edit.peer_id) {
                    peer_ids.push(edit.peer_id.clone());
                }
                if let Some(name) = &edit.peer_name {
                    peer_names.insert(edit.peer_id.clone(), name.clone());
                }
                edit_timestamps.push(edit.timestamp);
            }

            if peer_ids.len() >= 2 {
                let record = state
                    .conflicts
                    .entry(path.to_string())
                    .and_modify(|c| {
                        c.peer_ids = peer_ids.clone();
                        c.peer_names = peer_names.clone();
                        c.edit_timestamps = edit_timestamps.clone();
                        c.resolved = false;
                    })
                    .or_insert_with(|| ConflictRecord {
                        path: path.to_string(),
                        peer_ids,
                        peer_names,
                        first_detected: now,
                        edit_timestamps,
                        resolved: false,
                    });
                notify = Some(record.clone());
            }

            Self::evict_edits(&mut state, now);
            Self::evict_conflicts(&mut state);
        }

        if let Some(record) = notify {
            debug!(path = %record.path, peers = ?record.peer_ids, "concurrent edit detected");
            self.bus.emit(&record);
        }
    }

    /// Drop the 10% of tracked paths with the oldest latest edit.
    fn evict_edits(state: &mut TrackerState, now: u64) {
        if state.recent_edits.len() <= MAX_TRACKED_FILES {
            return;
        }
        let mut latest: Vec<(String, u64)> = state
            .recent_edits
            .iter()
            .map(|(path, edits)| {
                let newest = edits.iter().map(|e| e.timestamp).max().unwrap_or(0);
                (path.clone(), newest)
            })
            .collect();
        latest.sort_by_key(|(_, ts)| *ts);
        let drop_count = (MAX_TRACKED_FILES / 10).max(1);
        for (path, _) in latest.into_iter().take(drop_count) {
            state.recent_edits.remove(&path);
        }
        debug!(
            remaining = state.recent_edits.len(),
            now = now,
            "evicted stale edit history"
        );
    }

    /// Drop 10% of conflict records: resolved first, oldest first.
    fn evict_conflicts(state: &mut TrackerState) {
        if state.conflicts.len() <= MAX_CONFLICTS {
            return;
        }
        let mut records: Vec<(String, bool, u64)> = state
            .conflicts
            .iter()
            .map(|(path, c)| (path.clone(), c.resolved, c.first_detected))
            .collect();
        // Resolved sort before unresolved, then oldest first.
        records.sort_by_key(|(_, resolved, first)| (!*resolved, *first));
        let drop_count = (MAX_CONFLICTS / 10).max(1);
        for (path, _, _) in records.into_iter().take(drop_count) {
            state.conflicts.remove(&path);
        }
    }

    /// The unresolved conflict for `path`, if any.
    pub fn get_conflict(&self, path: &str) -> Option<ConflictRecord> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .conflicts
            .get(path)
            .filter(|c| !c.resolved)
            .cloned()
    }

    /// All unresolved conflicts.
    pub fn get_conflicts(&self) -> Vec<ConflictRecord> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .conflicts
            .values()
            .filter(|c| !c.resolved)
            .cloned()
            .collect()
    }

    /// Mark the conflict for `path` resolved. The record is retained.
    pub fn resolve_conflict(&self, path: &str) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if let Some(conflict) = state.conflicts.get_mut(path) {
            conflict.resolved = true;
        }
    }

    /// Forget all conflict records, resolved or not.
    pub fn clear_conflicts(&self) {
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .conflicts
            .clear();
    }

    /// Forget everything: conflicts and edit history.
    pub fn reset(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.conflicts.clear();
        state.recent_edits.clear();
    }

    /// Register a conflict listener. Dropping the handle unsubscribes.
    pub fn on_conflict(
        &self,
        callback: impl Fn(&ConflictRecord) + Send + Sync + 'static,
    ) -> Subscription {
        self.bus.subscribe(callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_single_peer_is_not_a_conflict() {
        let tracker = ConflictTracker::new();
        let t = now_ms();
        tracker.record_edit("/p.md", "peer-1", Some("L"), Some(t));
        tracker.record_edit("/p.md", "peer-1", Some("L"), Some(t + 100));
        assert!(tracker.get_conflict("/p.md").is_none());
    }

    #[test]
    fn test_two_peers_in_window_conflict() {
        let tracker = ConflictTracker::new();
        let t = now_ms();
        tracker.record_edit("/p.md", "peer-1", Some("L"), Some(t));
        tracker.record_edit("/p.md", "peer-2", Some("P"), Some(t + 500));

        let conflict = tracker.get_conflict("/p.md").expect("conflict expected");
        assert_eq!(conflict.peer_ids, vec!["peer-1", "peer-2"]);
        assert_eq!(conflict.peer_names.get("peer-1"), Some(&"L".to_string()));
        assert_eq!(conflict.peer_names.get("peer-2"), Some(&"P".to_string()));
        assert_eq!(conflict.edit_timestamps.len(), 2);
    }

    #[test]
    fn test_edits_outside_window_do_not_conflict() {
        let tracker = ConflictTracker::new();
        let t = now_ms();
        tracker.record_edit("/p.md", "peer-1", Some("L"), Some(t - 120_000));
        tracker.record_edit("/p.md", "peer-2", Some("P"), Some(t));
        assert!(tracker.get_conflict("/p.md").is_none());
    }

    #[test]
    fn test_distinct_paths_are_independent() {
        let tracker = ConflictTracker::new();
        let t = now_ms();
        tracker.record_edit("/a.md", "peer-1", None, Some(t));
        tracker.record_edit("/b.md", "peer-2", None, Some(t));
        assert!(tracker.get_conflict("/a.md").is_none());
        assert!(tracker.get_conflict("/b.md").is_none());
        assert!(tracker.get_conflicts().is_empty());
    }

    #[test]
    fn test_resolve_keeps_record_but_hides_it() {
        let tracker = ConflictTracker::new();
        let t = now_ms();
        tracker.record_edit("/p.md", "peer-1", None, Some(t));
        tracker.record_edit("/p.md", "peer-2", None, Some(t));
        assert!(tracker.get_conflict("/p.md").is_some());

        tracker.resolve_conflict("/p.md");
        assert!(tracker.get_conflict("/p.md").is_none());
        assert!(tracker.get_conflicts().is_empty());
    }

    #[test]
    fn test_new_edit_reopens_resolved_conflict() {
        let tracker = ConflictTracker::new();
        let t = now_ms();
        tracker.record_edit("/p.md", "peer-1", None, Some(t));
        tracker.record_edit("/p.md", "peer-2", None, Some(t));
        tracker.resolve_conflict("/p.md");

        tracker.record_edit("/p.md", "peer-2", None, Some(t + 1000));
        assert!(tracker.get_conflict("/p.md").is_some());
    }

    #[test]
    fn test_listener_notified() {
        let tracker = ConflictTracker::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let _sub = tracker.on_conflict(move |c| {
            assert_eq!(c.path, "/p.md");
            count_clone.fetch_add(1, Ordering::Relaxed);
        });

        let t = now_ms();
        tracker.record_edit("/p.md", "peer-1", None, Some(t));
        assert_eq!(count.load(Ordering::Relaxed), 0);
        tracker.record_edit("/p.md", "peer-2", None, Some(t));
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let tracker = ConflictTracker::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let _bad = tracker.on_conflict(|_| panic!("listener bug"));
        let _good = tracker.on_conflict(move |_| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });

        let t = now_ms();
        tracker.record_edit("/p.md", "peer-1", None, Some(t));
        tracker.record_edit("/p.md", "peer-2", None, Some(t));
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_tracked_file_eviction() {
        let tracker = ConflictTracker::new();
        let t = now_ms();
        for i in 0..(MAX_TRACKED_FILES + 1) {
            tracker.record_edit(&format!("/f{i}.md"), "peer-1", None, Some(t));
        }
        let state = tracker.state.read().unwrap();
        assert!(state.recent_edits.len() <= MAX_TRACKED_FILES);
    }

    #[test]
    fn test_conflict_eviction_prefers_resolved() {
        let tracker = ConflictTracker::new();
        let t = now_ms();
        {
            // Synthesize a full conflict map directly: MAX resolved + 1 new.
            let mut state = tracker.state.write().unwrap();
            for i in 0..MAX_CONFLICTS {
                state.conflicts.insert(
                    format!("/old{i}.md"),
                    ConflictRecord {
                        path: format!("/old{i}.md"),
                        peer_ids: vec!["a".into(), "b".into()],
                        peer_names: HashMap::new(),
                        first_detected: t - 10_000 + i as u64,
                        edit_timestamps: vec![t],
                        resolved: true,
                    },
                );
            }
        }

        tracker.record_edit("/new.md", "peer-1", None, Some(t));
        tracker.record_edit("/new.md", "peer-2", None, Some(t));

        let state = tracker.state.read().unwrap();
        assert!(state.conflicts.len() <= MAX_CONFLICTS);
        // The fresh unresolved conflict survived eviction.
        assert!(state.conflicts.contains_key("/new.md"));
        // The oldest resolved entry did not.
        assert!(!state.conflicts.contains_key("/old0.md"));
    }

    #[test]
    fn test_reset_clears_everything() {
        let tracker = ConflictTracker::new();
        let t = now_ms();
        tracker.record_edit("/p.md", "peer-1", None, Some(t));
        tracker.record_edit("/p.md", "peer-2", None, Some(t));
        tracker.reset();
        assert!(tracker.get_conflicts().is_empty());
        assert!(tracker.state.read().unwrap().recent_edits.is_empty());
    }
}
