//! Pending-acknowledgement table for important frames
//!
//! A frame enters the table when it is first transmitted and leaves it either when an
//! `Acknowledged` frame names its id or when its retry budget is spent. The table itself
//! never touches the socket: `sweep` reports what to resend and who went silent, and the
//! transport acts on that.

use crate::config::ReliabilityConfig;
use crate::frame::Frame;
use crate::PeerId;
use log::debug;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub frame: Frame,
    pub target: PeerId,
    /// Resends so far, not counting the first transmission
    pub attempts: u32,
    pub next_retry_at: Instant,
}

/// Outcome of one periodic pass over the table
#[derive(Debug, Default)]
pub struct Sweep {
    pub resend: Vec<Frame>,
    pub unreachable: Vec<PeerId>,
}

#[derive(Debug)]
pub struct PendingAcks {
    entries: HashMap<i32, PendingEntry>,
    retry_after: Duration,
    max_retries: u32,
}

impl PendingAcks {
    pub fn new(config: &ReliabilityConfig) -> Self {
        Self {
            entries: HashMap::new(),
            retry_after: config.retry_after,
            max_retries: config.max_retries,
        }
    }

    /// Records a frame at the moment of its first transmission
    pub fn track(&mut self, frame: Frame, now: Instant) {
        let target = frame.target_id.clone();
        self.entries.insert(
            frame.frame_id,
            PendingEntry {
                frame,
                target,
                attempts: 0,
                next_retry_at: now + self.retry_after,
            },
        );
    }

    /// Removes the entry for `frame_id`, however many times it was retried
    ///
    /// Only the peer the frame was sent to can acknowledge it.
    pub fn acknowledge(&mut self, frame_id: i32, from: &str) -> bool {
        match self.entries.get(&frame_id) {
            Some(entry) if entry.target == from => {
                self.entries.remove(&frame_id);
                true
            }
            _ => false,
        }
    }

    pub fn sweep(&mut self, now: Instant) -> Sweep {
        let mut sweep = Sweep::default();

        let mut due: Vec<i32> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.next_retry_at <= now)
            .map(|(id, _)| *id)
            .collect();
        due.sort_unstable();

        for frame_id in due {
            let Some(entry) = self.entries.get_mut(&frame_id) else {
                // Already purged with an unreachable peer earlier in this pass
                continue;
            };

            if entry.attempts >= self.max_retries {
                let target = entry.target.clone();
                debug!(
                    "Frame {} to {} unacknowledged after {} retries",
                    frame_id, target, entry.attempts
                );
                self.forget_peer(&target);
                sweep.unreachable.push(target);
                continue;
            }

            entry.attempts += 1;
            entry.next_retry_at = now + self.retry_after;
            sweep.resend.push(entry.frame.clone());
        }

        sweep
    }

    /// Drops every entry addressed to `peer`, returning how many were removed
    pub fn forget_peer(&mut self, peer: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.target != peer);
        before - self.entries.len()
    }

    pub fn get(&self, frame_id: i32) -> Option<&PendingEntry> {
        self.entries.get(&frame_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Recently delivered important frame ids per sender
///
/// A retried frame whose acknowledgement was lost arrives again with the same id. It must
/// be acknowledged again but handled only once.
#[derive(Debug)]
pub struct RecentFrames {
    seen: HashMap<PeerId, VecDeque<i32>>,
    capacity: usize,
}

impl RecentFrames {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashMap::new(),
            capacity,
        }
    }

    /// Returns false if this id from `sender` was already delivered
    pub fn first_delivery(&mut self, sender: &str, frame_id: i32) -> bool {
        let ids = self.seen.entry(sender.to_string()).or_default();
        if ids.contains(&frame_id) {
            return false;
        }
        if ids.len() >= self.capacity {
            ids.pop_front();
        }
        ids.push_back(frame_id);
        true
    }

    /// Clears a sender whose frame ids start over, such as a reconnecting peer
    pub fn forget(&mut self, sender: &str) {
        self.seen.remove(sender);
    }
}

impl Default for RecentFrames {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameBody;
    use crate::rpc::RpcEnvelope;
    use crate::SERVER_ID;

    fn important_frame(frame_id: i32, target: &str) -> Frame {
        let mut frame = Frame::rpc(RpcEnvelope::destroy(1), SERVER_ID, target);
        frame.frame_id = frame_id;
        frame
    }

    fn table() -> PendingAcks {
        PendingAcks::new(&ReliabilityConfig::default())
    }

    #[test]
    fn test_nothing_resent_within_grace_window() {
        let mut pending = table();
        let start = Instant::now();
        pending.track(important_frame(1, "alice"), start);

        let sweep = pending.sweep(start + Duration::from_millis(1999));
        assert!(sweep.resend.is_empty());
        assert!(sweep.unreachable.is_empty());
        assert_eq!(pending.get(1).unwrap().attempts, 0);
    }

    #[test]
    fn test_four_retries_then_unreachable() {
        let mut pending = table();
        let start = Instant::now();
        pending.track(important_frame(7, "alice"), start);

        let mut resent_at = Vec::new();
        let mut unreachable_at = None;
        // Sweep once a second for long enough to exhaust the budget
        for second in 1..=20 {
            let now = start + Duration::from_secs(second);
            let sweep = pending.sweep(now);
            for frame in &sweep.resend {
                assert_eq!(frame.frame_id, 7, "retries keep the original id");
                resent_at.push(second);
            }
            if !sweep.unreachable.is_empty() {
                assert_eq!(sweep.unreachable, vec!["alice".to_string()]);
                unreachable_at = Some(second);
                break;
            }
        }

        assert_eq!(resent_at, vec![2, 4, 6, 8]);
        for pair in resent_at.windows(2) {
            assert!(pair[1] - pair[0] >= 2);
        }
        assert_eq!(unreachable_at, Some(10));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_ack_removes_entry_even_after_retries() {
        let mut pending = table();
        let start = Instant::now();
        pending.track(important_frame(3, "alice"), start);

        let sweep = pending.sweep(start + Duration::from_secs(2));
        assert_eq!(sweep.resend.len(), 1);
        assert_eq!(pending.get(3).unwrap().attempts, 1);

        assert!(pending.acknowledge(3, "alice"));
        assert!(!pending.acknowledge(3, "alice"));
        assert!(pending.sweep(start + Duration::from_secs(30)).resend.is_empty());
    }

    #[test]
    fn test_ack_from_other_peer_ignored() {
        let mut pending = table();
        let start = Instant::now();
        pending.track(important_frame(4, "alice"), start);

        assert!(!pending.acknowledge(4, "bob"));
        assert!(pending.get(4).is_some());
        assert!(!pending.acknowledge(5, "alice"));

        assert!(pending.acknowledge(4, "alice"));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_unreachable_purges_all_frames_for_peer() {
        let mut pending = table();
        let start = Instant::now();
        pending.track(important_frame(1, "alice"), start);
        pending.track(important_frame(2, "alice"), start);
        pending.track(important_frame(3, "bob"), start + Duration::from_secs(5));

        let mut reports = Vec::new();
        for second in 1..=10 {
            reports.extend(pending.sweep(start + Duration::from_secs(second)).unreachable);
        }

        assert_eq!(reports, vec!["alice".to_string()]);
        assert_eq!(pending.len(), 1);
        assert!(pending.get(3).is_some());
    }

    #[test]
    fn test_forget_peer() {
        let mut pending = table();
        let now = Instant::now();
        pending.track(important_frame(1, "alice"), now);
        pending.track(important_frame(2, "bob"), now);
        pending.track(Frame::new(FrameBody::Heartbeat, SERVER_ID, "alice"), now);

        assert_eq!(pending.forget_peer("alice"), 2);
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_duplicate_delivery_detected() {
        let mut recent = RecentFrames::new(2);
        assert!(recent.first_delivery("alice", 1));
        assert!(!recent.first_delivery("alice", 1));
        assert!(recent.first_delivery("bob", 1));

        assert!(recent.first_delivery("alice", 2));
        assert!(recent.first_delivery("alice", 3));
        // Oldest id fell out of the window
        assert!(recent.first_delivery("alice", 1));

        recent.forget("bob");
        assert!(recent.first_delivery("bob", 1));
    }
}
