//! Liveness tracking through periodic heartbeats
//!
//! Every tracked peer has a miss counter. Each interval bumps all counters; a heartbeat
//! from a peer resets its counter. A peer whose counter reaches the threshold is dropped
//! from tracking and reported as timed out.

use crate::config::HeartbeatConfig;
use crate::PeerId;
use std::collections::HashMap;

#[derive(Debug, Default, PartialEq)]
pub struct HeartbeatTick {
    /// Peers that should receive a heartbeat this interval
    pub due: Vec<PeerId>,
    pub timed_out: Vec<PeerId>,
}

#[derive(Debug)]
pub struct HeartbeatMonitor {
    misses: HashMap<PeerId, u32>,
    threshold: u32,
}

impl HeartbeatMonitor {
    pub fn new(config: &HeartbeatConfig) -> Self {
        Self {
            misses: HashMap::new(),
            threshold: config.miss_threshold,
        }
    }

    pub fn track(&mut self, peer: impl Into<PeerId>) {
        self.misses.entry(peer.into()).or_insert(0);
    }

    pub fn untrack(&mut self, peer: &str) -> bool {
        self.misses.remove(peer).is_some()
    }

    /// Records a heartbeat; returns false for peers that are not tracked
    pub fn heard_from(&mut self, peer: &str) -> bool {
        match self.misses.get_mut(peer) {
            Some(misses) => {
                *misses = 0;
                true
            }
            None => false,
        }
    }

    pub fn tick(&mut self) -> HeartbeatTick {
        let mut tick = HeartbeatTick::default();

        for (peer, misses) in self.misses.iter_mut() {
            *misses += 1;
            if *misses >= self.threshold {
                tick.timed_out.push(peer.clone());
            } else {
                tick.due.push(peer.clone());
            }
        }

        for peer in &tick.timed_out {
            self.misses.remove(peer);
        }
        tick.due.sort();
        tick.timed_out.sort();
        tick
    }

    pub fn misses(&self, peer: &str) -> Option<u32> {
        self.misses.get(peer).copied()
    }

    pub fn is_tracking(&self, peer: &str) -> bool {
        self.misses.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.misses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.misses.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> HeartbeatMonitor {
        HeartbeatMonitor::new(&HeartbeatConfig::default())
    }

    #[test]
    fn test_silent_peer_times_out_on_third_interval() {
        let mut monitor = monitor();
        monitor.track("alice");

        let first = monitor.tick();
        assert_eq!(first.due, vec!["alice".to_string()]);
        assert!(first.timed_out.is_empty());

        let second = monitor.tick();
        assert_eq!(second.due, vec!["alice".to_string()]);

        let third = monitor.tick();
        assert!(third.due.is_empty());
        assert_eq!(third.timed_out, vec!["alice".to_string()]);
        assert!(!monitor.is_tracking("alice"));
    }

    #[test]
    fn test_heartbeat_resets_counter() {
        let mut monitor = monitor();
        monitor.track("alice");

        for _ in 0..10 {
            monitor.tick();
            monitor.tick();
            assert!(monitor.heard_from("alice"));
            assert_eq!(monitor.misses("alice"), Some(0));
        }
        assert!(monitor.is_tracking("alice"));
    }

    #[test]
    fn test_peers_are_independent() {
        let mut monitor = monitor();
        monitor.track("alice");
        monitor.track("bob");

        monitor.tick();
        monitor.heard_from("bob");
        monitor.tick();
        let tick = monitor.tick();

        assert_eq!(tick.timed_out, vec!["alice".to_string()]);
        assert_eq!(tick.due, vec!["bob".to_string()]);
        assert_eq!(monitor.len(), 1);
    }

    #[test]
    fn test_untracked_heartbeat_is_ignored() {
        let mut monitor = monitor();
        assert!(!monitor.heard_from("mallory"));
        assert!(monitor.is_empty());
    }

    #[test]
    fn test_track_does_not_reset_existing_counter() {
        let mut monitor = monitor();
        monitor.track("alice");
        monitor.tick();
        monitor.track("alice");
        assert_eq!(monitor.misses("alice"), Some(1));
    }
}
