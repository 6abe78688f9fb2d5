//! Queue selection.
//!
//! A strategy is synchronous and performs no I/O; the manager keeps it behind a
//! mutex and schedules restart timers for the queues it pauses.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use ferry_common::{RebalanceConfig, WeightedQueue};

/// What a fetch result did to the rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    Unchanged,
    Grew,
    Paused,
}

pub trait PollingStrategy: Send {
    /// Next queue to fetch from, or `None` when every queue is paused
    fn next_queue(&mut self) -> Option<String>;

    /// Take a queue out of rotation for the pause delay
    fn pause(&mut self, queue: &str);

    /// Put a paused queue back into rotation. No-op for active queues.
    fn restart(&mut self, queue: &str);

    /// Report a fetch result
    fn messages_found(&mut self, queue: &str, count: usize) -> Rotation;

    /// Grow a queue's share by one, up to its configured weight.
    /// Returns whether the rotation changed.
    fn rebalance(&mut self, queue: &str) -> bool;

    /// `(name, active weight)` of every queue currently in rotation
    fn active_queues(&self) -> Vec<(String, u32)>;

    /// Delay between a pause and the scheduled restart
    fn pause_delay(&self) -> Duration;
}

#[derive(Debug)]
struct Entry {
    name: String,
    weight: u32,
    active: u32,
    paused_until: Option<Instant>,
    weight_before_pause: u32,
    empty_streak: u32,
}

/// Weighted round-robin over a flat rotation where each queue appears
/// `active` times. Selection pops the front and pushes it to the back.
#[derive(Debug)]
pub struct WeightedRoundRobin {
    entries: Vec<Entry>,
    rotation: VecDeque<usize>,
    pause_delay: Duration,
    config: RebalanceConfig,
}

impl WeightedRoundRobin {
    pub fn new(queues: &[WeightedQueue], pause_delay: Duration, config: RebalanceConfig) -> Self {
        let mut entries: Vec<Entry> = Vec::with_capacity(queues.len());
        let mut rotation = VecDeque::new();

        for queue in queues {
            // Repeated names fold into one entry with the summed weight
            let index = match entries.iter().position(|e| e.name == queue.name) {
                Some(index) => {
                    entries[index].weight += queue.weight.max(1);
                    entries[index].active = entries[index].weight;
                    index
                }
                None => {
                    entries.push(Entry {
                        name: queue.name.clone(),
                        weight: queue.weight.max(1),
                        active: queue.weight.max(1),
                        paused_until: None,
                        weight_before_pause: 0,
                        empty_streak: 0,
                    });
                    entries.len() - 1
                }
            };
            for _ in 0..queue.weight.max(1) {
                rotation.push_back(index);
            }
        }

        Self {
            entries,
            rotation,
            pause_delay,
            config,
        }
    }

    fn index_of(&self, queue: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == queue)
    }

    fn insert_occurrences(&mut self, index: usize, count: u32) {
        for _ in 0..count {
            self.rotation.push_back(index);
        }
        self.entries[index].active += count;
    }

    fn reinstate(&mut self, index: usize, occurrences: u32) {
        let entry = &mut self.entries[index];
        entry.paused_until = None;
        entry.empty_streak = 0;
        let occurrences = occurrences.clamp(1, entry.weight);
        self.insert_occurrences(index, occurrences);
        debug!(queue = %self.entries[index].name, weight = occurrences, "Unpaused queue");
    }

    fn unpause_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.paused_until.is_some_and(|until| until <= now))
            .map(|(index, _)| index)
            .collect();

        for index in expired {
            let occurrences = self.restart_weight(index);
            self.reinstate(index, occurrences);
        }
    }

    fn restart_weight(&self, index: usize) -> u32 {
        if self.config.grow_on_messages {
            1
        } else {
            self.entries[index].weight_before_pause
        }
    }

    pub fn is_paused(&self, queue: &str) -> bool {
        self.index_of(queue)
            .is_some_and(|index| self.entries[index].paused_until.is_some())
    }
}

impl PollingStrategy for WeightedRoundRobin {
    fn next_queue(&mut self) -> Option<String> {
        self.unpause_expired();

        let index = self.rotation.pop_front()?;
        self.rotation.push_back(index);
        Some(self.entries[index].name.clone())
    }

    fn pause(&mut self, queue: &str) {
        let Some(index) = self.index_of(queue) else {
            return;
        };
        if self.entries[index].paused_until.is_some() {
            return;
        }

        self.rotation.retain(|&i| i != index);
        let entry = &mut self.entries[index];
        entry.weight_before_pause = entry.active;
        entry.active = 0;
        entry.empty_streak = 0;
        entry.paused_until = Some(Instant::now() + self.pause_delay);
        debug!(queue = %queue, delay_ms = self.pause_delay.as_millis() as u64, "Paused queue");
    }

    fn restart(&mut self, queue: &str) {
        let Some(index) = self.index_of(queue) else {
            return;
        };
        if self.entries[index].paused_until.is_none() {
            return;
        }
        let occurrences = self.restart_weight(index);
        self.reinstate(index, occurrences);
    }

    fn messages_found(&mut self, queue: &str, count: usize) -> Rotation {
        let Some(index) = self.index_of(queue) else {
            return Rotation::Unchanged;
        };

        if count == 0 {
            let entry = &mut self.entries[index];
            entry.empty_streak += 1;
            let threshold = self.config.pause_after_empty;
            if threshold > 0 && entry.empty_streak >= threshold && entry.paused_until.is_none() {
                self.pause(queue);
                return Rotation::Paused;
            }
            return Rotation::Unchanged;
        }

        self.entries[index].empty_streak = 0;
        if self.config.grow_on_messages && self.rebalance(queue) {
            Rotation::Grew
        } else {
            Rotation::Unchanged
        }
    }

    fn rebalance(&mut self, queue: &str) -> bool {
        let Some(index) = self.index_of(queue) else {
            return false;
        };

        if self.entries[index].paused_until.is_some() {
            self.reinstate(index, 1);
            return true;
        }

        let entry = &self.entries[index];
        if entry.active >= entry.weight {
            return false;
        }

        self.insert_occurrences(index, 1);
        let entry = &self.entries[index];
        debug!(
            queue = %entry.name,
            weight = entry.active,
            max = entry.weight,
            "Increased queue weight"
        );
        true
    }

    fn active_queues(&self) -> Vec<(String, u32)> {
        self.entries
            .iter()
            .filter(|e| e.active > 0)
            .map(|e| (e.name.clone(), e.active))
            .collect()
    }

    fn pause_delay(&self) -> Duration {
        self.pause_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy(queues: &[(&str, u32)], delay: Duration, grow: bool) -> WeightedRoundRobin {
        let queues: Vec<WeightedQueue> = queues.iter().map(|(n, w)| WeightedQueue::new(*n, *w)).collect();
        WeightedRoundRobin::new(
            &queues,
            delay,
            RebalanceConfig {
                grow_on_messages: grow,
                pause_after_empty: 1,
            },
        )
    }

    fn take(strategy: &mut WeightedRoundRobin, n: usize) -> Vec<String> {
        (0..n).filter_map(|_| strategy.next_queue()).collect()
    }

    #[test]
    fn test_weights_respected_over_any_window() {
        let mut wrr = strategy(&[("a", 2), ("b", 1)], Duration::from_secs(10), true);
        let picks = take(&mut wrr, 30);

        for start in 0..=picks.len() - 3 {
            let window = &picks[start..start + 3];
            assert_eq!(window.iter().filter(|q| *q == "a").count(), 2, "window {:?}", window);
            assert_eq!(window.iter().filter(|q| *q == "b").count(), 1, "window {:?}", window);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_queue_skipped_until_restart() {
        let mut wrr = strategy(&[("a", 2), ("b", 1)], Duration::from_secs(10), false);
        wrr.pause("a");

        assert!(take(&mut wrr, 10).iter().all(|q| q == "b"));
        assert_eq!(wrr.active_queues(), vec![("b".to_string(), 1)]);

        wrr.restart("a");
        let picks = take(&mut wrr, 30);
        assert_eq!(picks.iter().filter(|q| *q == "a").count(), 20);
        assert_eq!(wrr.active_queues(), vec![("a".to_string(), 2), ("b".to_string(), 1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_lifted_after_delay() {
        let mut wrr = strategy(&[("a", 1), ("b", 1)], Duration::from_secs(5), true);
        wrr.pause("a");
        assert!(take(&mut wrr, 4).iter().all(|q| q == "b"));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(take(&mut wrr, 4).contains(&"a".to_string()));
        assert!(!wrr.is_paused("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_with_growth_regrows_one_step_per_fetch() {
        let mut wrr = strategy(&[("a", 3)], Duration::from_secs(60), true);

        assert_eq!(wrr.messages_found("a", 0), Rotation::Paused);
        assert_eq!(wrr.next_queue(), None);

        wrr.restart("a");
        assert_eq!(wrr.active_queues(), vec![("a".to_string(), 1)]);

        assert_eq!(wrr.messages_found("a", 4), Rotation::Grew);
        assert_eq!(wrr.messages_found("a", 4), Rotation::Grew);
        assert_eq!(wrr.messages_found("a", 4), Rotation::Unchanged);
        assert_eq!(wrr.active_queues(), vec![("a".to_string(), 3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_is_idempotent() {
        let mut wrr = strategy(&[("a", 2)], Duration::from_secs(60), true);
        wrr.restart("a");
        assert_eq!(wrr.active_queues(), vec![("a".to_string(), 2)]);

        wrr.pause("a");
        wrr.restart("a");
        wrr.restart("a");
        assert_eq!(wrr.active_queues(), vec![("a".to_string(), 1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebalance_unpauses_with_weight_one() {
        let mut wrr = strategy(&[("a", 4)], Duration::from_secs(60), true);
        wrr.pause("a");
        assert!(wrr.rebalance("a"));
        assert_eq!(wrr.active_queues(), vec![("a".to_string(), 1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_after_several_empty_fetches() {
        let queues = vec![WeightedQueue::new("a", 1)];
        let mut wrr = WeightedRoundRobin::new(
            &queues,
            Duration::from_secs(1),
            RebalanceConfig {
                grow_on_messages: true,
                pause_after_empty: 3,
            },
        );

        assert_eq!(wrr.messages_found("a", 0), Rotation::Unchanged);
        assert_eq!(wrr.messages_found("a", 0), Rotation::Unchanged);
        assert_eq!(wrr.messages_found("a", 1), Rotation::Unchanged);
        assert_eq!(wrr.messages_found("a", 0), Rotation::Unchanged);
        assert_eq!(wrr.messages_found("a", 0), Rotation::Unchanged);
        assert_eq!(wrr.messages_found("a", 0), Rotation::Paused);
    }

    #[test]
    fn test_pausing_disabled() {
        let queues = vec![WeightedQueue::new("a", 1)];
        let mut wrr = WeightedRoundRobin::new(
            &queues,
            Duration::ZERO,
            RebalanceConfig {
                grow_on_messages: false,
                pause_after_empty: 0,
            },
        );
        for _ in 0..5 {
            assert_eq!(wrr.messages_found("a", 0), Rotation::Unchanged);
        }
        assert_eq!(wrr.next_queue().as_deref(), Some("a"));
    }

    #[test]
    fn test_unknown_queue_ignored() {
        let mut wrr = strategy(&[("a", 1)], Duration::ZERO, true);
        wrr.pause("zzz");
        wrr.restart("zzz");
        assert_eq!(wrr.messages_found("zzz", 3), Rotation::Unchanged);
        assert!(!wrr.rebalance("zzz"));
        assert_eq!(wrr.next_queue().as_deref(), Some("a"));
    }

    #[test]
    fn test_no_queues() {
        let mut wrr = strategy(&[], Duration::ZERO, true);
        assert_eq!(wrr.next_queue(), None);
        assert!(wrr.active_queues().is_empty());
    }
}
