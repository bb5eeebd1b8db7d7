//! Hardware volume changes scheduled against the device latency.
//!
//! Raising the volume happens a safety margin late and lowering it a margin
//! early, so a louder level is never heard before the audio it belongs to.
//! The queue is kept sorted by time; a change that would land after a newer
//! one is dropped instead of reordered.

use std::collections::VecDeque;

use crate::volume::ChannelVolumes;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeChange {
    pub at: u64,
    pub hw_volume: ChannelVolumes,
}

#[derive(Debug, Clone)]
pub struct VolumeChangeQueue {
    changes: VecDeque<VolumeChange>,
    safety_margin: u64,
    extra_delay: i64,
}

fn offset(at: u64, delta: i64) -> u64 {
    if delta >= 0 {
        at.saturating_add(delta as u64)
    } else {
        at.saturating_sub(delta.unsigned_abs())
    }
}

impl VolumeChangeQueue {
    pub fn new(safety_margin: u64, extra_delay: i64) -> Self {
        Self {
            changes: VecDeque::new(),
            safety_margin,
            extra_delay,
        }
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn pending(&self) -> impl Iterator<Item = &VolumeChange> {
        self.changes.iter()
    }

    /// Time of the earliest pending change.
    pub fn next_at(&self) -> Option<u64> {
        self.changes.front().map(|c| c.at)
    }

    /// Schedules `hw_volume`. Returns false when nothing was queued because
    /// the hardware already has that volume.
    pub fn push(
        &mut self,
        hw_volume: ChannelVolumes,
        current_hw: &ChannelVolumes,
        latency_usec: u64,
        now: u64,
    ) -> bool {
        if self.changes.is_empty() && hw_volume == *current_hw {
            tracing::trace!("deferred volume unchanged");
            return false;
        }

        let margin = self.safety_margin;
        let mut at = offset(latency_usec.saturating_add(now), self.extra_delay);
        let louder_than = |other: &ChannelVolumes| hw_volume.avg() > other.avg();

        let mut insert_after = None;
        for (position, change) in self.changes.iter().enumerate().rev() {
            if louder_than(&change.hw_volume) {
                if at + margin > change.at {
                    at += margin;
                    insert_after = Some(position);
                    break;
                }
            } else if at.saturating_sub(margin) > change.at {
                at -= margin;
                insert_after = Some(position);
                break;
            }
        }

        let position = match insert_after {
            Some(position) => position + 1,
            None => {
                if louder_than(current_hw) {
                    at += margin;
                } else {
                    at = at.saturating_sub(margin);
                }
                0
            }
        };

        let dropped = self.changes.len() - position;
        if dropped > 0 {
            tracing::debug!(dropped, "dropping deferred volume changes scheduled after a newer one");
        }
        self.changes.truncate(position);
        tracing::debug!(at, volume = hw_volume.avg().0, "deferred volume change queued");
        self.changes.push_back(VolumeChange { at, hw_volume });
        true
    }

    /// Pops every change due at `now`. Returns the last one applied, which
    /// becomes the new hardware volume.
    pub fn apply(&mut self, now: u64) -> Option<ChannelVolumes> {
        let mut applied = None;
        while self.changes.front().is_some_and(|c| c.at <= now) {
            if let Some(change) = self.changes.pop_front() {
                tracing::trace!(late = now - change.at, "deferred volume change due");
                applied = Some(change.hw_volume);
            }
        }
        applied
    }

    pub fn flush(&mut self) {
        self.changes.clear();
    }

    /// Shifts changes scheduled after the current latency earlier by the
    /// rewound duration, never before that limit.
    pub fn rewind(&mut self, rewound_usec: u64, current_hw: &ChannelVolumes, latency_usec: u64, now: u64) {
        let limit = offset(latency_usec.saturating_add(now), self.extra_delay);
        let mut previous = current_hw.avg();
        for change in self.changes.iter_mut() {
            let volume = change.hw_volume.avg();
            let modified_limit = if previous > volume {
                limit.saturating_sub(self.safety_margin)
            } else {
                limit + self.safety_margin
            };
            if change.at > modified_limit {
                change.at = change.at.saturating_sub(rewound_usec).max(modified_limit);
            }
            previous = volume;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::Volume;

    fn level(fraction: f64) -> ChannelVolumes {
        ChannelVolumes::uniform(2, Volume::from_fraction(fraction))
    }

    #[test]
    fn increases_are_late_and_decreases_early() {
        let mut q = VolumeChangeQueue::new(1_000, 0);
        assert!(q.push(level(0.8), &level(0.5), 10_000, 100));
        assert_eq!(q.next_at(), Some(11_100));
        q.flush();
        assert!(q.push(level(0.2), &level(0.5), 10_000, 100));
        assert_eq!(q.next_at(), Some(9_100));
    }

    #[test]
    fn unchanged_volume_is_not_queued() {
        let mut q = VolumeChangeQueue::new(1_000, 0);
        assert!(!q.push(level(0.5), &level(0.5), 10_000, 0));
        assert!(q.is_empty());
    }

    #[test]
    fn rewind_pulls_changes_towards_the_limit() {
        let mut q = VolumeChangeQueue::new(1_000, 0);
        q.push(level(0.8), &level(0.5), 50_000, 0);
        q.rewind(30_000, &level(0.5), 10_000, 0);
        assert_eq!(q.next_at(), Some(21_000));
        q.rewind(30_000, &level(0.5), 10_000, 0);
        assert_eq!(q.next_at(), Some(11_000));
        assert_eq!(q.apply(11_000), Some(level(0.8)));
        assert!(q.is_empty());
    }
}
