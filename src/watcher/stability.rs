//! Size-stability debouncing for monitored files.
//!
//! A file is only reported as changed once two size observations taken one
//! threshold apart agree. Every new raw notification replaces the pending
//! check for that path, and results of a replaced check are discarded.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Pending stability check for one file.
#[derive(Debug, Clone)]
struct StabilityCheck {
    /// Size snapshot the next observation is compared with.
    size: Option<u64>,
    /// When the next observation is due.
    deadline: Instant,
    /// Identity of this check; a newer notification gets a new one.
    generation: u64,
    /// An observation has been requested and not resolved yet.
    in_flight: bool,
}

/// Result of resolving an observation against its check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Size unchanged since the snapshot; the file has settled.
    Stable,
    /// Size moved; the check was rescheduled with the new snapshot.
    Unsettled,
    /// A newer check replaced this one (or it was cancelled).
    Superseded,
}

/// Tracks stability checks by relative path.
#[derive(Debug)]
pub struct StabilityTracker {
    pending: HashMap<PathBuf, StabilityCheck>,
    threshold: Duration,
    next_generation: u64,
}

impl StabilityTracker {
    /// Create a tracker with the given stability threshold.
    pub fn new(threshold: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            threshold,
            next_generation: 0,
        }
    }

    /// Start a new check for `path`, replacing any check in progress.
    ///
    /// `size` is the snapshot taken now, `None` if the file could not be
    /// stat'ed. Returns the identity of the new check.
    pub fn schedule(&mut self, path: PathBuf, size: Option<u64>, now: Instant) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.pending.insert(
            path,
            StabilityCheck {
                size,
                deadline: now + self.threshold,
                generation,
                in_flight: false,
            },
        );
        generation
    }

    /// Drop the check for `path` without reporting it.
    pub fn cancel(&mut self, path: &Path) -> bool {
        self.pending.remove(path).is_some()
    }

    /// Checks whose deadline passed and that are not already being observed.
    ///
    /// The returned checks are marked in flight until resolved.
    pub fn take_due(&mut self, now: Instant) -> Vec<(PathBuf, u64)> {
        let mut due = Vec::new();
        for (path, check) in self.pending.iter_mut() {
            if !check.in_flight && now >= check.deadline {
                check.in_flight = true;
                due.push((path.clone(), check.generation));
            }
        }
        due
    }

    /// Resolve an observation of `observed` bytes for check `generation`.
    pub fn resolve(
        &mut self,
        path: &Path,
        generation: u64,
        observed: u64,
        now: Instant,
    ) -> Resolution {
        let Some(check) = self.pending.get_mut(path) else {
            return Resolution::Superseded;
        };
        if check.generation != generation {
            return Resolution::Superseded;
        }

        if check.size == Some(observed) {
            self.pending.remove(path);
            return Resolution::Stable;
        }

        check.size = Some(observed);
        check.deadline = now + self.threshold;
        check.in_flight = false;
        Resolution::Unsettled
    }

    /// Drop check `generation` for `path` after a failed observation.
    ///
    /// Returns `false` when a newer check already replaced it.
    pub fn discard(&mut self, path: &Path, generation: u64) -> bool {
        match self.pending.get(path) {
            Some(check) if check.generation == generation => {
                self.pending.remove(path);
                true
            }
            _ => false,
        }
    }

    /// Check if there are any pending checks.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Get the number of pending checks.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drop every pending check.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: Duration = Duration::from_millis(50);

    #[test]
    fn test_stable_after_threshold() {
        let mut tracker = StabilityTracker::new(THRESHOLD);
        let start = Instant::now();
        let path = PathBuf::from("clip.mxf");

        tracker.schedule(path.clone(), Some(4), start);

        // Nothing is due before the threshold
        assert!(tracker.take_due(start + Duration::from_millis(10)).is_empty());

        let due = tracker.take_due(start + THRESHOLD);
        assert_eq!(due.len(), 1);
        let (due_path, generation) = due[0].clone();
        assert_eq!(due_path, path);

        let resolution = tracker.resolve(&path, generation, 4, start + THRESHOLD);
        assert_eq!(resolution, Resolution::Stable);
        assert!(!tracker.has_pending());
    }

    #[test]
    fn test_growing_file_is_rescheduled() {
        let mut tracker = StabilityTracker::new(THRESHOLD);
        let start = Instant::now();
        let path = PathBuf::from("clip.mxf");

        tracker.schedule(path.clone(), Some(4), start);
        let (_, generation) = tracker.take_due(start + THRESHOLD)[0].clone();

        let later = start + THRESHOLD;
        assert_eq!(
            tracker.resolve(&path, generation, 8, later),
            Resolution::Unsettled
        );

        // Rescheduled one threshold after the observation
        assert!(tracker.take_due(later + Duration::from_millis(10)).is_empty());
        let (_, generation) = tracker.take_due(later + THRESHOLD)[0].clone();
        assert_eq!(
            tracker.resolve(&path, generation, 8, later + THRESHOLD),
            Resolution::Stable
        );
    }

    #[test]
    fn test_newer_event_supersedes_in_flight_check() {
        let mut tracker = StabilityTracker::new(THRESHOLD);
        let start = Instant::now();
        let path = PathBuf::from("clip.mxf");

        tracker.schedule(path.clone(), Some(4), start);
        let (_, stale) = tracker.take_due(start + THRESHOLD)[0].clone();

        // A new write arrives while the observation is in flight
        let fresh = tracker.schedule(path.clone(), Some(8), start + THRESHOLD);
        assert_ne!(stale, fresh);

        assert_eq!(
            tracker.resolve(&path, stale, 8, start + THRESHOLD),
            Resolution::Superseded
        );
        assert!(tracker.has_pending());
        assert!(!tracker.discard(&path, stale));
    }

    #[test]
    fn test_in_flight_checks_are_not_taken_twice() {
        let mut tracker = StabilityTracker::new(THRESHOLD);
        let start = Instant::now();

        tracker.schedule(PathBuf::from("a.mxf"), Some(1), start);
        assert_eq!(tracker.take_due(start + THRESHOLD).len(), 1);
        assert!(tracker.take_due(start + THRESHOLD * 2).is_empty());
    }

    #[test]
    fn test_cancel_and_discard() {
        let mut tracker = StabilityTracker::new(THRESHOLD);
        let start = Instant::now();
        let path = PathBuf::from("clip.mxf");

        tracker.schedule(path.clone(), None, start);
        assert!(tracker.cancel(&path));
        assert!(!tracker.has_pending());

        let generation = tracker.schedule(path.clone(), None, start);
        assert!(tracker.discard(&path, generation));
        assert_eq!(tracker.pending_count(), 0);
    }
}
