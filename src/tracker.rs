//! Deterministic cleanup of toolkit-backed objects.
//!
//! Molecule handles (and anything else implementing [`Releasable`]) are
//! registered under a *wave*: a positive integer labeling one logical scope
//! of allocations. Cleaning a wave releases everything registered under it.
//! Wave 0 is the default wave for allocations with no narrower scope.
//!
//! The ledger is guarded by a single mutex; every operation serializes on
//! it. Release failures are logged and never abort a sweep, and an object
//! is removed from the ledger before its release runs, so nothing is ever
//! released twice by the tracker.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

/// Default quarantine delay before a deferred sweep runs.
pub const DEFAULT_QUARANTINE_DELAY: Duration = Duration::from_secs(60);

/// The default wave for allocations that never picked a scope.
pub const DEFAULT_WAVE: u64 = 0;

static NEXT_WAVE: AtomicU64 = AtomicU64::new(1);

/// Failure reported by a resource's release operation.
#[derive(Error, Debug, Clone)]
#[error("release failed: {reason}")]
pub struct ReleaseError {
    pub reason: String,
}

/// A resource the tracker can dispose of: an identity for deduplication
/// plus a release capability.
pub trait Releasable: Send {
    /// Stable identity; clones of one underlying resource share it.
    fn resource_key(&self) -> u64;
    fn release(&self) -> Result<(), ReleaseError>;
}

pub struct ResourceTracker {
    ledger: Mutex<BTreeMap<u64, Vec<Box<dyn Releasable>>>>,
    quarantine_delay: Duration,
}

impl Default for ResourceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::with_quarantine_delay(DEFAULT_QUARANTINE_DELAY)
    }

    pub fn with_quarantine_delay(delay: Duration) -> Self {
        ResourceTracker {
            ledger: Mutex::new(BTreeMap::new()),
            quarantine_delay: delay,
        }
    }

    /// Register `resource` under `wave`. Re-registering the same resource
    /// under the same wave is a no-op; with `move_from_other_waves` the
    /// resource is first withdrawn from every other wave.
    pub fn mark<R: Releasable + 'static>(&self, resource: R, wave: u64, move_from_other_waves: bool) {
        let key = resource.resource_key();
        let mut ledger = self.lock_ledger();
        if move_from_other_waves {
            for (&other, entries) in ledger.iter_mut() {
                if other != wave {
                    entries.retain(|r| r.resource_key() != key);
                }
            }
        }
        let entries = ledger.entry(wave).or_default();
        if entries.iter().any(|r| r.resource_key() == key) {
            return;
        }
        entries.push(Box::new(resource));
    }

    /// Release every object tracked for `wave`, then forget the wave.
    pub fn cleanup(&self, wave: u64) {
        let entries = {
            let mut ledger = self.lock_ledger();
            ledger.remove(&wave).unwrap_or_default()
        };
        release_all(wave, entries);
    }

    /// [`ResourceTracker::cleanup`] over every known wave.
    pub fn cleanup_all(&self) {
        let waves: Vec<(u64, Vec<Box<dyn Releasable>>)> = {
            let mut ledger = self.lock_ledger();
            std::mem::take(&mut *ledger).into_iter().collect()
        };
        for (wave, entries) in waves {
            release_all(wave, entries);
        }
    }

    /// Snapshot the whole ledger, clear it, and run the release sweep on
    /// the snapshot after the quarantine delay. For objects that may still
    /// be aliased by an in-flight operation.
    pub fn quarantine_and_cleanup(&self) {
        let snapshot: Vec<(u64, Vec<Box<dyn Releasable>>)> = {
            let mut ledger = self.lock_ledger();
            std::mem::take(&mut *ledger).into_iter().collect()
        };
        if snapshot.is_empty() {
            return;
        }
        let delay = self.quarantine_delay;
        let slot = std::sync::Arc::new(Mutex::new(Some(snapshot)));
        let worker_slot = slot.clone();
        let sweep = move |slot: &Mutex<Option<Vec<(u64, Vec<Box<dyn Releasable>>)>>>| {
            let taken = slot
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            if let Some(snapshot) = taken {
                for (wave, entries) in snapshot {
                    release_all(wave, entries);
                }
            }
        };
        let deferred = sweep.clone();
        let spawned = std::thread::Builder::new()
            .name("moldex-quarantine".into())
            .spawn(move || {
                std::thread::sleep(delay);
                deferred(&worker_slot);
            });
        if let Err(err) = spawned {
            warn!(error = %err, "quarantine thread unavailable, releasing inline");
            sweep(&slot);
        }
    }

    /// Process-unique, monotonically increasing, always positive.
    pub fn fresh_wave_id(&self) -> u64 {
        NEXT_WAVE.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of objects currently tracked for `wave`.
    pub fn tracked(&self, wave: u64) -> usize {
        self.lock_ledger().get(&wave).map_or(0, Vec::len)
    }

    /// Number of objects tracked across all waves.
    pub fn total_tracked(&self) -> usize {
        self.lock_ledger().values().map(Vec::len).sum()
    }

    fn lock_ledger(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, Vec<Box<dyn Releasable>>>> {
        self.ledger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn release_all(wave: u64, entries: Vec<Box<dyn Releasable>>) {
    let count = entries.len();
    for entry in entries {
        if let Err(err) = entry.release() {
            warn!(wave, key = entry.resource_key(), error = %err, "resource release failed");
        }
    }
    if count > 0 {
        debug!(wave, released = count, "cleanup_sweep");
    }
}

/// Scope guard that cleans its wave on every exit path.
pub struct WaveGuard<'a> {
    tracker: &'a ResourceTracker,
    wave: u64,
}

impl<'a> WaveGuard<'a> {
    /// Open a fresh wave on `tracker` and clean it on drop.
    pub fn fresh(tracker: &'a ResourceTracker) -> Self {
        let wave = tracker.fresh_wave_id();
        WaveGuard { tracker, wave }
    }

    pub fn wave(&self) -> u64 {
        self.wave
    }
}

impl Drop for WaveGuard<'_> {
    fn drop(&mut self) {
        self.tracker.cleanup(self.wave);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[derive(Clone)]
    struct Probe {
        key: u64,
        releases: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Probe {
        fn new(key: u64) -> (Self, Arc<AtomicUsize>) {
            let releases = Arc::new(AtomicUsize::new(0));
            (
                Probe {
                    key,
                    releases: releases.clone(),
                    fail: false,
                },
                releases,
            )
        }
    }

    impl Releasable for Probe {
        fn resource_key(&self) -> u64 {
            self.key
        }

        fn release(&self) -> Result<(), ReleaseError> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ReleaseError {
                    reason: "probe configured to fail".into(),
                });
            }
            Ok(())
        }
    }

    #[test]
    fn cleanup_releases_and_forgets_the_wave() {
        let tracker = ResourceTracker::new();
        let wave = tracker.fresh_wave_id();
        let (probe, releases) = Probe::new(1);
        tracker.mark(probe, wave, false);
        assert_eq!(tracker.tracked(wave), 1);

        tracker.cleanup(wave);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.tracked(wave), 0);

        // A second sweep finds nothing; no double release.
        tracker.cleanup(wave);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn duplicate_registration_is_a_no_op() {
        let tracker = ResourceTracker::new();
        let (probe, releases) = Probe::new(7);
        tracker.mark(probe.clone(), 3, false);
        tracker.mark(probe, 3, false);
        assert_eq!(tracker.tracked(3), 1);
        tracker.cleanup(3);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn mark_can_move_between_waves() {
        let tracker = ResourceTracker::new();
        let (probe, releases) = Probe::new(9);
        tracker.mark(probe.clone(), 1, false);
        tracker.mark(probe, 2, true);
        assert_eq!(tracker.tracked(1), 0);
        assert_eq!(tracker.tracked(2), 1);
        tracker.cleanup_all();
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn release_failures_do_not_abort_the_sweep() {
        let tracker = ResourceTracker::new();
        let (mut bad, bad_releases) = Probe::new(1);
        bad.fail = true;
        let (good, good_releases) = Probe::new(2);
        tracker.mark(bad, 5, false);
        tracker.mark(good, 5, false);
        tracker.cleanup(5);
        assert_eq!(bad_releases.load(Ordering::SeqCst), 1);
        assert_eq!(good_releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fresh_wave_ids_are_positive_and_increasing() {
        let tracker = ResourceTracker::new();
        let a = tracker.fresh_wave_id();
        let b = tracker.fresh_wave_id();
        assert!(a > 0);
        assert!(b > a);
    }

    #[test]
    fn quarantine_defers_the_sweep() {
        let tracker = ResourceTracker::with_quarantine_delay(Duration::from_millis(30));
        let (probe, releases) = Probe::new(11);
        tracker.mark(probe, DEFAULT_WAVE, false);

        tracker.quarantine_and_cleanup();
        // Ledger is already clear, but the release has not run yet.
        assert_eq!(tracker.total_tracked(), 0);
        assert_eq!(releases.load(Ordering::SeqCst), 0);

        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wave_guard_cleans_on_drop() {
        let tracker = ResourceTracker::new();
        let (probe, releases) = Probe::new(21);
        {
            let guard = WaveGuard::fresh(&tracker);
            tracker.mark(probe, guard.wave(), false);
            assert_eq!(tracker.tracked(guard.wave()), 1);
        }
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.total_tracked(), 0);
    }

    #[test]
    fn molecule_handles_release_through_the_tracker() {
        let mol = crate::chem::parse_smiles("CCO", true).unwrap();
        let tracker = ResourceTracker::new();
        let wave = tracker.fresh_wave_id();
        tracker.mark(mol.clone(), wave, false);
        tracker.cleanup(wave);
        assert!(mol.is_released());
    }
}
