//! Thread synchronization primitives used by the store and the transports.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/// Counting semaphore.
///
/// The blocking transport's sender thread waits here for queued packets.
#[derive(Debug, Default)]
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    /// Create a semaphore holding `permits` permits.
    #[must_use]
    pub const fn new(permits: usize) -> Self {
        Self { permits: parking_lot::const_mutex(permits), available: Condvar::new() }
    }

    /// Return one permit, waking a waiter.
    pub fn release(&self) {
        self.release_n(1);
    }

    /// Return `count` permits.
    pub fn release_n(&self, count: usize) {
        let mut permits = self.permits.lock();
        *permits += count;
        drop(permits);
        if count == 1 {
            self.available.notify_one();
        } else {
            self.available.notify_all();
        }
    }

    /// Block until a permit is available and take it.
    pub fn acquire(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.available.wait(&mut permits);
        }
        *permits -= 1;
    }

    /// Take a permit if one is immediately available.
    pub fn try_acquire(&self) -> bool {
        let mut permits = self.permits.lock();
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    /// Wait at most `timeout` for a permit. Returns whether one was taken.
    pub fn try_acquire_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut permits = self.permits.lock();
        while *permits == 0 {
            if self.available.wait_until(&mut permits, deadline).timed_out() {
                break;
            }
        }
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    /// Take every available permit, returning how many were taken.
    pub fn drain(&self) -> usize {
        std::mem::take(&mut *self.permits.lock())
    }

    /// Permits currently available.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        *self.permits.lock()
    }
}

#[derive(Debug, Default)]
struct BarrierState {
    parties: usize,
    failure: Option<String>,
}

/// Reusable countdown gate.
///
/// Every participant registers with [`add_party`](Self::add_party) and later
/// calls [`release`](Self::release) (or [`fail`](Self::fail)). Waiters are
/// woken once no party is outstanding. One barrier can span several stores so
/// a group of commits completes in a single wave.
#[derive(Debug, Default)]
pub struct SynchronizationBarrier {
    state: Mutex<BarrierState>,
    released: Condvar,
}

impl SynchronizationBarrier {
    /// Create a barrier with no outstanding parties.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one more party that must release before waiters proceed.
    pub fn add_party(&self) {
        self.state.lock().parties += 1;
    }

    /// Release one party.
    pub fn release(&self) {
        let mut state = self.state.lock();
        state.parties = state.parties.saturating_sub(1);
        if state.parties == 0 {
            self.released.notify_all();
        }
    }

    /// Release one party and record a failure; every waiter observes it.
    pub fn fail(&self, reason: impl Into<String>) {
        let mut state = self.state.lock();
        state.parties = state.parties.saturating_sub(1);
        if state.failure.is_none() {
            state.failure = Some(reason.into());
        }
        self.released.notify_all();
    }

    /// Number of parties not yet released.
    #[must_use]
    pub fn pending_parties(&self) -> usize {
        self.state.lock().parties
    }

    /// Block until every party is released.
    ///
    /// # Errors
    /// Returns [`Error::BarrierFailed`] if any party failed.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.state.lock();
        while state.parties > 0 && state.failure.is_none() {
            self.released.wait(&mut state);
        }
        Self::outcome(&state)
    }

    /// Like [`wait`](Self::wait) with an upper bound.
    ///
    /// # Errors
    /// Returns [`Error::Timeout`] if parties are still outstanding at the
    /// deadline, or [`Error::BarrierFailed`] if any party failed.
    pub fn wait_for(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.parties > 0 && state.failure.is_none() {
            if self.released.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        if state.parties > 0 && state.failure.is_none() {
            return Err(Error::Timeout {
                operation: "synchronization barrier".to_owned(),
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            });
        }
        Self::outcome(&state)
    }

    /// Clear parties and failure so the barrier can be reused.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.parties = 0;
        state.failure = None;
    }

    fn outcome(state: &BarrierState) -> Result<()> {
        match &state.failure {
            Some(reason) => Err(Error::BarrierFailed { message: reason.clone() }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_semaphore_counts() {
        let sem = Semaphore::new(2);
        assert!(sem.try_acquire());
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
        sem.release_n(3);
        assert_eq!(sem.available_permits(), 3);
        assert_eq!(sem.drain(), 3);
        assert_eq!(sem.available_permits(), 0);
    }

    #[test]
    fn test_semaphore_timeout() {
        let sem = Semaphore::new(0);
        let start = Instant::now();
        assert!(!sem.try_acquire_for(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_semaphore_wakes_waiter() {
        let sem = Arc::new(Semaphore::new(0));
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.acquire())
        };
        thread::sleep(Duration::from_millis(10));
        sem.release();
        waiter.join().unwrap();
        assert_eq!(sem.available_permits(), 0);
    }

    #[test]
    fn test_barrier_waits_for_all_parties() {
        let barrier = Arc::new(SynchronizationBarrier::new());
        barrier.add_party();
        barrier.add_party();

        let releaser = {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                barrier.release();
                barrier.release();
            })
        };
        barrier.wait().unwrap();
        assert_eq!(barrier.pending_parties(), 0);
        releaser.join().unwrap();
    }

    #[test]
    fn test_barrier_failure_propagates() {
        let barrier = SynchronizationBarrier::new();
        barrier.add_party();
        barrier.add_party();
        barrier.fail("fsync failed");
        assert!(matches!(barrier.wait(), Err(Error::BarrierFailed { .. })));

        barrier.reset();
        assert!(barrier.wait().is_ok());
    }

    #[test]
    fn test_barrier_timeout() {
        let barrier = SynchronizationBarrier::new();
        barrier.add_party();
        assert!(matches!(barrier.wait_for(Duration::from_millis(20)), Err(Error::Timeout { .. })));
    }
}
