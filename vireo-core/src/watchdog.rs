//! Shared liveness watchdog.
//!
//! One timer thread polls every registered [`ActiveObject`] and fires its
//! timeout callback once it has been idle for its own delay. Time comes from
//! an injected [`Clock`] so tests can drive it with [`ManualClock`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::snapshot::SnapshotList;

/// Source of monotonic time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current instant.
    fn now(&self) -> Instant;
}

/// Wall clock backed by [`Instant::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    /// Create a clock frozen at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self { base: Instant::now(), offset: Mutex::new(Duration::ZERO) }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

/// A resource whose liveness is checked by the watchdog.
pub trait ActiveObject: Send + Sync {
    /// Instant of the last observed activity.
    fn last_activity(&self) -> Instant;

    /// Idle time after which [`on_activity_timeout`](Self::on_activity_timeout) fires.
    fn timeout_delay(&self) -> Duration;

    /// Called from the watchdog when the object went idle. Return `false` to
    /// stop watching it.
    fn on_activity_timeout(&self, now: Instant) -> bool;
}

/// Registration handle returned by [`ActivityWatchdog::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

#[derive(Clone)]
struct WatchEntry {
    id: WatchId,
    object: Weak<dyn ActiveObject>,
}

impl fmt::Debug for WatchEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchEntry").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Centralized idle detector driven by a single timer thread.
#[derive(Debug)]
pub struct ActivityWatchdog {
    clock: Arc<dyn Clock>,
    period: Duration,
    entries: SnapshotList<WatchEntry>,
    next_id: AtomicU64,
    shutdown: Mutex<bool>,
    wakeup: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ActivityWatchdog {
    /// Create a watchdog polling every `period`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, period: Duration) -> Self {
        Self {
            clock,
            period,
            entries: SnapshotList::new(),
            next_id: AtomicU64::new(1),
            shutdown: Mutex::new(false),
            wakeup: Condvar::new(),
            thread: Mutex::new(None),
        }
    }

    /// Watchdog on the system clock.
    #[must_use]
    pub fn with_system_clock(period: Duration) -> Self {
        Self::new(Arc::new(SystemClock), period)
    }

    /// Clock used for staleness checks.
    #[must_use]
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Watch `object` until it is unregistered, dropped, or declines further
    /// checks.
    pub fn register(&self, object: &Arc<dyn ActiveObject>) -> WatchId {
        let id = WatchId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.push(WatchEntry { id, object: Arc::downgrade(object) });
        trace!(watch_id = id.0, "Registered active object");
        id
    }

    /// Stop watching a registration.
    pub fn unregister(&self, id: WatchId) {
        self.entries.remove_where(|e| e.id == id);
    }

    /// Number of live registrations.
    #[must_use]
    pub fn watched_count(&self) -> usize {
        self.entries.len()
    }

    /// Check every registration once. Returns how many timeouts fired.
    pub fn poll(&self) -> usize {
        let now = self.clock.now();
        let mut fired = 0;
        for entry in self.entries.snapshot().iter() {
            let Some(object) = entry.object.upgrade() else {
                self.unregister(entry.id);
                continue;
            };
            let idle = now.saturating_duration_since(object.last_activity());
            if idle < object.timeout_delay() {
                continue;
            }
            fired += 1;
            debug!(watch_id = entry.id.0, idle_ms = idle.as_millis() as u64, "Activity timeout");
            if !object.on_activity_timeout(now) {
                self.unregister(entry.id);
            }
        }
        fired
    }

    /// Start the timer thread. Calling it again while running is a no-op.
    ///
    /// # Errors
    /// Returns an error if the thread cannot be spawned.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut thread_slot = self.thread.lock();
        if thread_slot.is_some() {
            return Ok(());
        }
        *self.shutdown.lock() = false;
        let watchdog = Arc::downgrade(self);
        let period = self.period;
        let handle = thread::Builder::new()
            .name("vireo-watchdog".to_owned())
            .spawn(move || Self::run(&watchdog, period))
            .map_err(|e| Error::Internal { message: format!("cannot spawn watchdog thread: {e}") })?;
        *thread_slot = Some(handle);
        Ok(())
    }

    fn run(watchdog: &Weak<Self>, period: Duration) {
        loop {
            let Some(this) = watchdog.upgrade() else { return };
            {
                let mut shutdown = this.shutdown.lock();
                if !*shutdown {
                    this.wakeup.wait_for(&mut shutdown, period);
                }
                if *shutdown {
                    return;
                }
            }
            this.poll();
        }
    }

    /// Stop the timer thread and wait for it, unless called from it.
    pub fn stop(&self) {
        *self.shutdown.lock() = true;
        self.wakeup.notify_all();
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for ActivityWatchdog {
    fn drop(&mut self) {
        *self.shutdown.lock() = true;
        self.wakeup.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Idle {
        clock: Arc<ManualClock>,
        since: Mutex<Instant>,
        delay: Duration,
        timeouts: AtomicUsize,
        keep: bool,
    }

    impl ActiveObject for Idle {
        fn last_activity(&self) -> Instant {
            *self.since.lock()
        }

        fn timeout_delay(&self) -> Duration {
            self.delay
        }

        fn on_activity_timeout(&self, now: Instant) -> bool {
            self.timeouts.fetch_add(1, Ordering::SeqCst);
            *self.since.lock() = now;
            self.keep
        }
    }

    fn idle(clock: &Arc<ManualClock>, keep: bool) -> Arc<Idle> {
        Arc::new(Idle {
            clock: Arc::clone(clock),
            since: Mutex::new(clock.now()),
            delay: Duration::from_secs(1),
            timeouts: AtomicUsize::new(0),
            keep,
        })
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now() - start, Duration::from_millis(250));
    }

    #[test]
    fn test_fires_after_delay() {
        let clock = Arc::new(ManualClock::new());
        let watchdog = ActivityWatchdog::new(clock.clone(), Duration::from_millis(10));
        let object = idle(&clock, true);
        let dyn_object: Arc<dyn ActiveObject> = object.clone();
        watchdog.register(&dyn_object);

        clock.advance(Duration::from_millis(999));
        assert_eq!(watchdog.poll(), 0);
        clock.advance(Duration::from_millis(1));
        assert_eq!(watchdog.poll(), 1);
        assert_eq!(watchdog.poll(), 0);
        assert_eq!(object.timeouts.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&object.clock, &clock));
    }

    #[test]
    fn test_declining_object_is_unregistered() {
        let clock = Arc::new(ManualClock::new());
        let watchdog = ActivityWatchdog::new(clock.clone(), Duration::from_millis(10));
        let object: Arc<dyn ActiveObject> = idle(&clock, false);
        watchdog.register(&object);

        clock.advance(Duration::from_secs(2));
        assert_eq!(watchdog.poll(), 1);
        assert_eq!(watchdog.watched_count(), 0);
    }

    #[test]
    fn test_dropped_object_is_forgotten() {
        let clock = Arc::new(ManualClock::new());
        let watchdog = ActivityWatchdog::new(clock.clone(), Duration::from_millis(10));
        let object: Arc<dyn ActiveObject> = idle(&clock, true);
        watchdog.register(&object);
        drop(object);

        clock.advance(Duration::from_secs(2));
        assert_eq!(watchdog.poll(), 0);
        assert_eq!(watchdog.watched_count(), 0);
    }

    #[test]
    fn test_timer_thread_polls() {
        let clock = Arc::new(ManualClock::new());
        let watchdog = Arc::new(ActivityWatchdog::new(clock.clone(), Duration::from_millis(5)));
        let object = idle(&clock, true);
        let dyn_object: Arc<dyn ActiveObject> = object.clone();
        watchdog.register(&dyn_object);
        watchdog.start().unwrap();

        clock.advance(Duration::from_secs(1));
        let deadline = Instant::now() + Duration::from_secs(2);
        while object.timeouts.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        watchdog.stop();
        assert_eq!(object.timeouts.load(Ordering::SeqCst), 1);
    }
}
