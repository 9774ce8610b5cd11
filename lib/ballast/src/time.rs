use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

/// Returns the current unix timestamp (milliseconds elapsed since 1970-01-01).
/// Wall time is for event timestamps and observability only; correctness
/// decisions go through a `Clock`.
#[inline]
pub fn timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_millis() as u64
}

/// Monotonic time source. Deadlines, activity-after-send checks and
/// coalescing windows are all decided against this, never against wall time.
pub trait Clock: Send + Sync {
    /// Nanoseconds elapsed since an arbitrary fixed origin.
    fn now_nanos(&self) -> u64;
}

/// Production clock backed by `Instant`.
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    #[inline]
    pub fn new() -> MonotonicClock {
        MonotonicClock {
            origin: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    #[inline]
    fn now_nanos(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Hand-cranked clock for deterministic tests. Time only moves when `set` or
/// `advance` is called.
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    #[inline]
    pub fn new(start_nanos: u64) -> ManualClock {
        ManualClock {
            nanos: AtomicU64::new(start_nanos),
        }
    }

    /// Moves the clock to an absolute point. Panics when asked to go
    /// backwards.
    #[inline]
    pub fn set(&self, nanos: u64) {
        let previous = self.nanos.swap(nanos, Ordering::SeqCst);

        if previous > nanos {
            panic!("Manual clock moved backwards: {} -> {}", previous, nanos);
        }
    }

    /// Advances the clock by the supplied duration, returning the new time.
    #[inline]
    pub fn advance(&self, delta: Duration) -> u64 {
        let delta = delta.as_nanos() as u64;
        self.nanos.fetch_add(delta, Ordering::SeqCst) + delta
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now_nanos(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst)
    }
}
