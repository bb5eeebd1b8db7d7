use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Monotonic microsecond time source shared by the realtime threads.
pub trait Clock: Send + Sync {
    fn now_usec(&self) -> u64;
}

pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now_usec(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

/// Clock that only moves when told to.
#[derive(Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_usec: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_usec)),
        }
    }

    pub fn set(&self, usec: u64) {
        self.now.store(usec, Ordering::SeqCst);
    }

    pub fn advance(&self, usec: u64) {
        self.now.fetch_add(usec, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_usec(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
