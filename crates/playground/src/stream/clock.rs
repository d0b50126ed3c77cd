use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Source of timestamps for stream timing.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Replays fixed offsets from a base instant, one per `now()` call.
///
/// Once the script runs out the last offset is repeated, so a stream that
/// reads the clock more often than expected still sees time standing still
/// instead of jumping backwards.
#[derive(Debug)]
pub struct ScriptedClock {
    base: Instant,
    offsets: Mutex<VecDeque<Duration>>,
    last: Mutex<Duration>,
}

impl ScriptedClock {
    pub fn new(base: Instant, offsets: impl IntoIterator<Item = Duration>) -> Self {
        Self {
            base,
            offsets: Mutex::new(offsets.into_iter().collect()),
            last: Mutex::new(Duration::ZERO),
        }
    }

    /// Offsets given in milliseconds from `base`.
    pub fn from_millis(base: Instant, offsets: impl IntoIterator<Item = u64>) -> Self {
        Self::new(base, offsets.into_iter().map(Duration::from_millis))
    }

    pub fn base(&self) -> Instant {
        self.base
    }
}

impl Clock for ScriptedClock {
    fn now(&self) -> Instant {
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = match self.offsets.lock() {
            Ok(mut offsets) => offsets.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        };
        if let Some(offset) = next {
            *last = offset;
        }
        self.base + *last
    }
}
