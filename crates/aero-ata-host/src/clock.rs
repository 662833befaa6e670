use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Monotonic time source used for deadlines and bounded polling.
///
/// `sleep` is used between coarse (millisecond) polls; `delay` covers the
/// short microsecond holds of the register protocol and may spin.
pub trait HostClock {
    fn now_ns(&self) -> u64;
    fn sleep(&self, duration: Duration);
    fn delay(&self, duration: Duration) {
        self.sleep(duration);
    }
}

impl<C: HostClock + ?Sized> HostClock for &C {
    fn now_ns(&self) -> u64 {
        (**self).now_ns()
    }

    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration)
    }

    fn delay(&self, duration: Duration) {
        (**self).delay(duration)
    }
}

impl<C: HostClock + ?Sized> HostClock for Arc<C> {
    fn now_ns(&self) -> u64 {
        (**self).now_ns()
    }

    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration)
    }

    fn delay(&self, duration: Duration) {
        (**self).delay(duration)
    }
}

/// Host clock backed by [`Instant`].
#[derive(Debug, Clone, Copy)]
pub struct StdHostClock {
    origin: Instant,
}

impl StdHostClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for StdHostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HostClock for StdHostClock {
    fn now_ns(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn delay(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            std::hint::spin_loop();
        }
    }
}

/// Deterministic clock for tests: time only moves when something sleeps or
/// the test advances it.
///
/// Clones share the same counter, so a simulated device and the engine can
/// observe one timeline.
#[derive(Debug, Clone, Default)]
pub struct FakeHostClock {
    now_ns: Arc<AtomicU64>,
}

impl FakeHostClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, duration: Duration) {
        let delta = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.now_ns.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn set_ns(&self, ns: u64) {
        self.now_ns.store(ns, Ordering::SeqCst);
    }
}

impl HostClock for FakeHostClock {
    fn now_ns(&self) -> u64 {
        self.now_ns.load(Ordering::SeqCst)
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_clones_share_time() {
        let clock = FakeHostClock::new();
        let other = clock.clone();
        clock.sleep(Duration::from_millis(10));
        other.delay(Duration::from_micros(5));
        assert_eq!(clock.now_ns(), 10_005_000);
        assert_eq!(other.now_ns(), clock.now_ns());
    }

    #[test]
    fn std_clock_is_monotonic() {
        let clock = StdHostClock::new();
        let a = clock.now_ns();
        clock.delay(Duration::from_micros(50));
        assert!(clock.now_ns() >= a + 50_000);
    }
}
