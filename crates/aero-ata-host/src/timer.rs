/// The single one-shot deadline guarding the command in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandTimer {
    deadline_ns: Option<u64>,
}

impl CommandTimer {
    pub const fn new() -> Self {
        Self { deadline_ns: None }
    }

    /// Replaces any armed deadline with `now + timeout_ms`.
    pub fn start(&mut self, now_ns: u64, timeout_ms: u32) {
        let timeout_ns = u64::from(timeout_ms) * 1_000_000;
        self.deadline_ns = Some(now_ns.saturating_add(timeout_ns));
    }

    pub fn stop(&mut self) {
        self.deadline_ns = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline_ns.is_some()
    }

    pub fn deadline_ns(&self) -> Option<u64> {
        self.deadline_ns
    }

    /// True once the armed deadline has passed. A disarmed timer never expires.
    pub fn has_expired(&self, now_ns: u64) -> bool {
        self.deadline_ns.is_some_and(|deadline| now_ns >= deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_replaces_previous_deadline() {
        let mut timer = CommandTimer::new();
        timer.start(0, 10);
        timer.start(5_000_000, 10);
        assert_eq!(timer.deadline_ns(), Some(15_000_000));
        assert!(!timer.has_expired(14_999_999));
        assert!(timer.has_expired(15_000_000));
    }

    #[test]
    fn stop_is_idempotent_and_disarms() {
        let mut timer = CommandTimer::new();
        timer.stop();
        timer.start(0, 1);
        timer.stop();
        timer.stop();
        assert!(!timer.is_armed());
        assert!(!timer.has_expired(u64::MAX));
    }
}
