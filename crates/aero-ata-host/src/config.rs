use std::time::Duration;

/// Protocol timing for one bus.
///
/// The defaults follow the ATA-4 timing rules with generous margins for
/// media spin-up; tests shrink them to keep simulated runs short.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    /// Spacing between alternate-status samples in short status waits.
    pub status_sample_interval: Duration,
    /// Length of one short status wait.
    pub status_wait_window: Duration,
    /// Sleep between coarse polls (selection, reset, scan, packet DRQ).
    pub poll_interval: Duration,
    /// Coarse polls for BSY=0 (and DRDY=1) after the select bit is written.
    pub ready_poll_limit: u32,
    /// Grace timer armed when an interrupt-driven command cannot select its
    /// device; expiry completes the command with a timeout.
    pub stuck_bus_timeout_ms: u32,
    /// Bound for selection attempted with no command in flight.
    pub idle_select_timeout_ms: u32,
    /// How long SRST stays asserted.
    pub reset_hold: Duration,
    /// Wait after a reset before polling status.
    pub reset_settle: Duration,
    /// Coarse polls after a reset before giving up.
    pub reset_poll_limit: u32,
    /// Coarse polls shared by every wait of one drive scan.
    pub scan_poll_limit: u32,
    /// Coarse polls for IDENTIFY PACKET DEVICE data during slave probing.
    pub slave_probe_poll_limit: u32,
    /// Coarse polls for DRQ before writing a command packet.
    pub packet_drq_retries: u32,
    /// Coarse polls for BSY=0 after issuing a polled command.
    pub sync_busy_poll_limit: u32,
    /// Spacing between status samples while waiting for a data block.
    pub data_sample_interval: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            status_sample_interval: Duration::from_micros(5),
            status_wait_window: Duration::from_millis(1),
            poll_interval: Duration::from_millis(10),
            ready_poll_limit: 10,
            stuck_bus_timeout_ms: 1000,
            idle_select_timeout_ms: 1000,
            reset_hold: Duration::from_micros(100),
            reset_settle: Duration::from_millis(50),
            reset_poll_limit: 3100,
            scan_poll_limit: 3100,
            slave_probe_poll_limit: 1000,
            packet_drq_retries: 3,
            sync_busy_poll_limit: 3000,
            data_sample_interval: Duration::from_micros(10),
        }
    }
}

impl BusConfig {
    pub fn with_stuck_bus_timeout_ms(mut self, ms: u32) -> Self {
        self.stuck_bus_timeout_ms = ms;
        self
    }

    pub fn with_reset_poll_limit(mut self, polls: u32) -> Self {
        self.reset_poll_limit = polls;
        self
    }

    pub fn with_scan_poll_limit(mut self, polls: u32) -> Self {
        self.scan_poll_limit = polls;
        self
    }

    pub fn with_slave_probe_poll_limit(mut self, polls: u32) -> Self {
        self.slave_probe_poll_limit = polls;
        self
    }

    pub fn with_sync_busy_poll_limit(mut self, polls: u32) -> Self {
        self.sync_busy_poll_limit = polls;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}
