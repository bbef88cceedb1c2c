//! Session configuration envelope
use std::time::Duration;

/// Tunable session parameters. All setters clamp to the documented bounds,
/// so a `GattConfig` is always valid.
#[derive(Debug, Clone)]
pub struct GattConfig {
    /// Reply deadline for read-type commands, default 550 ms, minimum 250 ms
    pub read_reply_timeout: Duration,
    /// Reply deadline for write-type commands, default 550 ms, minimum 250 ms
    pub write_reply_timeout: Duration,
    /// Reply deadline for the initial MTU exchange, default 2500 ms,
    /// minimum 2000 ms
    pub initial_reply_timeout: Duration,
    /// Capacity of the response PDU ring, default 128, bounded 64..=1024
    pub pdu_ring_capacity: usize,
    /// Log payload data of every PDU
    pub debug_data: bool,
}

impl Default for GattConfig {
    fn default() -> Self {
        Self {
            read_reply_timeout: Duration::from_millis(550),
            write_reply_timeout: Duration::from_millis(550),
            initial_reply_timeout: Duration::from_millis(2500),
            pdu_ring_capacity: 128,
            debug_data: false,
        }
    }
}

impl GattConfig {
    pub fn with_read_reply_timeout_ms(mut self, ms: u64) -> Self {
        self.read_reply_timeout = Duration::from_millis(ms.max(250));
        self
    }

    pub fn with_write_reply_timeout_ms(mut self, ms: u64) -> Self {
        self.write_reply_timeout = Duration::from_millis(ms.max(250));
        self
    }

    pub fn with_initial_reply_timeout_ms(mut self, ms: u64) -> Self {
        self.initial_reply_timeout = Duration::from_millis(ms.max(2000));
        self
    }

    pub fn with_pdu_ring_capacity(mut self, capacity: usize) -> Self {
        self.pdu_ring_capacity = capacity.clamp(64, 1024);
        self
    }

    pub fn with_debug_data(mut self, debug_data: bool) -> Self {
        self.debug_data = debug_data;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_to_documented_bounds() {
        let cfg = GattConfig::default()
            .with_read_reply_timeout_ms(10)
            .with_write_reply_timeout_ms(0)
            .with_initial_reply_timeout_ms(100)
            .with_pdu_ring_capacity(7);
        assert_eq!(cfg.read_reply_timeout, Duration::from_millis(250));
        assert_eq!(cfg.write_reply_timeout, Duration::from_millis(250));
        assert_eq!(cfg.initial_reply_timeout, Duration::from_millis(2000));
        assert_eq!(cfg.pdu_ring_capacity, 64);

        let cfg = GattConfig::default().with_pdu_ring_capacity(100_000);
        assert_eq!(cfg.pdu_ring_capacity, 1024);
    }
}
