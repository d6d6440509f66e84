
use crate::{Ts, error::CoreError};

/// Compensation applied around the slot boundary so the channel is marked
/// busy just before the frame starts and released just after it ends
pub const SLOT_COMPENSATION: Ts = 0.000_001;

/// Upper bound on the backoff exponent, keeps `2^be` slot counts in range
pub const MAX_BE_LIMIT: u8 = 31;

/// Configuration for a CSMA/CA device
#[derive(Clone, PartialEq, Debug)]
pub struct CsmaConfig {
    /// Backoff slot duration (D_bp) in seconds
    pub backoff_period: Ts,

    /// Frame transmission duration (D_p) in seconds
    pub tx_duration: Ts,

    /// Minimum backoff exponent (macMinBE)
    pub min_be: u8,
    /// Maximum backoff exponent (macMaxBE)
    pub max_be: u8,
    /// Maximum number of backoffs before a packet is dropped (macMaxCSMABackoffs)
    pub csma_max_backoffs: u8,

    /// Packet generation period (T) in seconds
    pub packet_period: Ts,

    /// Clear channel assessment duration (T_cca) in seconds
    pub cca_duration: Ts,

    /// Number of packets to send
    pub packets: u32,

    /// Transmit power draw in watts
    pub tx_power: f64,
    /// Receive / sense power draw in watts
    pub rx_power: f64,
}

impl Default for CsmaConfig {
    fn default() -> Self {
        Self {
            backoff_period: 320e-6,
            tx_duration: 4e-3,

            min_be: 3,
            max_be: 5,
            csma_max_backoffs: 4,

            packet_period: 1.0,
            cca_duration: 128e-6,
            packets: 100,

            tx_power: 52.2e-3,
            rx_power: 59.1e-3,
        }
    }
}

impl CsmaConfig {
    /// Check parameters are usable, called when loading device configurations
    pub fn validate(&self) -> Result<(), CoreError> {
        let durations = [self.backoff_period, self.tx_duration, self.packet_period, self.cca_duration];
        if durations.iter().any(|d| !d.is_finite() || *d <= 0.0) {
            return Err(CoreError::InvalidConfig("durations must be positive"));
        }

        if self.backoff_period <= SLOT_COMPENSATION {
            return Err(CoreError::InvalidConfig("backoff period must exceed slot compensation"));
        }

        if self.min_be > self.max_be {
            return Err(CoreError::InvalidConfig("min_be must not exceed max_be"));
        }

        if self.max_be > MAX_BE_LIMIT {
            return Err(CoreError::InvalidConfig("max_be out of range"));
        }

        if !self.tx_power.is_finite() || self.tx_power < 0.0 || !self.rx_power.is_finite() || self.rx_power < 0.0 {
            return Err(CoreError::InvalidConfig("power draw must be non-negative"));
        }

        // The next packet is scheduled from the end of the current one
        if self.packet_period < self.max_access_time() {
            return Err(CoreError::InvalidConfig("packet period shorter than worst case channel access"));
        }

        Ok(())
    }

    /// Longest time from the start of a packet period until the device is
    /// done with that packet, with every backoff drawing its top slot
    pub fn max_access_time(&self) -> Ts {
        let slots = |be: u8| (1u64 << be.min(MAX_BE_LIMIT)) as Ts;

        let mut be = self.min_be;
        let mut t = slots(be) * self.backoff_period;

        for _ in 0..self.csma_max_backoffs {
            be = be.saturating_add(1).min(self.max_be);
            t += self.backoff_period + slots(be) * self.backoff_period;
        }

        // Claim the slot, transmit, then settle the counter
        t + self.backoff_period + self.tx_duration + SLOT_COMPENSATION
    }

    /// Energy spent on a single clear channel assessment
    pub fn cca_energy(&self) -> f64 {
        self.rx_power * self.cca_duration
    }

    /// Energy spent transmitting a single frame
    pub fn tx_energy(&self) -> f64 {
        self.tx_power * self.tx_duration
    }

    /// Absolute start of packet generation period `n`
    pub fn slot_start(&self, n: u32) -> Ts {
        n as Ts * self.packet_period
    }
}
