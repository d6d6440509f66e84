//! Medium Access Control (MAC) layer module.
//! Contains the CSMA/CA device state machine and its configuration.

use core::fmt;

use crate::{Ts, timer::TimerKind};

pub mod config;

pub mod csma;

/// Device index within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub usize);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

/// Zero-payload frame signal from a device to the sink
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transmission {
    pub source: DeviceId,
    pub sent_at: Ts,
}

/// Events carried by the scheduler
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Event {
    /// Device timer expiry
    Timer{ device: DeviceId, kind: TimerKind },

    /// Frame arriving at the sink
    Transmission(Transmission),
}
