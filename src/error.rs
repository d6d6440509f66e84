
use core::fmt;

use crate::{Ts, channel::ChannelKey, mac::DeviceId};

/// Model errors
#[derive(Debug, Clone, PartialEq)]
pub enum CoreError {
    /// Event requested before the current virtual time
    ScheduleInPast{ at: Ts, now: Ts },

    /// Event time is NaN or infinite
    InvalidTime(Ts),

    /// Concurrent transmission counter decremented below zero
    CounterUnderflow,

    /// Value does not match the register type
    TypeMismatch(ChannelKey),

    /// Register value out of range (negative or non-finite)
    InvalidValue(ChannelKey),

    /// Rejected device configuration
    InvalidConfig(&'static str),

    /// Event addressed to a device that does not exist
    UnknownDevice(DeviceId),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::ScheduleInPast{ at, now } => write!(f, "cannot schedule event at {} s, current time is {} s", at, now),
            CoreError::InvalidTime(t) => write!(f, "invalid event time: {}", t),
            CoreError::CounterUnderflow => write!(f, "concurrent transmission counter underflow"),
            CoreError::TypeMismatch(k) => write!(f, "value type mismatch for register {}", k),
            CoreError::InvalidValue(k) => write!(f, "value out of range for register {}", k),
            CoreError::InvalidConfig(m) => write!(f, "invalid configuration: {}", m),
            CoreError::UnknownDevice(d) => write!(f, "unknown device {}", d),
        }
    }
}

#[cfg(feature="std")]
impl std::error::Error for CoreError {}
