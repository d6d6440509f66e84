//! CSMA/CA model prelude

pub use crate::Ts;

pub use crate::error::CoreError;
pub use crate::timer::{Scheduler, TimerHandle, TimerKind};

pub use crate::channel::{Channel, ChannelKey, ChannelStats, Value};

pub use crate::mac::{DeviceId, Event, Transmission};
pub use crate::mac::config::CsmaConfig;
pub use crate::mac::csma::{Device, DeviceState};

pub use crate::sink::{Sink, Report, Outcome, Summary, Totals};

pub use crate::sim::{EventQueue, Simulation};
