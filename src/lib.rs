//! Slotted CSMA/CA channel access model
//
// Each sensor device runs the unacknowledged CSMA/CA backoff algorithm against
// a shared channel, a sink classifies every transmission as received or
// collided, and the run ends with delivery ratio, latency and energy figures.

#![no_std]

extern crate alloc;

#[cfg(any(test, feature="std"))]
extern crate std;

pub mod timer;

pub mod channel;

pub mod mac;

pub mod sink;

pub mod sim;

pub mod error;

pub mod prelude;


/// Virtual simulation time in seconds
pub type Ts = f64;
