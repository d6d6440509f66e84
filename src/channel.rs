//! Shared channel state
//
// A single instance is created per run and handed to every device and to the
// sink. Execution is single threaded and event ordered, so the registers live
// behind an `Rc<RefCell<_>>` and borrows never outlive a method call.

use core::cell::RefCell;

use alloc::rc::Rc;

use log::trace;
use strum::{Display, EnumIter, EnumString};

use crate::error::CoreError;

/// Register names for the key / value interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ChannelKey {
    ChannelFree,
    ConcurrentTx,
    DroppedPkts,
    TxPkts,
    LatencyAccum,
    EnergyAccum,
}

/// Register value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Bool(bool),
    Count(u32),
    Real(f64),
}

/// Snapshot of the shared registers
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelStats {
    pub channel_free: bool,
    pub concurrent_tx: u32,
    pub dropped_pkts: u32,
    pub tx_pkts: u32,
    /// Sum of per-packet latencies in seconds
    pub latency_accum: f64,
    /// Sum of radio energy in joules
    pub energy_accum: f64,
}

impl Default for ChannelStats {
    fn default() -> Self {
        Self {
            channel_free: true,
            concurrent_tx: 0,
            dropped_pkts: 0,
            tx_pkts: 0,
            latency_accum: 0.0,
            energy_accum: 0.0,
        }
    }
}

/// Handle to the shared channel state, clones refer to the same registers
#[derive(Debug, Clone, Default)]
pub struct Channel {
    inner: Rc<RefCell<ChannelStats>>,
}

impl Channel {
    /// Create a free, idle channel with zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_free(&self) -> bool {
        self.inner.borrow().channel_free
    }

    pub fn set_free(&self, free: bool) {
        trace!("Channel {}", if free { "free" } else { "busy" });
        self.inner.borrow_mut().channel_free = free;
    }

    pub fn concurrent_tx(&self) -> u32 {
        self.inner.borrow().concurrent_tx
    }

    /// Account for a transmission going on air, returns the new concurrent count
    pub fn begin_tx(&self) -> u32 {
        let mut s = self.inner.borrow_mut();
        s.tx_pkts += 1;
        s.concurrent_tx += 1;
        s.concurrent_tx
    }

    /// Account for a transmission leaving the air, returns the new concurrent count
    pub fn end_tx(&self) -> Result<u32, CoreError> {
        let mut s = self.inner.borrow_mut();
        s.concurrent_tx = s.concurrent_tx.checked_sub(1)
            .ok_or(CoreError::CounterUnderflow)?;
        Ok(s.concurrent_tx)
    }

    pub fn record_drop(&self) {
        self.inner.borrow_mut().dropped_pkts += 1;
    }

    pub fn add_latency(&self, seconds: f64) {
        self.inner.borrow_mut().latency_accum += seconds;
    }

    pub fn add_energy(&self, joules: f64) {
        self.inner.borrow_mut().energy_accum += joules;
    }

    pub fn stats(&self) -> ChannelStats {
        *self.inner.borrow()
    }

    /// Read a register by name
    pub fn get(&self, key: ChannelKey) -> Value {
        let s = self.inner.borrow();

        match key {
            ChannelKey::ChannelFree => Value::Bool(s.channel_free),
            ChannelKey::ConcurrentTx => Value::Count(s.concurrent_tx),
            ChannelKey::DroppedPkts => Value::Count(s.dropped_pkts),
            ChannelKey::TxPkts => Value::Count(s.tx_pkts),
            ChannelKey::LatencyAccum => Value::Real(s.latency_accum),
            ChannelKey::EnergyAccum => Value::Real(s.energy_accum),
        }
    }

    /// Write a register by name
    ///
    /// Values must match the register type, accumulators must be finite and non-negative.
    pub fn set(&self, key: ChannelKey, value: Value) -> Result<(), CoreError> {
        let mut s = self.inner.borrow_mut();

        match (key, value) {
            (ChannelKey::ChannelFree, Value::Bool(v)) => s.channel_free = v,
            (ChannelKey::ConcurrentTx, Value::Count(v)) => s.concurrent_tx = v,
            (ChannelKey::DroppedPkts, Value::Count(v)) => s.dropped_pkts = v,
            (ChannelKey::TxPkts, Value::Count(v)) => s.tx_pkts = v,
            (ChannelKey::LatencyAccum, Value::Real(v)) | (ChannelKey::EnergyAccum, Value::Real(v)) => {
                if !v.is_finite() || v < 0.0 {
                    return Err(CoreError::InvalidValue(key));
                }
                match key {
                    ChannelKey::LatencyAccum => s.latency_accum = v,
                    _ => s.energy_accum = v,
                }
            },
            _ => return Err(CoreError::TypeMismatch(key)),
        }

        Ok(())
    }
}
