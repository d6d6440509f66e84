//! Scheduler interface and per-device timer bookkeeping
//
// Devices never own the event loop, they request timers from a `Scheduler`
// and hold at most one handle per `TimerKind`.

use log::{trace, warn};
use strum::{Display, EnumCount, EnumIter};

use crate::{Ts, error::CoreError};

/// Opaque handle to a scheduled event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerHandle(pub u64);

/// Scheduler trait provides the virtual clock and timed event delivery
/// consumed by the protocol state machines.
///
/// Time is monotonic, events scheduled for the same instant fire in the
/// order they were scheduled.
pub trait Scheduler<E> {
    /// Returns the current virtual time in seconds
    fn now(&self) -> Ts;

    /// Schedule `event` to fire at absolute time `at`
    fn schedule_at(&mut self, at: Ts, event: E) -> Result<TimerHandle, CoreError>;

    /// Cancel a pending event, returning whether it was still pending
    fn cancel(&mut self, handle: TimerHandle) -> bool;
}

/// Device timer kinds, each device holds at most one pending timer per kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumCount, EnumIter, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum TimerKind {
    BackoffExpired,
    ChannelSetBusy,
    SendMessage,
    ChannelSetFree,
    DecrementConcurrent,
}

/// One replaceable handle slot per timer kind
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Timers {
    slots: [Option<TimerHandle>; TimerKind::COUNT],
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a timer of `kind`, retiring any timer of that kind still pending
    pub fn arm<E, S: Scheduler<E>>(&mut self, scheduler: &mut S, kind: TimerKind, at: Ts, event: E) -> Result<TimerHandle, CoreError> {
        if let Some(old) = self.slots[kind as usize].take() {
            if scheduler.cancel(old) {
                trace!("Cancelled pending {} timer {:?}", kind, old);
            }
        }

        let handle = scheduler.schedule_at(at, event)?;
        self.slots[kind as usize] = Some(handle);

        Ok(handle)
    }

    /// Mark the timer of `kind` as fired
    ///
    /// Returns false (and leaves the slot untouched) if `handle` is not the
    /// timer currently held for that kind.
    pub fn fire(&mut self, kind: TimerKind, handle: TimerHandle) -> bool {
        let slot = &mut self.slots[kind as usize];

        if *slot != Some(handle) {
            warn!("Stale {} timer {:?} (held: {:?})", kind, handle, slot);
            return false;
        }

        *slot = None;
        true
    }

    pub fn is_pending(&self, kind: TimerKind) -> bool {
        self.slots[kind as usize].is_some()
    }

    pub fn pending(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Cancel every held timer, returns the number that were still pending
    pub fn cancel_all<E, S: Scheduler<E>>(&mut self, scheduler: &mut S) -> usize {
        let mut n = 0;

        for slot in self.slots.iter_mut() {
            if let Some(h) = slot.take() {
                if scheduler.cancel(h) {
                    n += 1;
                }
            }
        }

        n
    }
}

#[cfg(any(test, feature="mocks"))]
pub mod mock {
    use alloc::vec::Vec;

    use rand_core::{RngCore, Error};

    use super::*;

    /// Mock scheduler recording every request, to assist with testing.
    ///
    /// Events are only delivered when the test takes them.
    #[derive(Debug)]
    pub struct ManualScheduler<E> {
        now: Ts,
        next: u64,
        pub scheduled: Vec<(TimerHandle, Ts, E)>,
        pub cancelled: Vec<TimerHandle>,
    }

    impl <E> ManualScheduler<E> {
        pub fn new() -> Self {
            Self{ now: 0.0, next: 0, scheduled: Vec::new(), cancelled: Vec::new() }
        }

        pub fn set_now(&mut self, now: Ts) {
            self.now = now;
        }

        /// Number of scheduled events neither taken nor cancelled
        pub fn pending(&self) -> usize {
            self.scheduled.len()
        }

        /// Remove the earliest pending event and advance the clock to it
        pub fn take_next(&mut self) -> Option<(TimerHandle, Ts, E)> {
            let mut best: Option<usize> = None;
            for (i, (h, t, _)) in self.scheduled.iter().enumerate() {
                let better = match best {
                    None => true,
                    Some(b) => {
                        let (bh, bt, _) = &self.scheduled[b];
                        t.total_cmp(bt).then_with(|| h.cmp(bh)).is_lt()
                    },
                };
                if better {
                    best = Some(i);
                }
            }

            let entry = self.scheduled.remove(best?);
            self.now = entry.1;

            Some(entry)
        }
    }

    impl <E> Scheduler<E> for ManualScheduler<E> {
        fn now(&self) -> Ts {
            self.now
        }

        fn schedule_at(&mut self, at: Ts, event: E) -> Result<TimerHandle, CoreError> {
            if at < self.now {
                return Err(CoreError::ScheduleInPast{ at, now: self.now });
            }

            let h = TimerHandle(self.next);
            self.next += 1;
            self.scheduled.push((h, at, event));

            Ok(h)
        }

        fn cancel(&mut self, handle: TimerHandle) -> bool {
            let before = self.scheduled.len();
            self.scheduled.retain(|(h, _, _)| *h != handle);
            self.cancelled.push(handle);

            self.scheduled.len() != before
        }
    }

    /// Deterministic RNG cycling through a fixed list of values
    #[derive(Clone, Debug)]
    pub struct SequenceRng {
        values: Vec<u64>,
        index: usize,
    }

    impl SequenceRng {
        /// Create a source cycling through `values`, which must not be empty
        pub fn new(values: &[u64]) -> Self {
            assert!(!values.is_empty(), "SequenceRng requires at least one value");
            Self{ values: values.to_vec(), index: 0 }
        }

        pub fn constant(value: u64) -> Self {
            Self::new(&[value])
        }
    }

    impl RngCore for SequenceRng {
        fn next_u32(&mut self) -> u32 {
            self.next_u64() as u32
        }

        fn next_u64(&mut self) -> u64 {
            let v = self.values[self.index % self.values.len()];
            self.index += 1;
            v
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            rand_core::impls::fill_bytes_via_next(self, dest)
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }
}
