//! Discrete event engine and run driver
//
// Devices, the shared channel and the sink are wired together here and driven
// from a single time ordered event queue.

use core::cmp::Ordering;

use alloc::collections::{BTreeSet, BinaryHeap};
use alloc::vec::Vec;

use log::{debug, info, trace};
use rand_core::RngCore;

use crate::{Ts, channel::Channel, error::CoreError};
use crate::mac::{DeviceId, Event, config::CsmaConfig, csma::Device};
use crate::sink::{Report, Sink};
use crate::timer::{Scheduler, TimerHandle};

struct Entry<E> {
    at: Ts,
    seq: u64,
    event: E,
}

impl <E> PartialEq for Entry<E> {
    fn eq(&self, o: &Self) -> bool {
        self.cmp(o) == Ordering::Equal
    }
}

impl <E> Eq for Entry<E> {}

impl <E> PartialOrd for Entry<E> {
    fn partial_cmp(&self, o: &Self) -> Option<Ordering> {
        Some(self.cmp(o))
    }
}

impl <E> Ord for Entry<E> {
    fn cmp(&self, o: &Self) -> Ordering {
        // Reversed for a min-heap, earliest time then earliest scheduled
        o.at.total_cmp(&self.at).then_with(|| o.seq.cmp(&self.seq))
    }
}

/// Time ordered event queue with cancellable entries
pub struct EventQueue<E> {
    now: Ts,
    seq: u64,
    heap: BinaryHeap<Entry<E>>,
    pending: BTreeSet<u64>,
}

impl <E> Default for EventQueue<E> {
    fn default() -> Self {
        Self{ now: 0.0, seq: 0, heap: BinaryHeap::new(), pending: BTreeSet::new() }
    }
}

impl <E> EventQueue<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events still pending
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Time of the next pending event
    pub fn peek_time(&mut self) -> Option<Ts> {
        self.discard_cancelled();
        self.heap.peek().map(|e| e.at)
    }

    /// Remove the next pending event, advancing the clock to its time
    pub fn pop(&mut self) -> Option<(TimerHandle, E)> {
        self.discard_cancelled();

        let e = self.heap.pop()?;
        self.pending.remove(&e.seq);
        self.now = e.at;

        Some((TimerHandle(e.seq), e.event))
    }

    fn discard_cancelled(&mut self) {
        while let Some(e) = self.heap.peek() {
            if self.pending.contains(&e.seq) {
                break;
            }
            self.heap.pop();
        }
    }
}

impl <E> Scheduler<E> for EventQueue<E> {
    fn now(&self) -> Ts {
        self.now
    }

    fn schedule_at(&mut self, at: Ts, event: E) -> Result<TimerHandle, CoreError> {
        if !at.is_finite() {
            return Err(CoreError::InvalidTime(at));
        }
        if at < self.now {
            return Err(CoreError::ScheduleInPast{ at, now: self.now });
        }

        let seq = self.seq;
        self.seq += 1;

        self.heap.push(Entry{ at, seq, event });
        self.pending.insert(seq);

        Ok(TimerHandle(seq))
    }

    fn cancel(&mut self, handle: TimerHandle) -> bool {
        self.pending.remove(&handle.0)
    }
}

/// A single run: devices sharing one channel and reporting to one sink
pub struct Simulation<R> {
    queue: EventQueue<Event>,
    channel: Channel,
    sink: Sink,
    devices: Vec<Device<R>>,
    dispatched: u64,
}

impl <R: RngCore> Default for Simulation<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl <R: RngCore> Simulation<R> {
    pub fn new() -> Self {
        let channel = Channel::new();

        Self {
            queue: EventQueue::new(),
            sink: Sink::new(channel.clone()),
            channel,
            devices: Vec::new(),
            dispatched: 0,
        }
    }

    /// Validate a device configuration, create the device and start it at the current time
    pub fn add_device(&mut self, config: CsmaConfig, rng: R) -> Result<DeviceId, CoreError> {
        config.validate()?;

        let id = DeviceId(self.devices.len());
        let mut device = Device::new(id, config, self.channel.clone(), rng);
        device.start(&mut self.queue)?;

        self.devices.push(device);

        Ok(id)
    }

    pub fn now(&self) -> Ts {
        self.queue.now()
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn sink(&self) -> &Sink {
        &self.sink
    }

    pub fn device(&self, id: DeviceId) -> Option<&Device<R>> {
        self.devices.get(id.0)
    }

    pub fn devices(&self) -> &[Device<R>] {
        &self.devices
    }

    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }

    /// Time of the next pending event, if any
    pub fn next_event_time(&mut self) -> Option<Ts> {
        self.queue.peek_time()
    }

    /// Events dispatched so far
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    /// Dispatch the next event, returns false once the queue is empty
    pub fn step(&mut self) -> Result<bool, CoreError> {
        let (handle, event) = match self.queue.pop() {
            Some(v) => v,
            None => return Ok(false),
        };

        self.dispatched += 1;
        trace!("Dispatch {:?} at {} s", event, self.queue.now());

        match event {
            Event::Timer{ device, kind } => {
                let d = self.devices.get_mut(device.0)
                    .ok_or(CoreError::UnknownDevice(device))?;
                d.on_timer(handle, kind, &mut self.queue)?;
            },
            Event::Transmission(tx) => {
                self.sink.receive(&tx);
            },
        }

        Ok(true)
    }

    /// Run until no events remain
    pub fn run(&mut self) -> Result<u64, CoreError> {
        info!("Starting run with {} device(s)", self.devices.len());

        let start = self.dispatched;
        while self.step()? {}

        info!("Run complete at {} s after {} events", self.now(), self.dispatched - start);

        Ok(self.dispatched - start)
    }

    /// Run events scheduled up to and including `limit`
    pub fn run_until(&mut self, limit: Ts) -> Result<u64, CoreError> {
        let start = self.dispatched;

        while let Some(t) = self.next_event_time() {
            if t > limit {
                break;
            }
            self.step()?;
        }

        debug!("Ran to {} s ({} events, {} pending)", limit, self.dispatched - start, self.queue.len());

        Ok(self.dispatched - start)
    }

    /// End the run, cancelling outstanding device timers and computing the report
    pub fn finish(mut self) -> Report {
        let mut cancelled = 0;
        for d in self.devices.iter_mut() {
            cancelled += d.stop(&mut self.queue);
        }

        if cancelled > 0 {
            info!("Finished at {} s with {} device timer(s) cancelled", self.now(), cancelled);
        }

        self.sink.finish()
    }
}
