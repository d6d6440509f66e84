
use log::{trace, debug};

use rand_core::RngCore;
use strum::Display;

use crate::{Ts, channel::Channel, error::CoreError};
use crate::timer::{Scheduler, TimerHandle, TimerKind, Timers};

use super::{DeviceId, Event, Transmission};
use super::config::*;


/// Device states, each waiting state maps to exactly one pending timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum DeviceState {
    /// Nothing to send (before start, after the last packet, or stopped)
    Idle,
    /// Waiting for the random backoff to expire
    AwaitingBackoff,
    /// Assessing the channel, only observable within a handler
    PerformingCca,
    /// Channel assessed clear, holding until the slot boundary to claim it
    ChannelBusyHold,
    /// Channel claimed, frame starts at the slot boundary
    Transmitting,
    /// Frame on air, channel held until the transmission ends
    ChannelFreeHold,
    /// Channel released, concurrent transmission counter about to settle
    CounterSettling,
}

impl DeviceState {
    /// Timer that ends this state
    pub fn timer(&self) -> Option<TimerKind> {
        match self {
            DeviceState::Idle | DeviceState::PerformingCca => None,
            DeviceState::AwaitingBackoff => Some(TimerKind::BackoffExpired),
            DeviceState::ChannelBusyHold => Some(TimerKind::ChannelSetBusy),
            DeviceState::Transmitting => Some(TimerKind::SendMessage),
            DeviceState::ChannelFreeHold => Some(TimerKind::ChannelSetFree),
            DeviceState::CounterSettling => Some(TimerKind::DecrementConcurrent),
        }
    }
}

/// Draw a backoff slot count uniformly from `[0, 2^be]` (inclusive)
pub fn backoff_slots<R: RngCore>(rng: &mut R, be: u8) -> u64 {
    let n = (1u64 << be.min(MAX_BE_LIMIT)) + 1;

    // Reject the tail that would bias the modulo
    let limit = u64::MAX - (u64::MAX % n);
    loop {
        let v = rng.next_u64();
        if v < limit {
            return v % n;
        }
    }
}

/// CSMA/CA sensor device, transmissions are not acknowledged
///
/// Generic over the random source (R) so runs can be reproduced.
#[derive(Debug)]
pub struct Device<R> {
    id: DeviceId,
    config: CsmaConfig,
    channel: Channel,
    rng: R,

    state: DeviceState,

    /// Backoffs for the current packet
    nb: u8,
    /// Current backoff exponent
    be: u8,

    pkt_to_send: u32,
    tot_pkt: u32,
    pkt_creation_time: Ts,

    timers: Timers,
}

impl <R: RngCore> Device<R> {
    /// Create a new device attached to the shared channel
    pub fn new(id: DeviceId, config: CsmaConfig, channel: Channel, rng: R) -> Self {
        Self {
            id,
            nb: 0,
            be: config.min_be,
            pkt_to_send: config.packets,
            tot_pkt: config.packets,
            pkt_creation_time: 0.0,

            state: DeviceState::Idle,
            timers: Timers::new(),

            config,
            channel,
            rng,
        }
    }

    /// Schedule the first backoff if there is anything to send
    pub fn start<S: Scheduler<Event>>(&mut self, scheduler: &mut S) -> Result<(), CoreError> {
        if self.pkt_to_send == 0 {
            debug!("{} has no packets to send", self.id);
            return Ok(());
        }

        let now = scheduler.now();
        self.pkt_creation_time = now;

        let at = now + self.random_offset();
        self.arm(scheduler, TimerKind::BackoffExpired, at)?;
        self.state = DeviceState::AwaitingBackoff;

        debug!("{} starting with {} packets, first backoff expires at {} s", self.id, self.pkt_to_send, at);

        Ok(())
    }

    /// Handle expiry of a device timer
    ///
    /// Firings for handles this device no longer holds are ignored.
    pub fn on_timer<S: Scheduler<Event>>(&mut self, handle: TimerHandle, kind: TimerKind, scheduler: &mut S) -> Result<(), CoreError> {
        if !self.timers.fire(kind, handle) {
            return Ok(());
        }

        trace!("{} {} at {} s (state: {})", self.id, kind, scheduler.now(), self.state);

        match kind {
            TimerKind::BackoffExpired => self.backoff_expired(scheduler),
            TimerKind::ChannelSetBusy => self.set_channel_busy(scheduler),
            TimerKind::SendMessage => self.send_message(scheduler),
            TimerKind::ChannelSetFree => self.set_channel_free(scheduler),
            TimerKind::DecrementConcurrent => self.decrement_concurrent(scheduler),
        }
    }

    /// Cancel any pending timers, returning the number cancelled
    pub fn stop<S: Scheduler<Event>>(&mut self, scheduler: &mut S) -> usize {
        let n = self.timers.cancel_all(scheduler);
        if n > 0 {
            debug!("{} stopped in state {} with {} pending timer(s)", self.id, self.state, n);
        }

        self.state = DeviceState::Idle;

        n
    }

    /// Random backoff offset in seconds, `[0, 2^be] * D_bp`
    pub fn random_offset(&mut self) -> Ts {
        backoff_slots(&mut self.rng, self.be) as Ts * self.config.backoff_period
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn config(&self) -> &CsmaConfig {
        &self.config
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn nb(&self) -> u8 {
        self.nb
    }

    pub fn be(&self) -> u8 {
        self.be
    }

    pub fn pkt_to_send(&self) -> u32 {
        self.pkt_to_send
    }

    pub fn tot_pkt(&self) -> u32 {
        self.tot_pkt
    }

    pub fn pkt_creation_time(&self) -> Ts {
        self.pkt_creation_time
    }

    pub fn is_pending(&self, kind: TimerKind) -> bool {
        self.timers.is_pending(kind)
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.pending()
    }

    fn arm<S: Scheduler<Event>>(&mut self, scheduler: &mut S, kind: TimerKind, at: Ts) -> Result<(), CoreError> {
        let event = Event::Timer{ device: self.id, kind };
        self.timers.arm(scheduler, kind, at, event)?;
        Ok(())
    }

    /// Clear channel assessment, sensing costs energy whatever the outcome
    fn perform_cca(&mut self) -> bool {
        self.channel.add_energy(self.config.cca_energy());
        self.channel.is_free()
    }

    fn backoff_expired<S: Scheduler<Event>>(&mut self, scheduler: &mut S) -> Result<(), CoreError> {
        let now = scheduler.now();
        self.state = DeviceState::PerformingCca;

        if self.perform_cca() {
            debug!("{} channel is free at {} s", self.id, now);

            let at = now + self.config.backoff_period - SLOT_COMPENSATION;
            self.arm(scheduler, TimerKind::ChannelSetBusy, at)?;
            self.state = DeviceState::ChannelBusyHold;

            return Ok(());
        }

        if self.nb < self.config.csma_max_backoffs {
            self.nb += 1;
            self.be = self.be.saturating_add(1).min(self.config.max_be);

            debug!("{} channel is busy at {} s, retry (nb: {} be: {})", self.id, now, self.nb, self.be);

            let at = now + self.config.backoff_period + self.random_offset();
            self.arm(scheduler, TimerKind::BackoffExpired, at)?;
            self.state = DeviceState::AwaitingBackoff;

            return Ok(());
        }

        debug!("{} channel is busy at {} s, dropping packet after {} retries", self.id, now, self.nb);

        self.channel.record_drop();
        self.decrease_and_repeat(scheduler)
    }

    fn set_channel_busy<S: Scheduler<Event>>(&mut self, scheduler: &mut S) -> Result<(), CoreError> {
        let now = scheduler.now();
        debug!("{} set channel busy at {} s", self.id, now);

        self.channel.set_free(false);

        self.arm(scheduler, TimerKind::SendMessage, now + SLOT_COMPENSATION)?;
        self.state = DeviceState::Transmitting;

        Ok(())
    }

    fn send_message<S: Scheduler<Event>>(&mut self, scheduler: &mut S) -> Result<(), CoreError> {
        let now = scheduler.now();

        self.channel.add_energy(self.config.tx_energy());
        let concurrent = self.channel.begin_tx();

        debug!("{} send message at {} s ({} concurrent)", self.id, now, concurrent);

        // Delivered to the sink at the same instant
        let tx = Transmission{ source: self.id, sent_at: now };
        scheduler.schedule_at(now, Event::Transmission(tx))?;

        self.arm(scheduler, TimerKind::ChannelSetFree, now + self.config.tx_duration)?;
        self.state = DeviceState::ChannelFreeHold;

        Ok(())
    }

    fn set_channel_free<S: Scheduler<Event>>(&mut self, scheduler: &mut S) -> Result<(), CoreError> {
        let now = scheduler.now();

        self.channel.set_free(true);

        // Latency is only attributed when no collision is in progress
        let concurrent = self.channel.concurrent_tx();
        if concurrent <= 1 {
            let latency = now - self.pkt_creation_time;
            self.channel.add_latency(latency);

            debug!("{} set channel free at {} s, latency {} s", self.id, now, latency);
        } else {
            debug!("{} set channel free at {} s, {} concurrent transmissions", self.id, now, concurrent);
        }

        self.arm(scheduler, TimerKind::DecrementConcurrent, now + SLOT_COMPENSATION)?;
        self.state = DeviceState::CounterSettling;

        Ok(())
    }

    fn decrement_concurrent<S: Scheduler<Event>>(&mut self, scheduler: &mut S) -> Result<(), CoreError> {
        self.channel.end_tx()?;
        self.decrease_and_repeat(scheduler)
    }

    /// Reset backoff state and move on to the next packet, if any
    fn decrease_and_repeat<S: Scheduler<Event>>(&mut self, scheduler: &mut S) -> Result<(), CoreError> {
        self.nb = 0;
        self.be = self.config.min_be;

        self.pkt_to_send = self.pkt_to_send.saturating_sub(1);

        if self.pkt_to_send == 0 {
            debug!("{} finished all {} packets", self.id, self.tot_pkt);
            self.state = DeviceState::Idle;
            return Ok(());
        }

        // Next packet becomes eligible at the start of its generation period
        let start = self.config.slot_start(self.tot_pkt - self.pkt_to_send);
        let at = start + self.random_offset();

        self.arm(scheduler, TimerKind::BackoffExpired, at)?;
        self.pkt_creation_time = start;
        self.state = DeviceState::AwaitingBackoff;

        debug!("{} next packet at {} s, backoff expires at {} s ({} remaining)", self.id, start, at, self.pkt_to_send);

        Ok(())
    }
}


#[cfg(test)]
mod test {
    use std::vec;

    use rand::{SeedableRng, rngs::StdRng};

    use crate::timer::mock::{ManualScheduler, SequenceRng};
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        let d = a - b;
        d < 1e-12 && d > -1e-12
    }

    /// Take the next event, dispatching it to the device if it is a timer
    fn step(dev: &mut Device<SequenceRng>, sched: &mut ManualScheduler<Event>) -> Event {
        let (h, _t, ev) = sched.take_next().unwrap();
        if let Event::Timer{ device, kind } = ev {
            assert_eq!(device, dev.id());
            dev.on_timer(h, kind, sched).unwrap();
        }
        ev
    }

    fn device(config: CsmaConfig, channel: &Channel) -> Device<SequenceRng> {
        Device::new(DeviceId(0), config, channel.clone(), SequenceRng::constant(0))
    }

    #[test]
    fn single_packet_cycle() {
        let _ = simplelog::SimpleLogger::init(log::LevelFilter::Debug, simplelog::Config::default());

        let config = CsmaConfig{ packets: 1, ..Default::default() };
        let channel = Channel::new();
        let mut sched = ManualScheduler::new();
        let mut dev = device(config.clone(), &channel);

        dev.start(&mut sched).unwrap();
        assert_eq!(dev.state(), DeviceState::AwaitingBackoff);
        assert_eq!(sched.scheduled[0].1, 0.0);

        // Backoff expires, CCA finds the channel free
        step(&mut dev, &mut sched);
        assert_eq!(dev.state(), DeviceState::ChannelBusyHold);
        assert!(close(sched.scheduled[0].1, config.backoff_period - SLOT_COMPENSATION));
        assert!(close(channel.stats().energy_accum, config.cca_energy()));

        // Channel marked busy
        step(&mut dev, &mut sched);
        assert_eq!(dev.state(), DeviceState::Transmitting);
        assert!(!channel.is_free());

        // Frame goes out
        step(&mut dev, &mut sched);
        assert_eq!(dev.state(), DeviceState::ChannelFreeHold);
        assert_eq!(channel.concurrent_tx(), 1);
        assert_eq!(channel.stats().tx_pkts, 1);
        let sent_at = sched.now();

        // Sink notification is delivered before the channel is released
        match step(&mut dev, &mut sched) {
            Event::Transmission(tx) => {
                assert_eq!(tx.source, DeviceId(0));
                assert_eq!(tx.sent_at, sent_at);
            },
            e => panic!("unexpected event {:?}", e),
        }

        step(&mut dev, &mut sched);
        assert_eq!(dev.state(), DeviceState::CounterSettling);
        assert!(channel.is_free());
        assert!(close(channel.stats().latency_accum, sent_at + config.tx_duration));

        step(&mut dev, &mut sched);
        assert_eq!(dev.state(), DeviceState::Idle);
        assert_eq!(dev.pkt_to_send(), 0);
        assert_eq!(channel.concurrent_tx(), 0);
        assert_eq!(sched.pending(), 0);
        assert_eq!(dev.pending_timers(), 0);

        let s = channel.stats();
        assert!(close(s.energy_accum, config.cca_energy() + config.tx_energy()));
        assert_eq!(s.dropped_pkts, 0);
    }

    #[test]
    fn busy_channel_drops_after_max_backoffs() {
        let _ = simplelog::SimpleLogger::init(log::LevelFilter::Debug, simplelog::Config::default());

        let config = CsmaConfig{ min_be: 3, max_be: 4, csma_max_backoffs: 4, packets: 2, ..Default::default() };
        let channel = Channel::new();
        channel.set_free(false);

        let mut sched = ManualScheduler::new();
        let mut dev = device(config.clone(), &channel);
        dev.start(&mut sched).unwrap();

        for k in 1..=config.csma_max_backoffs {
            step(&mut dev, &mut sched);
            let fired = sched.now();

            assert_eq!(dev.state(), DeviceState::AwaitingBackoff);
            assert_eq!(dev.nb(), k);
            assert_eq!(dev.be(), (config.min_be + k).min(config.max_be));
            assert!(close(sched.scheduled[0].1, fired + config.backoff_period));
        }

        // One more busy assessment exhausts the backoffs
        step(&mut dev, &mut sched);

        let s = channel.stats();
        assert_eq!(s.dropped_pkts, 1);
        assert_eq!(s.tx_pkts, 0);
        assert!(close(s.energy_accum, 5.0 * config.cca_energy()));

        assert_eq!(dev.nb(), 0);
        assert_eq!(dev.be(), config.min_be);
        assert_eq!(dev.pkt_to_send(), 1);
        assert_eq!(dev.pkt_creation_time(), config.slot_start(1));

        // Next packet waits for its generation period
        assert_eq!(sched.pending(), 1);
        assert_eq!(sched.scheduled[0].1, config.slot_start(1));
    }

    #[test]
    fn drops_at_largest_backoff_limit() {
        let config = CsmaConfig{ csma_max_backoffs: u8::MAX, packets: 1, ..Default::default() };
        let channel = Channel::new();
        channel.set_free(false);

        let mut sched = ManualScheduler::new();
        let mut dev = device(config.clone(), &channel);
        dev.start(&mut sched).unwrap();

        for _ in 0..u8::MAX {
            step(&mut dev, &mut sched);
            assert_eq!(dev.state(), DeviceState::AwaitingBackoff);
        }
        assert_eq!(dev.nb(), u8::MAX);
        assert_eq!(dev.be(), config.max_be);
        assert_eq!(channel.stats().dropped_pkts, 0);

        // Final busy assessment drops instead of retrying
        step(&mut dev, &mut sched);

        assert_eq!(channel.stats().dropped_pkts, 1);
        assert_eq!(dev.nb(), 0);
        assert_eq!(dev.state(), DeviceState::Idle);
        assert_eq!(sched.pending(), 0);
    }

    #[test]
    fn backoff_offset_scales_with_exponent() {
        let config = CsmaConfig{ min_be: 2, max_be: 3, packets: 1, ..Default::default() };
        let channel = Channel::new();
        channel.set_free(false);

        // Always draw the top slot: 2^be
        let top = |be: u8| 1u64 << be;
        let mut dev = Device::new(DeviceId(3), config.clone(), channel.clone(), SequenceRng::new(&[top(2), top(3), top(3)]));
        let mut sched = ManualScheduler::new();

        dev.start(&mut sched).unwrap();
        assert!(close(sched.scheduled[0].1, 4.0 * config.backoff_period));

        let (h, t, _) = sched.take_next().unwrap();
        dev.on_timer(h, TimerKind::BackoffExpired, &mut sched).unwrap();
        assert!(close(sched.scheduled[0].1, t + config.backoff_period + 8.0 * config.backoff_period));

        // Exponent is capped, range stays at 2^max_be
        let (h, t, _) = sched.take_next().unwrap();
        dev.on_timer(h, TimerKind::BackoffExpired, &mut sched).unwrap();
        assert_eq!(dev.be(), 3);
        assert!(close(sched.scheduled[0].1, t + config.backoff_period + 8.0 * config.backoff_period));
    }

    #[test]
    fn stale_timer_is_ignored() {
        let channel = Channel::new();
        let mut sched = ManualScheduler::new();
        let mut dev = device(CsmaConfig::default(), &channel);

        dev.start(&mut sched).unwrap();
        let (h, _t, _e) = sched.take_next().unwrap();

        dev.on_timer(TimerHandle(h.0 + 100), TimerKind::BackoffExpired, &mut sched).unwrap();
        dev.on_timer(h, TimerKind::SendMessage, &mut sched).unwrap();
        assert_eq!(dev.state(), DeviceState::AwaitingBackoff);
        assert_eq!(channel.stats().energy_accum, 0.0);

        dev.on_timer(h, TimerKind::BackoffExpired, &mut sched).unwrap();
        assert_eq!(dev.state(), DeviceState::ChannelBusyHold);

        // Repeat firing of the same handle is rejected
        dev.on_timer(h, TimerKind::BackoffExpired, &mut sched).unwrap();
        assert!(close(channel.stats().energy_accum, CsmaConfig::default().cca_energy()));
    }

    #[test]
    fn stop_cancels_pending_timers() {
        let channel = Channel::new();
        let mut sched = ManualScheduler::new();
        let mut dev = device(CsmaConfig::default(), &channel);

        dev.start(&mut sched).unwrap();
        assert!(dev.is_pending(TimerKind::BackoffExpired));

        assert_eq!(dev.stop(&mut sched), 1);
        assert_eq!(dev.state(), DeviceState::Idle);
        assert_eq!(dev.pending_timers(), 0);
        assert_eq!(sched.pending(), 0);
        assert_eq!(sched.cancelled.len(), 1);
    }

    #[test]
    fn zero_packets_stays_idle() {
        let channel = Channel::new();
        let mut sched = ManualScheduler::new();
        let mut dev = device(CsmaConfig{ packets: 0, ..Default::default() }, &channel);

        dev.start(&mut sched).unwrap();
        assert_eq!(dev.state(), DeviceState::Idle);
        assert_eq!(sched.pending(), 0);
    }

    #[test]
    fn backoff_slots_rejects_biased_draws() {
        // 2^64 - 1 is divisible by 3, so u64::MAX falls in the rejected tail
        let mut rng = SequenceRng::new(&[u64::MAX, 7]);
        assert_eq!(backoff_slots(&mut rng, 1), 1);
    }

    #[test]
    fn backoff_slots_are_uniform() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut counts = vec![0u32; 5];

        for _ in 0..50_000 {
            let s = backoff_slots(&mut rng, 2) as usize;
            assert!(s <= 4);
            counts[s] += 1;
        }

        for c in counts {
            assert!(c > 9_400 && c < 10_600, "count {} out of range", c);
        }

        for _ in 0..1_000 {
            assert!(backoff_slots(&mut rng, 0) <= 1);
        }
    }
}
