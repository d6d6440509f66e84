//! Collision aggregator
//
// The sink classifies every frame against the concurrent transmission count
// at the instant it arrives, and produces the run summary at the end.

use core::fmt;

use log::{debug, info};

use crate::{channel::Channel, mac::Transmission};

/// Sink classification of an incoming frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reception {
    Received,
    Collided,
}

/// Sink node, counts successful and collided frames
#[derive(Debug, Clone)]
pub struct Sink {
    channel: Channel,
    received: u32,
    collided: u32,
}

impl Sink {
    pub fn new(channel: Channel) -> Self {
        Self{ channel, received: 0, collided: 0 }
    }

    /// Classify a frame arriving from a device
    pub fn receive(&mut self, tx: &Transmission) -> Reception {
        let concurrent = self.channel.concurrent_tx();

        if concurrent > 1 {
            debug!("Collision on frame from {} ({} concurrent)", tx.source, concurrent);
            self.collided += 1;
            Reception::Collided
        } else {
            debug!("Frame from {} successfully received", tx.source);
            self.received += 1;
            Reception::Received
        }
    }

    pub fn received(&self) -> u32 {
        self.received
    }

    pub fn collided(&self) -> u32 {
        self.collided
    }

    /// Total frames observed
    pub fn observed(&self) -> u32 {
        self.received + self.collided
    }

    /// Snapshot sink counters and channel accumulators
    pub fn totals(&self) -> Totals {
        let s = self.channel.stats();

        Totals {
            received: self.received,
            collided: self.collided,
            dropped: s.dropped_pkts,
            transmitted: s.tx_pkts,
            latency_accum: s.latency_accum,
            energy_accum: s.energy_accum,
        }
    }

    /// Compute the end of run report
    pub fn finish(&self) -> Report {
        let report = finalize(&self.totals());

        info!("Average delivery ratio: {}", DisplayOpt(report.totals.delivery_ratio_pct(), "%"));
        match &report.outcome {
            Outcome::Summary(s) => {
                info!("Average latency: {:.4} ms", s.avg_latency_ms);
                info!("Average energy consumption: {:.4} mJ", s.avg_energy_mj);
            },
            Outcome::NoPacketsReceived => {
                info!("Average latency and energy undefined: no packets received");
            },
        }

        report
    }
}

/// Raw counters at the end of a run
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Totals {
    pub received: u32,
    pub collided: u32,
    pub dropped: u32,
    pub transmitted: u32,
    /// Seconds
    pub latency_accum: f64,
    /// Joules
    pub energy_accum: f64,
}

impl Totals {
    /// Packets that reached a terminal outcome
    pub fn attempts(&self) -> u32 {
        self.received + self.collided + self.dropped
    }

    /// Received packets as a percentage of all attempts, `None` without attempts
    pub fn delivery_ratio_pct(&self) -> Option<f64> {
        match self.attempts() {
            0 => None,
            n => Some(self.received as f64 / n as f64 * 100.0),
        }
    }
}

/// Derived per-packet statistics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    pub delivery_ratio_pct: f64,
    pub avg_latency_ms: f64,
    pub avg_energy_mj: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    Summary(Summary),
    /// Averages per received packet are undefined
    NoPacketsReceived,
}

/// End of run report
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Report {
    pub totals: Totals,
    pub outcome: Outcome,
}

impl Report {
    pub fn summary(&self) -> Option<&Summary> {
        match &self.outcome {
            Outcome::Summary(s) => Some(s),
            Outcome::NoPacketsReceived => None,
        }
    }
}

/// Derive delivery ratio, average latency and average energy from run totals
pub fn finalize(totals: &Totals) -> Report {
    let outcome = match (totals.received, totals.delivery_ratio_pct()) {
        (0, _) | (_, None) => Outcome::NoPacketsReceived,
        (received, Some(delivery_ratio_pct)) => {
            let received = received as f64;
            Outcome::Summary(Summary {
                delivery_ratio_pct,
                avg_latency_ms: totals.latency_accum / received * 1000.0,
                avg_energy_mj: totals.energy_accum / received * 1000.0,
            })
        },
    };

    Report{ totals: *totals, outcome }
}

struct DisplayOpt(Option<f64>, &'static str);

impl fmt::Display for DisplayOpt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(v) => write!(f, "{:.2}{}", v, self.1),
            None => write!(f, "undefined"),
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = &self.totals;
        writeln!(f, "Transmitted: {} Received: {} Collided: {} Dropped: {}", t.transmitted, t.received, t.collided, t.dropped)?;
        writeln!(f, "Average delivery ratio: {}", DisplayOpt(t.delivery_ratio_pct(), "%"))?;

        match &self.outcome {
            Outcome::Summary(s) => {
                writeln!(f, "Average latency: {:.4} ms", s.avg_latency_ms)?;
                write!(f, "Average energy consumption: {:.4} mJ", s.avg_energy_mj)
            },
            Outcome::NoPacketsReceived => {
                write!(f, "Average latency and energy consumption: undefined (no packets received)")
            },
        }
    }
}


#[cfg(test)]
mod test {
    use std::string::ToString;

    use crate::mac::DeviceId;
    use super::*;

    fn tx() -> Transmission {
        Transmission{ source: DeviceId(1), sent_at: 0.0 }
    }

    #[test]
    fn classifies_on_concurrent_count() {
        let channel = Channel::new();
        let mut sink = Sink::new(channel.clone());

        channel.begin_tx();
        assert_eq!(sink.receive(&tx()), Reception::Received);

        channel.begin_tx();
        assert_eq!(sink.receive(&tx()), Reception::Collided);
        assert_eq!(sink.receive(&tx()), Reception::Collided);

        assert_eq!(sink.received(), 1);
        assert_eq!(sink.collided(), 2);
        assert_eq!(sink.observed(), 3);
    }

    #[test]
    fn delivery_ratio() {
        let totals = Totals{ received: 8, collided: 1, dropped: 1, transmitted: 9, latency_accum: 0.04, energy_accum: 0.002 };
        let report = finalize(&totals);

        let s = report.summary().unwrap();
        assert_eq!(s.delivery_ratio_pct, 80.0);
        assert!((s.avg_latency_ms - 5.0) < 1e-9 && (5.0 - s.avg_latency_ms) < 1e-9);
        assert!((s.avg_energy_mj - 0.25) < 1e-9 && (0.25 - s.avg_energy_mj) < 1e-9);
    }

    #[test]
    fn no_packets_received_is_undefined() {
        let totals = Totals{ collided: 2, dropped: 1, transmitted: 2, energy_accum: 0.01, ..Default::default() };
        let report = finalize(&totals);

        assert_eq!(report.outcome, Outcome::NoPacketsReceived);
        assert_eq!(report.totals.delivery_ratio_pct(), Some(0.0));
        assert!(report.to_string().contains("undefined (no packets received)"));

        let empty = finalize(&Totals::default());
        assert_eq!(empty.outcome, Outcome::NoPacketsReceived);
        assert_eq!(empty.totals.delivery_ratio_pct(), None);
        assert!(empty.to_string().contains("delivery ratio: undefined"));
    }

    #[test]
    fn totals_include_channel_registers() {
        let channel = Channel::new();
        let sink = Sink::new(channel.clone());

        channel.record_drop();
        channel.add_latency(0.5);
        channel.add_energy(0.25);
        channel.begin_tx();

        let t = sink.totals();
        assert_eq!(t.dropped, 1);
        assert_eq!(t.transmitted, 1);
        assert_eq!(t.latency_accum, 0.5);
        assert_eq!(t.energy_accum, 0.25);
    }

    #[test]
    fn report_display() {
        let totals = Totals{ received: 1, transmitted: 1, latency_accum: 0.002, energy_accum: 0.0005, ..Default::default() };
        let text = finalize(&totals).to_string();

        assert!(text.contains("Average delivery ratio: 100.00%"));
        assert!(text.contains("Average latency: 2.0000 ms"));
        assert!(text.contains("Average energy consumption: 0.5000 mJ"));
    }
}
