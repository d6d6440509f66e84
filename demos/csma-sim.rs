//! CSMA/CA sensor network run
//
// Builds a star of identical sensor devices sharing one channel, runs the
// model to completion (or to `--until`, or Ctrl-C) and prints the sink report.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info};

use rand::{SeedableRng, rngs::StdRng};
use strum::IntoEnumIterator;
use structopt::StructOpt;

use csma_ca::prelude::*;


#[derive(Debug, StructOpt)]
struct Options {
    #[structopt(long, default_value = "10")]
    /// Number of sensor devices
    pub devices: usize,

    #[structopt(long, default_value = "100")]
    /// Packets sent by each device
    pub packets: u32,

    #[structopt(long, default_value = "320us", parse(try_from_str = parse_secs))]
    /// Backoff slot duration (D_bp)
    pub backoff_period: f64,

    #[structopt(long, default_value = "4ms", parse(try_from_str = parse_secs))]
    /// Frame transmission duration (D_p)
    pub tx_duration: f64,

    #[structopt(long, default_value = "1s", parse(try_from_str = parse_secs))]
    /// Packet generation period (T)
    pub packet_period: f64,

    #[structopt(long, default_value = "128us", parse(try_from_str = parse_secs))]
    /// Clear channel assessment duration (T_cca)
    pub cca_duration: f64,

    #[structopt(long, default_value = "3")]
    /// Minimum backoff exponent (macMinBE)
    pub min_be: u8,

    #[structopt(long, default_value = "5")]
    /// Maximum backoff exponent (macMaxBE)
    pub max_be: u8,

    #[structopt(long, default_value = "4")]
    /// Maximum number of backoffs before a packet is dropped (macMaxCSMABackoffs)
    pub max_backoffs: u8,

    #[structopt(long, default_value = "0.0522")]
    /// Transmit power draw in watts
    pub tx_power: f64,

    #[structopt(long, default_value = "0.0591")]
    /// Receive / sense power draw in watts
    pub rx_power: f64,

    #[structopt(long)]
    /// Seed for reproducible runs (random if not set)
    pub seed: Option<u64>,

    #[structopt(long, parse(try_from_str = parse_secs))]
    /// Stop after this much virtual time
    pub until: Option<f64>,

    #[structopt(long, default_value = "info")]
    /// Configure log level
    pub log_level: simplelog::LevelFilter,
}

fn parse_secs(s: &str) -> Result<f64, humantime::DurationError> {
    humantime::parse_duration(s).map(|d| d.as_secs_f64())
}

fn main() -> anyhow::Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    // Bind exit handler
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    }).expect("Error setting Ctrl-C handler");

    // Load options
    let opts = Options::from_args();

    // Initialise logging
    let _ = simplelog::SimpleLogger::init(opts.log_level, simplelog::Config::default());

    let config = CsmaConfig {
        backoff_period: opts.backoff_period,
        tx_duration: opts.tx_duration,
        min_be: opts.min_be,
        max_be: opts.max_be,
        csma_max_backoffs: opts.max_backoffs,
        packet_period: opts.packet_period,
        cca_duration: opts.cca_duration,
        packets: opts.packets,
        tx_power: opts.tx_power,
        rx_power: opts.rx_power,
    };

    let seed = opts.seed.unwrap_or_else(rand::random);
    info!("Starting csma-sim with {} devices (seed: {})", opts.devices, seed);
    debug!("Device configuration: {:?}", config);

    let mut sim = Simulation::new();
    for i in 0..opts.devices {
        let rng = StdRng::seed_from_u64(seed.wrapping_add(i as u64));
        sim.add_device(config.clone(), rng)
            .map_err(|e| anyhow::anyhow!("Error adding device {}: {}", i, e))?;
    }

    while running.load(Ordering::SeqCst) {
        match (sim.next_event_time(), opts.until) {
            (None, _) => break,
            (Some(t), Some(limit)) if t > limit => break,
            _ => (),
        }

        sim.step()?;
    }

    if !running.load(Ordering::SeqCst) {
        info!("Interrupted at {} s", sim.now());
    }

    let channel = sim.channel().clone();
    for k in ChannelKey::iter() {
        debug!("{}: {:?}", k, channel.get(k));
    }

    let report = sim.finish();
    println!("{}", report);

    Ok(())
}
