// SPDX-License-Identifier: MIT
// Copyright (c) 2024-2026 The OpenIDN Developers

//! OpenIDN server daemon.
//!
//! Binds the IDN-Hello streaming port (7255) and the management port
//! (7355), starts the driver against the selected DAC adapter and runs
//! until interrupted.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: dummy adapter, settings from /etc/openidn/settings.ini
//! openidnd
//!
//! # Cap the device point rate and tune the buffering
//! openidnd --setMaxPointRate 30000 --setChunkLengthUs 5000 --setBufferTargetMs 40
//!
//! # Diagnostic verbosity
//! openidnd --debug
//! ```

use clap::Parser;
use openidn::settings::Settings;
use openidn::{DacAdapter, DummyAdapter, RuntimeConfig, Supervisor};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "openidnd")]
#[command(version, about = "Real-time IDN streaming server for laser projection DACs")]
struct Args {
    /// Use the dummy (hardware-free) adapter (currently the only bundled
    /// output; hardware adapters plug in through the adapter trait)
    #[arg(long)]
    dummy: bool,

    /// Device point-rate ceiling in points per second
    #[arg(long = "setMaxPointRate", value_name = "PPS")]
    max_point_rate: Option<u32>,

    /// WAVE slice target duration in microseconds
    #[arg(long = "setChunkLengthUs", value_name = "US")]
    chunk_length_us: Option<f64>,

    /// Driver buffer fill-depth setpoint in milliseconds
    #[arg(long = "setBufferTargetMs", value_name = "MS")]
    buffer_target_ms: Option<f64>,

    /// Settings file path
    #[arg(long, value_name = "FILE", default_value = "/etc/openidn/settings.ini")]
    settings: PathBuf,

    /// Diagnostic logging
    #[arg(long)]
    debug: bool,

    /// Per-slice diagnostic logging (very verbose)
    #[arg(long)]
    debuglive: bool,

    /// Once-per-second summary logging
    #[arg(long)]
    debugsimple: bool,
}

fn init_logging(args: &Args) {
    let filter = if args.debuglive {
        "trace"
    } else if args.debug || args.debugsimple {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter))
        .format_timestamp_micros()
        .init();
}

fn main() {
    // Argument errors exit with -1, everything else is conventional
    let args = Args::try_parse().unwrap_or_else(|err| {
        let _ = err.print();
        process::exit(-1);
    });
    init_logging(&args);

    let config = Arc::new(RuntimeConfig::new());

    // Settings file first, CLI overrides second
    match Settings::load(&args.settings) {
        Ok(settings) => {
            if let Some(name) = settings.host_name() {
                config.set_host_name(name);
            }
            if let Some(target) = settings.buffer_target_ms() {
                config.set_buffer_target_ms(target);
            }
        }
        Err(err) => {
            log::warn!("settings file ignored: {}", err);
        }
    }

    if let Some(pps) = args.max_point_rate {
        config.set_max_pointrate(pps);
        log::info!("max point rate set to {} pps", pps);
    }
    if let Some(us) = args.chunk_length_us {
        config.set_chunk_length_us(us);
        log::info!("chunk length set to {} us", us);
    }
    if let Some(ms) = args.buffer_target_ms {
        config.set_buffer_target_ms(ms);
        log::info!("buffer target set to {} ms", ms);
    }

    // --dummy is accepted explicitly but is also the default
    if args.dummy {
        log::debug!("dummy adapter selected on the command line");
    }
    let adapter: Arc<dyn DacAdapter> = Arc::new(DummyAdapter::new());
    log::info!("using the {} adapter", adapter.name());

    let supervisor = match Supervisor::start(config, adapter, args.settings.clone()) {
        Ok(supervisor) => supervisor,
        Err(err) => {
            log::error!("startup failed: {}", err);
            process::exit(1);
        }
    };

    log::info!("openidnd {} running", openidn::VERSION);
    supervisor.run();
}
