//! Argument parsing for running from the command line

use std::{net::SocketAddr, path::PathBuf};

use clap::{Parser, Subcommand};

use crate::config::{Config, OutputMode, SinkMode};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    #[clap(subcommand)]
    pub command: Command,
    #[clap(flatten)]
    pub overrides: Overrides,
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the (simulated) digitizer and deliver one session to the file or
    /// datagram sink
    Sample,
    /// Request a session over the network and persist it as it arrives
    Collect,
    /// Digitizer, wireless sink and collector in one process over an
    /// in-memory link
    Loopback,
    /// Turn a persisted session into displacement and complex exports
    Process {
        /// Persisted sample file
        input: PathBuf,
        /// Where to write displacement in meters, one value per line
        #[clap(long)]
        displacement: Option<PathBuf>,
        /// Where to write mean-removed `re,im` rows
        #[clap(long)]
        complex: Option<PathBuf>,
    },
}

/// Anything set here wins over the config file
#[derive(clap::Args, Debug, Default)]
pub struct Overrides {
    /// TOML config file
    #[clap(short, long)]
    pub config: Option<PathBuf>,
    /// Raw ADC clock rate in Hz
    #[clap(long)]
    pub sample_rate: Option<u32>,
    /// Decimation factor (256, 1024, 4096 or 16384)
    #[clap(short, long)]
    pub decimation: Option<u32>,
    /// Session length in seconds
    #[clap(short = 't', long)]
    pub duration: Option<u32>,
    #[clap(long, value_enum)]
    pub output_mode: Option<OutputMode>,
    #[clap(short, long, value_enum)]
    pub sink: Option<SinkMode>,
    /// Persisted sample file
    #[clap(short, long)]
    pub output: Option<PathBuf>,
    /// Address of the digitizer, for the collector
    #[clap(long)]
    pub peer: Option<SocketAddr>,
    /// Address the datagram sink listens on
    #[clap(long)]
    pub bind: Option<SocketAddr>,
    /// Sample buffer capacity
    #[clap(long)]
    #[clap(value_parser = clap::value_parser!(u64).range(1..))]
    pub capacity: Option<u64>,
    /// Advertised device name
    #[clap(long)]
    pub name: Option<String>,
    /// Seconds to look for the device before giving up
    #[clap(long)]
    pub discovery_timeout: Option<f64>,
    /// Seconds of datagram silence before giving up, 0 to wait forever
    #[clap(long)]
    pub idle_timeout: Option<f64>,
    /// Pace the simulated hardware at the decimated rate
    #[clap(long)]
    pub realtime: bool,
}

impl Overrides {
    pub fn apply(&self, config: &mut Config) {
        if let Some(v) = self.sample_rate {
            config.sample_rate = v;
        }
        if let Some(v) = self.decimation {
            config.decimation = v;
        }
        if let Some(v) = self.duration {
            config.duration = v;
        }
        if let Some(v) = self.output_mode {
            config.output_mode = v;
        }
        if let Some(v) = self.sink {
            config.sink = v;
        }
        if let Some(v) = &self.output {
            config.output = v.clone();
        }
        if let Some(v) = self.peer {
            config.peer_address = v;
        }
        if let Some(v) = self.bind {
            config.bind_address = v;
        }
        if let Some(v) = self.capacity {
            config.buffer_capacity = v as usize;
        }
        if let Some(v) = &self.name {
            config.device_name = v.clone();
        }
        if let Some(v) = self.discovery_timeout {
            config.discovery_timeout_secs = v;
        }
        if let Some(v) = self.idle_timeout {
            config.idle_timeout_secs = Some(v);
        }
        if self.realtime {
            config.realtime = true;
        }
    }

    /// The config file if one was given, rig defaults otherwise, with every
    /// flag applied on top
    pub fn resolve(&self) -> crate::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        self.apply(&mut config);
        Ok(config)
    }
}

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}
