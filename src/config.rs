//! Session configuration.
//!
//! Every knob the rig used to have hard-coded lives here. A [`Config`] starts
//! from the rig defaults, can be loaded from a TOML file and is then
//! overridden by command line flags (see [`crate::args`]).

use std::{
    fmt,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{session_target, Error, Result, DATAGRAM_PORT, DECIMATIONS, DEVICE_NAME, SAMPLE_RATE};

/// Which ADC output port the sequencer reads
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum OutputMode {
    /// Digital-filter output, one word per decimation period
    Filtered,
    /// Raw conversion output, decimation is ignored
    NoLatency,
}

/// The one sink a session delivers to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SinkMode {
    File,
    Notification,
    Datagram,
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub ssid: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("ssid", &self.ssid)
            .field("password", &"********")
            .finish()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Raw ADC clock rate in Hz
    pub sample_rate: u32,
    pub decimation: u32,
    /// Session length in seconds
    pub duration: u32,
    pub output_mode: OutputMode,
    pub sink: SinkMode,
    /// Persisted sample file
    pub output: PathBuf,
    /// Where the collector finds the sampler
    pub peer_address: SocketAddr,
    /// Where the sampler listens for the initiation datagram
    pub bind_address: SocketAddr,
    pub credentials: Option<Credentials>,
    pub buffer_capacity: usize,
    /// Advertised name matched during discovery
    pub device_name: String,
    pub discovery_timeout_secs: f64,
    /// Give up on a silent datagram stream after this long; `0` waits forever
    pub idle_timeout_secs: Option<f64>,
    /// Pace the simulated hardware at the decimated rate
    pub realtime: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            decimation: 4096,
            duration: 20,
            output_mode: OutputMode::Filtered,
            sink: SinkMode::File,
            output: default_output(&Utc::now()),
            peer_address: SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::new(192, 168, 3, 28),
                DATAGRAM_PORT,
            )),
            bind_address: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DATAGRAM_PORT)),
            credentials: None,
            buffer_capacity: 50_000,
            device_name: DEVICE_NAME.to_owned(),
            discovery_timeout_secs: 80.0,
            idle_timeout_secs: Some(30.0),
            realtime: false,
        }
    }
}

/// Timestamped file name so back-to-back sessions don't clobber each other
pub fn default_output(time: &DateTime<Utc>) -> PathBuf {
    PathBuf::from(format!("iq-{}.txt", time.format("%Y-%m-%d-%H:%M:%S")))
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::Configuration(e.to_string()))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Configuration(format!("reading {path:?}: {e}")))?;
        Self::from_toml_str(&text)
    }

    /// Reject anything that would make the hardware sequencing meaningless
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(Error::Configuration("sample rate must be positive".into()));
        }
        if self.duration == 0 {
            return Err(Error::Configuration("duration must be positive".into()));
        }
        if self.buffer_capacity == 0 {
            return Err(Error::Configuration("buffer capacity must be positive".into()));
        }
        if self.output_mode == OutputMode::Filtered && !DECIMATIONS.contains(&self.decimation) {
            return Err(Error::Configuration(format!(
                "{} is not a supported decimation factor, expected one of {:?}",
                self.decimation, DECIMATIONS
            )));
        }
        if !(self.discovery_timeout_secs.is_finite() && self.discovery_timeout_secs > 0.0) {
            return Err(Error::Configuration("discovery timeout must be positive".into()));
        }
        if let Some(idle) = self.idle_timeout_secs {
            if !(idle.is_finite() && idle >= 0.0) {
                return Err(Error::Configuration(
                    "idle timeout must be zero (wait forever) or positive".into(),
                ));
            }
        }
        if self.target() == 0 {
            return Err(Error::Configuration(format!(
                "{} Hz for {} s at decimation {} yields no samples",
                self.sample_rate,
                self.duration,
                self.effective_decimation()
            )));
        }
        Ok(())
    }

    /// Decimation actually applied by the selected output port
    pub fn effective_decimation(&self) -> u32 {
        match self.output_mode {
            OutputMode::Filtered => self.decimation,
            OutputMode::NoLatency => 1,
        }
    }

    /// Session target `N`
    pub fn target(&self) -> usize {
        session_target(self.sample_rate, self.effective_decimation(), self.duration)
    }

    /// Decimated rate of I/Q pairs in Hz
    pub fn output_rate(&self) -> f64 {
        self.sample_rate as f64 / self.effective_decimation() as f64
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.discovery_timeout_secs)
    }

    /// `None` when the stream may stay silent indefinitely
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs
            .filter(|&secs| secs > 0.0)
            .map(Duration::from_secs_f64)
    }
}
