//! Immutable run configuration, built once from the command line and validated
//! before any hardware call is made.

use std::{fmt, time::Duration};

use crate::{
    device::{Route, RoutingTable},
    radio::ClockSource,
    sample::WireFormat,
    Error, Result,
};

/// Parsed `key=value,key=value` device address string
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceArgs {
    pairs: Vec<(String, String)>,
}

impl DeviceArgs {
    pub fn parse(s: &str) -> Result<Self> {
        let mut pairs = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, val) = part.split_once('=').ok_or_else(|| {
                Error::Configuration(format!("device arg '{part}' is not key=value"))
            })?;
            pairs.push((key.trim().to_owned(), val.trim().to_owned()));
        }
        Ok(Self { pairs })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// One board per `addrN` key, and at least one
    pub fn num_boards(&self) -> usize {
        self.pairs
            .iter()
            .filter(|(k, _)| {
                k.strip_prefix("addr")
                    .map_or(false, |n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
            })
            .count()
            .max(1)
    }
}

impl fmt::Display for DeviceArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<String> = self.pairs.iter().map(|(k, v)| format!("{k}={v}")).collect();
        write!(f, "{}", joined.join(","))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChannelConfig {
    pub index: usize,
    pub route: Route,
    pub freq: f64,
    pub rate: f64,
    pub bandwidth: f64,
    pub gain: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClockPlan {
    pub reference: ClockSource,
    pub time_source: ClockSource,
    /// Seconds to wait for GPS lock, polled once per second
    pub lock_wait: u32,
}

impl ClockPlan {
    pub fn uses_gps(&self) -> bool {
        self.reference == ClockSource::Gpsdo || self.time_source == ClockSource::Gpsdo
    }
}

/// How long to capture for
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SampleTarget {
    Seconds(f64),
    Samples(u64),
}

/// Everything a capture needs, straight from the command line
#[derive(Clone, Debug)]
pub struct CaptureOptions {
    pub device: String,
    pub prefix: String,
    pub channels: usize,
    pub rate: f64,
    pub freq: f64,
    pub gain: f64,
    /// Zero or negative means "same as the rate"
    pub bandwidth: f64,
    pub target: SampleTarget,
    pub samples_per_block: Option<usize>,
    pub format: WireFormat,
    pub clock: ClockPlan,
    pub start_offset: Duration,
}

#[derive(Clone, Debug)]
pub struct AcquisitionPlan {
    pub device: DeviceArgs,
    pub prefix: String,
    pub channels: Vec<ChannelConfig>,
    pub total_samples: u64,
    /// Capture length in seconds, as asked for or as implied by the sample count
    pub duration: f64,
    pub samples_per_block: Option<usize>,
    pub format: WireFormat,
    pub clock: ClockPlan,
    pub start_offset: Duration,
}

impl AcquisitionPlan {
    pub fn from_options(opts: &CaptureOptions, table: &RoutingTable) -> Result<Self> {
        if !(opts.rate > 0.0) {
            return Err(Error::Configuration(
                "Please specify a valid sample rate".to_owned(),
            ));
        }
        let routes = table.routes(opts.channels)?;
        let device = DeviceArgs::parse(&opts.device)?;
        let needed = table.boards_needed(opts.channels)?;
        if needed > device.num_boards() {
            return Err(Error::IncompatibleDevice {
                channels: opts.channels,
                needed,
                boards: device.num_boards(),
            });
        }
        if opts.samples_per_block == Some(0) {
            return Err(Error::Configuration(
                "samples per block must be positive".to_owned(),
            ));
        }
        let (total_samples, duration) = match opts.target {
            SampleTarget::Seconds(secs) if secs >= 0.0 => {
                ((opts.rate * secs).round() as u64, secs)
            }
            SampleTarget::Seconds(secs) => {
                return Err(Error::Configuration(format!(
                    "capture duration {secs} s is negative"
                )))
            }
            SampleTarget::Samples(n) => (n, n as f64 / opts.rate),
        };
        if total_samples == 0 {
            return Err(Error::Configuration(
                "nothing to capture: give a duration or a sample count".to_owned(),
            ));
        }
        let bandwidth = if opts.bandwidth > 0.0 {
            opts.bandwidth
        } else {
            opts.rate
        };
        let channels = routes
            .iter()
            .enumerate()
            .map(|(index, &route)| ChannelConfig {
                index,
                route,
                freq: opts.freq,
                rate: opts.rate,
                bandwidth,
                gain: opts.gain,
            })
            .collect();
        Ok(Self {
            device,
            prefix: opts.prefix.clone(),
            channels,
            total_samples,
            duration,
            samples_per_block: opts.samples_per_block,
            format: opts.format,
            clock: opts.clock,
            start_offset: opts.start_offset,
        })
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }
}
