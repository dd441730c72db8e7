//! The run-metadata document written next to the channel files

use std::fmt;

use chrono::{DateTime, Datelike, Timelike, Utc};
use hifitime::Epoch;
use tracing::debug;

use crate::{
    clock::LockStatus,
    device::ChannelReadback,
    plan::AcquisitionPlan,
    radio::{ClockSource, Radio},
    sample::WireFormat,
};

/// `YYYY-MM-DD-hh:mm:ss`
pub fn utc_timestamp(time: &DateTime<Utc>) -> String {
    format!(
        "{}-{:02}-{:02}-{:02}:{:02}:{:02}",
        time.year(),
        time.month(),
        time.day(),
        time.hour(),
        time.minute(),
        time.second()
    )
}

/// Modified Julian Date of a UTC instant
pub fn mjd(time: &DateTime<Utc>) -> f64 {
    let unix = time.timestamp() as f64 + f64::from(time.timestamp_subsec_nanos()) * 1e-9;
    Epoch::from_unix_seconds(unix).to_mjd_utc_days()
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChannelSettings {
    pub freq: f64,
    pub bandwidth: f64,
    pub rate: f64,
    pub gain: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChannelMetadata {
    pub index: usize,
    pub antenna: String,
    pub requested: ChannelSettings,
    /// What the hardware settled on
    pub achieved: ChannelSettings,
}

impl From<&ChannelReadback> for ChannelMetadata {
    fn from(rb: &ChannelReadback) -> Self {
        Self {
            index: rb.requested.index,
            antenna: rb.achieved.antenna.clone(),
            requested: ChannelSettings {
                freq: rb.requested.freq,
                bandwidth: rb.requested.bandwidth,
                rate: rb.requested.rate,
                gain: rb.requested.gain,
            },
            achieved: ChannelSettings {
                freq: rb.achieved.freq,
                bandwidth: rb.achieved.bandwidth,
                rate: rb.achieved.rate,
                gain: rb.achieved.gain,
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SweepMetadata {
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

/// Snapshot of a run, taken once when capture starts
#[derive(Clone, Debug, PartialEq)]
pub struct RunMetadata {
    pub device: String,
    pub reference: ClockSource,
    pub time_source: ClockSource,
    /// Wall-clock time the first sample is scheduled for
    pub start: DateTime<Utc>,
    pub lock: LockStatus,
    pub gps_time: Option<String>,
    pub position: Option<String>,
    pub duration: f64,
    pub total_samples: u64,
    pub format: WireFormat,
    pub channels: Vec<ChannelMetadata>,
    pub sweep: Option<SweepMetadata>,
}

impl RunMetadata {
    /// The clock sources recorded are the ones actually in force, which differ from
    /// the plan when a missing GPS lock forced the internal clock
    pub fn new(
        plan: &AcquisitionPlan,
        sources: (ClockSource, ClockSource),
        readback: &[ChannelReadback],
        lock: LockStatus,
    ) -> Self {
        Self {
            device: plan.device.to_string(),
            reference: sources.0,
            time_source: sources.1,
            start: Utc::now()
                + chrono::Duration::from_std(plan.start_offset)
                    .unwrap_or_else(|_| chrono::Duration::zero()),
            lock,
            gps_time: None,
            position: None,
            duration: plan.duration,
            total_samples: plan.total_samples,
            format: plan.format,
            channels: readback.iter().map(ChannelMetadata::from).collect(),
            sweep: None,
        }
    }

    pub fn with_sweep(mut self, sweep: SweepMetadata) -> Self {
        self.sweep = Some(sweep);
        self
    }

    /// Fill in GPS time (only trusted under lock) and the NMEA position from board 0
    pub fn with_gps<R: Radio + ?Sized>(mut self, radio: &mut R) -> Self {
        if self.lock == LockStatus::Locked {
            self.gps_time = read_text(radio, "gps_time");
        }
        self.position = read_text(radio, "gps_gpgga");
        self
    }
}

fn read_text<R: Radio + ?Sized>(radio: &mut R, name: &str) -> Option<String> {
    match radio.mboard_sensor(name, 0) {
        Ok(v) => Some(v.to_string()),
        Err(e) => {
            debug!("No '{name}' for metadata: {e}");
            None
        }
    }
}

impl fmt::Display for RunMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Device: {}", self.device)?;
        writeln!(f, "Clock Reference: {}", self.reference)?;
        writeln!(f, "Time Source: {}", self.time_source)?;
        writeln!(f, "Start time: {} UTC", utc_timestamp(&self.start))?;
        writeln!(f, "Start MJD: {:.8}", mjd(&self.start))?;
        writeln!(f, "Lock status: {}", self.lock)?;
        if let Some(t) = &self.gps_time {
            writeln!(f, "GPS time: {t}")?;
        }
        if let Some(p) = &self.position {
            writeln!(f, "Position: {p}")?;
        }
        writeln!(f, "Duration: {} s", self.duration)?;
        if self.sweep.is_some() {
            writeln!(f, "Total samples per step: {}", self.total_samples)?;
        } else {
            writeln!(f, "Total samples: {}", self.total_samples)?;
        }
        writeln!(f, "Format: {}", self.format)?;
        writeln!(f, "Channels: {}", self.channels.len())?;
        if let Some(c) = self.channels.first().map(|c| c.achieved) {
            writeln!(f, "Fc: {:.6} MHz", c.freq / 1e6)?;
            writeln!(f, "BW: {:.6} MHz", c.bandwidth / 1e6)?;
            writeln!(f, "Fs: {:.6} Msps", c.rate / 1e6)?;
            writeln!(f, "Gain: {:.6} dB", c.gain)?;
        }
        if let Some(s) = &self.sweep {
            writeln!(f, "Min Gain: {:.6} dB", s.min)?;
            writeln!(f, "Max Gain: {:.6} dB", s.max)?;
            writeln!(f, "Step Size: {:.6} dB", s.step)?;
        }
        for c in &self.channels {
            let (i, req, got) = (c.index, &c.requested, &c.achieved);
            writeln!(f, "Chan {i} Antenna: {}", c.antenna)?;
            writeln!(
                f,
                "Chan {i} Fc: {:.6} MHz (requested {:.6} MHz)",
                got.freq / 1e6,
                req.freq / 1e6
            )?;
            writeln!(
                f,
                "Chan {i} BW: {:.6} MHz (requested {:.6} MHz)",
                got.bandwidth / 1e6,
                req.bandwidth / 1e6
            )?;
            writeln!(
                f,
                "Chan {i} Fs: {:.6} Msps (requested {:.6} Msps)",
                got.rate / 1e6,
                req.rate / 1e6
            )?;
            writeln!(
                f,
                "Chan {i} Gain: {:.6} dB (requested {:.6} dB)",
                got.gain, req.gain
            )?;
        }
        Ok(())
    }
}
