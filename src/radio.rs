//! The interface we consume from the radio front-end driver.
//!
//! Channel indices are global across boards: board 0 owns the first channels of
//! its subdevice spec, board 1 the ones after that, and so on.

use std::{fmt, str::FromStr};

use crate::{sample::WireFormat, Result};

/// Device time, counted from the last "reset at PPS" origin
pub type TimeSpec = hifitime::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockSource {
    Internal,
    External,
    Gpsdo,
}

impl fmt::Display for ClockSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClockSource::Internal => write!(f, "internal"),
            ClockSource::External => write!(f, "external"),
            ClockSource::Gpsdo => write!(f, "gpsdo"),
        }
    }
}

impl FromStr for ClockSource {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "internal" => Ok(ClockSource::Internal),
            "external" => Ok(ClockSource::External),
            "gpsdo" => Ok(ClockSource::Gpsdo),
            _ => Err(format!(
                "unknown source '{s}' (expected internal, external or gpsdo)"
            )),
        }
    }
}

/// A board sensor reading
#[derive(Clone, Debug, PartialEq)]
pub enum SensorValue {
    Bool { name: String, value: bool },
    Text { name: String, value: String },
}

impl SensorValue {
    pub fn to_bool(&self) -> bool {
        match self {
            SensorValue::Bool { value, .. } => *value,
            SensorValue::Text { value, .. } => value == "true",
        }
    }
}

impl fmt::Display for SensorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorValue::Bool { name, value } => write!(f, "{name}: {value}"),
            SensorValue::Text { name, value } => write!(f, "{name}: {value}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StreamCmd {
    /// Start continuous streaming, at a device time or immediately
    StartContinuous { at: Option<TimeSpec> },
    StopContinuous,
}

/// Problems the driver flags on a batch without failing the call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RxErrorCode {
    Timeout,
    Overflow,
    LateCommand,
    BadPacket,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecvResult {
    /// Samples written into every channel buffer
    pub samples: usize,
    pub error: Option<RxErrorCode>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamArgs {
    pub format: WireFormat,
    pub channels: Vec<usize>,
}

/// A receive stream over a fixed set of channels
pub trait RxStreamer {
    fn num_channels(&self) -> usize;

    fn format(&self) -> WireFormat;

    /// Largest sample count a single `recv` will ever deliver
    fn max_num_samps(&self) -> usize;

    /// Current device time of the board driving this stream
    fn device_time(&self) -> Result<TimeSpec>;

    fn issue_stream_cmd(&mut self, cmd: StreamCmd) -> Result<()>;

    /// Block until some samples arrive. Each buffer in `buffs` belongs to one channel
    /// and holds at least `nsamps` samples in the stream's wire format.
    /// The driver may deliver fewer samples than asked for.
    fn recv(&mut self, buffs: &mut [&mut [u8]], nsamps: usize) -> Result<RecvResult>;
}

/// A (possibly multi-board) radio front-end
pub trait Radio {
    fn num_boards(&self) -> usize;

    fn board_name(&self, board: usize) -> String;

    /// Summary of the device tree, for logs
    fn pp_string(&self) -> String;

    /// Give the calling thread real-time scheduling priority for the receive path
    fn raise_thread_priority(&mut self) -> Result<()>;

    fn set_rx_subdev_spec(&mut self, spec: &str, board: usize) -> Result<()>;
    fn rx_subdev_spec(&self, board: usize) -> Result<String>;

    fn set_rx_antenna(&mut self, antenna: &str, chan: usize) -> Result<()>;
    fn rx_antenna(&self, chan: usize) -> Result<String>;

    fn set_rx_freq(&mut self, hz: f64, chan: usize) -> Result<()>;
    fn rx_freq(&self, chan: usize) -> Result<f64>;

    fn set_rx_rate(&mut self, rate: f64, chan: usize) -> Result<()>;
    fn rx_rate(&self, chan: usize) -> Result<f64>;

    fn set_rx_bandwidth(&mut self, hz: f64, chan: usize) -> Result<()>;
    fn rx_bandwidth(&self, chan: usize) -> Result<f64>;

    fn set_rx_gain(&mut self, db: f64, chan: usize) -> Result<()>;
    fn rx_gain(&self, chan: usize) -> Result<f64>;

    fn set_clock_source(&mut self, source: ClockSource, board: usize) -> Result<()>;
    fn set_time_source(&mut self, source: ClockSource, board: usize) -> Result<()>;

    fn mboard_sensor(&mut self, name: &str, board: usize) -> Result<SensorValue>;

    /// Device time latched at the most recent PPS edge
    fn time_last_pps(&self, board: usize) -> Result<TimeSpec>;

    fn time_now(&self, board: usize) -> Result<TimeSpec>;

    /// Load `time` into the board's clock when the next PPS edge arrives
    fn set_time_next_pps(&mut self, time: TimeSpec, board: usize) -> Result<()>;

    fn rx_stream(&mut self, args: &StreamArgs) -> Result<Box<dyn RxStreamer>>;
}
