//! A deterministic software front-end.
//!
//! Time only moves when something waits: sleeping on the [`SimClock`], receiving
//! samples, or paying the configured command latency. PPS edges fall on whole
//! seconds of the simulated clock and are shared by every board, the way a common
//! GPS or external reference would be.

use std::{cell::Cell, cell::RefCell, rc::Rc, time::Duration};

use byte_slice_cast::AsMutSliceOf;
use hifitime::Unit;
use num_traits::NumCast;

use crate::{
    clock::Sleep,
    plan::DeviceArgs,
    radio::{
        ClockSource, Radio, RecvResult, RxErrorCode, RxStreamer, SensorValue, StreamArgs,
        StreamCmd, TimeSpec,
    },
    sample::{Sample, WireFormat},
    Error, Result,
};

/// Daughterboard channels per simulated board
pub const CHANNELS_PER_BOARD: usize = 4;

const GPS_EPOCH_OFFSET: f64 = 1_790_000_000.0;
const NMEA: &str = "$GPGGA,120000.00,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";

/// Shared simulated wall clock, in seconds
#[derive(Clone, Debug, Default)]
pub struct SimClock {
    now: Rc<Cell<f64>>,
}

impl SimClock {
    pub fn now(&self) -> f64 {
        self.now.get()
    }

    pub fn advance(&self, secs: f64) {
        self.now.set(self.now.get() + secs);
    }

    fn advance_to(&self, secs: f64) {
        if secs > self.now.get() {
            self.now.set(secs);
        }
    }
}

impl Sleep for SimClock {
    fn sleep(&mut self, dur: Duration) {
        self.advance(dur.as_secs_f64());
    }
}

#[derive(Clone, Debug)]
pub struct SimConfig {
    pub boards: usize,
    pub max_num_samps: usize,
    /// Caps on successive deliveries, cycled. Empty delivers whatever was asked for.
    pub batch_pattern: Vec<usize>,
    /// `gps_locked` polls per board before the GPSDO reports lock. `None` never locks.
    pub gps_lock_after: Option<u32>,
    /// The first N sensor reads fail
    pub sensor_failures: u32,
    /// Every Nth receive call flags an overflow. Zero never does.
    pub overflow_every: usize,
    pub freq_step: f64,
    pub rate_step: f64,
    pub bandwidth_step: f64,
    pub gain_step: f64,
    /// Seconds of simulated time each "reset at next PPS" command takes
    pub command_latency: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            boards: 1,
            max_num_samps: 2000,
            batch_pattern: Vec::new(),
            gps_lock_after: Some(0),
            sensor_failures: 0,
            overflow_every: 0,
            freq_step: 0.0,
            rate_step: 0.0,
            bandwidth_step: 0.0,
            gain_step: 0.0,
            command_latency: 0.0,
        }
    }
}

#[derive(Clone, Debug, Default)]
struct SimChannel {
    antenna: String,
    freq: f64,
    rate: f64,
    bandwidth: f64,
    gain: f64,
}

#[derive(Clone, Debug)]
struct SimBoard {
    subdev: String,
    clock_source: ClockSource,
    time_source: ClockSource,
    /// Board time minus simulated time
    offset: f64,
    gps_polls: u32,
}

/// Everything the streamers were asked to do, for inspection
#[derive(Clone, Debug, Default)]
pub struct StreamLog {
    pub commands: Vec<StreamCmd>,
    pub requests: Vec<usize>,
    pub delivered: Vec<usize>,
    /// Simulated time each start command was issued
    pub started_at: Vec<f64>,
}

pub struct SimRadio {
    config: SimConfig,
    clock: SimClock,
    boards: Vec<SimBoard>,
    channels: Vec<SimChannel>,
    sensor_failures: u32,
    gain_history: Vec<(usize, f64)>,
    gain_times: Vec<f64>,
    resets: Vec<(usize, f64)>,
    priority_raised: bool,
    log: Rc<RefCell<StreamLog>>,
}

fn quantize(value: f64, step: f64) -> f64 {
    if step > 0.0 {
        (value / step).round() * step
    } else {
        value
    }
}

fn secs(t: TimeSpec) -> f64 {
    t.to_seconds()
}

fn spec(secs: f64) -> TimeSpec {
    Unit::Second * secs
}

impl SimRadio {
    pub fn new(config: SimConfig) -> Self {
        Self::with_clock(config, SimClock::default())
    }

    pub fn with_clock(config: SimConfig, clock: SimClock) -> Self {
        let boards = (0..config.boards.max(1))
            .map(|b| SimBoard {
                subdev: "A:0".to_owned(),
                clock_source: ClockSource::Internal,
                time_source: ClockSource::Internal,
                // Free-running boards disagree by whole seconds and a fraction
                offset: 1000.0 * (b + 1) as f64 + 0.25 * b as f64,
                gps_polls: 0,
            })
            .collect::<Vec<_>>();
        let channels = vec![
            SimChannel {
                antenna: "RX1".to_owned(),
                ..Default::default()
            };
            boards.len() * CHANNELS_PER_BOARD
        ];
        Self {
            sensor_failures: config.sensor_failures,
            config,
            clock,
            boards,
            channels,
            gain_history: Vec::new(),
            gain_times: Vec::new(),
            resets: Vec::new(),
            priority_raised: false,
            log: Rc::new(RefCell::new(StreamLog::default())),
        }
    }

    /// Build from device args such as `type=sim,addr0=a,addr1=b,lock_after=3`
    pub fn from_args(args: &DeviceArgs) -> Result<Self> {
        let mut config = SimConfig {
            boards: args.num_boards(),
            ..Default::default()
        };
        if let Some(v) = args.get("lock_after") {
            config.gps_lock_after = match v {
                "never" => None,
                n => Some(n.parse().map_err(|_| {
                    Error::Configuration(format!("lock_after '{n}' is not a count"))
                })?),
            };
        }
        if let Some(v) = args.get("max_samps") {
            config.max_num_samps = v
                .parse()
                .map_err(|_| Error::Configuration(format!("max_samps '{v}' is not a count")))?;
        }
        Ok(Self::new(config))
    }

    pub fn clock(&self) -> SimClock {
        self.clock.clone()
    }

    /// Every gain request, as `(channel, dB)`
    pub fn gain_history(&self) -> &[(usize, f64)] {
        &self.gain_history
    }

    /// Simulated time of each entry in [`SimRadio::gain_history`]
    pub fn gain_times(&self) -> &[f64] {
        &self.gain_times
    }

    pub fn priority_raised(&self) -> bool {
        self.priority_raised
    }

    /// Every "reset at next PPS", as `(board, simulated time issued)`
    pub fn resets(&self) -> &[(usize, f64)] {
        &self.resets
    }

    pub fn clock_sources(&self, board: usize) -> Option<(ClockSource, ClockSource)> {
        self.boards
            .get(board)
            .map(|b| (b.clock_source, b.time_source))
    }

    pub fn stream_log(&self) -> StreamLog {
        self.log.borrow().clone()
    }

    fn board(&self, board: usize) -> Result<&SimBoard> {
        self.boards
            .get(board)
            .ok_or_else(|| Error::Driver(format!("no board {board}")))
    }

    fn board_mut(&mut self, board: usize) -> Result<&mut SimBoard> {
        self.boards
            .get_mut(board)
            .ok_or_else(|| Error::Driver(format!("no board {board}")))
    }

    fn chan(&self, chan: usize) -> Result<&SimChannel> {
        self.channels
            .get(chan)
            .ok_or_else(|| Error::Driver(format!("no channel {chan}")))
    }

    fn chan_mut(&mut self, chan: usize) -> Result<&mut SimChannel> {
        self.channels
            .get_mut(chan)
            .ok_or_else(|| Error::Driver(format!("no channel {chan}")))
    }

    fn gps_locked(&self, board: &SimBoard) -> bool {
        self.config
            .gps_lock_after
            .map_or(false, |after| board.gps_polls >= after)
    }
}

impl Radio for SimRadio {
    fn num_boards(&self) -> usize {
        self.boards.len()
    }

    fn board_name(&self, board: usize) -> String {
        format!("sim{board}")
    }

    fn pp_string(&self) -> String {
        let mut s = format!("Simulated front-end, {} board(s)", self.boards.len());
        for (i, b) in self.boards.iter().enumerate() {
            s.push_str(&format!(
                "\n  Board {i}: subdev {}, clock {}, time {}",
                b.subdev, b.clock_source, b.time_source
            ));
        }
        s
    }

    fn raise_thread_priority(&mut self) -> Result<()> {
        self.priority_raised = true;
        Ok(())
    }

    fn set_rx_subdev_spec(&mut self, spec: &str, board: usize) -> Result<()> {
        if spec.split_whitespace().count() > CHANNELS_PER_BOARD {
            return Err(Error::Driver(format!("subdev spec '{spec}' is too long")));
        }
        self.board_mut(board)?.subdev = spec.to_owned();
        Ok(())
    }

    fn rx_subdev_spec(&self, board: usize) -> Result<String> {
        Ok(self.board(board)?.subdev.clone())
    }

    fn set_rx_antenna(&mut self, antenna: &str, chan: usize) -> Result<()> {
        self.chan_mut(chan)?.antenna = antenna.to_owned();
        Ok(())
    }

    fn rx_antenna(&self, chan: usize) -> Result<String> {
        Ok(self.chan(chan)?.antenna.clone())
    }

    fn set_rx_freq(&mut self, hz: f64, chan: usize) -> Result<()> {
        let step = self.config.freq_step;
        self.chan_mut(chan)?.freq = quantize(hz, step);
        Ok(())
    }

    fn rx_freq(&self, chan: usize) -> Result<f64> {
        Ok(self.chan(chan)?.freq)
    }

    fn set_rx_rate(&mut self, rate: f64, chan: usize) -> Result<()> {
        let step = self.config.rate_step;
        self.chan_mut(chan)?.rate = quantize(rate, step);
        Ok(())
    }

    fn rx_rate(&self, chan: usize) -> Result<f64> {
        Ok(self.chan(chan)?.rate)
    }

    fn set_rx_bandwidth(&mut self, hz: f64, chan: usize) -> Result<()> {
        let step = self.config.bandwidth_step;
        self.chan_mut(chan)?.bandwidth = quantize(hz, step);
        Ok(())
    }

    fn rx_bandwidth(&self, chan: usize) -> Result<f64> {
        Ok(self.chan(chan)?.bandwidth)
    }

    fn set_rx_gain(&mut self, db: f64, chan: usize) -> Result<()> {
        let step = self.config.gain_step;
        self.chan_mut(chan)?.gain = quantize(db, step);
        self.gain_history.push((chan, db));
        self.gain_times.push(self.clock.now());
        Ok(())
    }

    fn rx_gain(&self, chan: usize) -> Result<f64> {
        Ok(self.chan(chan)?.gain)
    }

    fn set_clock_source(&mut self, source: ClockSource, board: usize) -> Result<()> {
        self.board_mut(board)?.clock_source = source;
        Ok(())
    }

    fn set_time_source(&mut self, source: ClockSource, board: usize) -> Result<()> {
        self.board_mut(board)?.time_source = source;
        Ok(())
    }

    fn mboard_sensor(&mut self, name: &str, board: usize) -> Result<SensorValue> {
        self.board(board)?;
        if self.sensor_failures > 0 {
            self.sensor_failures -= 1;
            return Err(Error::Driver(format!("sensor '{name}' read failed")));
        }
        match name {
            "gps_locked" => {
                let b = self.board_mut(board)?;
                b.gps_polls += 1;
                let b = self.board(board)?;
                Ok(SensorValue::Bool {
                    name: "GPS lock".to_owned(),
                    value: self.gps_locked(b),
                })
            }
            "ref_locked" => {
                let b = self.board(board)?;
                Ok(SensorValue::Bool {
                    name: "Ref lock".to_owned(),
                    value: b.clock_source != ClockSource::Gpsdo || self.gps_locked(b),
                })
            }
            "gps_time" => Ok(SensorValue::Text {
                name: "GPS epoch time".to_owned(),
                value: format!("{:.0}", (GPS_EPOCH_OFFSET + self.clock.now()).floor()),
            }),
            "gps_gpgga" => Ok(SensorValue::Text {
                name: "GPGGA".to_owned(),
                value: NMEA.to_owned(),
            }),
            _ => Err(Error::Driver(format!("unknown sensor '{name}'"))),
        }
    }

    fn time_last_pps(&self, board: usize) -> Result<TimeSpec> {
        let b = self.board(board)?;
        Ok(spec(self.clock.now().floor() + b.offset))
    }

    fn time_now(&self, board: usize) -> Result<TimeSpec> {
        let b = self.board(board)?;
        Ok(spec(self.clock.now() + b.offset))
    }

    fn set_time_next_pps(&mut self, time: TimeSpec, board: usize) -> Result<()> {
        let next_edge = self.clock.now().floor() + 1.0;
        self.board_mut(board)?.offset = secs(time) - next_edge;
        self.resets.push((board, self.clock.now()));
        self.clock.advance(self.config.command_latency);
        Ok(())
    }

    fn rx_stream(&mut self, args: &StreamArgs) -> Result<Box<dyn RxStreamer>> {
        let first = *args
            .channels
            .first()
            .ok_or_else(|| Error::Driver("stream needs at least one channel".to_owned()))?;
        for &c in &args.channels {
            self.chan(c)?;
        }
        let rate = self.chan(first)?.rate;
        if !(rate > 0.0) {
            return Err(Error::Driver(format!("channel {first} has no sample rate")));
        }
        Ok(Box::new(SimStreamer {
            clock: self.clock.clone(),
            offset: self.boards[0].offset,
            rate,
            format: args.format,
            channels: args.channels.clone(),
            max_num_samps: self.config.max_num_samps,
            batch_pattern: self.config.batch_pattern.clone(),
            overflow_every: self.config.overflow_every,
            calls: 0,
            produced: 0,
            start_at: None,
            running: false,
            log: Rc::clone(&self.log),
        }))
    }
}

pub struct SimStreamer {
    clock: SimClock,
    offset: f64,
    rate: f64,
    format: WireFormat,
    channels: Vec<usize>,
    max_num_samps: usize,
    batch_pattern: Vec<usize>,
    overflow_every: usize,
    calls: usize,
    produced: u64,
    start_at: Option<f64>,
    running: bool,
    log: Rc<RefCell<StreamLog>>,
}

/// I ramps with the sample index, Q carries the channel id
fn fill<T: Sample>(buf: &mut [u8], first: u64, chan: usize, n: usize) -> Result<()> {
    let samples = buf
        .as_mut_slice_of::<T>()
        .map_err(|e| Error::Driver(format!("bad receive buffer: {e}")))?;
    let q = <T as NumCast>::from(chan).unwrap_or_default();
    for (k, iq) in samples[..2 * n].chunks_exact_mut(2).enumerate() {
        iq[0] = <T as NumCast>::from((first + k as u64) % 2048).unwrap_or_default();
        iq[1] = q;
    }
    Ok(())
}

impl RxStreamer for SimStreamer {
    fn num_channels(&self) -> usize {
        self.channels.len()
    }

    fn format(&self) -> WireFormat {
        self.format
    }

    fn max_num_samps(&self) -> usize {
        self.max_num_samps
    }

    fn device_time(&self) -> Result<TimeSpec> {
        Ok(spec(self.clock.now() + self.offset))
    }

    fn issue_stream_cmd(&mut self, cmd: StreamCmd) -> Result<()> {
        match cmd {
            StreamCmd::StartContinuous { at } => {
                self.log.borrow_mut().started_at.push(self.clock.now());
                self.running = true;
                self.start_at = at.map(|t| secs(t) - self.offset);
            }
            StreamCmd::StopContinuous => {
                self.running = false;
                self.start_at = None;
            }
        }
        self.log.borrow_mut().commands.push(cmd);
        Ok(())
    }

    fn recv(&mut self, buffs: &mut [&mut [u8]], nsamps: usize) -> Result<RecvResult> {
        if buffs.len() != self.channels.len() {
            return Err(Error::Driver(format!(
                "{} buffers for {} channels",
                buffs.len(),
                self.channels.len()
            )));
        }
        self.log.borrow_mut().requests.push(nsamps);
        if !self.running {
            self.clock.advance(0.1);
            self.log.borrow_mut().delivered.push(0);
            return Ok(RecvResult {
                samples: 0,
                error: Some(RxErrorCode::Timeout),
            });
        }
        if let Some(start) = self.start_at.take() {
            self.clock.advance_to(start);
        }

        let mut n = nsamps.min(self.max_num_samps);
        if !self.batch_pattern.is_empty() {
            n = n.min(self.batch_pattern[self.calls % self.batch_pattern.len()]);
        }
        self.calls += 1;

        let bps = self.format.bytes_per_sample();
        for (buf, &chan) in buffs.iter_mut().zip(&self.channels) {
            if buf.len() < n * bps {
                return Err(Error::Driver(format!(
                    "buffer of {} bytes cannot hold {n} samples",
                    buf.len()
                )));
            }
            match self.format {
                WireFormat::Sc16 => fill::<i16>(buf, self.produced, chan, n)?,
                WireFormat::Fc32 => fill::<f32>(buf, self.produced, chan, n)?,
            }
        }
        self.produced += n as u64;
        self.clock.advance(n as f64 / self.rate);
        self.log.borrow_mut().delivered.push(n);

        let error = if self.overflow_every > 0 && self.calls % self.overflow_every == 0 {
            Some(RxErrorCode::Overflow)
        } else {
            None
        };
        Ok(RecvResult { samples: n, error })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byte_slice_cast::AsMutByteSlice;

    #[test]
    fn test_pps_reset_lands_on_next_edge() {
        let mut radio = SimRadio::new(SimConfig::default());
        let mut clock = radio.clock();
        clock.sleep(Duration::from_millis(2500));
        radio.set_time_next_pps(TimeSpec::ZERO, 0).unwrap();
        // Edge at t = 3 s becomes board time zero
        clock.sleep(Duration::from_millis(500));
        assert!(secs(radio.time_now(0).unwrap()).abs() < 1e-9);
        assert!(secs(radio.time_last_pps(0).unwrap()).abs() < 1e-9);
    }

    #[test]
    fn test_gps_lock_after_polls() {
        let mut radio = SimRadio::new(SimConfig {
            gps_lock_after: Some(3),
            sensor_failures: 1,
            ..Default::default()
        });
        assert!(radio.mboard_sensor("gps_locked", 0).is_err());
        assert!(!radio.mboard_sensor("gps_locked", 0).unwrap().to_bool());
        assert!(!radio.mboard_sensor("gps_locked", 0).unwrap().to_bool());
        assert!(radio.mboard_sensor("gps_locked", 0).unwrap().to_bool());
        assert!(radio.mboard_sensor("bogus", 0).is_err());
    }

    #[test]
    fn test_streamer_honours_batch_pattern() {
        let mut radio = SimRadio::new(SimConfig {
            max_num_samps: 100,
            batch_pattern: vec![100, 30],
            ..Default::default()
        });
        radio.set_rx_rate(1e6, 0).unwrap();
        let mut rx = radio
            .rx_stream(&StreamArgs {
                format: WireFormat::Sc16,
                channels: vec![0],
            })
            .unwrap();
        rx.issue_stream_cmd(StreamCmd::StartContinuous { at: None })
            .unwrap();
        let mut buf = vec![0i16; 200];
        let mut got = Vec::new();
        for _ in 0..3 {
            let bytes = buf.as_mut_byte_slice();
            got.push(rx.recv(&mut [bytes], 80).unwrap().samples);
        }
        assert_eq!(got, vec![80, 30, 80]);
        // Channel 0 in Q, ramp restarted at 110 for the third batch
        assert_eq!(buf[1], 0);
        assert_eq!(buf[0], 110);
        assert_eq!(radio.stream_log().requests, vec![80, 80, 80]);
    }
}
