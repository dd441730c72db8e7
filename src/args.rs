//! Argument parsing for running from the command line

use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};

use crate::{
    calibration::SweepPlan,
    plan::{CaptureOptions, ClockPlan, SampleTarget},
    radio::ClockSource,
    sample::WireFormat,
    Result,
};

/// Capture length when neither `--duration` nor `--nsamps` is given
pub const DEFAULT_RECORD_SECONDS: f64 = 10.0;
/// Samples per gain step when `--nsamps` is not given
pub const DEFAULT_TUNE_SAMPLES: u64 = 100;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Command,
    #[clap(flatten)]
    pub verbose: Verbosity<InfoLevel>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Stream every channel to its own file
    Record(CaptureArgs),
    /// Repeat a short capture over a ladder of gains
    Tune {
        #[clap(flatten)]
        capture: CaptureArgs,
        /// Lowest gain of the sweep (dB)
        #[clap(long, default_value_t = 0.0)]
        tune_min: f64,
        /// Highest gain of the sweep (dB)
        #[clap(long, default_value_t = 30.0)]
        tune_max: f64,
        /// Gain increment per step (dB)
        #[clap(long, default_value_t = 1.0)]
        step: f64,
    },
}

#[derive(Args, Debug, Clone)]
pub struct CaptureArgs {
    /// Device address args, e.g. "type=sim,addr0=192.168.40.2,addr1=192.168.40.3"
    #[clap(long, default_value = "type=sim")]
    pub dev: String,
    /// Output prefix, channel N goes to <file>_chan<N>.bin
    #[clap(long, default_value = "usrp_samples")]
    pub file: String,
    /// Number of channels to record (1-8, 5 and up need two boards)
    #[clap(long, default_value_t = 1)]
    #[clap(value_parser = clap::value_parser!(u8).range(1..))]
    pub chan: u8,
    /// Sample rate (samples per second)
    #[clap(long, default_value_t = 0.0)]
    pub rate: f64,
    /// Center frequency (Hz)
    #[clap(long, default_value_t = 0.0)]
    pub freq: f64,
    /// Gain (dB)
    #[clap(long, default_value_t = 0.0)]
    pub gain: f64,
    /// Analog bandwidth (Hz), defaults to the sample rate
    #[clap(long, default_value_t = 0.0)]
    pub bw: f64,
    /// Seconds to capture
    #[clap(long)]
    pub duration: Option<f64>,
    /// Samples per channel to capture, overrides --duration
    #[clap(long)]
    pub nsamps: Option<u64>,
    /// Samples per receive call, capped at the driver maximum
    #[clap(long)]
    pub spb: Option<usize>,
    /// Clock reference: internal, external or gpsdo
    #[clap(long = "ref", value_parser = valid_source, default_value = "internal")]
    pub reference: ClockSource,
    /// Time (PPS) source: internal, external or gpsdo
    #[clap(long, value_parser = valid_source, default_value = "internal")]
    pub pps: ClockSource,
    /// Seconds to wait for GPS lock
    #[clap(long, default_value_t = 30)]
    pub wait: u32,
    /// Seconds between issuing the start command and the first sample
    #[clap(long, value_parser = valid_seconds, default_value = "1.9")]
    pub setup: Duration,
    /// Wire sample format: sc16 or fc32
    #[clap(long, value_parser = valid_format, default_value = "sc16")]
    pub format: WireFormat,
}

impl CaptureArgs {
    /// `--nsamps` wins over `--duration`, and `fallback` covers neither
    pub fn options(&self, fallback: SampleTarget) -> CaptureOptions {
        let target = match (self.nsamps, self.duration) {
            (Some(n), _) => SampleTarget::Samples(n),
            (None, Some(secs)) => SampleTarget::Seconds(secs),
            (None, None) => fallback,
        };
        CaptureOptions {
            device: self.dev.clone(),
            prefix: self.file.clone(),
            channels: self.chan.into(),
            rate: self.rate,
            freq: self.freq,
            gain: self.gain,
            bandwidth: self.bw,
            target,
            samples_per_block: self.spb,
            format: self.format,
            clock: ClockPlan {
                reference: self.reference,
                time_source: self.pps,
                lock_wait: self.wait,
            },
            start_offset: self.setup,
        }
    }
}

impl Command {
    pub fn capture(&self) -> &CaptureArgs {
        match self {
            Command::Record(c) => c,
            Command::Tune { capture, .. } => capture,
        }
    }

    pub fn options(&self) -> CaptureOptions {
        match self {
            Command::Record(c) => c.options(SampleTarget::Seconds(DEFAULT_RECORD_SECONDS)),
            Command::Tune { capture, .. } => {
                capture.options(SampleTarget::Samples(DEFAULT_TUNE_SAMPLES))
            }
        }
    }

    /// The gain sweep, for `tune` only
    pub fn sweep(&self) -> Result<Option<SweepPlan>> {
        match self {
            Command::Record(_) => Ok(None),
            Command::Tune {
                tune_min,
                tune_max,
                step,
                ..
            } => SweepPlan::new(*tune_min, *tune_max, *step).map(Some),
        }
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

fn valid_source(s: &str) -> std::result::Result<ClockSource, String> {
    s.parse()
}

fn valid_format(s: &str) -> std::result::Result<WireFormat, String> {
    s.parse()
}

fn valid_seconds(s: &str) -> std::result::Result<Duration, String> {
    let secs: f64 = s.parse().map_err(|_| format!("'{s}' is not a number"))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("'{s}' is not a non-negative number of seconds"));
    }
    Ok(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("usrp_record").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_record_args() {
        let cli = parse(&[
            "record", "--dev", "type=sim,addr0=a", "--file", "out/cap", "--chan", "4", "--rate",
            "10e6", "--freq", "1.4e9", "--ref", "gpsdo", "--pps", "gpsdo", "--format", "fc32",
        ]);
        let opts = cli.command.options();
        assert_eq!(opts.channels, 4);
        assert_eq!(opts.rate, 10e6);
        assert_eq!(opts.prefix, "out/cap");
        assert_eq!(opts.format, WireFormat::Fc32);
        assert_eq!(opts.clock.reference, ClockSource::Gpsdo);
        assert_eq!(opts.target, SampleTarget::Seconds(DEFAULT_RECORD_SECONDS));
        assert_eq!(opts.start_offset, Duration::from_millis(1900));
        assert!(cli.command.sweep().unwrap().is_none());
    }

    #[test]
    fn test_nsamps_overrides_duration() {
        let cli = parse(&["record", "--duration", "3", "--nsamps", "500"]);
        assert_eq!(cli.command.options().target, SampleTarget::Samples(500));
        let cli = parse(&["record", "--duration", "3"]);
        assert_eq!(cli.command.options().target, SampleTarget::Seconds(3.0));
    }

    #[test]
    fn test_tune_args() {
        let cli = parse(&[
            "tune", "--rate", "1e6", "--tune-min", "0", "--tune-max", "10", "--step", "2",
        ]);
        assert_eq!(
            cli.command.options().target,
            SampleTarget::Samples(DEFAULT_TUNE_SAMPLES)
        );
        assert_eq!(cli.command.sweep().unwrap().unwrap().gains().len(), 6);
        assert_eq!(cli.command.capture().rate, 1e6);
    }

    #[test]
    fn test_rejected_values() {
        let bad: [&[&str]; 4] = [
            &["record", "--ref", "atomic"],
            &["record", "--format", "sc8"],
            &["record", "--setup", "-1"],
            &["record", "--chan", "0"],
        ];
        for args in bad {
            assert!(
                Cli::try_parse_from(std::iter::once("usrp_record").chain(args.iter().copied()))
                    .is_err()
            );
        }
    }

    #[test]
    fn test_convert_filter() {
        assert_eq!(
            convert_filter(log::LevelFilter::Warn),
            tracing_subscriber::filter::LevelFilter::WARN
        );
    }
}
