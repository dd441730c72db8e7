//! Gain sweeps: the same fixed-length capture repeated at a ladder of gains.
//!
//! Every step appends to the same channel files, so the output is one block of
//! `total_samples` per gain in sweep order.

use std::time::Duration;

use tracing::info;

use crate::{
    clock::{LockPolicy, Sleep},
    device::RoutingTable,
    metadata::{RunMetadata, SweepMetadata},
    plan::AcquisitionPlan,
    radio::Radio,
    record::{capture, prepare},
    sink::ChannelSink,
    stream::CaptureSummary,
    Error, Result,
};

/// Wait after a gain change before streaming
pub const GAIN_SETTLE: Duration = Duration::from_millis(100);
/// Pause between steps
pub const STEP_PAUSE: Duration = Duration::from_millis(200);
/// Longest gain ladder a sweep may have
pub const MAX_STEPS: f64 = 10_000.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SweepPlan {
    pub tune_min: f64,
    pub tune_max: f64,
    pub step: f64,
}

impl SweepPlan {
    pub fn new(tune_min: f64, tune_max: f64, step: f64) -> Result<Self> {
        if !(step > 0.0) || !step.is_finite() {
            return Err(Error::Configuration(format!(
                "gain step must be positive, got {step}"
            )));
        }
        if !tune_min.is_finite() || !tune_max.is_finite() || tune_min > tune_max {
            return Err(Error::Configuration(format!(
                "gain range {tune_min}..{tune_max} is empty"
            )));
        }
        let steps = ((tune_max - tune_min) / step).floor() + 1.0;
        if steps > MAX_STEPS {
            return Err(Error::Configuration(format!(
                "gain step {step} over {tune_min}..{tune_max} gives {steps} steps (at most {MAX_STEPS})"
            )));
        }
        Ok(Self {
            tune_min,
            tune_max,
            step,
        })
    }

    /// `tune_min + i * step` for every `i` that stays at or under `tune_max`
    pub fn gains(&self) -> Vec<f64> {
        // Rounding in `i * step` may land just past the top: still take that
        // step, but at `tune_max` itself
        let limit = self.tune_max + self.step * 1e-9;
        (0u32..)
            .map(|i| self.tune_min + f64::from(i) * self.step)
            .take_while(|&g| g <= limit)
            .map(|g| g.min(self.tune_max))
            .collect()
    }
}

impl From<SweepPlan> for SweepMetadata {
    fn from(s: SweepPlan) -> Self {
        Self {
            min: s.tune_min,
            max: s.tune_max,
            step: s.step,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SweepStep {
    pub gain: f64,
    /// Per-channel gain the device settled on
    pub achieved: Vec<f64>,
    pub summary: CaptureSummary,
}

#[derive(Debug)]
pub struct SweepReport {
    pub metadata: RunMetadata,
    pub steps: Vec<SweepStep>,
    pub bytes: Vec<u64>,
}

/// Run a gain sweep. Without GPS lock (when a GPSDO is asked for) the sweep does
/// not start.
pub fn run_tune<R, S>(
    radio: &mut R,
    sleep: &mut S,
    plan: &AcquisitionPlan,
    sweep: &SweepPlan,
    table: &RoutingTable,
) -> Result<SweepReport>
where
    R: Radio + ?Sized,
    S: Sleep + ?Sized,
{
    let mut plan = plan.clone();
    for c in plan.channels.iter_mut() {
        c.gain = sweep.tune_min;
    }
    let prepared = prepare(radio, sleep, &plan, table, LockPolicy::Fatal)?;
    let metadata = RunMetadata::new(&plan, prepared.sources, &prepared.readback, prepared.lock)
        .with_sweep((*sweep).into())
        .with_gps(radio);

    let mut sink = ChannelSink::open(&plan.prefix, plan.num_channels())?;
    sink.write_metadata(&metadata)?;

    let gains = sweep.gains();
    let mut steps = Vec::with_capacity(gains.len());
    for (i, gain) in gains.into_iter().enumerate() {
        let achieved = prepared.controller.set_gain(radio, gain)?;
        info!("Step {}: gain {gain:.2} dB (actual {:?})", i + 1, achieved);
        sleep.sleep(GAIN_SETTLE);
        let summary = capture(radio, &plan, &mut sink)?;
        steps.push(SweepStep {
            gain,
            achieved,
            summary,
        });
        sleep.sleep(STEP_PAUSE);
    }
    info!("Sweep done, {} steps", steps.len());
    Ok(SweepReport {
        metadata,
        steps,
        bytes: sink.bytes_written().to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        plan::{tests::options, SampleTarget},
        radio::ClockSource,
        sim::{SimConfig, SimRadio},
        sink::{channel_path, metadata_path},
    };
    use std::fs;

    fn plan(prefix: &str) -> AcquisitionPlan {
        let mut opts = options();
        opts.prefix = prefix.to_owned();
        opts.channels = 1;
        opts.rate = 1e6;
        opts.target = SampleTarget::Samples(100);
        AcquisitionPlan::from_options(&opts, &RoutingTable::builtin().unwrap()).unwrap()
    }

    #[test]
    fn test_gain_ladder() {
        assert_eq!(
            SweepPlan::new(0.0, 10.0, 2.0).unwrap().gains(),
            vec![0.0, 2.0, 4.0, 6.0, 8.0, 10.0]
        );
        assert_eq!(SweepPlan::new(0.0, 1.0, 0.1).unwrap().gains().len(), 11);
        assert_eq!(SweepPlan::new(5.0, 5.0, 1.0).unwrap().gains(), vec![5.0]);
        assert_eq!(SweepPlan::new(0.0, 9.0, 2.0).unwrap().gains().last(), Some(&8.0));

        let fine = SweepPlan::new(0.1, 0.3, 0.1).unwrap();
        let gains = fine.gains();
        assert_eq!(gains.len(), 3);
        assert!(gains.iter().all(|&g| g <= fine.tune_max), "{gains:?}");
        assert_eq!(gains.last(), Some(&0.3));
    }

    #[test]
    fn test_invalid_sweeps() {
        assert!(SweepPlan::new(0.0, 10.0, 0.0).is_err());
        assert!(SweepPlan::new(0.0, 10.0, -1.0).is_err());
        assert!(SweepPlan::new(10.0, 0.0, 1.0).is_err());
        // A step this small would never finish
        assert!(matches!(
            SweepPlan::new(0.0, 30.0, 1e-9),
            Err(Error::Configuration(_))
        ));
        assert_eq!(SweepPlan::new(0.0, 9_999.0, 1.0).unwrap().gains().len(), 10_000);
    }

    #[test]
    fn test_sweep_visits_every_gain() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("tune").to_string_lossy().into_owned();
        let plan = plan(&prefix);
        let mut radio = SimRadio::new(SimConfig::default());
        let mut clock = radio.clock();
        let sweep = SweepPlan::new(0.0, 10.0, 2.0).unwrap();
        let report = run_tune(
            &mut radio,
            &mut clock,
            &plan,
            &sweep,
            &RoutingTable::builtin().unwrap(),
        )
        .unwrap();

        let visited: Vec<f64> = report.steps.iter().map(|s| s.gain).collect();
        assert_eq!(visited, vec![0.0, 2.0, 4.0, 6.0, 8.0, 10.0]);
        // Configuration applies tune_min once, then every step sets its gain
        let history: Vec<f64> = radio.gain_history().iter().map(|&(_, g)| g).collect();
        assert_eq!(history, vec![0.0, 0.0, 2.0, 4.0, 6.0, 8.0, 10.0]);
        assert!(report.steps.iter().all(|s| s.summary.samples == 100));

        // Each step's stream starts only after the gain has had time to settle
        let starts = radio.stream_log().started_at;
        assert_eq!(starts.len(), 6);
        for (gain_at, start_at) in radio.gain_times()[1..].iter().zip(&starts) {
            assert!(start_at - gain_at >= GAIN_SETTLE.as_secs_f64() - 1e-9);
        }

        assert_eq!(report.bytes, vec![6 * 100 * 4]);
        assert_eq!(
            fs::metadata(channel_path(&prefix, 0)).unwrap().len(),
            6 * 100 * 4
        );
        let text = fs::read_to_string(metadata_path(&prefix)).unwrap();
        assert!(text.contains("Min Gain: 0.000000 dB\n"));
        assert!(text.contains("Step Size: 2.000000 dB\n"));
    }

    #[test]
    fn test_sweep_requires_lock() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("tune").to_string_lossy().into_owned();
        let mut plan = plan(&prefix);
        plan.clock.reference = ClockSource::Gpsdo;
        plan.clock.time_source = ClockSource::Gpsdo;
        let mut radio = SimRadio::new(SimConfig {
            gps_lock_after: None,
            ..Default::default()
        });
        let mut clock = radio.clock();
        let sweep = SweepPlan::new(0.0, 10.0, 2.0).unwrap();
        let res = run_tune(
            &mut radio,
            &mut clock,
            &plan,
            &sweep,
            &RoutingTable::builtin().unwrap(),
        );
        assert!(matches!(res, Err(Error::HardwareLock { board: 0, .. })));
        assert!(radio.gain_history().is_empty());
        assert!(!std::path::Path::new(&format!("{prefix}_chan0.bin")).exists());
    }
}
