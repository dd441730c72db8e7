//! The recording workflow: configure, synchronize, stream to disk

use std::time::Duration;

use tracing::{info, warn};

use crate::{
    clock::{ClockSyncManager, LockPolicy, LockStatus, Sleep},
    device::{ChannelReadback, DeviceController, RoutingTable},
    metadata::RunMetadata,
    plan::AcquisitionPlan,
    radio::{ClockSource, Radio, StreamArgs},
    sample::{Sample, WireFormat},
    sink::ChannelSink,
    stream::{CaptureSummary, StreamSession},
    Result,
};

/// Pause between configuring the channels and opening the stream
pub const CONFIG_SETTLE: Duration = Duration::from_millis(100);

/// A device routed, synchronized and configured, ready to stream
pub struct Prepared {
    pub controller: DeviceController,
    pub readback: Vec<ChannelReadback>,
    pub lock: LockStatus,
    /// Clock and time source actually in force on board 0
    pub sources: (ClockSource, ClockSource),
}

#[derive(Debug)]
pub struct Recording {
    pub metadata: RunMetadata,
    pub summary: CaptureSummary,
    /// Bytes appended to each channel file
    pub bytes: Vec<u64>,
}

/// Route the channels, synchronize every board and apply the channel settings
pub fn prepare<R, S>(
    radio: &mut R,
    sleep: &mut S,
    plan: &AcquisitionPlan,
    table: &RoutingTable,
    policy: LockPolicy,
) -> Result<Prepared>
where
    R: Radio + ?Sized,
    S: Sleep + ?Sized,
{
    info!("Using device: {}", radio.pp_string());
    if let Err(e) = radio.raise_thread_priority() {
        warn!("Could not raise thread priority, overflows are more likely: {e}");
    }
    let controller = DeviceController::new(table, plan.num_channels(), radio.num_boards())?;
    controller.apply_routing(radio)?;

    let mut sync = ClockSyncManager::new(plan.clock, radio.num_boards());
    let lock = sync.synchronize(radio, sleep, policy)?;
    let sources = sync
        .boards()
        .first()
        .map_or((plan.clock.reference, plan.clock.time_source), |b| {
            (b.reference, b.time_source)
        });

    let readback = controller.configure(radio, &plan.channels)?;
    sleep.sleep(CONFIG_SETTLE);
    Ok(Prepared {
        controller,
        readback,
        lock,
        sources,
    })
}

fn capture_as<T, R>(radio: &mut R, plan: &AcquisitionPlan, sink: &mut ChannelSink) -> Result<CaptureSummary>
where
    T: Sample,
    R: Radio + ?Sized,
{
    let stream = radio.rx_stream(&StreamArgs {
        format: T::FORMAT,
        channels: (0..plan.num_channels()).collect(),
    })?;
    let mut session = StreamSession::<T>::new(stream, plan.total_samples, plan.samples_per_block)?;
    session.start(plan.start_offset)?;
    let summary = session.run(sink)?;
    session.stop()?;
    Ok(summary)
}

/// One timed capture of `plan.total_samples` per channel into `sink`
pub fn capture<R: Radio + ?Sized>(
    radio: &mut R,
    plan: &AcquisitionPlan,
    sink: &mut ChannelSink,
) -> Result<CaptureSummary> {
    match plan.format {
        WireFormat::Sc16 => capture_as::<i16, R>(radio, plan, sink),
        WireFormat::Fc32 => capture_as::<f32, R>(radio, plan, sink),
    }
}

/// Record one capture. A missing GPS lock degrades to the internal clock and is
/// noted in the metadata rather than failing the run.
pub fn run_record<R, S>(
    radio: &mut R,
    sleep: &mut S,
    plan: &AcquisitionPlan,
    table: &RoutingTable,
) -> Result<Recording>
where
    R: Radio + ?Sized,
    S: Sleep + ?Sized,
{
    let prepared = prepare(radio, sleep, plan, table, LockPolicy::FallBackToInternal)?;
    let metadata = RunMetadata::new(plan, prepared.sources, &prepared.readback, prepared.lock)
        .with_gps(radio);

    let mut sink = ChannelSink::open(&plan.prefix, plan.num_channels())?;
    sink.write_metadata(&metadata)?;
    let summary = capture(radio, plan, &mut sink)?;
    info!("Done recording to {}_chan*.bin", plan.prefix);
    Ok(Recording {
        metadata,
        summary,
        bytes: sink.bytes_written().to_vec(),
    })
}
