//! The continuous receive loop
//!
//! A session never retries a batch. Whatever count the driver reports is written
//! and added to the running total, and the loop only ends once that total reaches
//! the target. Short batches, empty batches and batches the driver flags (overflow,
//! timeout, ...) are all accepted as they come.

use std::time::Duration;

use byte_slice_cast::AsMutByteSlice;
use hifitime::Unit;
use tracing::{debug, info, warn};

use crate::{
    radio::{RxErrorCode, RxStreamer, StreamCmd},
    sample::Sample,
    sink::ChannelSink,
    Error, Result,
};

/// One channel's share of a receive call
#[derive(Debug)]
pub struct SampleBlock<'a, T> {
    pub channel: usize,
    /// Complex samples delivered, `data` holds twice as many components
    pub samples: usize,
    pub data: &'a [T],
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CaptureSummary {
    pub samples: u64,
    pub calls: u64,
    /// Calls that delivered less than they asked for
    pub short_batches: u64,
    pub overflows: u64,
    pub other_errors: u64,
}

pub struct StreamSession<T: Sample> {
    stream: Box<dyn RxStreamer>,
    /// Driver-facing buffers, `max_num_samps` each
    recv_buffers: Vec<Vec<T>>,
    /// What blocks are handed out from, `samples_per_block` each
    out_buffers: Vec<Vec<T>>,
    samples_per_block: usize,
    target: u64,
    summary: CaptureSummary,
    running: bool,
}

impl<T: Sample> StreamSession<T> {
    /// `samples_per_block` defaults to, and is capped at, the driver's maximum
    pub fn new(
        stream: Box<dyn RxStreamer>,
        target: u64,
        samples_per_block: Option<usize>,
    ) -> Result<Self> {
        if stream.format() != T::FORMAT {
            return Err(Error::Driver(format!(
                "stream delivers {} but the session stores {}",
                stream.format(),
                T::FORMAT
            )));
        }
        let max = stream.max_num_samps();
        if max == 0 {
            return Err(Error::Driver("driver reports a zero block length".to_owned()));
        }
        let spb = match samples_per_block {
            Some(0) => {
                return Err(Error::Configuration(
                    "samples per block must be positive".to_owned(),
                ))
            }
            Some(n) if n > max => {
                warn!("Samples per block {n} exceeds the driver maximum, using {max}");
                max
            }
            Some(n) => n,
            None => max,
        };
        let nchan = stream.num_channels();
        info!(
            "Allocated {nchan} buffers with {max} complex {} samples",
            T::FORMAT
        );
        Ok(Self {
            stream,
            recv_buffers: vec![vec![T::default(); 2 * max]; nchan],
            out_buffers: vec![vec![T::default(); 2 * spb]; nchan],
            samples_per_block: spb,
            target,
            summary: CaptureSummary::default(),
            running: false,
        })
    }

    pub fn num_channels(&self) -> usize {
        self.recv_buffers.len()
    }

    pub fn samples_per_block(&self) -> usize {
        self.samples_per_block
    }

    pub fn target(&self) -> u64 {
        self.target
    }

    pub fn received(&self) -> u64 {
        self.summary.samples
    }

    pub fn summary(&self) -> CaptureSummary {
        self.summary
    }

    /// Start continuous streaming `offset` after the device's current time
    pub fn start(&mut self, offset: Duration) -> Result<()> {
        let at = self.stream.device_time()? + Unit::Second * offset.as_secs_f64();
        debug!("Stream start at device time {at}");
        self.stream
            .issue_stream_cmd(StreamCmd::StartContinuous { at: Some(at) })?;
        self.running = true;
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        if self.running {
            self.stream.issue_stream_cmd(StreamCmd::StopContinuous)?;
            self.running = false;
        }
        Ok(())
    }

    /// One receive call: ask for the rest of the target, capped at one block, and
    /// hand back what each channel got
    pub fn receive(&mut self) -> Result<Vec<SampleBlock<'_, T>>> {
        let remaining = self.target.saturating_sub(self.summary.samples);
        let request = remaining.min(self.samples_per_block as u64) as usize;

        let result = {
            let mut buffs: Vec<&mut [u8]> = self
                .recv_buffers
                .iter_mut()
                .map(|b| b.as_mut_byte_slice())
                .collect();
            self.stream.recv(&mut buffs, request)?
        };

        let delivered = if result.samples > request {
            warn!(
                "Driver reported {} samples for a request of {request}",
                result.samples
            );
            request
        } else {
            result.samples
        };

        self.summary.calls += 1;
        self.summary.samples += delivered as u64;
        if delivered < request {
            self.summary.short_batches += 1;
        }
        match result.error {
            None => (),
            Some(RxErrorCode::Overflow) => self.summary.overflows += 1,
            Some(code) => {
                debug!(?code, delivered, "Driver flagged batch");
                self.summary.other_errors += 1;
            }
        }

        // Pure width copy, no scaling
        let n = 2 * delivered;
        for (out, recv) in self.out_buffers.iter_mut().zip(&self.recv_buffers) {
            out[..n].copy_from_slice(&recv[..n]);
        }
        Ok(self
            .out_buffers
            .iter()
            .enumerate()
            .map(|(channel, out)| SampleBlock {
                channel,
                samples: delivered,
                data: &out[..n],
            })
            .collect())
    }

    /// Receive until the target is reached, handing every block to the sink
    pub fn run(&mut self, sink: &mut ChannelSink) -> Result<CaptureSummary> {
        info!("Starting to receive {} samples per channel", self.target);
        while self.summary.samples < self.target {
            for block in self.receive()? {
                sink.write_block(&block)?;
            }
        }
        let s = self.summary;
        if s.short_batches > 0 || s.overflows > 0 || s.other_errors > 0 {
            warn!(
                "Received {} samples in {} calls ({} short, {} overflows, {} other errors)",
                s.samples, s.calls, s.short_batches, s.overflows, s.other_errors
            );
        } else {
            info!("Received {} samples in {} calls", s.samples, s.calls);
        }
        Ok(s)
    }
}

impl<T: Sample> Drop for StreamSession<T> {
    fn drop(&mut self) {
        if self.running {
            let _ = self.stream.issue_stream_cmd(StreamCmd::StopContinuous);
        }
    }
}
