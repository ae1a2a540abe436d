// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hardware decode adapter.
//!
//! Wraps an asynchronous hardware engine whose submission side can report
//! "queue full" and whose output side can report "timeout". All decode
//! progress happens inside the caller's `decode` call: submission is retried
//! with a fixed sleep until the engine accepts, and after every submission
//! attempt all currently-available outputs are drained so the engine can make
//! room. Accepted outputs are copied into a bounded frame ring that evicts
//! the oldest frame under backpressure instead of blocking the engine.

use std::time::Duration;

use log::debug;
use log::error;
use log::info;
use log::warn;

use crate::backend::retry_with_backoff;
use crate::backend::Attempt;
use crate::backend::DecodeBackend;
use crate::backend::DecodedFrame;
use crate::backend::EngineError;
use crate::backend::RetryBudget;
use crate::decoded_frame_size;
use crate::demux::CompressedUnit;
use crate::image_processing::nv12_copy;
use crate::ring::FrameRing;
use crate::ring::PushOutcome;
use crate::ring::RingSlot;
use crate::ring::DEFAULT_RING_CAPACITY;
use crate::PixelFormat;
use crate::Resolution;

/// Submission wrapper handed to the hardware engine.
///
/// An empty `data` with `eos` set marks the end of the stream.
pub struct SubmitPacket<'a> {
    pub data: &'a [u8],
    pub pts: i64,
    pub eos: bool,
}

/// Outcome of a [`HardwareEngine::put_packet`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Accepted,
    /// The engine's internal queue is full; retry once it has consumed
    /// some of its backlog.
    QueueFull,
}

/// One output surface produced by the hardware engine.
///
/// `data` is the engine's stride-padded semi-planar storage: a luma plane of
/// `hor_stride` bytes per line, followed at `hor_stride * ver_stride` by the
/// interleaved chroma plane.
pub struct HwOutput {
    pub resolution: Resolution,
    pub hor_stride: usize,
    pub ver_stride: usize,
    pub pts: i64,
    pub data: Vec<u8>,
    /// Non-zero when the engine flags this output as corrupt.
    pub errinfo: u32,
    /// Non-zero when the engine asks for this output to be discarded.
    pub discard: u32,
    /// The stream geometry/format changed; this output carries no frame.
    pub format_change: bool,
    /// This output is the last one of the stream.
    pub eos: bool,
}

/// Outcome of a [`HardwareEngine::get_frame`] call.
pub enum GetOutcome {
    Output(HwOutput),
    /// Nothing is ready right now.
    Empty,
    /// The engine timed out internally; worth retrying shortly.
    Timeout,
}

/// Asynchronous hardware decode engine: packets go in whenever the engine has
/// queue space, outputs come out whenever the engine has finished them.
pub trait HardwareEngine {
    fn put_packet(&mut self, packet: &SubmitPacket) -> Result<PutOutcome, EngineError>;

    fn get_frame(&mut self) -> Result<GetOutcome, EngineError>;

    /// Acquires a new buffer pool and registers it with the engine. Called
    /// after the engine reports a format change, before decoding resumes.
    fn register_frame_pool(&mut self) -> Result<(), EngineError>;

    fn reset(&mut self) -> Result<(), EngineError>;
}

/// Latency/memory tradeoffs of the hardware path, overridable by deployers.
#[derive(Debug, Clone)]
pub struct HardwareTuning {
    /// Number of slots in the frame ring.
    pub ring_capacity: usize,
    /// Sleep between submission attempts while the engine queue is full.
    pub submit_retry_interval: Duration,
    /// Retries of a timed-out output drain before giving up on it.
    pub drain_retry_attempts: u32,
    /// Sleep between output drain retries.
    pub drain_retry_interval: Duration,
}

impl Default for HardwareTuning {
    fn default() -> Self {
        Self {
            ring_capacity: DEFAULT_RING_CAPACITY,
            submit_retry_interval: Duration::from_millis(3),
            drain_retry_attempts: 5,
            drain_retry_interval: Duration::from_millis(3),
        }
    }
}

enum DrainStep {
    Output(HwOutput),
    /// Nothing ready; stop draining for now.
    Idle,
    /// Repeated timeouts or an engine error; abandon this drain attempt.
    GaveUp,
}

pub struct HardwareAdapter {
    engine: Box<dyn HardwareEngine>,
    ring: FrameRing,
    submit_budget: RetryBudget,
    drain_budget: RetryBudget,
    eos_seen: bool,
    closed: bool,
}

impl HardwareAdapter {
    pub fn new(engine: Box<dyn HardwareEngine>, tuning: HardwareTuning) -> Self {
        Self {
            engine,
            ring: FrameRing::new(tuning.ring_capacity),
            submit_budget: RetryBudget {
                attempts: None,
                interval: tuning.submit_retry_interval,
            },
            drain_budget: RetryBudget {
                attempts: Some(tuning.drain_retry_attempts),
                interval: tuning.drain_retry_interval,
            },
            eos_seen: false,
            closed: false,
        }
    }

    /// Waits for the next engine output, retrying timeouts within the drain
    /// budget.
    fn next_output(&mut self) -> DrainStep {
        let budget = self.drain_budget;
        let engine = self.engine.as_mut();

        let result: Result<Option<DrainStep>, EngineError> =
            retry_with_backoff(budget, || match engine.get_frame()? {
                GetOutcome::Output(output) => Ok(Attempt::Ready(DrainStep::Output(output))),
                GetOutcome::Empty => Ok(Attempt::Ready(DrainStep::Idle)),
                GetOutcome::Timeout => Ok(Attempt::Again),
            });

        match result {
            Ok(Some(step)) => step,
            Ok(None) => {
                error!("hardware engine kept timing out, abandoning this drain attempt");
                DrainStep::GaveUp
            }
            Err(err) => {
                error!("failed to pull output from hardware engine: {}", err);
                DrainStep::GaveUp
            }
        }
    }

    /// Copies the active pixel region of `output` into a fresh ring slot,
    /// dropping the engine's stride padding.
    fn store_output(&mut self, output: &HwOutput) {
        let width = output.resolution.width as usize;
        let height = output.resolution.height as usize;

        let mut data = vec![0u8; decoded_frame_size(PixelFormat::NV12, width, height)];
        nv12_copy(
            &output.data,
            &mut data,
            width,
            height,
            [output.hor_stride, output.hor_stride, 0],
            [0, output.hor_stride * output.ver_stride, 0],
        );

        let slot = RingSlot {
            data,
            resolution: output.resolution,
            pts: output.pts,
        };
        if self.ring.push(slot) == PushOutcome::Evicted {
            info!("frame ring full, discarded the oldest frame");
        }
    }

    /// Drains all currently-available outputs, returning how many frames
    /// were stored.
    fn drain_outputs(&mut self) -> usize {
        let mut got = 0;

        while !self.eos_seen {
            let output = match self.next_output() {
                DrainStep::Output(output) => output,
                DrainStep::Idle | DrainStep::GaveUp => break,
            };

            if output.format_change {
                debug!(
                    "format change to {}x{}, registering new frame pool",
                    output.resolution.width, output.resolution.height
                );
                if let Err(err) = self.engine.register_frame_pool() {
                    error!("failed to register frame pool: {}", err);
                    break;
                }
            } else if output.errinfo != 0 || output.discard != 0 {
                warn!(
                    "dropping engine output, errinfo: {} discard: {}",
                    output.errinfo, output.discard
                );
            } else {
                self.store_output(&output);
                got += 1;
            }

            if output.eos {
                info!("found last frame");
                self.eos_seen = true;
            }
        }

        got
    }
}

impl DecodeBackend for HardwareAdapter {
    /// Implements the two-directional retry protocol: submission is retried
    /// indefinitely while the engine queue is full, and every submission
    /// attempt is followed by a full output drain so the engine can catch up.
    fn decode(&mut self, unit: &CompressedUnit) -> Result<usize, EngineError> {
        let packet = SubmitPacket {
            data: &unit.data,
            pts: unit.pts,
            eos: unit.eos || unit.data.is_empty(),
        };

        let mut got = 0;
        let submit_budget = self.submit_budget;
        retry_with_backoff::<_, EngineError>(submit_budget, || {
            let outcome = self.engine.put_packet(&packet)?;

            // Drain after every submission attempt, successful or not:
            // a full queue only clears once outputs are consumed.
            got += self.drain_outputs();

            match outcome {
                PutOutcome::Accepted => Ok(Attempt::Ready(())),
                PutOutcome::QueueFull => Ok(Attempt::Again),
            }
        })?;

        Ok(got)
    }

    fn take_frame(&mut self) -> Option<DecodedFrame> {
        let slot = self.ring.pop()?;
        Some(DecodedFrame {
            format: PixelFormat::NV12,
            resolution: slot.resolution,
            pts: slot.pts,
            data: slot.data,
        })
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        if let Err(err) = self.engine.reset() {
            warn!("hardware engine reset failed: {}", err);
        }
        self.ring.clear();
        self.closed = true;
    }
}
