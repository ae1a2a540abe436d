// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Software decode adapter.
//!
//! Wraps a synchronous codec engine: each compressed unit is submitted, then
//! the engine is drained in a loop until it reports that no more frames are
//! available from this submission. Drained frames wait in a ready queue until
//! the client retrieves them.

use std::collections::VecDeque;

use log::debug;

use crate::backend::DecodeBackend;
use crate::backend::DecodedFrame;
use crate::backend::EngineError;
use crate::demux::CompressedUnit;

/// Outcome of a single [`SoftwareEngine::drain`] call.
pub enum DrainOutcome {
    Frame(DecodedFrame),
    /// No more frames are available from the current submission.
    WouldBlock,
    /// The engine has been flushed; no further frames will be produced.
    EndOfStream,
}

/// Synchronous codec engine: one compressed unit in, zero or more frames out.
///
/// An end-of-stream unit (empty payload, `eos` set) puts the engine into
/// flush mode; subsequent drains return the remaining frames and then
/// [`DrainOutcome::EndOfStream`].
pub trait SoftwareEngine {
    /// Feeds one compressed unit. Fails if the engine rejects it, which is
    /// surfaced to the caller rather than silently swallowed.
    fn submit(&mut self, unit: &CompressedUnit) -> Result<(), EngineError>;

    /// Pulls the next decoded frame resulting from previous submissions.
    fn drain(&mut self) -> Result<DrainOutcome, EngineError>;
}

/// A queue where decoded frames wait until they are retrieved by the client.
#[derive(Default)]
pub(crate) struct ReadyFramesQueue {
    queue: VecDeque<DecodedFrame>,
}

impl ReadyFramesQueue {
    pub(crate) fn push(&mut self, frame: DecodedFrame) {
        self.queue.push_back(frame)
    }

    pub(crate) fn pop(&mut self) -> Option<DecodedFrame> {
        self.queue.pop_front()
    }

    pub(crate) fn clear(&mut self) {
        self.queue.clear()
    }
}

pub struct SoftwareAdapter {
    engine: Box<dyn SoftwareEngine>,
    ready: ReadyFramesQueue,
    finished: bool,
}

impl SoftwareAdapter {
    pub fn new(engine: Box<dyn SoftwareEngine>) -> Self {
        Self {
            engine,
            ready: Default::default(),
            finished: false,
        }
    }
}

impl DecodeBackend for SoftwareAdapter {
    fn decode(&mut self, unit: &CompressedUnit) -> Result<usize, EngineError> {
        if self.finished {
            return Ok(0);
        }

        self.engine.submit(unit)?;

        let mut got = 0;
        loop {
            match self.engine.drain()? {
                DrainOutcome::Frame(frame) => {
                    self.ready.push(frame);
                    got += 1;
                }
                DrainOutcome::WouldBlock => break,
                DrainOutcome::EndOfStream => {
                    debug!("software engine reached end of stream");
                    self.finished = true;
                    break;
                }
            }
        }

        Ok(got)
    }

    fn take_frame(&mut self) -> Option<DecodedFrame> {
        self.ready.pop()
    }

    fn close(&mut self) {
        self.ready.clear();
    }
}
