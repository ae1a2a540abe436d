// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decode backends.
//!
//! A backend adapts one decode execution model to the blocking,
//! frame-at-a-time contract of the session: [`software`] wraps a synchronous
//! submit/drain codec engine, [`hardware`] wraps an asynchronous put/get
//! engine behind a bounded frame ring. Exactly one backend is instantiated
//! when a session opens, chosen by the requested decoder name.

pub mod dummy;
pub mod hardware;
pub mod software;

use std::time::Duration;

use thiserror::Error;

use crate::demux::CodecParameters;
use crate::demux::CompressedUnit;
use crate::PixelFormat;
use crate::Resolution;

/// Error returned by decode engine collaborators.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The engine rejected a submitted unit, usually because the stream is
    /// corrupt. The session remains usable for subsequent units.
    #[error("engine rejected input unit: {0}")]
    BadInput(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One fully decoded image, prior to output normalization.
///
/// The frame owns its pixel data: unpadded planes stored back to back, as
/// described by `format`. For [`PixelFormat::Opaque`] frames `data` is empty.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub format: PixelFormat,
    pub resolution: Resolution,
    pub pts: i64,
    pub data: Vec<u8>,
}

/// Backend-agnostic decode contract used by the session facade.
pub trait DecodeBackend {
    /// Hands one compressed unit to the engine. Returns how many frames
    /// became available: 0, 1, or more, since one unit can unblock several
    /// queued outputs on the hardware path.
    fn decode(&mut self, unit: &CompressedUnit) -> Result<usize, EngineError>;

    /// Pops the next available decoded frame, if any.
    fn take_frame(&mut self) -> Option<DecodedFrame>;

    /// Releases engine resources and any buffered frames. Idempotent.
    fn close(&mut self);
}

/// Constructs the engine collaborators behind the two backends.
///
/// Backend selection happens once, at session open time: a requested decoder
/// name equal to [`EngineFactory::hardware_decoder_name`] selects the
/// hardware path, any other name is forwarded to `new_software`.
pub trait EngineFactory {
    /// Reserved decoder name selecting the hardware path.
    fn hardware_decoder_name(&self) -> &str;

    fn new_software(
        &self,
        decoder: &str,
        codec: &CodecParameters,
    ) -> Result<Box<dyn software::SoftwareEngine>, EngineError>;

    fn new_hardware(
        &self,
        codec: &CodecParameters,
    ) -> Result<Box<dyn hardware::HardwareEngine>, EngineError>;
}

/// How often, and how many times, to retry an engine call that is not ready.
#[derive(Debug, Clone, Copy)]
pub struct RetryBudget {
    /// Maximum number of retries after the initial attempt; `None` retries
    /// indefinitely.
    pub attempts: Option<u32>,
    /// Fixed sleep between attempts.
    pub interval: Duration,
}

pub(crate) enum Attempt<T> {
    Ready(T),
    Again,
}

/// Runs `op` until it yields a value or the budget is exhausted, sleeping
/// `budget.interval` between attempts. Returns `Ok(None)` when the budget
/// runs out. Engine errors abort the loop immediately.
pub(crate) fn retry_with_backoff<T, E>(
    budget: RetryBudget,
    mut op: impl FnMut() -> Result<Attempt<T>, E>,
) -> Result<Option<T>, E> {
    let mut retries_left = budget.attempts;
    loop {
        if let Attempt::Ready(value) = op()? {
            return Ok(Some(value));
        }

        match retries_left.as_mut() {
            Some(0) => return Ok(None),
            Some(n) => *n -= 1,
            None => (),
        }

        std::thread::sleep(budget.interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_returns_first_ready_value() {
        let mut calls = 0;
        let result: Result<_, EngineError> = retry_with_backoff(
            RetryBudget {
                attempts: Some(5),
                interval: Duration::ZERO,
            },
            || {
                calls += 1;
                if calls == 3 {
                    Ok(Attempt::Ready(calls))
                } else {
                    Ok(Attempt::Again)
                }
            },
        );
        assert_eq!(result.unwrap(), Some(3));
        assert_eq!(calls, 3);
    }

    #[test]
    fn retry_budget_exhaustion_yields_none() {
        let mut calls = 0;
        let result: Result<Option<()>, EngineError> = retry_with_backoff(
            RetryBudget {
                attempts: Some(5),
                interval: Duration::ZERO,
            },
            || {
                calls += 1;
                Ok(Attempt::Again)
            },
        );
        assert_eq!(result.unwrap(), None);
        // The initial attempt plus five retries.
        assert_eq!(calls, 6);
    }

    #[test]
    fn retry_propagates_errors() {
        let result: Result<Option<()>, EngineError> = retry_with_backoff(
            RetryBudget {
                attempts: None,
                interval: Duration::ZERO,
            },
            || Err(EngineError::BadInput("broken".into())),
        );
        assert!(matches!(result, Err(EngineError::BadInput(_))));
    }
}
