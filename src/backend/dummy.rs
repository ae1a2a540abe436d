// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Dummy engines whose only purpose is to let the session run so it can be
//! tested in isolation.
//!
//! Both engines synthesize one solid mid-gray frame per compressed unit,
//! using the unit's timestamp, so a full open/decode/retrieve/close cycle
//! works without any real codec or device.

use std::collections::VecDeque;

use anyhow::anyhow;

use crate::backend::hardware::GetOutcome;
use crate::backend::hardware::HardwareEngine;
use crate::backend::hardware::HwOutput;
use crate::backend::hardware::PutOutcome;
use crate::backend::hardware::SubmitPacket;
use crate::backend::software::DrainOutcome;
use crate::backend::software::SoftwareEngine;
use crate::backend::DecodedFrame;
use crate::backend::EngineError;
use crate::backend::EngineFactory;
use crate::decoded_frame_size;
use crate::demux::CodecParameters;
use crate::demux::CompressedUnit;
use crate::PixelFormat;
use crate::Resolution;

/// Reserved decoder name selecting [`DummyHardwareEngine`].
pub const DUMMY_HARDWARE_DECODER: &str = "dummy-hw";

const GRAY_Y: u8 = 126;
const NEUTRAL_CHROMA: u8 = 128;

/// Synchronous dummy engine: every submitted unit becomes one I420 frame.
pub struct DummySoftwareEngine {
    resolution: Resolution,
    pending: Option<DecodedFrame>,
    flushing: bool,
}

impl DummySoftwareEngine {
    pub fn new(resolution: Resolution) -> Self {
        Self {
            resolution,
            pending: None,
            flushing: false,
        }
    }
}

impl SoftwareEngine for DummySoftwareEngine {
    fn submit(&mut self, unit: &CompressedUnit) -> Result<(), EngineError> {
        if unit.eos || unit.data.is_empty() {
            self.flushing = true;
            return Ok(());
        }

        let width = self.resolution.width as usize;
        let height = self.resolution.height as usize;
        let mut data = vec![GRAY_Y; decoded_frame_size(PixelFormat::I420, width, height)];
        data[width * height..].fill(NEUTRAL_CHROMA);

        self.pending = Some(DecodedFrame {
            format: PixelFormat::I420,
            resolution: self.resolution,
            pts: unit.pts,
            data,
        });
        Ok(())
    }

    fn drain(&mut self) -> Result<DrainOutcome, EngineError> {
        if let Some(frame) = self.pending.take() {
            return Ok(DrainOutcome::Frame(frame));
        }
        if self.flushing {
            Ok(DrainOutcome::EndOfStream)
        } else {
            Ok(DrainOutcome::WouldBlock)
        }
    }
}

/// Asynchronous dummy engine: every packet becomes one stride-padded NV12
/// output, preceded by a format-change output so the pool registration path
/// is exercised too.
pub struct DummyHardwareEngine {
    resolution: Resolution,
    outputs: VecDeque<HwOutput>,
    pool_registered: bool,
    format_announced: bool,
}

impl DummyHardwareEngine {
    pub fn new(resolution: Resolution) -> Self {
        Self {
            resolution,
            outputs: VecDeque::new(),
            pool_registered: false,
            format_announced: false,
        }
    }

    fn marker_output(&self) -> HwOutput {
        HwOutput {
            resolution: self.resolution,
            hor_stride: 0,
            ver_stride: 0,
            pts: 0,
            data: Vec::new(),
            errinfo: 0,
            discard: 0,
            format_change: true,
            eos: false,
        }
    }

    fn frame_output(&self, pts: i64, eos: bool) -> HwOutput {
        let width = self.resolution.width as usize;
        let height = self.resolution.height as usize;
        // Pad lines the way real hardware does.
        let hor_stride = (width + 15) & !15;
        let ver_stride = (height + 15) & !15;

        let mut data = vec![GRAY_Y; hor_stride * ver_stride * 3 / 2];
        data[hor_stride * ver_stride..].fill(NEUTRAL_CHROMA);

        HwOutput {
            resolution: self.resolution,
            hor_stride,
            ver_stride,
            pts,
            data,
            errinfo: 0,
            discard: 0,
            format_change: false,
            eos,
        }
    }
}

impl HardwareEngine for DummyHardwareEngine {
    fn put_packet(&mut self, packet: &SubmitPacket) -> Result<PutOutcome, EngineError> {
        if !self.format_announced {
            self.outputs.push_back(self.marker_output());
            self.format_announced = true;
        }

        if packet.eos {
            // Flag the end of the stream on an empty discarded output.
            let mut last = self.frame_output(packet.pts, true);
            last.discard = 1;
            self.outputs.push_back(last);
        } else {
            let output = self.frame_output(packet.pts, false);
            self.outputs.push_back(output);
        }
        Ok(PutOutcome::Accepted)
    }

    fn get_frame(&mut self) -> Result<GetOutcome, EngineError> {
        match self.outputs.pop_front() {
            Some(output) => {
                if !output.format_change && !self.pool_registered {
                    return Err(EngineError::Other(anyhow!(
                        "no frame pool registered after format change"
                    )));
                }
                Ok(GetOutcome::Output(output))
            }
            None => Ok(GetOutcome::Empty),
        }
    }

    fn register_frame_pool(&mut self) -> Result<(), EngineError> {
        self.pool_registered = true;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), EngineError> {
        self.outputs.clear();
        Ok(())
    }
}

/// Factory wiring the dummy engines into a session.
#[derive(Default)]
pub struct DummyEngineFactory;

impl EngineFactory for DummyEngineFactory {
    fn hardware_decoder_name(&self) -> &str {
        DUMMY_HARDWARE_DECODER
    }

    fn new_software(
        &self,
        _decoder: &str,
        codec: &CodecParameters,
    ) -> Result<Box<dyn SoftwareEngine>, EngineError> {
        Ok(Box::new(DummySoftwareEngine::new(codec.coded_resolution)))
    }

    fn new_hardware(
        &self,
        codec: &CodecParameters,
    ) -> Result<Box<dyn HardwareEngine>, EngineError> {
        Ok(Box::new(DummyHardwareEngine::new(codec.coded_resolution)))
    }
}
