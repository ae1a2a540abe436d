// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Backend-polymorphic video decode pipeline.
//!
//! This crate turns a compressed video elementary stream into a sequence of
//! packed RGB frames. Two decode execution models are supported behind one
//! blocking, frame-at-a-time interface: a synchronous software engine
//! (submit a unit, drain decoded frames) and an asynchronous hardware engine
//! (put a packet, poll for outputs), whose fire-and-forget completions are
//! decoupled from the consumer through a bounded, lossy frame ring.
//!
//! The entry point is [`session::Session`], which owns the demuxer, the
//! selected decode backend and the pixel conversion caches. Container
//! demuxing and the actual entropy decoding are collaborator boundaries,
//! expressed as the [`demux::Demuxer`], [`backend::software::SoftwareEngine`]
//! and [`backend::hardware::HardwareEngine`] traits.

pub mod backend;
pub mod demux;
pub mod image_processing;
pub mod ring;
pub mod session;

pub use backend::DecodedFrame;
pub use demux::CompressedUnit;
pub use session::Session;
pub use session::SessionOptions;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

/// Pixel layouts handled by the pipeline.
///
/// `I420` and `NV12` describe unpadded buffers with their planes stored back
/// to back. `Opaque` stands for decoded frames that live in hardware-only
/// memory and cannot be read as pixel planes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    I420,
    NV12,
    Rgb24,
    Opaque,
}

/// Returns the size required to store a frame of `format` with size
/// `width`x`height`, without any padding.
pub fn decoded_frame_size(format: PixelFormat, width: usize, height: usize) -> usize {
    match format {
        PixelFormat::I420 | PixelFormat::NV12 => {
            let y_size = width * height;
            // U and V planes need to be aligned to 2.
            let uv_size = ((width + 1) / 2) * ((height + 1) / 2) * 2;

            y_size + uv_size
        }
        PixelFormat::Rgb24 => width * height * 3,
        PixelFormat::Opaque => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_sizes() {
        assert_eq!(decoded_frame_size(PixelFormat::I420, 4, 4), 24);
        assert_eq!(decoded_frame_size(PixelFormat::NV12, 4, 4), 24);
        // Odd dimensions round the chroma planes up.
        assert_eq!(decoded_frame_size(PixelFormat::I420, 3, 3), 9 + 8);
        assert_eq!(decoded_frame_size(PixelFormat::Rgb24, 4, 4), 48);
        assert_eq!(decoded_frame_size(PixelFormat::Opaque, 4, 4), 0);
    }
}
