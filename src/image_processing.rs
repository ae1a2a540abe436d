// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Pixel format conversion.
//!
//! Normalizes heterogeneous decoder outputs into packed RGB. Planar YUV
//! converts in a single stage; semi-planar YUV goes through a planar
//! intermediate first, because the RGB converter only operates on planar
//! input. Converters are cached per (geometry, source format, destination
//! format) tuple and rebuilt whenever any of the three changes.

use log::debug;
use thiserror::Error;

use crate::decoded_frame_size;
use crate::PixelFormat;
use crate::Resolution;

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("no converter from {src:?} to {dst:?}")]
    Unsupported { src: PixelFormat, dst: PixelFormat },
    #[error("buffer holds {got} bytes, need {expected}")]
    BufferSize { expected: usize, got: usize },
}

/// Copies `src` into `dst` as NV12, removing any extra padding.
pub fn nv12_copy(
    src: &[u8],
    dst: &mut [u8],
    width: usize,
    height: usize,
    strides: [usize; 3],
    offsets: [usize; 3],
) {
    // Copy Y.
    let src_y_lines = src[offsets[0]..]
        .chunks(strides[0])
        .map(|line| &line[..width]);
    let dst_y_lines = dst.chunks_mut(width);

    for (src_line, dst_line) in src_y_lines.zip(dst_y_lines).take(height) {
        dst_line.copy_from_slice(src_line);
    }

    let dst_u_offset = width * height;

    // Align width and height to 2 for the UV plane. 1 sample per 4 pixels,
    // but two components per line, so the width can remain as-is.
    let uv_width = if width % 2 == 1 { width + 1 } else { width };
    let uv_height = if height % 2 == 1 { height + 1 } else { height } / 2;

    // Copy UV.
    let src_uv_lines = src[offsets[1]..]
        .chunks(strides[1])
        .map(|line| &line[..uv_width]);
    let dst_uv_lines = dst[dst_u_offset..].chunks_mut(uv_width);
    for (src_line, dst_line) in src_uv_lines.zip(dst_uv_lines).take(uv_height) {
        dst_line.copy_from_slice(src_line);
    }
}

/// Converts an unpadded NV12 buffer into I420 by splitting the interleaved
/// chroma plane.
fn nv12_to_i420(src: &[u8], dst: &mut [u8], width: usize, height: usize) {
    let y_size = width * height;
    let uv_width = (width + 1) / 2;
    let uv_height = (height + 1) / 2;

    dst[..y_size].copy_from_slice(&src[..y_size]);

    let (u_plane, v_plane) = dst[y_size..].split_at_mut(uv_width * uv_height);
    for (pair, (u, v)) in src[y_size..]
        .chunks_exact(2)
        .zip(u_plane.iter_mut().zip(v_plane.iter_mut()))
    {
        *u = pair[0];
        *v = pair[1];
    }
}

fn clamp_u8(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

/// Converts an unpadded I420 buffer into packed RGB24, using BT.601
/// limited-range coefficients in 8-bit fixed point. Chroma samples are
/// replicated over their 2x2 block.
fn i420_to_rgb(src: &[u8], dst: &mut [u8], width: usize, height: usize) {
    let y_size = width * height;
    let uv_width = (width + 1) / 2;
    let uv_height = (height + 1) / 2;

    let (y_plane, chroma) = src.split_at(y_size);
    let (u_plane, v_plane) = chroma.split_at(uv_width * uv_height);

    for row in 0..height {
        for col in 0..width {
            let y = y_plane[row * width + col] as i32;
            let u = u_plane[(row / 2) * uv_width + col / 2] as i32;
            let v = v_plane[(row / 2) * uv_width + col / 2] as i32;

            let c = 298 * (y - 16);
            let d = u - 128;
            let e = v - 128;

            let rgb = &mut dst[(row * width + col) * 3..][..3];
            rgb[0] = clamp_u8((c + 409 * e + 128) >> 8);
            rgb[1] = clamp_u8((c - 100 * d - 208 * e + 128) >> 8);
            rgb[2] = clamp_u8((c + 516 * d + 128) >> 8);
        }
    }
}

/// A converter for one exact (geometry, source format, destination format)
/// tuple. Conversion quality is fixed; no filter configurability is exposed.
pub struct Converter {
    resolution: Resolution,
    src: PixelFormat,
    dst: PixelFormat,
}

impl Converter {
    fn matches(&self, resolution: Resolution, src: PixelFormat, dst: PixelFormat) -> bool {
        self.resolution == resolution && self.src == src && self.dst == dst
    }

    pub fn convert(&self, src: &[u8], dst: &mut [u8]) -> Result<(), ConvertError> {
        let width = self.resolution.width as usize;
        let height = self.resolution.height as usize;

        let src_size = decoded_frame_size(self.src, width, height);
        if src.len() != src_size {
            return Err(ConvertError::BufferSize {
                expected: src_size,
                got: src.len(),
            });
        }
        let dst_size = decoded_frame_size(self.dst, width, height);
        if dst.len() != dst_size {
            return Err(ConvertError::BufferSize {
                expected: dst_size,
                got: dst.len(),
            });
        }

        match (self.src, self.dst) {
            (PixelFormat::NV12, PixelFormat::I420) => {
                nv12_to_i420(src, dst, width, height);
                Ok(())
            }
            (PixelFormat::I420, PixelFormat::Rgb24) => {
                i420_to_rgb(src, dst, width, height);
                Ok(())
            }
            (src, dst) => Err(ConvertError::Unsupported { src, dst }),
        }
    }
}

/// Returns the converter cached in `slot`, lazily building it and replacing a
/// stale one whenever the geometry or either format changed.
pub fn cached_converter(
    slot: &mut Option<Converter>,
    resolution: Resolution,
    src: PixelFormat,
    dst: PixelFormat,
) -> &Converter {
    if !matches!(slot, Some(c) if c.matches(resolution, src, dst)) {
        if slot.is_some() {
            debug!(
                "rebuilding {:?} -> {:?} converter for {}x{}",
                src, dst, resolution.width, resolution.height
            );
        }
        *slot = None;
    }

    slot.get_or_insert_with(|| Converter {
        resolution,
        src,
        dst,
    })
}
