// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Demux collaborator boundary.
//!
//! The pipeline does not understand container formats itself: it consumes
//! compressed units from whatever implements [`Demuxer`]. The only built-in
//! implementation is [`IvfDemuxer`], which reads raw IVF elementary streams
//! and is enough to drive the software decode path end to end.

use bytes::Buf;
use bytes::Bytes;
use thiserror::Error;

use crate::Resolution;

#[derive(Error, Debug)]
pub enum DemuxError {
    #[error("failed to read source: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed container: {0}")]
    Malformed(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
    Other,
}

/// Codec parameters declared by the container for one stream.
#[derive(Debug, Clone)]
pub struct CodecParameters {
    /// Codec name as declared by the container, e.g. a fourcc.
    pub codec: String,
    pub coded_resolution: Resolution,
}

#[derive(Debug, Clone)]
pub struct StreamDesc {
    pub kind: StreamKind,
    /// Declared frame count; 0 means unknown and callers must rely on
    /// end-of-stream signaling instead.
    pub frame_count: u64,
    pub codec: CodecParameters,
}

#[derive(Debug, Clone, Default)]
pub struct DemuxOptions {
    /// Asks network demuxers to force a reliable transport (e.g. RTSP over
    /// TCP) instead of the protocol default. File demuxers ignore this.
    pub force_reliable_transport: bool,
}

/// One demuxed, still-encoded chunk of the video stream.
///
/// Consumed exactly once by a decode call; the caller may reuse or drop it
/// afterwards.
#[derive(Debug, Clone)]
pub struct CompressedUnit {
    pub data: Bytes,
    pub pts: i64,
    pub eos: bool,
}

impl CompressedUnit {
    /// An explicit end-of-stream marker, used to flush the decode backend
    /// once the demuxer has run dry.
    pub fn end_of_stream() -> Self {
        Self {
            data: Bytes::new(),
            pts: 0,
            eos: true,
        }
    }
}

/// Outcome of pulling the next unit from a demuxer.
pub enum UnitEvent {
    Unit(CompressedUnit),
    /// Transient condition (e.g. a network source that has nothing buffered).
    /// Callers should retry rather than terminate.
    NotReady,
    EndOfStream,
}

pub trait Demuxer {
    fn open(source: &str, options: &DemuxOptions) -> Result<Self, DemuxError>
    where
        Self: Sized;

    /// The streams declared by the container.
    fn streams(&self) -> &[StreamDesc];

    fn read_unit(&mut self) -> Result<UnitEvent, DemuxError>;
}

const IVF_HEADER_SIZE: usize = 32;
const IVF_FRAME_HEADER_SIZE: usize = 12;

/// Demuxer for IVF elementary streams.
pub struct IvfDemuxer {
    data: Bytes,
    pos: usize,
    streams: [StreamDesc; 1],
}

impl IvfDemuxer {
    /// Parses an in-memory IVF stream.
    pub fn from_bytes(data: Bytes) -> Result<Self, DemuxError> {
        if data.len() < IVF_HEADER_SIZE {
            return Err(DemuxError::Malformed("truncated IVF header"));
        }

        let mut header = &data[..IVF_HEADER_SIZE];
        let mut signature = [0u8; 4];
        header.copy_to_slice(&mut signature);
        if &signature != b"DKIF" {
            return Err(DemuxError::Malformed("bad IVF signature"));
        }

        let _version = header.get_u16_le();
        let _header_size = header.get_u16_le();
        let mut fourcc = [0u8; 4];
        header.copy_to_slice(&mut fourcc);
        let width = header.get_u16_le();
        let height = header.get_u16_le();
        let _timebase_den = header.get_u32_le();
        let _timebase_num = header.get_u32_le();
        let frame_count = header.get_u32_le() as u64;

        let codec = CodecParameters {
            codec: String::from_utf8_lossy(&fourcc).into_owned(),
            coded_resolution: Resolution::from((width as u32, height as u32)),
        };

        Ok(Self {
            data,
            pos: IVF_HEADER_SIZE,
            streams: [StreamDesc {
                kind: StreamKind::Video,
                frame_count,
                codec,
            }],
        })
    }
}

impl Demuxer for IvfDemuxer {
    fn open(source: &str, _options: &DemuxOptions) -> Result<Self, DemuxError> {
        let data = Bytes::from(std::fs::read(source)?);
        Self::from_bytes(data)
    }

    fn streams(&self) -> &[StreamDesc] {
        &self.streams
    }

    fn read_unit(&mut self) -> Result<UnitEvent, DemuxError> {
        let mut remaining = &self.data[self.pos..];
        if remaining.len() < IVF_FRAME_HEADER_SIZE {
            return Ok(UnitEvent::EndOfStream);
        }

        let len = remaining.get_u32_le() as usize;
        let pts = remaining.get_u64_le() as i64;
        if remaining.len() < len {
            // A truncated trailing record is treated as the end of the
            // stream rather than an error.
            return Ok(UnitEvent::EndOfStream);
        }

        let start = self.pos + IVF_FRAME_HEADER_SIZE;
        self.pos = start + len;

        Ok(UnitEvent::Unit(CompressedUnit {
            data: self.data.slice(start..start + len),
            pts,
            eos: false,
        }))
    }
}

/// Synthesizes an IVF stream whose frame payloads are single repeated bytes,
/// one per entry of `frames`.
#[cfg(test)]
pub(crate) fn synthesize_ivf(width: u16, height: u16, frames: &[(u8, usize)]) -> Bytes {
    use bytes::BufMut;

    let mut out = Vec::new();
    out.put_slice(b"DKIF");
    out.put_u16_le(0); // version
    out.put_u16_le(IVF_HEADER_SIZE as u16);
    out.put_slice(b"VP80");
    out.put_u16_le(width);
    out.put_u16_le(height);
    out.put_u32_le(30); // timebase denominator
    out.put_u32_le(1); // timebase numerator
    out.put_u32_le(frames.len() as u32);
    out.put_u32_le(0); // unused

    for (index, (byte, len)) in frames.iter().enumerate() {
        out.put_u32_le(*len as u32);
        out.put_u64_le(index as u64);
        out.put_bytes(*byte, *len);
    }

    Bytes::from(out)
}
