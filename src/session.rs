// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decode session facade.
//!
//! A [`Session`] owns the demux collaborator, the decode backend chosen at
//! open time, and the cached pixel converters. The lifecycle is
//! open -> { next_unit -> decode -> retrieve_frame* }* -> close, with every
//! call blocking until it completes; callers drive all decode progress from
//! a single thread.

use log::debug;
use log::info;
use thiserror::Error;

use crate::backend::hardware::HardwareAdapter;
use crate::backend::hardware::HardwareTuning;
use crate::backend::software::SoftwareAdapter;
use crate::backend::DecodeBackend;
use crate::backend::EngineError;
use crate::backend::EngineFactory;
use crate::decoded_frame_size;
use crate::demux::CompressedUnit;
use crate::demux::DemuxError;
use crate::demux::DemuxOptions;
use crate::demux::Demuxer;
use crate::demux::StreamKind;
use crate::demux::UnitEvent;
use crate::image_processing::cached_converter;
use crate::image_processing::ConvertError;
use crate::image_processing::Converter;
use crate::PixelFormat;

#[derive(Error, Debug)]
pub enum OpenError {
    #[error(transparent)]
    Demux(#[from] DemuxError),
    #[error("no video stream found in source")]
    NoVideoStream,
    #[error("failed to initialize decode engine: {0}")]
    Engine(#[from] EngineError),
}

#[derive(Error, Debug)]
pub enum ReadError {
    #[error("session is closed")]
    Closed,
    #[error(transparent)]
    Demux(#[from] DemuxError),
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("session is closed")]
    Closed,
    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[derive(Error, Debug)]
pub enum RetrieveError {
    #[error("session is closed")]
    Closed,
    #[error("no decoded frame is available")]
    NoFrame,
    #[error("cannot convert {0:?} output to RGB")]
    UnsupportedFormat(PixelFormat),
    #[error("output buffer holds {got} bytes, need {expected}")]
    BufferSize { expected: usize, got: usize },
    #[error(transparent)]
    Convert(#[from] ConvertError),
}

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Requested decoder name. The factory's reserved hardware name selects
    /// the hardware path; any other name selects the software path.
    pub decoder: String,
    pub demux: DemuxOptions,
    pub hardware: HardwareTuning,
}

/// One decode session over one stream source.
///
/// Sessions are independent of each other; concurrent calls into the same
/// session are not supported and must be serialized by the caller.
pub struct Session<D: Demuxer> {
    demuxer: D,
    backend: Box<dyn DecodeBackend>,
    /// Stage caches: semi-planar to planar, planar to packed RGB.
    to_planar: Option<Converter>,
    to_rgb: Option<Converter>,
    yuv_scratch: Vec<u8>,
    closed: bool,
}

impl<D: Demuxer> Session<D> {
    /// Opens `source` and instantiates the decode backend named by
    /// `options.decoder`. Returns the session together with the container's
    /// declared frame count, which is 0 for raw elementary streams; callers
    /// must then rely on end-of-stream signaling instead.
    pub fn open<F: EngineFactory>(
        source: &str,
        options: &SessionOptions,
        factory: &F,
    ) -> Result<(Self, u64), OpenError> {
        let demuxer = D::open(source, &options.demux)?;

        let stream = demuxer
            .streams()
            .iter()
            .find(|s| s.kind == StreamKind::Video)
            .ok_or(OpenError::NoVideoStream)?;
        let frame_count = stream.frame_count;
        let codec = stream.codec.clone();
        info!(
            "video stream: {} {}x{}, declared frame count {}",
            codec.codec, codec.coded_resolution.width, codec.coded_resolution.height, frame_count
        );

        let backend: Box<dyn DecodeBackend> =
            if options.decoder == factory.hardware_decoder_name() {
                Box::new(HardwareAdapter::new(
                    factory.new_hardware(&codec)?,
                    options.hardware.clone(),
                ))
            } else {
                Box::new(SoftwareAdapter::new(
                    factory.new_software(&options.decoder, &codec)?,
                ))
            };

        Ok((
            Self {
                demuxer,
                backend,
                to_planar: None,
                to_rgb: None,
                yuv_scratch: Vec::new(),
                closed: false,
            },
            frame_count,
        ))
    }

    /// Pulls the next compressed unit from the demuxer. [`UnitEvent::NotReady`]
    /// is transient; callers should retry rather than terminate.
    pub fn next_unit(&mut self) -> Result<UnitEvent, ReadError> {
        if self.closed {
            return Err(ReadError::Closed);
        }
        Ok(self.demuxer.read_unit()?)
    }

    /// Hands `unit` to the active backend. Returns how many frames became
    /// available; the hardware path can report more than one, since one unit
    /// may unblock several queued outputs.
    pub fn decode(&mut self, unit: &CompressedUnit) -> Result<usize, DecodeError> {
        if self.closed {
            return Err(DecodeError::Closed);
        }
        Ok(self.backend.decode(unit)?)
    }

    /// Pops the next decoded frame and converts it into `dst` as packed RGB,
    /// `width * height * 3` bytes.
    pub fn retrieve_frame(&mut self, dst: &mut [u8]) -> Result<(), RetrieveError> {
        if self.closed {
            return Err(RetrieveError::Closed);
        }

        let frame = self.backend.take_frame().ok_or(RetrieveError::NoFrame)?;
        let width = frame.resolution.width as usize;
        let height = frame.resolution.height as usize;

        let expected = decoded_frame_size(PixelFormat::Rgb24, width, height);
        if dst.len() != expected {
            return Err(RetrieveError::BufferSize {
                expected,
                got: dst.len(),
            });
        }

        match frame.format {
            PixelFormat::I420 => {
                cached_converter(
                    &mut self.to_rgb,
                    frame.resolution,
                    PixelFormat::I420,
                    PixelFormat::Rgb24,
                )
                .convert(&frame.data, dst)?;
            }
            PixelFormat::NV12 => {
                self.yuv_scratch
                    .resize(decoded_frame_size(PixelFormat::I420, width, height), 0);
                cached_converter(
                    &mut self.to_planar,
                    frame.resolution,
                    PixelFormat::NV12,
                    PixelFormat::I420,
                )
                .convert(&frame.data, &mut self.yuv_scratch)?;
                cached_converter(
                    &mut self.to_rgb,
                    frame.resolution,
                    PixelFormat::I420,
                    PixelFormat::Rgb24,
                )
                .convert(&self.yuv_scratch, dst)?;
            }
            PixelFormat::Rgb24 => {
                // The engine's payload must agree with its declared geometry.
                if frame.data.len() != expected {
                    return Err(ConvertError::BufferSize {
                        expected,
                        got: frame.data.len(),
                    }
                    .into());
                }
                dst.copy_from_slice(&frame.data);
            }
            PixelFormat::Opaque => {
                return Err(RetrieveError::UnsupportedFormat(PixelFormat::Opaque))
            }
        }

        Ok(())
    }

    /// Releases the backend, any buffered frames and the conversion caches.
    /// Idempotent; subsequent decode or retrieve calls report the session as
    /// closed.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }

        self.backend.close();
        self.to_planar = None;
        self.to_rgb = None;
        self.yuv_scratch = Vec::new();
        self.closed = true;
        debug!("session closed");
    }
}

impl<D: Demuxer> Drop for Session<D> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    use bytes::Bytes;

    use crate::backend::dummy::DummyEngineFactory;
    use crate::backend::dummy::DUMMY_HARDWARE_DECODER;
    use crate::backend::software::DrainOutcome;
    use crate::backend::software::SoftwareEngine;
    use crate::backend::DecodedFrame;
    use crate::demux::synthesize_ivf;
    use crate::demux::CodecParameters;
    use crate::demux::IvfDemuxer;
    use crate::demux::StreamDesc;
    use crate::Resolution;

    /// Writes `data` to a unique temporary file and returns its path.
    fn fixture_file(data: &[u8]) -> std::path::PathBuf {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let path = std::env::temp_dir().join(format!(
            "framepump-fixture-{}-{}.ivf",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::write(&path, data).unwrap();
        path
    }

    /// Runs a full open/decode/retrieve/close cycle and returns the RGB
    /// frames that came out.
    fn run_to_completion(decoder: &str, frames: usize) -> (u64, Vec<Vec<u8>>) {
        let _ = env_logger::builder().is_test(true).try_init();

        let fixture = synthesize_ivf(8, 6, &vec![(0x42, 16); frames]);
        let path = fixture_file(&fixture);

        let options = SessionOptions {
            decoder: decoder.to_owned(),
            ..Default::default()
        };
        let (mut session, frame_count) = Session::<IvfDemuxer>::open(
            path.to_str().unwrap(),
            &options,
            &DummyEngineFactory,
        )
        .unwrap();

        let mut rgb_frames = Vec::new();
        let mut retrieve_all = |session: &mut Session<IvfDemuxer>, available: usize| {
            for _ in 0..available {
                let mut rgb = vec![0u8; 8 * 6 * 3];
                session.retrieve_frame(&mut rgb).unwrap();
                rgb_frames.push(rgb);
            }
        };

        loop {
            match session.next_unit().unwrap() {
                UnitEvent::Unit(unit) => {
                    let available = session.decode(&unit).unwrap();
                    retrieve_all(&mut session, available);
                }
                UnitEvent::NotReady => continue,
                UnitEvent::EndOfStream => break,
            }
        }

        // Flush the backend with an explicit end-of-stream unit.
        let available = session.decode(&CompressedUnit::end_of_stream()).unwrap();
        retrieve_all(&mut session, available);

        session.close();
        session.close();
        std::fs::remove_file(&path).unwrap();

        (frame_count, rgb_frames)
    }

    #[test]
    fn software_path_end_to_end() {
        let (frame_count, frames) = run_to_completion("dummy-sw", 5);
        assert_eq!(frame_count, 5);
        assert_eq!(frames.len() as u64, frame_count);

        // The dummy engine produces mid-gray frames.
        for frame in &frames {
            assert!(frame.iter().all(|&b| b.abs_diff(128) <= 1));
        }
    }

    #[test]
    fn hardware_path_end_to_end() {
        let (frame_count, frames) = run_to_completion(DUMMY_HARDWARE_DECODER, 5);
        assert_eq!(frame_count, 5);
        assert_eq!(frames.len() as u64, frame_count);

        for frame in &frames {
            assert!(frame.iter().all(|&b| b.abs_diff(128) <= 1));
        }
    }

    #[test]
    fn calls_after_close_report_closed() {
        let fixture = synthesize_ivf(4, 4, &[(0, 4)]);
        let path = fixture_file(&fixture);
        let (mut session, _) = Session::<IvfDemuxer>::open(
            path.to_str().unwrap(),
            &SessionOptions::default(),
            &DummyEngineFactory,
        )
        .unwrap();

        session.close();
        assert!(matches!(session.next_unit(), Err(ReadError::Closed)));
        assert!(matches!(
            session.decode(&CompressedUnit::end_of_stream()),
            Err(DecodeError::Closed)
        ));
        let mut rgb = vec![0u8; 4 * 4 * 3];
        assert!(matches!(
            session.retrieve_frame(&mut rgb),
            Err(RetrieveError::Closed)
        ));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn retrieve_without_decoded_frame_fails() {
        let fixture = synthesize_ivf(4, 4, &[(0, 4)]);
        let path = fixture_file(&fixture);
        let (mut session, _) = Session::<IvfDemuxer>::open(
            path.to_str().unwrap(),
            &SessionOptions::default(),
            &DummyEngineFactory,
        )
        .unwrap();

        let mut rgb = vec![0u8; 4 * 4 * 3];
        assert!(matches!(
            session.retrieve_frame(&mut rgb),
            Err(RetrieveError::NoFrame)
        ));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn undersized_output_buffer_is_rejected() {
        let fixture = synthesize_ivf(4, 4, &[(0x11, 4)]);
        let path = fixture_file(&fixture);
        let (mut session, _) = Session::<IvfDemuxer>::open(
            path.to_str().unwrap(),
            &SessionOptions::default(),
            &DummyEngineFactory,
        )
        .unwrap();

        let unit = match session.next_unit().unwrap() {
            UnitEvent::Unit(unit) => unit,
            _ => panic!("expected a unit"),
        };
        assert_eq!(session.decode(&unit).unwrap(), 1);

        let mut short = vec![0u8; 7];
        assert!(matches!(
            session.retrieve_frame(&mut short),
            Err(RetrieveError::BufferSize {
                expected: 48,
                got: 7
            })
        ));
        std::fs::remove_file(&path).unwrap();
    }

    /// Engine producing opaque hardware-surface frames the pipeline cannot
    /// convert.
    struct OpaqueEngine {
        resolution: Resolution,
        pending: Option<DecodedFrame>,
    }

    impl SoftwareEngine for OpaqueEngine {
        fn submit(&mut self, unit: &CompressedUnit) -> Result<(), EngineError> {
            self.pending = Some(DecodedFrame {
                format: PixelFormat::Opaque,
                resolution: self.resolution,
                pts: unit.pts,
                data: Vec::new(),
            });
            Ok(())
        }

        fn drain(&mut self) -> Result<DrainOutcome, EngineError> {
            Ok(match self.pending.take() {
                Some(frame) => DrainOutcome::Frame(frame),
                None => DrainOutcome::WouldBlock,
            })
        }
    }

    struct OpaqueFactory;

    impl EngineFactory for OpaqueFactory {
        fn hardware_decoder_name(&self) -> &str {
            DUMMY_HARDWARE_DECODER
        }

        fn new_software(
            &self,
            _decoder: &str,
            codec: &CodecParameters,
        ) -> Result<Box<dyn SoftwareEngine>, EngineError> {
            Ok(Box::new(OpaqueEngine {
                resolution: codec.coded_resolution,
                pending: None,
            }))
        }

        fn new_hardware(
            &self,
            _codec: &CodecParameters,
        ) -> Result<Box<dyn crate::backend::hardware::HardwareEngine>, EngineError> {
            Err(EngineError::Other(anyhow::anyhow!("not available")))
        }
    }

    #[test]
    fn opaque_surface_retrieval_is_an_explicit_error() {
        let fixture = synthesize_ivf(4, 4, &[(0x11, 4)]);
        let path = fixture_file(&fixture);
        let (mut session, _) = Session::<IvfDemuxer>::open(
            path.to_str().unwrap(),
            &SessionOptions::default(),
            &OpaqueFactory,
        )
        .unwrap();

        let unit = match session.next_unit().unwrap() {
            UnitEvent::Unit(unit) => unit,
            _ => panic!("expected a unit"),
        };
        assert_eq!(session.decode(&unit).unwrap(), 1);

        let mut rgb = vec![0u8; 4 * 4 * 3];
        assert!(matches!(
            session.retrieve_frame(&mut rgb),
            Err(RetrieveError::UnsupportedFormat(PixelFormat::Opaque))
        ));

        // The session survives the failed retrieval.
        assert!(session.next_unit().is_ok());
        std::fs::remove_file(&path).unwrap();
    }

    /// Engine whose packed RGB payloads disagree with their declared
    /// geometry.
    struct ShortRgbEngine {
        resolution: Resolution,
        pending: Option<DecodedFrame>,
    }

    impl SoftwareEngine for ShortRgbEngine {
        fn submit(&mut self, unit: &CompressedUnit) -> Result<(), EngineError> {
            self.pending = Some(DecodedFrame {
                format: PixelFormat::Rgb24,
                resolution: self.resolution,
                pts: unit.pts,
                data: vec![0; 10],
            });
            Ok(())
        }

        fn drain(&mut self) -> Result<DrainOutcome, EngineError> {
            Ok(match self.pending.take() {
                Some(frame) => DrainOutcome::Frame(frame),
                None => DrainOutcome::WouldBlock,
            })
        }
    }

    struct ShortRgbFactory;

    impl EngineFactory for ShortRgbFactory {
        fn hardware_decoder_name(&self) -> &str {
            DUMMY_HARDWARE_DECODER
        }

        fn new_software(
            &self,
            _decoder: &str,
            codec: &CodecParameters,
        ) -> Result<Box<dyn SoftwareEngine>, EngineError> {
            Ok(Box::new(ShortRgbEngine {
                resolution: codec.coded_resolution,
                pending: None,
            }))
        }

        fn new_hardware(
            &self,
            _codec: &CodecParameters,
        ) -> Result<Box<dyn crate::backend::hardware::HardwareEngine>, EngineError> {
            Err(EngineError::Other(anyhow::anyhow!("not available")))
        }
    }

    #[test]
    fn rgb_frame_with_inconsistent_size_is_rejected() {
        let fixture = synthesize_ivf(4, 4, &[(0x11, 4)]);
        let path = fixture_file(&fixture);
        let (mut session, _) = Session::<IvfDemuxer>::open(
            path.to_str().unwrap(),
            &SessionOptions::default(),
            &ShortRgbFactory,
        )
        .unwrap();

        let unit = match session.next_unit().unwrap() {
            UnitEvent::Unit(unit) => unit,
            _ => panic!("expected a unit"),
        };
        assert_eq!(session.decode(&unit).unwrap(), 1);

        let mut rgb = vec![0u8; 4 * 4 * 3];
        assert!(matches!(
            session.retrieve_frame(&mut rgb),
            Err(RetrieveError::Convert(ConvertError::BufferSize {
                expected: 48,
                got: 10,
            }))
        ));

        // The session survives the failed retrieval.
        assert!(session.next_unit().is_ok());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn hardware_engine_init_failure_is_fatal_at_open() {
        let fixture = synthesize_ivf(4, 4, &[(0x11, 4)]);
        let path = fixture_file(&fixture);
        let options = SessionOptions {
            decoder: DUMMY_HARDWARE_DECODER.to_owned(),
            ..Default::default()
        };
        assert!(matches!(
            Session::<IvfDemuxer>::open(path.to_str().unwrap(), &options, &OpaqueFactory),
            Err(OpenError::Engine(_))
        ));
        std::fs::remove_file(&path).unwrap();
    }

    /// Demuxer whose first read reports a transient not-ready condition.
    struct FlakyDemuxer {
        streams: [StreamDesc; 1],
        reads: u32,
    }

    impl Demuxer for FlakyDemuxer {
        fn open(_source: &str, _options: &DemuxOptions) -> Result<Self, DemuxError> {
            Ok(Self {
                streams: [StreamDesc {
                    kind: StreamKind::Video,
                    frame_count: 0,
                    codec: CodecParameters {
                        codec: "test".to_owned(),
                        coded_resolution: Resolution::from((4, 4)),
                    },
                }],
                reads: 0,
            })
        }

        fn streams(&self) -> &[StreamDesc] {
            &self.streams
        }

        fn read_unit(&mut self) -> Result<UnitEvent, DemuxError> {
            self.reads += 1;
            Ok(match self.reads {
                1 => UnitEvent::NotReady,
                2 => UnitEvent::Unit(CompressedUnit {
                    data: Bytes::from_static(&[0x42]),
                    pts: 0,
                    eos: false,
                }),
                _ => UnitEvent::EndOfStream,
            })
        }
    }

    #[test]
    fn transient_not_ready_is_distinct_from_end_of_stream() {
        let (mut session, frame_count) =
            Session::<FlakyDemuxer>::open("", &SessionOptions::default(), &DummyEngineFactory)
                .unwrap();
        // Raw stream: unknown frame count.
        assert_eq!(frame_count, 0);

        assert!(matches!(session.next_unit().unwrap(), UnitEvent::NotReady));
        assert!(matches!(session.next_unit().unwrap(), UnitEvent::Unit(_)));
        assert!(matches!(
            session.next_unit().unwrap(),
            UnitEvent::EndOfStream
        ));
    }
}
