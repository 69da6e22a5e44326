use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use opencv::{
    core::{Mat, Vector},
    imgcodecs,
    prelude::*,
};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info};

use crate::config::Config;
use crate::error::{FlowError, Result};
use crate::recorder::{Recorder, SinkFactory, VideoWriterFactory};
use crate::source::{FrameSource, VideoSource};
use crate::tracker::TrackingEngine;
use crate::visualization::draw_fps;

/// Which frames a stream carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamMode {
    /// Raw frames from the source.
    Index,
    /// Frames annotated with optical flow trails.
    OpticalFlow,
    /// Routed by the transport but without an implementation.
    BackgroundSubtraction,
}

impl FromStr for StreamMode {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "index" => Ok(StreamMode::Index),
            "opticalflow" => Ok(StreamMode::OpticalFlow),
            "backgroundsubtraction" => Ok(StreamMode::BackgroundSubtraction),
            _ => Err(FlowError::UnsupportedMode(s.to_string())),
        }
    }
}

impl fmt::Display for StreamMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamMode::Index => "index",
            StreamMode::OpticalFlow => "opticalflow",
            StreamMode::BackgroundSubtraction => "backgroundsubtraction",
        };
        write!(f, "{name}")
    }
}

/// Reply to a recording toggle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Ack {
    pub status: &'static str,
}

impl Ack {
    pub fn ok() -> Self {
        Ack { status: "ok" }
    }
}

/// Ends a [`FrameStream`] at its next iteration.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct FpsCounter {
    started: Instant,
    frames: u64,
}

/// Per-call entry point tying the frame source, tracking engine and recorder
/// together.
///
/// The source and engine sit behind one lock so frames are produced one at
/// a time in device order; the recorder sits behind another so recording
/// can be toggled while a stream is running. The publish path decides
/// whether to record and writes under the same recorder lock.
///
/// The raw and tracked paths read from the same source, so a session should
/// drive only one of them.
pub struct FramePublisher {
    engine: Mutex<TrackingEngine>,
    recorder: Mutex<Recorder>,
    jpeg_quality: i32,
    fps: Option<Mutex<FpsCounter>>,
}

impl FramePublisher {
    pub fn new(engine: TrackingEngine, recorder: Recorder, config: &Config) -> Self {
        let fps = config.show_fps.then(|| {
            Mutex::new(FpsCounter {
                started: Instant::now(),
                frames: 0,
            })
        });
        FramePublisher {
            engine: Mutex::new(engine),
            recorder: Mutex::new(recorder),
            jpeg_quality: config.jpeg_quality,
            fps,
        }
    }

    /// Publisher over the configured capture source, recording through
    /// OpenCV's `VideoWriter`.
    pub fn open(config: &Config) -> anyhow::Result<Self> {
        let source = VideoSource::open(&config.source)?;
        Self::with_parts(Box::new(source), Box::new(VideoWriterFactory), config)
    }

    pub fn with_parts(
        source: Box<dyn FrameSource>,
        sink_factory: Box<dyn SinkFactory>,
        config: &Config,
    ) -> anyhow::Result<Self> {
        let engine = TrackingEngine::new(source, config)?;
        let recorder = Recorder::new(config.recorder_params(), sink_factory);
        Ok(Self::new(engine, recorder, config))
    }

    /// Next source frame, untouched, as JPEG.
    pub fn get_raw_frame(&self) -> Result<Vec<u8>> {
        let mut engine = self.engine.lock();
        let frame = engine.read_frame()?;
        self.publish(frame)
    }

    /// Next source frame with optical flow trails, as JPEG.
    pub fn get_tracked_frame(&self) -> Result<Vec<u8>> {
        let mut engine = self.engine.lock();
        let frame = engine.advance(None)?;
        self.publish(frame)
    }

    pub fn next_frame(&self, mode: StreamMode) -> Result<Vec<u8>> {
        match mode {
            StreamMode::Index => self.get_raw_frame(),
            StreamMode::OpticalFlow => self.get_tracked_frame(),
            StreamMode::BackgroundSubtraction => {
                Err(FlowError::UnsupportedMode(mode.to_string()))
            }
        }
    }

    /// Endless sequence of encoded frames, ending when the source runs dry
    /// or `cancel` fires.
    pub fn stream(self: &Arc<Self>, mode: StreamMode, cancel: CancelToken) -> FrameStream {
        FrameStream {
            publisher: Arc::clone(self),
            mode,
            cancel,
            finished: false,
        }
    }

    pub fn begin_recording(&self) -> Result<Ack> {
        let geometry = self.engine.lock().geometry()?;
        self.recorder.lock().start(geometry)?;
        Ok(Ack::ok())
    }

    pub fn end_recording(&self) -> Result<Ack> {
        self.recorder.lock().stop()?;
        Ok(Ack::ok())
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.lock().is_active()
    }

    /// Called with the engine lock held, which keeps frames in device order.
    ///
    /// The frame rate overlay is drawn after recording, so it only reaches
    /// the published JPEG.
    fn publish(&self, mut frame: Mat) -> Result<Vec<u8>> {
        {
            let mut recorder = self.recorder.lock();
            if recorder.is_active() {
                if let Err(err) = recorder.write(&frame) {
                    error!(%err, "recording failed, closing it");
                    if let Err(err) = recorder.stop() {
                        error!(%err, "failed to close recording");
                    }
                }
            }
        }

        if let Some(counter) = &self.fps {
            let mut counter = counter.lock();
            counter.frames += 1;
            let elapsed = counter.started.elapsed().as_secs_f64();
            if elapsed > 0. {
                draw_fps(&mut frame, counter.frames as f64 / elapsed)?;
            }
        }

        encode_jpeg(&frame, self.jpeg_quality)
    }
}

pub fn encode_jpeg(frame: &Mat, quality: i32) -> Result<Vec<u8>> {
    let mut buf = Vector::<u8>::new();
    let params = Vector::<i32>::from_iter([imgcodecs::IMWRITE_JPEG_QUALITY, quality]);
    if !imgcodecs::imencode(".jpg", frame, &mut buf, &params)? {
        return Err(FlowError::Encode("jpeg"));
    }
    Ok(buf.to_vec())
}

/// Pull-based stream of encoded frames for the transport layer.
///
/// A source failure is yielded once and ends the stream; cancellation ends
/// it silently.
pub struct FrameStream {
    publisher: Arc<FramePublisher>,
    mode: StreamMode,
    cancel: CancelToken,
    finished: bool,
}

impl Iterator for FrameStream {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if self.cancel.is_cancelled() {
            info!(mode = %self.mode, "stream cancelled");
            self.finished = true;
            return None;
        }
        match self.publisher.next_frame(self.mode) {
            Ok(bytes) => Some(Ok(bytes)),
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}
