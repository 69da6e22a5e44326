use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::ensure;
use chrono::Local;
use opencv::{
    core::{Mat, Size},
    prelude::*,
    videoio::{VideoWriter, VideoWriterTrait},
};
use tracing::{info, warn};

use crate::error::{FlowError, Result};
use crate::source::Geometry;

/// Four character codec tag, e.g. `mp4v` or `MJPG`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FourCc([char; 4]);

impl FourCc {
    pub fn code(&self) -> Result<i32> {
        let [a, b, c, d] = self.0;
        Ok(VideoWriter::fourcc(a, b, c, d)?)
    }

    /// Container file extension conventionally paired with the codec.
    pub fn extension(&self) -> &'static str {
        match self.to_string().to_ascii_lowercase().as_str() {
            "mp4v" | "avc1" | "h264" | "hev1" | "hvc1" => "mp4",
            "vp80" | "vp90" => "webm",
            _ => "avi",
        }
    }
}

impl FromStr for FourCc {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let chars: Vec<char> = s.chars().collect();
        ensure!(
            chars.len() == 4 && chars.iter().all(|c| c.is_ascii_graphic()),
            "codec tag must be four printable ASCII characters, got {s:?}"
        );
        Ok(FourCc([chars[0], chars[1], chars[2], chars[3]]))
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.iter().try_for_each(|c| write!(f, "{c}"))
    }
}

#[derive(Clone, Debug)]
pub struct RecorderParams {
    pub output_dir: PathBuf,
    pub codec: FourCc,
}

/// Destination of recorded frames.
pub trait VideoSink: Send {
    fn write(&mut self, frame: &Mat) -> Result<()>;

    /// Flush and close. No frame is written afterwards.
    fn release(&mut self) -> Result<()>;
}

pub trait SinkFactory: Send {
    fn open(&self, path: &Path, codec: FourCc, geometry: Geometry) -> Result<Box<dyn VideoSink>>;
}

/// Opens sinks backed by an OpenCV `VideoWriter`.
pub struct VideoWriterFactory;

impl SinkFactory for VideoWriterFactory {
    fn open(&self, path: &Path, codec: FourCc, geometry: Geometry) -> Result<Box<dyn VideoSink>> {
        let filename = path
            .to_str()
            .ok_or_else(|| FlowError::SinkUnavailable(path.to_path_buf()))?;
        let writer = VideoWriter::new(
            filename,
            codec.code()?,
            geometry.fps,
            Size::new(geometry.width, geometry.height),
            true,
        )?;
        if !writer.is_opened()? {
            return Err(FlowError::SinkUnavailable(path.to_path_buf()));
        }
        Ok(Box::new(VideoWriterSink { writer }))
    }
}

struct VideoWriterSink {
    writer: VideoWriter,
}

impl VideoSink for VideoWriterSink {
    fn write(&mut self, frame: &Mat) -> Result<()> {
        VideoWriterTrait::write(&mut self.writer, frame)?;
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        self.writer.release()?;
        Ok(())
    }
}

struct Session {
    sink: Box<dyn VideoSink>,
    path: PathBuf,
    geometry: Geometry,
    frames: usize,
}

/// Optional persistence of the published frames.
///
/// Recording is active exactly while a session (open sink) exists.
pub struct Recorder {
    params: RecorderParams,
    factory: Box<dyn SinkFactory>,
    session: Option<Session>,
}

impl Recorder {
    pub fn new(params: RecorderParams, factory: Box<dyn SinkFactory>) -> Self {
        Recorder {
            params,
            factory,
            session: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// Output file of the active session.
    pub fn path(&self) -> Option<&Path> {
        self.session.as_ref().map(|s| s.path.as_path())
    }

    pub fn frames_written(&self) -> Option<usize> {
        self.session.as_ref().map(|s| s.frames)
    }

    /// Open a new recording with the given geometry.
    ///
    /// Returns `Ok(false)` without touching the open sink when a recording is
    /// already active.
    pub fn start(&mut self, geometry: Geometry) -> Result<bool> {
        if let Some(session) = &self.session {
            warn!(path = %session.path.display(), "recording already active");
            return Ok(false);
        }
        if geometry.width <= 0 || geometry.height <= 0 {
            return Err(FlowError::RecorderMisuse(format!(
                "cannot record frames of {}x{}",
                geometry.width, geometry.height
            )));
        }

        fs::create_dir_all(&self.params.output_dir)?;
        let path = self.next_path();
        let sink = self.factory.open(&path, self.params.codec, geometry)?;
        info!(
            path = %path.display(),
            width = geometry.width,
            height = geometry.height,
            fps = geometry.fps,
            codec = %self.params.codec,
            "recording started"
        );
        self.session = Some(Session {
            sink,
            path,
            geometry,
            frames: 0,
        });
        Ok(true)
    }

    /// Close the active recording. Returns `Ok(false)` when none was active.
    pub fn stop(&mut self) -> Result<bool> {
        let Some(mut session) = self.session.take() else {
            return Ok(false);
        };
        session.sink.release()?;
        info!(
            path = %session.path.display(),
            frames = session.frames,
            "recording stopped"
        );
        Ok(true)
    }

    pub fn write(&mut self, frame: &Mat) -> Result<()> {
        let session = self.session.as_mut().ok_or_else(|| {
            FlowError::RecorderMisuse("write while recording is inactive".to_string())
        })?;
        let Geometry { width, height, .. } = session.geometry;
        if frame.cols() != width || frame.rows() != height {
            return Err(FlowError::RecorderMisuse(format!(
                "frame is {}x{}, recording {}x{}",
                frame.cols(),
                frame.rows(),
                width,
                height
            )));
        }
        session.sink.write(frame)?;
        session.frames += 1;
        Ok(())
    }

    /// Timestamped file name in the output directory that does not exist yet.
    fn next_path(&self) -> PathBuf {
        let stem = Local::now().format("%Y%m%d_%H%M%S_%6f").to_string();
        let extension = self.params.codec.extension();
        let mut path = self.params.output_dir.join(format!("{stem}.{extension}"));
        let mut n = 1;
        while path.exists() {
            path = self
                .params
                .output_dir
                .join(format!("{stem}_{n}.{extension}"));
            n += 1;
        }
        path
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(err) = session.sink.release() {
                warn!(%err, path = %session.path.display(), "failed to close recording");
            }
        }
    }
}
