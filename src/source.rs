use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use log::{debug, info, warn};
use opencv::{
    core::Mat,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTraitConst},
};

use crate::error::{FlowError, Result};

/// Frame rate assumed when a device does not report one.
pub const DEFAULT_FPS: f64 = 30.;

/// Frame size and rate of a video stream.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Geometry {
    pub width: i32,
    pub height: i32,
    pub fps: f64,
}

/// Anything that yields BGR frames one at a time.
///
/// `Ok(None)` marks the end of the stream. Implementations release their
/// underlying device when dropped.
pub trait FrameSource: Send {
    fn read(&mut self) -> Result<Option<Mat>>;

    fn geometry(&self) -> Result<Geometry>;
}

/// Capture device index or video file path.
#[derive(Clone, Debug, PartialEq)]
pub enum SourceId {
    Device(i32),
    File(PathBuf),
}

impl FromStr for SourceId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        if s.is_empty() {
            anyhow::bail!("empty capture source");
        }
        Ok(match s.parse::<i32>() {
            Ok(index) => SourceId::Device(index),
            Err(_) => SourceId::File(PathBuf::from(s)),
        })
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceId::Device(index) => write!(f, "device {index}"),
            SourceId::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// OpenCV backed capture device or video file.
pub struct VideoSource {
    cap: VideoCapture,
    id: SourceId,
}

impl VideoSource {
    pub fn open(id: &SourceId) -> Result<VideoSource> {
        let cap = match id {
            SourceId::Device(index) => VideoCapture::new(*index, videoio::CAP_ANY)?,
            SourceId::File(path) => {
                let path = path
                    .to_str()
                    .ok_or_else(|| FlowError::SourceUnavailable(format!("{id}")))?;
                VideoCapture::from_file(path, videoio::CAP_ANY)?
            }
        };
        if !cap.is_opened()? {
            return Err(FlowError::SourceUnavailable(format!("failed to open {id}")));
        }
        info!("opened capture source {}", id);
        Ok(VideoSource {
            cap,
            id: id.clone(),
        })
    }

    pub fn id(&self) -> &SourceId {
        &self.id
    }
}

impl FrameSource for VideoSource {
    fn read(&mut self) -> Result<Option<Mat>> {
        let mut frame = Mat::default();
        if !self.cap.read(&mut frame)? || frame.rows() == 0 || frame.cols() == 0 {
            debug!("no frame from {}", self.id);
            return Ok(None);
        }
        Ok(Some(frame))
    }

    fn geometry(&self) -> Result<Geometry> {
        let width = VideoCaptureTraitConst::get(&self.cap, videoio::CAP_PROP_FRAME_WIDTH)? as i32;
        let height = VideoCaptureTraitConst::get(&self.cap, videoio::CAP_PROP_FRAME_HEIGHT)? as i32;
        let mut fps = VideoCaptureTraitConst::get(&self.cap, videoio::CAP_PROP_FPS)?;
        if fps.is_nan() || fps <= 0. {
            warn!("{} reports no frame rate, assuming {}", self.id, DEFAULT_FPS);
            fps = DEFAULT_FPS;
        }
        Ok(Geometry { width, height, fps })
    }
}

impl Drop for VideoSource {
    fn drop(&mut self) {
        if let Err(err) = self.cap.release() {
            warn!("failed to release {}: {}", self.id, err);
        } else {
            debug!("released capture source {}", self.id);
        }
    }
}
