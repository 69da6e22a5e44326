//! Synthetic frames, an in-memory frame source and a recording sink log for
//! unit tests.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use opencv::{
    core::{self, Mat, Rect, Scalar, Size},
    imgproc,
    prelude::*,
};
use parking_lot::Mutex;

use crate::error::Result;
use crate::recorder::{FourCc, SinkFactory, VideoSink};
use crate::source::{FrameSource, Geometry};

pub const WIDTH: i32 = 160;
pub const HEIGHT: i32 = 120;

pub fn frame_size() -> Size {
    Size::new(WIDTH, HEIGHT)
}

pub fn test_geometry() -> Geometry {
    Geometry {
        width: WIDTH,
        height: HEIGHT,
        fps: 25.,
    }
}

fn filled(rows: i32, cols: i32, value: f64) -> Mat {
    Mat::new_rows_cols_with_default(rows, cols, core::CV_8UC3, Scalar::all(value)).unwrap()
}

/// Three blurred squares translating by (step, step / 2) pixels per frame.
pub fn moving_squares(count: usize, step: i32) -> Vec<Mat> {
    let squares = [(30, 25, 200.), (90, 30, 140.), (50, 70, 250.)];
    (0..count as i32)
        .map(|i| {
            let mut frame = filled(HEIGHT, WIDTH, 30.);
            for (x, y, value) in squares {
                imgproc::rectangle(
                    &mut frame,
                    Rect::new(x + step * i, y + step * i / 2, 16, 16),
                    Scalar::all(value),
                    imgproc::FILLED,
                    imgproc::LINE_8,
                    0,
                )
                .unwrap();
            }
            let mut blurred = Mat::default();
            imgproc::gaussian_blur(
                &frame,
                &mut blurred,
                Size::new(5, 5),
                1.2,
                1.2,
                core::BORDER_DEFAULT,
            )
            .unwrap();
            blurred
        })
        .collect()
}

/// A frame whose size differs from [`moving_squares`].
pub fn malformed_frame() -> Mat {
    filled(HEIGHT / 2, WIDTH / 2, 90.)
}

pub fn blank_frame() -> Mat {
    filled(HEIGHT, WIDTH, 0.)
}

pub struct MemorySource {
    frames: VecDeque<Mat>,
}

impl MemorySource {
    pub fn new(frames: Vec<Mat>) -> Self {
        MemorySource {
            frames: frames.into(),
        }
    }
}

impl FrameSource for MemorySource {
    fn read(&mut self) -> Result<Option<Mat>> {
        Ok(self.frames.pop_front())
    }

    fn geometry(&self) -> Result<Geometry> {
        Ok(test_geometry())
    }
}

#[derive(Debug)]
struct SinkRecord {
    path: PathBuf,
    frames: usize,
    last_frame: Option<Vec<u8>>,
    released: bool,
    writes_after_release: usize,
}

/// Shared log of every sink opened by a [`MemorySinkFactory`].
#[derive(Clone, Default)]
pub struct SinkLog(Arc<Mutex<Vec<SinkRecord>>>);

impl SinkLog {
    pub fn opened(&self) -> Vec<PathBuf> {
        self.0.lock().iter().map(|r| r.path.clone()).collect()
    }

    pub fn frames(&self, index: usize) -> usize {
        self.0.lock()[index].frames
    }

    /// Pixels of the last frame written to sink `index`.
    pub fn last_frame(&self, index: usize) -> Option<Vec<u8>> {
        self.0.lock()[index].last_frame.clone()
    }

    pub fn total_frames(&self) -> usize {
        self.0.lock().iter().map(|r| r.frames).sum()
    }

    pub fn released(&self, index: usize) -> bool {
        self.0.lock()[index].released
    }

    pub fn writes_after_release(&self) -> usize {
        self.0.lock().iter().map(|r| r.writes_after_release).sum()
    }
}

pub struct MemorySinkFactory {
    log: SinkLog,
}

impl MemorySinkFactory {
    pub fn new(log: SinkLog) -> Self {
        MemorySinkFactory { log }
    }
}

impl SinkFactory for MemorySinkFactory {
    fn open(&self, path: &Path, _codec: FourCc, _geometry: Geometry) -> Result<Box<dyn VideoSink>> {
        let mut records = self.log.0.lock();
        records.push(SinkRecord {
            path: path.to_path_buf(),
            frames: 0,
            last_frame: None,
            released: false,
            writes_after_release: 0,
        });
        Ok(Box::new(MemorySink {
            log: self.log.clone(),
            index: records.len() - 1,
        }))
    }
}

struct MemorySink {
    log: SinkLog,
    index: usize,
}

impl VideoSink for MemorySink {
    fn write(&mut self, frame: &Mat) -> Result<()> {
        let mut records = self.log.0.lock();
        let record = &mut records[self.index];
        if record.released {
            record.writes_after_release += 1;
        } else {
            record.frames += 1;
            record.last_frame = Some(frame.data_bytes()?.to_vec());
        }
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        self.log.0.lock()[self.index].released = true;
        Ok(())
    }
}
