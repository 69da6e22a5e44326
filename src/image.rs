use opencv::{core, imgproc, prelude::*};

use crate::error::{FlowError, Result};
use crate::my_types::*;

/// Row-major grayscale image storage
#[derive(Clone, Debug)]
pub struct Image {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
}

impl Image {
    /// Create an empty image
    pub fn empty() -> Image {
        Image {
            data: vec![],
            width: 0,
            height: 0,
        }
    }

    /// Luminance of a BGR frame as delivered by the capture device.
    pub fn from_bgr(frame: &Mat) -> Result<Image> {
        if frame.typ() != core::CV_8UC3 {
            return Err(FlowError::degraded(format!(
                "expected an 8-bit BGR frame, got type {}",
                frame.typ()
            )));
        }
        if frame.rows() == 0 || frame.cols() == 0 {
            return Err(FlowError::degraded("empty frame"));
        }
        let mut gray = Mat::default();
        imgproc::cvt_color(frame, &mut gray, imgproc::COLOR_BGR2GRAY, 0)?;
        Ok(Image {
            data: gray.data_bytes()?.to_vec(),
            width: gray.cols() as usize,
            height: gray.rows() as usize,
        })
    }

    pub fn same_size(&self, other: &Image) -> bool {
        self.width == other.width && self.height == other.height
    }

    pub fn contains(&self, point: Vector2d) -> bool {
        point.x >= 0.
            && point.y >= 0.
            && point.x <= self.width as f64 - 1.
            && point.y <= self.height as f64 - 1.
    }

    #[inline(always)]
    pub fn value(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.width + x]
    }

    #[inline(always)]
    pub fn value_i32(&self, x: i32, y: i32) -> u8 {
        self.data[y as usize * self.width + x as usize]
    }

    #[inline(always)]
    #[cfg(test)]
    pub fn set_value(&mut self, x: usize, y: usize, value: u8) {
        self.data[y * self.width + x] = value;
    }

    /// Copy `patch` into this image with its top-left corner at (x, y).
    #[cfg(test)]
    pub fn set_sub_image_i32(&mut self, x: i32, y: i32, patch: &Image) {
        for py in 0..patch.height {
            for px in 0..patch.width {
                let tx = x + px as i32;
                let ty = y + py as i32;
                if tx < 0 || ty < 0 || tx >= self.width as i32 || ty >= self.height as i32 {
                    continue;
                }
                self.set_value(tx as usize, ty as usize, patch.value(px, py));
            }
        }
    }
}

/// Bilinear sample, clamped to the image border.
pub fn bilinear(image: &Image, point: Vector2d) -> f64 {
    let max_x = image.width as i32 - 1;
    let max_y = image.height as i32 - 1;
    let fx = point.x.floor();
    let fy = point.y.floor();
    let ax = point.x - fx;
    let ay = point.y - fy;
    let x0 = (fx as i32).clamp(0, max_x);
    let y0 = (fy as i32).clamp(0, max_y);
    let x1 = (x0 + 1).min(max_x);
    let y1 = (y0 + 1).min(max_y);

    let v = |x: i32, y: i32| image.value_i32(x, y) as f64;
    (1. - ax) * (1. - ay) * v(x0, y0)
        + ax * (1. - ay) * v(x1, y0)
        + (1. - ax) * ay * v(x0, y1)
        + ax * ay * v(x1, y1)
}
