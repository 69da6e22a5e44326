use opencv::{
    core::{self, Mat, Point, Scalar},
    imgproc,
    prelude::*,
};
use rand::Rng;

use crate::my_types::*;

const TRAIL_THICKNESS: i32 = 2;
const MARKER_RADIUS: i32 = 5;

/// Fixed table of display colors, one per feature slot.
#[derive(Clone, Debug)]
pub struct Palette {
    colors: Vec<Scalar>,
}

impl Palette {
    pub fn random<R: Rng>(size: usize, rng: &mut R) -> Palette {
        let colors = (0..size.max(1))
            .map(|_| {
                Scalar::new(
                    rng.gen_range(0..255) as f64,
                    rng.gen_range(0..255) as f64,
                    rng.gen_range(0..255) as f64,
                    0.,
                )
            })
            .collect();
        Palette { colors }
    }

    /// Color for feature slot `index`, wrapping around the table.
    pub fn color(&self, index: usize) -> Scalar {
        self.colors[index % self.colors.len()]
    }
}

fn to_cv_point(point: &Vector2d) -> Point {
    Point::new(point.x as i32, point.y as i32)
}

/// All-zero image with the size and type of `frame`.
pub fn blank_like(frame: &Mat) -> opencv::Result<Mat> {
    Mat::new_rows_cols_with_default(frame.rows(), frame.cols(), frame.typ(), Scalar::all(0.))
}

/// Motion segment from the previous to the current feature position.
pub fn draw_trail(
    mask: &mut Mat,
    old: &Vector2d,
    new: &Vector2d,
    color: Scalar,
) -> opencv::Result<()> {
    imgproc::line(
        mask,
        to_cv_point(new),
        to_cv_point(old),
        color,
        TRAIL_THICKNESS,
        imgproc::LINE_8,
        0,
    )
}

/// Filled dot at the current feature position.
pub fn draw_marker(frame: &mut Mat, point: &Vector2d, color: Scalar) -> opencv::Result<()> {
    imgproc::circle(
        frame,
        to_cv_point(point),
        MARKER_RADIUS,
        color,
        imgproc::FILLED,
        imgproc::LINE_8,
        0,
    )
}

/// Saturating per-pixel sum of the frame and the trail mask.
pub fn overlay(frame: &Mat, mask: &Mat) -> opencv::Result<Mat> {
    let mut out = Mat::default();
    core::add(frame, mask, &mut out, &Mat::default(), -1)?;
    Ok(out)
}

pub fn draw_fps(frame: &mut Mat, fps: f64) -> opencv::Result<()> {
    imgproc::put_text(
        frame,
        &format!("FPS: {fps:.2}"),
        Point::new(20, 20),
        imgproc::FONT_HERSHEY_DUPLEX,
        0.7,
        Scalar::new(255., 255., 255., 0.),
        1,
        imgproc::LINE_AA,
        false,
    )
}

/// True when every channel of every pixel is zero.
pub fn is_blank(image: &Mat) -> opencv::Result<bool> {
    let sum = core::sum_elems(image)?;
    Ok(sum.0.iter().all(|v| *v == 0.))
}
