use std::cmp::Ordering;

use crate::image::Image;
use crate::my_types::*;

/// Corner selection thresholds.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureParams {
    /// Upper bound on the number of returned corners.
    pub max_corners: usize,
    /// Corners weaker than `quality_level` times the strongest response are rejected.
    pub quality_level: f64,
    /// Minimum euclidean distance between two returned corners.
    pub min_distance: f64,
    /// Side of the window over which the structure tensor is summed.
    pub block_size: usize,
}

impl Default for FeatureParams {
    fn default() -> Self {
        FeatureParams {
            max_corners: 100,
            quality_level: 0.2,
            min_distance: 7.,
            block_size: 7,
        }
    }
}

/// Shi-Tomasi corner detector: the corner score of a pixel is the smaller
/// eigenvalue of its structure tensor.
pub struct Detector {
    params: FeatureParams,
    response: Vec<f64>,
}

struct Candidate {
    score: f64,
    x: usize,
    y: usize,
}

impl Detector {
    pub fn new(params: FeatureParams) -> Self {
        Detector {
            params,
            response: vec![],
        }
    }

    pub fn params(&self) -> &FeatureParams {
        &self.params
    }

    /// Strongest corners first, at most `max_corners`, pairwise at least
    /// `min_distance` apart.
    pub fn detect(&mut self, image: &Image) -> Vec<Vector2d> {
        let w = image.width;
        let h = image.height;
        let r = self.params.block_size / 2;
        // Sobel taps and the tensor window both need valid neighbours.
        let border = r + 1;
        if self.params.max_corners == 0 || w <= 2 * border || h <= 2 * border {
            return vec![];
        }

        self.compute_response(image);
        let max_response = self.response.iter().cloned().fold(0., f64::max);
        if max_response <= 0. {
            return vec![];
        }
        let threshold = self.params.quality_level * max_response;

        let mut candidates = vec![];
        for y in border..(h - border) {
            for x in border..(w - border) {
                let score = self.response[y * w + x];
                if score > threshold && self.is_local_maximum(w, x, y) {
                    candidates.push(Candidate { score, x, y });
                }
            }
        }
        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then((a.y, a.x).cmp(&(b.y, b.x)))
        });

        let min_distance2 = self.params.min_distance.powi(2);
        let mut corners: Vec<Vector2d> = vec![];
        for candidate in candidates {
            let point = Vector2d::new(candidate.x as f64, candidate.y as f64);
            if corners
                .iter()
                .any(|c| (c - point).norm_squared() < min_distance2)
            {
                continue;
            }
            corners.push(point);
            if corners.len() == self.params.max_corners {
                break;
            }
        }
        corners
    }

    fn is_local_maximum(&self, w: usize, x: usize, y: usize) -> bool {
        let score = self.response[y * w + x];
        for ny in (y - 1)..=(y + 1) {
            for nx in (x - 1)..=(x + 1) {
                if self.response[ny * w + nx] > score {
                    return false;
                }
            }
        }
        true
    }

    /// Minimum eigenvalue of the block-summed structure tensor at every pixel.
    fn compute_response(&mut self, image: &Image) {
        let w = image.width;
        let h = image.height;
        let r = (self.params.block_size / 2) as isize;

        // Sobel gradients, zero on the one pixel border.
        let mut ixx = vec![0.; w * h];
        let mut iyy = vec![0.; w * h];
        let mut ixy = vec![0.; w * h];
        let v = |x: usize, y: usize| image.value(x, y) as f64;
        for y in 1..(h - 1) {
            for x in 1..(w - 1) {
                let gx = (v(x + 1, y - 1) + 2. * v(x + 1, y) + v(x + 1, y + 1)
                    - v(x - 1, y - 1)
                    - 2. * v(x - 1, y)
                    - v(x - 1, y + 1))
                    / 8.;
                let gy = (v(x - 1, y + 1) + 2. * v(x, y + 1) + v(x + 1, y + 1)
                    - v(x - 1, y - 1)
                    - 2. * v(x, y - 1)
                    - v(x + 1, y - 1))
                    / 8.;
                let i = y * w + x;
                ixx[i] = gx * gx;
                iyy[i] = gy * gy;
                ixy[i] = gx * gy;
            }
        }

        let sxx = IntegralImage::new(&ixx, w, h);
        let syy = IntegralImage::new(&iyy, w, h);
        let sxy = IntegralImage::new(&ixy, w, h);

        self.response.clear();
        self.response.resize(w * h, 0.);
        for y in 0..h {
            let y0 = (y as isize - r).max(0) as usize;
            let y1 = (y as isize + r).min(h as isize - 1) as usize;
            for x in 0..w {
                let x0 = (x as isize - r).max(0) as usize;
                let x1 = (x as isize + r).min(w as isize - 1) as usize;
                let a = sxx.sum(x0, y0, x1, y1);
                let c = syy.sum(x0, y0, x1, y1);
                let b = sxy.sum(x0, y0, x1, y1);
                let half_trace = (a + c) / 2.;
                let root = (((a - c) / 2.).powi(2) + b * b).sqrt();
                self.response[y * w + x] = (half_trace - root).max(0.);
            }
        }
    }
}

/// Summed-area table for constant time box sums.
struct IntegralImage {
    sums: Vec<f64>,
    stride: usize,
}

impl IntegralImage {
    fn new(values: &[f64], w: usize, h: usize) -> Self {
        let stride = w + 1;
        let mut sums = vec![0.; stride * (h + 1)];
        for y in 0..h {
            let mut row = 0.;
            for x in 0..w {
                row += values[y * w + x];
                sums[(y + 1) * stride + x + 1] = sums[y * stride + x + 1] + row;
            }
        }
        IntegralImage { sums, stride }
    }

    /// Sum over the closed box [x0, x1] x [y0, y1].
    fn sum(&self, x0: usize, y0: usize, x1: usize, y1: usize) -> f64 {
        let s = self.stride;
        self.sums[(y1 + 1) * s + x1 + 1] - self.sums[y0 * s + x1 + 1] - self.sums[(y1 + 1) * s + x0]
            + self.sums[y0 * s + x0]
    }
}
