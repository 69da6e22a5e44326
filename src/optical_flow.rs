use nalgebra as na;

use crate::frame::PyramidFrame;
use crate::image::*;
use crate::my_types::*;

type Range = [[i16; 2]; 2];

/// Pyramidal Lucas-Kanade search configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct FlowParams {
    /// Side of the square integration window in pixels. Must be odd.
    pub win_size: usize,
    /// Number of downscaled levels searched above the full resolution image.
    pub max_level: usize,
    /// Iteration cap per level.
    pub max_iters: usize,
    /// An iteration whose update is shorter than this (in pixels) terminates the level.
    pub epsilon: f64,
    /// Features whose spatial gradient matrix has a smaller eigenvalue are lost.
    pub min_eig: f64,
}

impl Default for FlowParams {
    fn default() -> Self {
        FlowParams {
            win_size: 15,
            max_level: 2,
            max_iters: 10,
            epsilon: 0.03,
            min_eig: 1e-4,
        }
    }
}

/// Outcome of tracking one feature, index-aligned with the input points.
#[derive(Clone, Copy, Debug)]
pub struct FlowPoint {
    pub point: Vector2d,
    pub found: bool,
    /// Mean absolute intensity difference over the window at full resolution.
    pub error: f64,
}

pub struct OpticalFlow {
    params: FlowParams,
    ix: Matrixd,
    iy: Matrixd,
    it: Matrixd,
    grid: Matrixd,
}

impl OpticalFlow {
    pub fn new(params: FlowParams) -> OpticalFlow {
        let n = params.win_size;
        OpticalFlow {
            params,
            ix: na::DMatrix::zeros(n, n),
            iy: na::DMatrix::zeros(n, n),
            it: na::DMatrix::zeros(n, n),
            grid: na::DMatrix::zeros(n, n),
        }
    }

    pub fn params(&self) -> &FlowParams {
        &self.params
    }

    /// Track `points0` from `pyramid_frame0` into `pyramid_frame1`.
    pub fn process(
        &mut self,
        pyramid_frame0: &PyramidFrame,
        pyramid_frame1: &PyramidFrame,
        points0: &[Vector2d],
    ) -> Vec<FlowPoint> {
        points0
            .iter()
            .map(
                |point0| match self.process_feature(pyramid_frame0, pyramid_frame1, *point0) {
                    Some((point, error)) => FlowPoint {
                        point,
                        found: true,
                        error,
                    },
                    None => FlowPoint {
                        point: *point0,
                        found: false,
                        error: f64::INFINITY,
                    },
                },
            )
            .collect()
    }

    /// ref http://robots.stanford.edu/cs223b04/algo_tracking.pdf
    fn process_feature(
        &mut self,
        pyramid_frame0: &PyramidFrame,
        pyramid_frame1: &PyramidFrame,
        point0: Vector2d,
    ) -> Option<(Vector2d, f64)> {
        let lk_term2 = self.params.epsilon.powi(2);
        let r = (self.params.win_size - 1) / 2;
        let levels = self
            .params
            .max_level
            .min(pyramid_frame0.level_count() - 1)
            .min(pyramid_frame1.level_count() - 1);

        let mut g = Vector2d::zeros();
        let mut d = Vector2d::zeros();
        for level in (0..levels + 1).rev() {
            let level0 = pyramid_frame0.get_image_at_level(level);
            let level1 = pyramid_frame1.get_image_at_level(level);
            let u = point0 / u32::pow(2, level as u32) as f64;
            let range = integration_range(level0, u, r, 1)?;
            // compute the derivative
            scharr(
                level0,
                u,
                range,
                &mut self.ix,
                &mut self.iy,
                &mut self.grid,
            );
            let gradient = spatial_gradient(&self.ix, &self.iy);
            if gradient.symmetric_eigenvalues().min() < self.params.min_eig {
                return None;
            }
            let mut nu = Vector2d::zeros();
            for _ in 0..self.params.max_iters {
                image_difference(range, r, &self.grid, &mut self.it, level1, u + g + nu)?;
                let eta = flow_vector(&gradient, &self.ix, &self.iy, &self.it)?;
                nu += eta;
                if eta.norm_squared() < lk_term2 {
                    break;
                }
            }

            d = nu;
            if level > 0 {
                g = 2. * (g + d)
            }
        }

        let point1 = point0 + g + d;
        if !pyramid_frame1.image.contains(point1) {
            return None;
        }
        let error = self.it.iter().map(|v| v.abs()).sum::<f64>() / self.it.len().max(1) as f64;
        Some((point1, error))
    }
}

fn flow_vector(gradient: &Matrix2d, ix: &Matrixd, iy: &Matrixd, it: &Matrixd) -> Option<Vector2d> {
    let mut b = Vector2d::zeros();

    for y in 0..iy.nrows() {
        for x in 0..ix.ncols() {
            b[0] += it[(y, x)] * ix[(y, x)];
            b[1] += it[(y, x)] * iy[(y, x)];
        }
    }

    gradient.try_inverse().map(|inv_g| inv_g * b)
}

fn image_difference(
    prev_range: Range,
    r: usize,
    i0: &Matrixd,
    it: &mut Matrixd,
    level: &Image,
    center: Vector2d,
) -> Option<()> {
    let range = integration_range(level, center, r, 0)?;
    if range != prev_range {
        return None;
    }
    fill_grid(level, range, center, it);
    *it *= -1.;
    *it += i0.view((1, 1), (it.nrows(), it.ncols()));
    Some(())
}

fn spatial_gradient(ix: &Matrixd, iy: &Matrixd) -> Matrix2d {
    debug_assert_eq!(ix.shape(), iy.shape());

    let mut x2 = 0.;
    let mut y2 = 0.;
    let mut xy = 0.;

    for y in 0..iy.nrows() {
        for x in 0..ix.ncols() {
            x2 += ix[(y, x)] * ix[(y, x)];
            y2 += iy[(y, x)] * iy[(y, x)];
            xy += ix[(y, x)] * iy[(y, x)];
        }
    }

    Matrix2d::new(x2, xy, xy, y2)
}

/// ref https://theailearner.com/tag/scharr-operator/
fn scharr(
    level: &Image,
    center: Vector2d,
    range: Range,
    out_x: &mut Matrixd,
    out_y: &mut Matrixd,
    grid: &mut Matrixd,
) {
    let grange = [
        [range[0][0] - 1, range[0][1] + 1],
        [range[1][0] - 1, range[1][1] + 1],
    ];
    fill_grid(level, grange, center, grid);

    *out_x = Matrixd::zeros(grid.nrows() - 2, grid.ncols() - 2);
    *out_y = Matrixd::zeros(grid.nrows() - 2, grid.ncols() - 2);
    for y in 1..(grid.nrows() - 1) {
        for x in 1..(grid.ncols() - 1) {
            out_x[(y - 1, x - 1)] =
                (10. * grid[(y, x + 1)] + 3. * grid[(y + 1, x + 1)] + 3. * grid[(y - 1, x + 1)]
                    - 10. * grid[(y, x - 1)]
                    - 3. * grid[(y + 1, x - 1)]
                    - 3. * grid[(y - 1, x - 1)])
                    / 32.;
            out_y[(y - 1, x - 1)] =
                (10. * grid[(y + 1, x)] + 3. * grid[(y + 1, x + 1)] + 3. * grid[(y + 1, x - 1)]
                    - 10. * grid[(y - 1, x)]
                    - 3. * grid[(y - 1, x + 1)]
                    - 3. * grid[(y - 1, x - 1)])
                    / 32.;
        }
    }
}

fn fill_grid(level: &Image, range: Range, center: Vector2d, grid: &mut Matrixd) {
    *grid = na::DMatrix::zeros(
        (range[1][1] - range[1][0] + 1) as usize,
        (range[0][1] - range[0][0] + 1) as usize,
    );

    for (y_ind, y) in (range[1][0]..=range[1][1]).enumerate() {
        for (x_ind, x) in (range[0][0]..=range[0][1]).enumerate() {
            grid[(y_ind, x_ind)] = bilinear(level, center + Vector2d::new(x as f64, y as f64));
        }
    }
}

/// Returns closed range of integer steps that can be taken without going outside
/// the image borders. Returns None if the center point is outside the level
/// boundaries.
fn integration_range(level: &Image, center: Vector2d, r: usize, padding: i16) -> Option<Range> {
    let r = r as i16;
    let mut range = [[0, 0], [0, 0]];
    for i in 0..2 {
        let s = if i == 0 { level.width } else { level.height };
        if center[i] < 0. || center[i] > (s as f64 - 1.) {
            return None;
        }
        let n = center[i] as i16;
        let fract = if center[i].fract() > 0. { 1 } else { 0 };
        range[i] = [
            i16::max(-r, -n + padding),
            i16::min(r, s as i16 - n - padding - 1 - fract),
        ];
        if range[i][0] > range[i][1] {
            return None;
        }
    }
    Some(range)
}
