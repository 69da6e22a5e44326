use nalgebra as na;

pub type Vector2d = na::Vector2<f64>;
pub type Matrix2d = na::Matrix2<f64>;

pub type Matrixd = nalgebra::DMatrix<f64>;
