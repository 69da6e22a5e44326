use anyhow::Result;

use crate::image::Image;
use crate::pyramid::Pyramid;

/// A luminance frame together with its downscaled levels.
#[derive(Debug)]
pub struct PyramidFrame {
    /// original image
    pub image: Image,
    /// downsized images
    pub pyramid: Pyramid,
}

impl PyramidFrame {
    pub fn new(image: Image, levels: usize) -> Result<PyramidFrame> {
        let mut pyramid = Pyramid::empty();
        pyramid.compute(&image, levels)?;
        Ok(PyramidFrame { image, pyramid })
    }

    pub fn level_count(&self) -> usize {
        self.pyramid.levels.len() + 1
    }

    pub fn get_image_at_level(&self, level: usize) -> &Image {
        if level == 0 {
            &self.image
        } else {
            &self.pyramid.levels[level - 1]
        }
    }
}
