use std::path::PathBuf;

use anyhow::{ensure, Result};
use clap::Parser;

use crate::detector::FeatureParams;
use crate::optical_flow::FlowParams;
use crate::recorder::{FourCc, RecorderParams};
use crate::source::SourceId;
use crate::tracker::ReseedPolicy;

#[derive(Clone, Debug, Parser)]
pub struct Config {
    /// Capture device index or video file path.
    #[clap(long, default_value = "0")]
    pub source: SourceId,

    /// Frames between two re-detections of the feature set.
    #[clap(long, default_value = "500")]
    pub refresh_period: usize,

    /// `periodic` or `on-failure`.
    #[clap(long, default_value = "on-failure")]
    pub reseed_policy: ReseedPolicy,

    #[clap(long, default_value = "100")]
    pub max_corners: usize,

    #[clap(long, default_value = "0.2")]
    pub quality_level: f64,

    #[clap(long, default_value = "7")]
    pub min_distance: f64,

    #[clap(long, default_value = "7")]
    pub block_size: usize,

    #[clap(long, default_value = "15")]
    pub win_size: usize,

    #[clap(long, default_value = "2")]
    pub max_level: usize,

    #[clap(long, default_value = "10")]
    pub max_iters: usize,

    #[clap(long, default_value = "0.03")]
    pub epsilon: f64,

    /// Drop tracked features whose window error exceeds this value.
    #[clap(long)]
    pub max_flow_error: Option<f64>,

    #[clap(long, default_value = "300")]
    pub palette_size: usize,

    /// Seed of the trail color generator.
    #[clap(long, default_value = "0")]
    pub seed: u64,

    /// FourCC of the recording codec.
    #[clap(long, default_value = "mp4v")]
    pub codec: FourCc,

    #[clap(long, default_value = "recordings")]
    pub output_dir: PathBuf,

    #[clap(long, default_value = "95")]
    pub jpeg_quality: i32,

    /// Print the publishing frame rate on every frame.
    #[clap(long)]
    pub show_fps: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config::parse_from(["flowcam"])
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.refresh_period > 0, "refresh period must be positive");
        ensure!(
            self.palette_size >= self.max_corners,
            "palette of {} colors cannot cover {} corners",
            self.palette_size,
            self.max_corners
        );
        ensure!(
            self.quality_level > 0. && self.quality_level <= 1.,
            "quality level must be in (0, 1]"
        );
        ensure!(self.min_distance >= 0., "min distance must not be negative");
        ensure!(
            self.block_size >= 3 && self.block_size % 2 == 1,
            "block size must be odd and at least 3"
        );
        ensure!(
            self.win_size >= 3 && self.win_size % 2 == 1,
            "search window must be odd and at least 3"
        );
        ensure!(self.max_iters > 0, "flow needs at least one iteration");
        ensure!(self.epsilon > 0., "flow epsilon must be positive");
        ensure!(
            (0..=100).contains(&self.jpeg_quality),
            "jpeg quality must be within 0..=100"
        );
        Ok(())
    }

    pub fn feature_params(&self) -> FeatureParams {
        FeatureParams {
            max_corners: self.max_corners,
            quality_level: self.quality_level,
            min_distance: self.min_distance,
            block_size: self.block_size,
        }
    }

    pub fn flow_params(&self) -> FlowParams {
        FlowParams {
            win_size: self.win_size,
            max_level: self.max_level,
            max_iters: self.max_iters,
            epsilon: self.epsilon,
            ..FlowParams::default()
        }
    }

    pub fn recorder_params(&self) -> RecorderParams {
        RecorderParams {
            output_dir: self.output_dir.clone(),
            codec: self.codec,
        }
    }
}
