use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context as AnyhowContext};
use opencv::{core::Mat, prelude::*};
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::detector::Detector;
use crate::error::{FlowError, Result};
use crate::frame::PyramidFrame;
use crate::image::Image;
use crate::my_types::*;
use crate::optical_flow::{FlowPoint, OpticalFlow};
use crate::source::{FrameSource, Geometry};
use crate::visualization::*;

/// What the engine does after a flow update fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReseedPolicy {
    /// Keep the current feature set until the next periodic re-seed.
    Periodic,
    /// Re-seed on the next call.
    OnFailure,
}

impl FromStr for ReseedPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "periodic" => Ok(ReseedPolicy::Periodic),
            "on-failure" => Ok(ReseedPolicy::OnFailure),
            _ => bail!("unknown re-seed policy {s:?}, expected `periodic` or `on-failure`"),
        }
    }
}

impl fmt::Display for ReseedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReseedPolicy::Periodic => write!(f, "periodic"),
            ReseedPolicy::OnFailure => write!(f, "on-failure"),
        }
    }
}

/// Working set of one seeding of the tracker.
///
/// Built in one piece by [`TrackingState::seed`] and replaced wholesale on the
/// next re-seed.
pub struct TrackingState {
    /// Colors indexed by feature slot.
    pub palette: Palette,
    /// Accumulated motion segments since this state was seeded.
    pub trail_mask: Mat,
    pub last_gray: PyramidFrame,
    /// Positions in `last_gray` of the features still being tracked.
    pub last_features: Vec<Vector2d>,
    /// Survivors of the last flow update at their previous positions.
    pub previous_features: Vec<Vector2d>,
    /// Survivors of the last flow update at their new positions.
    pub current_features: Vec<Vector2d>,
    pub last_frame: Mat,
    /// Latest annotated output, `None` until the first successful update.
    pub current_frame: Option<Mat>,
    /// Frames processed since seeding.
    pub frame_count: usize,
}

impl TrackingState {
    pub fn seed(
        frame: &Mat,
        detector: &mut Detector,
        pyramid_levels: usize,
        palette: Palette,
    ) -> Result<TrackingState> {
        let gray = Image::from_bgr(frame)?;
        let last_features = detector.detect(&gray);
        let last_gray = PyramidFrame::new(gray, pyramid_levels).map_err(FlowError::degraded)?;
        Ok(TrackingState {
            palette,
            trail_mask: blank_like(frame)?,
            last_gray,
            last_features,
            previous_features: vec![],
            current_features: vec![],
            last_frame: frame.try_clone()?,
            current_frame: None,
            frame_count: 0,
        })
    }
}

/// Sparse optical flow over a frame source with periodic re-seeding.
///
/// One engine processes frames strictly one at a time; it is shared between
/// callers behind a lock by [`crate::publisher::FramePublisher`].
pub struct TrackingEngine {
    source: Box<dyn FrameSource>,
    detector: Detector,
    flow: OpticalFlow,
    policy: ReseedPolicy,
    refresh_period: usize,
    max_flow_error: Option<f64>,
    palette_size: usize,
    rng: Xoshiro256PlusPlus,
    state: Option<TrackingState>,
    reseed_pending: bool,
    reseeds: usize,
    degraded_frames: usize,
}

impl TrackingEngine {
    pub fn new(source: Box<dyn FrameSource>, config: &Config) -> anyhow::Result<Self> {
        config.validate().context("invalid tracking configuration")?;
        Ok(TrackingEngine {
            source,
            detector: Detector::new(config.feature_params()),
            flow: OpticalFlow::new(config.flow_params()),
            policy: config.reseed_policy,
            refresh_period: config.refresh_period,
            max_flow_error: config.max_flow_error,
            palette_size: config.palette_size,
            rng: Xoshiro256PlusPlus::seed_from_u64(config.seed),
            state: None,
            reseed_pending: false,
            reseeds: 0,
            degraded_frames: 0,
        })
    }

    pub fn state(&self) -> Option<&TrackingState> {
        self.state.as_ref()
    }

    pub fn policy(&self) -> ReseedPolicy {
        self.policy
    }

    /// Number of re-seeds performed so far.
    pub fn reseeds(&self) -> usize {
        self.reseeds
    }

    /// Number of frames on which the flow update failed.
    pub fn degraded_frames(&self) -> usize {
        self.degraded_frames
    }

    pub fn geometry(&self) -> Result<Geometry> {
        self.source.geometry()
    }

    /// Next frame from the source, bypassing the tracker.
    pub fn read_frame(&mut self) -> Result<Mat> {
        self.source.read()?.ok_or(FlowError::SourceExhausted)
    }

    /// Track one frame and return it annotated with motion trails.
    ///
    /// Pulls from the source when `frame` is `None`. Only source failures are
    /// returned; a failed flow update yields the previous annotated frame.
    pub fn advance(&mut self, frame: Option<Mat>) -> Result<Mat> {
        let frame = match frame {
            Some(frame) => frame,
            None => self.read_frame()?,
        };

        let mut reseeded = false;
        if self.reseed_due() {
            let forced = self.state.is_none() || self.reseed_pending;
            if let Err(err) = self.reseed(&frame, forced) {
                self.degraded_frames += 1;
                if self.policy == ReseedPolicy::Periodic && self.state.is_some() {
                    warn!(%err, "re-seed failed, keeping the current feature set");
                } else {
                    warn!(%err, "re-seed failed, retrying on the next frame");
                    self.reseed_pending = true;
                }
                if let Some(state) = self.state.as_mut() {
                    state.frame_count += 1;
                }
                return self.held_frame(frame);
            }
            reseeded = true;
        }

        if let Some(state) = self.state.as_mut() {
            state.frame_count += 1;
        }

        // a freshly seeded set has no motion to draw yet
        match self.update(&frame, !reseeded) {
            Ok(annotated) => Ok(annotated),
            Err(err) => {
                debug!(%err, policy = %self.policy, "holding last annotated frame");
                self.degraded_frames += 1;
                if self.policy == ReseedPolicy::OnFailure {
                    self.reseed_pending = true;
                }
                self.held_frame(frame)
            }
        }
    }

    fn reseed_due(&self) -> bool {
        match &self.state {
            None => true,
            Some(state) => self.reseed_pending || state.frame_count % self.refresh_period == 0,
        }
    }

    /// Replace the state with one seeded from `frame`.
    ///
    /// A scheduled re-seed refuses a frame whose size differs from the one
    /// being tracked, so the current state survives a malformed frame. A
    /// forced re-seed accepts any frame.
    fn reseed(&mut self, frame: &Mat, forced: bool) -> Result<()> {
        if let (false, Some(state)) = (forced, &self.state) {
            let tracked = &state.last_gray.image;
            if frame.cols() as usize != tracked.width || frame.rows() as usize != tracked.height {
                return Err(FlowError::degraded(format!(
                    "re-seed frame is {}x{}, tracking {}x{}",
                    frame.cols(),
                    frame.rows(),
                    tracked.width,
                    tracked.height
                )));
            }
        }
        let palette = Palette::random(self.palette_size, &mut self.rng);
        let pyramid_levels = self.flow.params().max_level;
        let state = TrackingState::seed(frame, &mut self.detector, pyramid_levels, palette)?;
        info!(
            features = state.last_features.len(),
            reseeds = self.reseeds + 1,
            "seeded feature set"
        );
        self.state = Some(state);
        self.reseed_pending = false;
        self.reseeds += 1;
        Ok(())
    }

    fn held_frame(&self, frame: Mat) -> Result<Mat> {
        match self.state.as_ref().and_then(|s| s.current_frame.as_ref()) {
            Some(held) => Ok(held.try_clone()?),
            None => Ok(frame),
        }
    }

    /// One flow step. Leaves the state untouched unless it succeeds up to
    /// the drawing stage.
    fn update(&mut self, frame: &Mat, draw_trails: bool) -> Result<Mat> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| FlowError::degraded("no tracking state"))?;
        if state.last_features.is_empty() {
            return Err(FlowError::degraded("no features to track"));
        }

        let gray = Image::from_bgr(frame)?;
        if !gray.same_size(&state.last_gray.image) {
            return Err(FlowError::degraded(format!(
                "frame is {}x{}, tracking {}x{}",
                gray.width, gray.height, state.last_gray.image.width, state.last_gray.image.height
            )));
        }
        let current_gray = PyramidFrame::new(gray, self.flow.params().max_level)
            .map_err(FlowError::degraded)?;

        let flow = self
            .flow
            .process(&state.last_gray, &current_gray, &state.last_features);
        let (good_old, good_new) = select_tracked(&state.last_features, &flow, self.max_flow_error);

        let annotated = draw_tracks(frame, state, &good_old, &good_new, draw_trails)
            .map_err(|err| FlowError::degraded(format!("drawing tracks failed: {err}")))?;

        state.current_frame = Some(annotated.try_clone()?);
        state.last_frame = frame.try_clone()?;
        state.last_gray = current_gray;
        state.last_features = good_new.clone();
        state.previous_features = good_old;
        state.current_features = good_new;
        Ok(annotated)
    }
}

/// Features whose flow was found, as index-aligned (old, new) lists.
pub fn select_tracked(
    old: &[Vector2d],
    flow: &[FlowPoint],
    max_error: Option<f64>,
) -> (Vec<Vector2d>, Vec<Vector2d>) {
    old.iter()
        .zip(flow)
        .filter(|(_, p)| p.found && max_error.map_or(true, |max| p.error <= max))
        .map(|(o, p)| (*o, p.point))
        .unzip()
}

fn draw_tracks(
    frame: &Mat,
    state: &mut TrackingState,
    good_old: &[Vector2d],
    good_new: &[Vector2d],
    draw_trails: bool,
) -> opencv::Result<Mat> {
    let mut marked = frame.try_clone()?;
    for (i, (old, new)) in good_old.iter().zip(good_new).enumerate() {
        let color = state.palette.color(i);
        if draw_trails {
            draw_trail(&mut state.trail_mask, old, new, color)?;
        }
        draw_marker(&mut marked, new, color)?;
    }
    overlay(&marked, &state.trail_mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;

    fn engine(frames: Vec<Mat>, config: &Config) -> TrackingEngine {
        TrackingEngine::new(Box::new(MemorySource::new(frames)), config).unwrap()
    }

    fn same_pixels(a: &Mat, b: &Mat) -> bool {
        a.size().unwrap() == b.size().unwrap()
            && a.data_bytes().unwrap() == b.data_bytes().unwrap()
    }

    #[test]
    fn test_first_call_seeds() {
        let config = Config::default();
        let mut engine = engine(moving_squares(1, 0), &config);
        assert!(engine.state().is_none());
        let out = engine.advance(None).unwrap();
        assert_eq!(out.size().unwrap(), frame_size());
        assert_eq!(engine.reseeds(), 1);
        let state = engine.state().unwrap();
        assert!(!state.last_features.is_empty());
        assert_eq!(state.frame_count, 1);
        assert!(is_blank(&state.trail_mask).unwrap());
    }

    #[test]
    fn test_seed_has_blank_trail_mask() {
        let config = Config::default();
        let frames = moving_squares(1, 0);
        let mut detector = Detector::new(config.feature_params());
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(0);
        let state =
            TrackingState::seed(&frames[0], &mut detector, 2, Palette::random(300, &mut rng))
                .unwrap();
        assert!(is_blank(&state.trail_mask).unwrap());
        assert_eq!(state.trail_mask.size().unwrap(), frame_size());
        assert_eq!(state.frame_count, 0);
        assert!(state.current_frame.is_none());
        assert!(!state.last_features.is_empty());
    }

    #[test]
    fn test_periodic_reseed() {
        let config = Config {
            refresh_period: 4,
            reseed_policy: ReseedPolicy::Periodic,
            ..Config::default()
        };
        let mut engine = engine(moving_squares(13, 1), &config);
        let mut reseeded_at = vec![];
        for i in 0..13 {
            let before = engine.reseeds();
            engine.advance(None).unwrap();
            if engine.reseeds() > before {
                reseeded_at.push(i);
                let state = engine.state().unwrap();
                assert!(is_blank(&state.trail_mask).unwrap());
                assert!(state.current_frame.is_some());
            } else {
                assert!(!is_blank(&engine.state().unwrap().trail_mask).unwrap());
            }
        }
        assert_eq!(reseeded_at, vec![0, 4, 8, 12]);
        assert!(matches!(
            engine.advance(None),
            Err(FlowError::SourceExhausted)
        ));
    }

    #[test]
    fn test_features_stay_aligned() {
        let config = Config::default();
        let mut engine = engine(moving_squares(8, 2), &config);
        for _ in 0..8 {
            engine.advance(None).unwrap();
            let state = engine.state().unwrap();
            assert_eq!(state.previous_features.len(), state.current_features.len());
            assert_eq!(state.last_features.len(), state.current_features.len());
            assert_eq!(state.trail_mask.size().unwrap(), frame_size());
        }
        let state = engine.state().unwrap();
        assert!(!state.current_features.is_empty());
        assert!(!is_blank(&state.trail_mask).unwrap());
        assert_eq!(engine.degraded_frames(), 0);
    }

    #[test]
    fn test_tracks_follow_motion() {
        let config = Config::default();
        let mut engine = engine(moving_squares(2, 2), &config);
        engine.advance(None).unwrap();
        engine.advance(None).unwrap();
        let state = engine.state().unwrap();
        assert!(!state.current_features.is_empty());
        for (old, new) in state.previous_features.iter().zip(&state.current_features) {
            let motion = new - old;
            assert!((motion - Vector2d::new(2., 1.)).norm() < 1., "motion {motion:?}");
        }
    }

    fn degraded_sequence() -> Vec<Mat> {
        let mut frames = moving_squares(5, 1);
        frames[3] = malformed_frame();
        frames
    }

    #[test]
    fn test_degraded_frame_periodic() {
        let config = Config {
            refresh_period: 10,
            reseed_policy: ReseedPolicy::Periodic,
            ..Config::default()
        };
        let mut engine = engine(degraded_sequence(), &config);
        let mut outputs = vec![];
        for _ in 0..5 {
            outputs.push(engine.advance(None).unwrap());
        }
        assert!(same_pixels(&outputs[3], &outputs[2]));
        assert_eq!(engine.degraded_frames(), 1);
        // the fifth frame continues from the state of the third
        assert_eq!(engine.reseeds(), 1);
        assert_eq!(engine.state().unwrap().frame_count, 5);
        assert_eq!(outputs[4].size().unwrap(), frame_size());
    }

    #[test]
    fn test_malformed_frame_on_reseed_periodic() {
        let config = Config {
            refresh_period: 3,
            reseed_policy: ReseedPolicy::Periodic,
            ..Config::default()
        };
        let mut engine = engine(degraded_sequence(), &config);
        let mut outputs = vec![];
        for _ in 0..5 {
            outputs.push(engine.advance(None).unwrap());
        }
        // the fourth frame was due for a re-seed but is malformed
        assert!(same_pixels(&outputs[3], &outputs[2]));
        assert_eq!(engine.degraded_frames(), 1);
        assert_eq!(engine.reseeds(), 1);
        let state = engine.state().unwrap();
        assert_eq!(state.frame_count, 5);
        assert!(!state.current_features.is_empty());
        assert!(!is_blank(&state.trail_mask).unwrap());
    }

    #[test]
    fn test_malformed_frame_on_reseed_on_failure() {
        let config = Config {
            refresh_period: 3,
            reseed_policy: ReseedPolicy::OnFailure,
            ..Config::default()
        };
        let mut engine = engine(degraded_sequence(), &config);
        let mut outputs = vec![];
        for _ in 0..5 {
            outputs.push(engine.advance(None).unwrap());
        }
        assert!(same_pixels(&outputs[3], &outputs[2]));
        assert_eq!(engine.reseeds(), 2);
        let state = engine.state().unwrap();
        assert_eq!(state.frame_count, 1);
        assert_eq!(state.last_gray.image.width, WIDTH as usize);
        assert!(is_blank(&state.trail_mask).unwrap());
    }

    #[test]
    fn test_degraded_frame_on_failure() {
        let config = Config {
            refresh_period: 10,
            reseed_policy: ReseedPolicy::OnFailure,
            ..Config::default()
        };
        let mut engine = engine(degraded_sequence(), &config);
        let mut outputs = vec![];
        for _ in 0..4 {
            outputs.push(engine.advance(None).unwrap());
        }
        assert!(same_pixels(&outputs[3], &outputs[2]));
        assert_eq!(engine.reseeds(), 1);

        engine.advance(None).unwrap();
        assert_eq!(engine.reseeds(), 2);
        assert_eq!(engine.state().unwrap().frame_count, 1);
    }

    #[test]
    fn test_blank_video_is_passed_through() {
        let config = Config::default();
        let mut engine = engine(vec![blank_frame(), blank_frame()], &config);
        let first = engine.advance(None).unwrap();
        assert!(engine.state().unwrap().last_features.is_empty());
        assert!(is_blank(&first).unwrap());
        assert_eq!(engine.degraded_frames(), 1);
        engine.advance(None).unwrap();
        assert_eq!(engine.reseeds(), 2);
    }

    #[test]
    fn test_supplied_frame_skips_source() {
        let config = Config::default();
        let mut engine = engine(vec![], &config);
        let frame = moving_squares(1, 0).remove(0);
        engine.advance(Some(frame)).unwrap();
        assert_eq!(engine.reseeds(), 1);
        assert!(matches!(
            engine.advance(None),
            Err(FlowError::SourceExhausted)
        ));
    }

    #[test]
    fn test_select_tracked() {
        let old = vec![
            Vector2d::new(1., 1.),
            Vector2d::new(2., 2.),
            Vector2d::new(3., 3.),
        ];
        let flow = vec![
            FlowPoint {
                point: Vector2d::new(1.5, 1.),
                found: true,
                error: 2.,
            },
            FlowPoint {
                point: Vector2d::new(2., 2.),
                found: false,
                error: f64::INFINITY,
            },
            FlowPoint {
                point: Vector2d::new(3.5, 3.),
                found: true,
                error: 20.,
            },
        ];
        let (good_old, good_new) = select_tracked(&old, &flow, None);
        assert_eq!(good_old, vec![old[0], old[2]]);
        assert_eq!(good_new, vec![flow[0].point, flow[2].point]);

        let (good_old, good_new) = select_tracked(&old, &flow, Some(10.));
        assert_eq!(good_old, vec![old[0]]);
        assert_eq!(good_new.len(), 1);
    }

    #[test]
    fn test_parse_policy() {
        assert_eq!(
            "periodic".parse::<ReseedPolicy>().unwrap(),
            ReseedPolicy::Periodic
        );
        assert_eq!(
            "on-failure".parse::<ReseedPolicy>().unwrap(),
            ReseedPolicy::OnFailure
        );
        assert!("sometimes".parse::<ReseedPolicy>().is_err());
        assert_eq!(ReseedPolicy::OnFailure.to_string(), "on-failure");
    }
}
