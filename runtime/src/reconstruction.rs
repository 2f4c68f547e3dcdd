//! The background reconstruction loop.
//!
//! One dedicated thread polls the camera and configuration store, rebuilds
//! the rectification state when a reinit-triggering parameter changes, and
//! runs the conversion/rectify/downscale/match/filter/pack pipeline for every
//! fresh camera frame.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use depthcv_calib3d::{
    build_uv_distortion_map, solve_rectification, RectificationState, SharedDistortionMap,
    UvDistortionMap,
};
use depthcv_core::{
    matrix_to_f32, needs_reinit, rotation_to_homogeneous, ColorMode, DebugView, Error,
    FrameLayout, Result, StereoConfig,
};
use depthcv_imgproc::{
    extend_left, extend_left_rgb, remap, remap_rgb, resize_linear, resize_linear_rgb,
    rgba_region_alpha_to_gray, rgba_region_to_gray, rgba_region_to_rgb, BorderMode, EyeRect,
    Interpolation,
};
use depthcv_stereo::{
    run_post_filter, DisparityMatcher, MatcherInput, PostFilterInput, SgbmMatcher,
    DISPARITY_SCALE,
};
use image::{GrayImage, RgbImage};
use nalgebra::Matrix4;

use crate::debug::{DebugSink, DebugTexture};
use crate::exchange::{DepthFrameExchange, FrameConsumer, FrameProducer};
use crate::frame::{normalized_bound, pack_eyes};
use crate::sources::{CalibrationSource, CameraSource, ConfigSource};

const CYCLE_SLEEP: Duration = Duration::from_micros(100);
const PERF_WINDOW: usize = 20;

/// Consumer-side handles returned by [`DepthReconstruction::start`].
pub struct ReconstructionHandles {
    pub frames: FrameConsumer,
    pub distortion: SharedDistortionMap,
    pub debug: Arc<DebugSink>,
}

/// Owner of the reconstruction thread. Dropping it requests shutdown and
/// joins the thread; the in-flight cycle always runs to completion.
pub struct DepthReconstruction {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    average_cycle_ms: Arc<Mutex<f32>>,
}

impl DepthReconstruction {
    pub fn start(
        camera: Arc<dyn CameraSource>,
        config: Arc<dyn ConfigSource>,
        calibration: Arc<dyn CalibrationSource>,
    ) -> Result<(Self, ReconstructionHandles)> {
        let (producer, consumer) = DepthFrameExchange::new();
        let distortion: SharedDistortionMap = Arc::new(RwLock::new(UvDistortionMap::empty()));
        let debug = Arc::new(DebugSink::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let average_cycle_ms = Arc::new(Mutex::new(0.0f32));

        let worker = Worker {
            camera,
            config_source: config,
            calibration_source: calibration,
            producer,
            distortion: Arc::clone(&distortion),
            debug: Arc::clone(&debug),
            shutdown: Arc::clone(&shutdown),
            average_cycle_ms: Arc::clone(&average_cycle_ms),
            last_config: StereoConfig::default(),
            last_sequence: None,
            state: None,
            cycle_times: VecDeque::with_capacity(PERF_WINDOW),
            first_render: false,
        };

        let thread = std::thread::Builder::new()
            .name("depth-reconstruction".to_string())
            .spawn(move || worker.run())
            .map_err(|e| Error::Runtime(format!("failed to spawn reconstruction thread: {e}")))?;

        Ok((
            Self {
                shutdown,
                thread: Some(thread),
                average_cycle_ms,
            },
            ReconstructionHandles {
                frames: consumer,
                distortion,
                debug,
            },
        ))
    }

    /// Rolling average cycle latency over the last 20 reconstructed frames.
    pub fn average_cycle_ms(&self) -> f32 {
        *self
            .average_cycle_ms
            .lock()
            .unwrap_or_else(|p| p.into_inner())
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for DepthReconstruction {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Everything derived from one calibration + config snapshot.
struct GeometryState {
    rect: RectificationState,
    layout: FrameLayout,
    /// Inverse rectification rotations, composed with the capture pose to
    /// produce the per-eye world transforms.
    rotation_inv_left: Matrix4<f32>,
    rotation_inv_right: Matrix4<f32>,
    disparity_to_depth: Matrix4<f32>,
}

enum EyePair {
    Gray(GrayImage, GrayImage),
    Rgb(RgbImage, RgbImage),
}

struct FrameSnapshot {
    eyes: EyePair,
    pose_left: Matrix4<f32>,
    pose_right: Matrix4<f32>,
}

struct Worker {
    camera: Arc<dyn CameraSource>,
    config_source: Arc<dyn ConfigSource>,
    calibration_source: Arc<dyn CalibrationSource>,
    producer: FrameProducer,
    distortion: SharedDistortionMap,
    debug: Arc<DebugSink>,
    shutdown: Arc<AtomicBool>,
    average_cycle_ms: Arc<Mutex<f32>>,
    last_config: StereoConfig,
    last_sequence: Option<u64>,
    state: Option<Arc<GeometryState>>,
    cycle_times: VecDeque<f32>,
    first_render: bool,
}

impl Worker {
    fn run(mut self) {
        while !self.shutdown.load(Ordering::Relaxed) {
            std::thread::sleep(CYCLE_SLEEP);

            let config = self.config_source.stereo_config();
            if self.state.is_none() || needs_reinit(&self.last_config, &config) {
                self.reinitialize(&config);
            }
            if config.parallel_matching != self.last_config.parallel_matching {
                tracing::debug!(
                    parallel = config.parallel_matching,
                    "matcher parallelism toggled"
                );
            }
            self.last_config = config;

            if !config.enabled || config.freeze {
                continue;
            }
            let Some(state) = self.state.clone() else {
                continue;
            };
            self.cycle(&config, &state);
        }
    }

    /// Rebuild rectification state, distortion lookup and working buffers.
    /// On failure the previous state is kept and the failure is logged.
    fn reinitialize(&mut self, config: &StereoConfig) {
        let Some(frame) = self.camera.frame() else {
            return;
        };
        let (width, height) = {
            let frame = frame.read().unwrap_or_else(|p| p.into_inner());
            (frame.width, frame.height)
        };
        if width == 0 || height == 0 {
            return;
        }

        let calibration = self.calibration_source.calibration();
        let rect = match solve_rectification(
            &calibration,
            width,
            height,
            config.downscale_factor.max(1),
            config.fov_scale,
            config.depth_offset,
        ) {
            Ok(rect) => rect,
            Err(err) => {
                tracing::warn!(%err, "rectification solve failed; keeping previous state");
                return;
            }
        };
        let lookup = match build_uv_distortion_map(&calibration, width, height, config.fov_scale)
        {
            Ok(lookup) => lookup,
            Err(err) => {
                tracing::warn!(%err, "distortion lookup rebuild failed; keeping previous state");
                return;
            }
        };

        {
            let mut shared = self.distortion.write().unwrap_or_else(|p| p.into_inner());
            *shared = lookup;
        }

        let (cv_width, cv_height) = (rect.cv_width, rect.cv_height);
        self.producer.reset_with(|f| f.resize(cv_width, cv_height));

        let rotation_inv_left =
            matrix_to_f32(&rotation_to_homogeneous(&rect.rotation_left.transpose()));
        let rotation_inv_right =
            matrix_to_f32(&rotation_to_homogeneous(&rect.rotation_right.transpose()));
        let disparity_to_depth = matrix_to_f32(&rect.disparity_to_depth);

        tracing::info!(cv_width, cv_height, "rectification state rebuilt");
        self.state = Some(Arc::new(GeometryState {
            rect,
            layout: calibration.layout,
            rotation_inv_left,
            rotation_inv_right,
            disparity_to_depth,
        }));
        self.first_render = true;
        self.last_sequence = None;
    }

    /// Copy the pixel region and poses out of the camera frame, holding its
    /// lock only for the extraction. Returns `None` on any skip condition.
    fn snapshot(&mut self, config: &StereoConfig, state: &GeometryState) -> Option<FrameSnapshot> {
        let frame = self.camera.frame()?;
        let frame = frame.read().unwrap_or_else(|p| p.into_inner());

        if frame.layout == FrameLayout::Mono || frame.layout != state.layout {
            return None;
        }
        let skip_mod = config.frame_skip as u64 + 1;
        if Some(frame.sequence) == self.last_sequence || frame.sequence % skip_mod != 0 {
            return None;
        }
        if frame.buffer.len() < (frame.width as usize * frame.height as usize * 4) {
            return None;
        }
        let (fw, fh) = (state.rect.frame_width, state.rect.frame_height);
        let (expect_fw, expect_fh) = frame.layout.eye_frame_size(frame.width, frame.height);
        if (fw, fh) != (expect_fw, expect_fh) {
            // Camera resolution changed under us; wait for the next reinit.
            return None;
        }
        self.last_sequence = Some(frame.sequence);

        let (left_rect, right_rect) = match frame.layout {
            FrameLayout::StereoHorizontal => (
                EyeRect { x: 0, y: 0, width: fw, height: fh },
                EyeRect { x: fw, y: 0, width: fw, height: fh },
            ),
            // Vertical cameras carry the left eye in the second half of the
            // buffer rows.
            FrameLayout::StereoVertical => (
                EyeRect { x: 0, y: fh, width: fw, height: fh },
                EyeRect { x: 0, y: 0, width: fw, height: fh },
            ),
            FrameLayout::Mono => return None,
        };

        let eyes = match config.color_mode {
            ColorMode::Color => EyePair::Rgb(
                rgba_region_to_rgb(&frame.buffer, frame.width, left_rect),
                rgba_region_to_rgb(&frame.buffer, frame.width, right_rect),
            ),
            ColorMode::GrayFromColor => EyePair::Gray(
                rgba_region_to_gray(&frame.buffer, frame.width, left_rect),
                rgba_region_to_gray(&frame.buffer, frame.width, right_rect),
            ),
            ColorMode::GrayFromAlpha => EyePair::Gray(
                rgba_region_alpha_to_gray(&frame.buffer, frame.width, left_rect),
                rgba_region_alpha_to_gray(&frame.buffer, frame.width, right_rect),
            ),
        };

        Some(FrameSnapshot {
            eyes,
            pose_left: frame.view_to_world_left,
            pose_right: frame.view_to_world_right,
        })
    }

    /// Rectify, downscale and left-extend both eyes.
    fn prepare_inputs(
        &self,
        eyes: EyePair,
        config: &StereoConfig,
        state: &GeometryState,
        margin: u32,
    ) -> EyePair {
        let rect = &state.rect;
        let interp = if config.rectification_filtering {
            Interpolation::Linear
        } else {
            Interpolation::Nearest
        };
        let border = BorderMode::Constant(0);
        let (cv_w, cv_h) = (rect.cv_width, rect.cv_height);

        match eyes {
            EyePair::Gray(left, right) => {
                let left = remap(
                    &left,
                    &rect.map_left.map_x,
                    &rect.map_left.map_y,
                    rect.frame_width,
                    rect.frame_height,
                    interp,
                    border,
                );
                let right = remap(
                    &right,
                    &rect.map_right.map_x,
                    &rect.map_right.map_y,
                    rect.frame_width,
                    rect.frame_height,
                    interp,
                    border,
                );
                let left = resize_linear(&left, cv_w, cv_h);
                let right = resize_linear(&right, cv_w, cv_h);
                EyePair::Gray(extend_left(&left, margin), extend_left(&right, margin))
            }
            EyePair::Rgb(left, right) => {
                let left = remap_rgb(
                    &left,
                    &rect.map_left.map_x,
                    &rect.map_left.map_y,
                    rect.frame_width,
                    rect.frame_height,
                    interp,
                    border,
                );
                let right = remap_rgb(
                    &right,
                    &rect.map_right.map_x,
                    &rect.map_right.map_y,
                    rect.frame_width,
                    rect.frame_height,
                    interp,
                    border,
                );
                let left = resize_linear_rgb(&left, cv_w, cv_h);
                let right = resize_linear_rgb(&right, cv_w, cv_h);
                EyePair::Rgb(extend_left_rgb(&left, margin), extend_left_rgb(&right, margin))
            }
        }
    }

    fn cycle(&mut self, config: &StereoConfig, state: &GeometryState) {
        let started = Instant::now();

        let Some(snapshot) = self.snapshot(config, state) else {
            return;
        };

        let margin = config.num_disparities().max(1) as u32;
        let extended = self.prepare_inputs(snapshot.eyes, config, state, margin);
        let (left_input, right_input) = match &extended {
            EyePair::Gray(l, r) => (MatcherInput::from_gray(l), MatcherInput::from_gray(r)),
            EyePair::Rgb(l, r) => (MatcherInput::from_rgb(l), MatcherInput::from_rgb(r)),
        };

        let matcher = SgbmMatcher::from_params(
            config.min_disparity,
            config.max_disparity,
            &config.matcher,
            config.parallel_matching,
        );
        let left_disparity = match matcher.compute(&left_input, &right_input) {
            Ok(d) => d,
            Err(err) => {
                tracing::warn!(%err, "stereo matching failed; skipping cycle");
                return;
            }
        };
        let right_disparity = if config.dual_eye_disparity
            || config.filter_mode.needs_right_matcher()
        {
            match matcher
                .derive_right_matcher()
                .compute(&right_input, &left_input)
            {
                Ok(d) => Some(d),
                Err(err) => {
                    tracing::warn!(%err, "right-eye matching failed; skipping cycle");
                    return;
                }
            }
        } else {
            None
        };

        // Any right map that exists came from the mirrored matcher and needs
        // its sign flipped back at packing.
        let right_mirrored = right_disparity.is_some();

        let (cv_w, cv_h) = (state.rect.cv_width, state.rect.cv_height);
        let filtered = run_post_filter(PostFilterInput {
            mode: config.filter_mode,
            left: left_disparity,
            right: right_disparity,
            guide_left: left_input,
            guide_right: right_input,
            dual_eye: config.dual_eye_disparity,
            block_size: config.matcher.block_size,
            wls: config.wls,
            fbs: config.fbs,
            expected_width: cv_w + margin,
        });

        let view_to_world_left = snapshot.pose_left * state.rotation_inv_left;
        let view_to_world_right = if config.dual_eye_disparity {
            snapshot.pose_right * state.rotation_inv_right
        } else {
            view_to_world_left
        };
        let first_render = std::mem::take(&mut self.first_render);

        let downscale = state.rect.downscale_factor;
        let q = state.disparity_to_depth;
        self.producer.publish(|frame| {
            if frame.width != cv_w * 2 || frame.height != cv_h {
                frame.resize(cv_w, cv_h);
            }
            pack_eyes(
                frame,
                &filtered.left,
                &filtered.left_confidence,
                &filtered.right,
                &filtered.right_confidence,
                margin,
                cv_w,
                cv_h,
                right_mirrored,
            );
            frame.downscale_factor = downscale;
            frame.min_disparity_norm = normalized_bound(config.min_disparity);
            frame.max_disparity_norm = normalized_bound(config.max_disparity);
            frame.disparity_to_depth = q;
            frame.view_to_world_left = view_to_world_left;
            frame.view_to_world_right = view_to_world_right;
            frame.first_render = first_render;
        });

        if config.debug_view != DebugView::None {
            self.render_debug(config, &filtered, margin, cv_w, cv_h);
        }

        let elapsed_ms = started.elapsed().as_secs_f32() * 1000.0;
        if self.cycle_times.len() == PERF_WINDOW {
            self.cycle_times.pop_front();
        }
        self.cycle_times.push_back(elapsed_ms);
        let avg = self.cycle_times.iter().sum::<f32>() / self.cycle_times.len() as f32;
        *self
            .average_cycle_ms
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = avg;
    }

    fn render_debug(
        &self,
        config: &StereoConfig,
        filtered: &depthcv_stereo::PostFilterOutput,
        margin: u32,
        cv_w: u32,
        cv_h: u32,
    ) {
        let mut data = vec![0u8; (cv_w * cv_h) as usize];
        match config.debug_view {
            DebugView::Disparity => {
                let scale = 255.0 / (config.max_disparity * DISPARITY_SCALE).max(1) as f32;
                for y in 0..cv_h {
                    for x in 0..cv_w {
                        let v = filtered.left.get(x + margin, y) as f32;
                        data[(y * cv_w + x) as usize] = (v * scale).clamp(0.0, 255.0) as u8;
                    }
                }
            }
            DebugView::Confidence => {
                let conf = &filtered.left_confidence;
                for y in 0..cv_h {
                    for x in 0..cv_w {
                        let v = if conf.width > 0 {
                            conf.get((x + margin).min(conf.width - 1), y)
                        } else {
                            0.0
                        };
                        data[(y * cv_w + x) as usize] = v.clamp(0.0, 255.0) as u8;
                    }
                }
            }
            DebugView::None => return,
        }
        self.debug.publish(DebugTexture {
            data,
            width: cv_w,
            height: cv_h,
            view: config.debug_view,
        });
    }
}
