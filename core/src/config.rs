//! Tunable reconstruction parameters, polled by value each cycle.
//!
//! The reconstruction loop keeps its last-seen snapshot and compares against a
//! fresh one every iteration; `needs_reinit` isolates the "did anything that
//! invalidates the rectification state change" decision so it can be tested on
//! its own.

/// How the raw RGBA camera buffer is turned into matcher input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMode {
    /// Triple-channel RGB matching.
    Color,
    /// Grayscale derived from the color channels.
    GrayFromColor,
    /// Grayscale taken from an auxiliary alpha plane.
    GrayFromAlpha,
}

/// Disparity post-filter pipeline selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    None,
    HoleFill,
    Wls,
    WlsFbs,
    /// Hole filling followed by the bilateral solver only.
    Fbs,
}

impl FilterMode {
    /// Whether the mode needs a right-eye disparity pass even when dual-eye
    /// disparity is disabled.
    pub fn needs_right_matcher(&self) -> bool {
        matches!(self, FilterMode::Wls | FilterMode::WlsFbs | FilterMode::Fbs)
    }
}

/// Aggregation breadth of the semi-global matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatcherVariant {
    /// Horizontal-only aggregation, the cheap block-matching fallback.
    SinglePass,
    /// Five-path semi-global aggregation.
    Standard,
    /// Eight-path aggregation, slowest and smoothest.
    Full,
}

/// Debug visualization written to the shared debug texture slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugView {
    None,
    Disparity,
    Confidence,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatcherParams {
    pub block_size: usize,
    /// Smoothness penalty for +-1 disparity steps, scaled by block_size^2.
    pub p1: i32,
    /// Smoothness penalty for larger jumps, scaled by block_size^2.
    pub p2: i32,
    pub uniqueness_ratio: i32,
    pub speckle_window_size: i32,
    pub speckle_range: i32,
    pub disp12_max_diff: i32,
    pub pre_filter_cap: i32,
    pub variant: MatcherVariant,
}

impl Default for MatcherParams {
    fn default() -> Self {
        Self {
            block_size: 5,
            p1: 8,
            p2: 32,
            uniqueness_ratio: 5,
            speckle_window_size: 100,
            speckle_range: 1,
            disp12_max_diff: 1,
            pre_filter_cap: 31,
            variant: MatcherVariant::Standard,
        }
    }
}

impl MatcherParams {
    /// Speckle range collapses to zero when the speckle window is disabled.
    pub fn effective_speckle_range(&self) -> i32 {
        if self.speckle_window_size > 0 {
            self.speckle_range
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WlsParams {
    pub lambda: f32,
    pub sigma_color: f32,
    /// Discontinuity radius factor, multiplied by the matcher block size.
    pub confidence_radius: i32,
}

impl Default for WlsParams {
    fn default() -> Self {
        Self {
            lambda: 8000.0,
            sigma_color: 1.5,
            confidence_radius: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FbsParams {
    pub spatial: f32,
    pub luma: f32,
    pub chroma: f32,
    pub lambda: f32,
    pub iterations: usize,
}

impl Default for FbsParams {
    fn default() -> Self {
        Self {
            spatial: 8.0,
            luma: 8.0,
            chroma: 8.0,
            lambda: 128.0,
            iterations: 5,
        }
    }
}

/// Complete per-cycle configuration snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StereoConfig {
    /// Projection mode requests stereo reconstruction at all.
    pub enabled: bool,
    /// Freeze the pipeline while keeping the last served frame.
    pub freeze: bool,
    pub min_disparity: i32,
    pub max_disparity: i32,
    pub downscale_factor: u32,
    pub fov_scale: f64,
    /// Unitless multiplier applied to the eye baseline for perceptual tuning.
    pub depth_offset: f64,
    pub color_mode: ColorMode,
    pub dual_eye_disparity: bool,
    pub frame_skip: u32,
    /// Linear (true) vs nearest (false) rectification resampling.
    pub rectification_filtering: bool,
    /// Multicore matching; toggling does not require a reinit.
    pub parallel_matching: bool,
    pub filter_mode: FilterMode,
    pub matcher: MatcherParams,
    pub wls: WlsParams,
    pub fbs: FbsParams,
    pub debug_view: DebugView,
}

impl Default for StereoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            freeze: false,
            min_disparity: 0,
            max_disparity: 64,
            downscale_factor: 2,
            fov_scale: 1.0,
            depth_offset: 1.0,
            color_mode: ColorMode::GrayFromColor,
            dual_eye_disparity: false,
            frame_skip: 0,
            rectification_filtering: true,
            parallel_matching: true,
            filter_mode: FilterMode::None,
            matcher: MatcherParams::default(),
            wls: WlsParams::default(),
            fbs: FbsParams::default(),
            debug_view: DebugView::None,
        }
    }
}

impl StereoConfig {
    pub fn num_disparities(&self) -> i32 {
        self.max_disparity - self.min_disparity
    }
}

/// True when a parameter changed that invalidates the rectification state and
/// the working buffers. Matcher and filter parameters deliberately do not
/// trigger a reinit; they are re-read every cycle.
pub fn needs_reinit(prev: &StereoConfig, next: &StereoConfig) -> bool {
    prev.max_disparity != next.max_disparity
        || prev.downscale_factor != next.downscale_factor
        || prev.fov_scale != next.fov_scale
        || prev.depth_offset != next.depth_offset
        || prev.color_mode != next.color_mode
        || prev.dual_eye_disparity != next.dual_eye_disparity
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reinit_on_downscale_change() {
        let prev = StereoConfig::default();
        let mut next = prev;
        next.downscale_factor = 4;
        assert!(needs_reinit(&prev, &next));
    }

    #[test]
    fn reinit_on_depth_offset_and_color_mode() {
        let prev = StereoConfig::default();
        let mut next = prev;
        next.depth_offset = 1.1;
        assert!(needs_reinit(&prev, &next));

        let mut next = prev;
        next.color_mode = ColorMode::Color;
        assert!(needs_reinit(&prev, &next));
    }

    #[test]
    fn no_reinit_on_matcher_params() {
        let prev = StereoConfig::default();
        let mut next = prev;
        next.matcher.block_size = 9;
        next.matcher.p1 = 24;
        next.filter_mode = FilterMode::Wls;
        next.frame_skip = 3;
        assert!(!needs_reinit(&prev, &next));
    }

    #[test]
    fn speckle_range_gated_by_window() {
        let mut m = MatcherParams::default();
        m.speckle_window_size = 0;
        m.speckle_range = 4;
        assert_eq!(m.effective_speckle_range(), 0);
        m.speckle_window_size = 50;
        assert_eq!(m.effective_speckle_range(), 4);
    }
}
