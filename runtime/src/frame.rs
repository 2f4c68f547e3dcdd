//! The reconstruction output unit and its packing.

use depthcv_stereo::{ConfidenceMap, DisparityMap, DISPARITY_SCALE};
use nalgebra::Matrix4;

/// Divisor turning a fixed-point disparity bound into the normalized value
/// consumers use for world-space reconstruction.
pub const WORLD_DISPARITY_NORM: f32 = 2048.0;

/// Confidence packing factor; post-filter confidence spans `[0, 255]` and the
/// packed channel spans the positive 16-bit range.
const CONFIDENCE_PACK_SCALE: f32 = 32768.0 / 255.0;

/// One reconstructed depth frame.
///
/// The pixel buffer interleaves (disparity, confidence) i16 pairs and is laid
/// out `(cv_width * 2) x cv_height`: left eye in the first half-width, right
/// eye in the second. Memory identity is preserved across cycles; only a
/// rectification rebuild resizes it.
#[derive(Debug, Clone)]
pub struct DepthFrame {
    pub data: Vec<i16>,
    /// Total packed width, twice the per-eye matcher width.
    pub width: u32,
    pub height: u32,
    pub downscale_factor: u32,
    pub min_disparity_norm: f32,
    pub max_disparity_norm: f32,
    pub disparity_to_depth: Matrix4<f32>,
    pub view_to_world_left: Matrix4<f32>,
    pub view_to_world_right: Matrix4<f32>,
    pub valid: bool,
    /// Set on the first frame after a rebuild so consumers can clear stale
    /// history.
    pub first_render: bool,
    /// Content checksum stamped by the producer on publish.
    pub checksum: u64,
}

impl Default for DepthFrame {
    fn default() -> Self {
        Self::new()
    }
}

impl DepthFrame {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            width: 0,
            height: 0,
            downscale_factor: 1,
            min_disparity_norm: 0.0,
            max_disparity_norm: 0.0,
            disparity_to_depth: Matrix4::identity(),
            view_to_world_left: Matrix4::identity(),
            view_to_world_right: Matrix4::identity(),
            valid: false,
            first_render: false,
            checksum: 0,
        }
    }

    /// Resize in place for a new matcher resolution; contents are stale until
    /// the next publish.
    pub fn resize(&mut self, cv_width: u32, cv_height: u32) {
        self.width = cv_width * 2;
        self.height = cv_height;
        self.data.resize((self.width * self.height * 2) as usize, 0);
        self.valid = false;
    }

    #[inline]
    pub fn disparity_at(&self, x: u32, y: u32) -> i16 {
        self.data[((y * self.width + x) * 2) as usize]
    }

    #[inline]
    pub fn confidence_at(&self, x: u32, y: u32) -> i16 {
        self.data[((y * self.width + x) * 2 + 1) as usize]
    }

    /// Wrapping content checksum. The producer stamps it together with the
    /// validity flag on publish; consumers recompute it to detect torn reads.
    pub fn compute_checksum(&self) -> u64 {
        self.data
            .iter()
            .fold(0u64, |acc, &v| acc.wrapping_mul(31).wrapping_add(v as u64))
    }
}

#[inline]
fn pack_confidence(c: f32) -> i16 {
    (c * CONFIDENCE_PACK_SCALE).min(i16::MAX as f32) as i16
}

/// Pack both eyes into the interleaved buffer, cropping the left extension
/// margin the matcher worked on.
///
/// `mirrored_right` marks a right map produced over a mirrored search
/// interval (negated values by convention); its sign is inverted on packing
/// so both halves share the left sign convention. A right map that just
/// reuses the left result is packed as-is.
#[allow(clippy::too_many_arguments)]
pub fn pack_eyes(
    frame: &mut DepthFrame,
    left: &DisparityMap,
    left_confidence: &ConfidenceMap,
    right: &DisparityMap,
    right_confidence: &ConfidenceMap,
    margin: u32,
    cv_width: u32,
    cv_height: u32,
    mirrored_right: bool,
) {
    debug_assert_eq!(frame.width, cv_width * 2);
    debug_assert_eq!(frame.height, cv_height);

    for y in 0..cv_height {
        for x in 0..cv_width {
            let src_x = x + margin;
            let out = ((y * frame.width + x) * 2) as usize;
            frame.data[out] = left.get(src_x, y);
            frame.data[out + 1] = if left_confidence.width > 0 {
                pack_confidence(left_confidence.get(src_x.min(left_confidence.width - 1), y))
            } else {
                0
            };

            let out = ((y * frame.width + cv_width + x) * 2) as usize;
            let rv = right.get(src_x, y);
            frame.data[out] = if mirrored_right { rv.saturating_neg() } else { rv };
            frame.data[out + 1] = if right_confidence.width > 0 {
                pack_confidence(right_confidence.get(src_x.min(right_confidence.width - 1), y))
            } else {
                0
            };
        }
    }
}

/// Normalized disparity bound for the frame header.
pub fn normalized_bound(disparity: i32) -> f32 {
    (disparity * DISPARITY_SCALE) as f32 / WORLD_DISPARITY_NORM
}
