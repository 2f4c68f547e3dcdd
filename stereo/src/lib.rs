//! Disparity estimation from rectified stereo pairs.
//!
//! This crate provides a semi-global block matcher producing fixed-point
//! signed disparity maps, and the post-filter pipeline (hole filling,
//! edge-aware smoothing, bilateral refinement) that turns a raw disparity map
//! into a disparity + confidence pair.

use image::{GrayImage, RgbImage};

pub mod filter;
pub mod sgbm;

pub use filter::{fill_holes, run_post_filter, ConfidenceMap, PostFilterInput, PostFilterOutput};
pub use sgbm::SgbmMatcher;

pub use depthcv_core::{Error, Result};

/// Disparity maps are stored in fixed point, `true_disparity * 16`.
pub const DISPARITY_SCALE: i32 = 16;

/// Matcher input view over a tightly packed 8-bit image with 1 (grayscale)
/// or 3 (RGB) channels.
#[derive(Debug, Clone, Copy)]
pub struct MatcherInput<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub channels: u32,
}

impl<'a> MatcherInput<'a> {
    pub fn from_gray(image: &'a GrayImage) -> Self {
        Self {
            data: image.as_raw(),
            width: image.width(),
            height: image.height(),
            channels: 1,
        }
    }

    pub fn from_rgb(image: &'a RgbImage) -> Self {
        Self {
            data: image.as_raw(),
            width: image.width(),
            height: image.height(),
            channels: 3,
        }
    }

    #[inline]
    pub(crate) fn sample(&self, x: usize, y: usize, c: usize) -> u8 {
        self.data[(y * self.width as usize + x) * self.channels as usize + c]
    }
}

/// Signed fixed-point disparity map.
#[derive(Debug, Clone)]
pub struct DisparityMap {
    /// `true_disparity * 16`; invalid pixels hold `(min_disparity - 1) * 16`.
    pub data: Vec<i16>,
    pub width: u32,
    pub height: u32,
    pub min_disparity: i32,
    pub max_disparity: i32,
}

impl DisparityMap {
    pub fn new(width: u32, height: u32, min_disparity: i32, max_disparity: i32) -> Self {
        let invalid = ((min_disparity - 1) * DISPARITY_SCALE) as i16;
        Self {
            data: vec![invalid; (width * height) as usize],
            width,
            height,
            min_disparity,
            max_disparity,
        }
    }

    /// Fixed-point marker for pixels with no accepted match.
    pub fn invalid_value(&self) -> i16 {
        ((self.min_disparity - 1) * DISPARITY_SCALE) as i16
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> i16 {
        self.data[(y * self.width + x) as usize]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, value: i16) {
        self.data[(y * self.width + x) as usize] = value;
    }

    /// Whether a fixed-point value lies inside the valid disparity interval.
    pub fn is_valid_value(&self, value: i16) -> bool {
        let v = value as i32;
        v >= self.min_disparity * DISPARITY_SCALE && v <= self.max_disparity * DISPARITY_SCALE
    }
}

/// Stereo matching seam; the reconstruction loop talks to the matcher only
/// through this.
pub trait DisparityMatcher {
    fn compute(&self, left: &MatcherInput<'_>, right: &MatcherInput<'_>) -> Result<DisparityMap>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_marker_sits_below_range() {
        let map = DisparityMap::new(8, 8, 0, 64);
        assert_eq!(map.invalid_value(), -16);
        assert!(!map.is_valid_value(map.invalid_value()));
        assert!(map.is_valid_value(0));
        assert!(map.is_valid_value(64 * 16));
        assert!(!map.is_valid_value(65 * 16));
    }

    #[test]
    fn matcher_input_sampling() {
        let img = GrayImage::from_fn(4, 2, |x, y| image::Luma([(x + y * 10) as u8]));
        let input = MatcherInput::from_gray(&img);
        assert_eq!(input.sample(3, 1, 0), 13);
    }
}
