//! Disparity post-filtering.
//!
//! Four stages combine according to the configured filter mode: row-scan hole
//! filling, an edge-aware weighted smoothing pass guided by the left image,
//! and a confidence-weighted bilateral solver. Every stage also maintains the
//! per-pixel confidence map that gets packed next to disparity downstream.

use depthcv_core::{FbsParams, FilterMode, WlsParams};
use rayon::prelude::*;

use crate::{DisparityMap, MatcherInput, DISPARITY_SCALE};

/// Per-pixel confidence in `[0, 255]`.
#[derive(Debug, Clone)]
pub struct ConfidenceMap {
    pub data: Vec<f32>,
    pub width: u32,
    pub height: u32,
}

impl ConfidenceMap {
    /// Fully confident map, degraded only where filtering touched pixels.
    pub fn new_full(width: u32, height: u32) -> Self {
        Self {
            data: vec![255.0; (width * height) as usize],
            width,
            height,
        }
    }

    pub fn new_zero(width: u32, height: u32) -> Self {
        Self {
            data: vec![0.0; (width * height) as usize],
            width,
            height,
        }
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.data[(y * self.width + x) as usize]
    }
}

/// Row-scan hole filling.
///
/// Scans each row in the matcher's nominal direction (`left_to_right` for the
/// left matcher, reversed for the right one), propagating the nearest
/// preceding valid disparity into runs of invalid pixels. Filled cells and the
/// valid cell at the run's leading boundary get zero confidence. Running this
/// twice is a no-op: the second pass finds no invalid pixels.
pub fn fill_holes(
    disparity: &mut DisparityMap,
    confidence: &mut ConfidenceMap,
    left_to_right: bool,
) {
    let width = disparity.width as usize;
    let min_fp = disparity.min_disparity * DISPARITY_SCALE;
    let max_fp = disparity.max_disparity * DISPARITY_SCALE;
    let valid = |v: i16| (v as i32) >= min_fp && (v as i32) <= max_fp;

    disparity
        .data
        .par_chunks_mut(width)
        .zip(confidence.data.par_chunks_mut(width))
        .for_each(|(disp_row, conf_row)| {
            let order: Box<dyn Iterator<Item = usize>> = if left_to_right {
                Box::new(0..width)
            } else {
                Box::new((0..width).rev())
            };

            let mut last_valid: Option<(usize, i16)> = None;
            let mut pending: Vec<usize> = Vec::new();
            for x in order {
                let v = disp_row[x];
                if valid(v) {
                    if !pending.is_empty() {
                        // Close the gap with the nearest valid neighbor.
                        let fill = last_valid.map(|(_, lv)| lv).unwrap_or(v);
                        for &gx in &pending {
                            disp_row[gx] = fill;
                            conf_row[gx] = 0.0;
                        }
                        pending.clear();
                    }
                    last_valid = Some((x, v));
                } else {
                    if pending.is_empty() {
                        if let Some((lx, _)) = last_valid {
                            conf_row[lx] = 0.0;
                        }
                    }
                    pending.push(x);
                }
            }
            // Trailing gap with no closing neighbor.
            if let Some((_, lv)) = last_valid {
                for &gx in &pending {
                    disp_row[gx] = lv;
                    conf_row[gx] = 0.0;
                }
            }
        });
}

/// Left-right consistency confidence: full confidence where the mirrored
/// matcher agrees within one pixel, zero elsewhere and within
/// `discontinuity_radius` of a disparity jump.
fn consistency_confidence(
    left: &DisparityMap,
    right: &DisparityMap,
    discontinuity_radius: i32,
) -> ConfidenceMap {
    let width = left.width;
    let height = left.height;
    let mut conf = ConfidenceMap::new_zero(width, height);

    conf.data
        .par_chunks_mut(width as usize)
        .enumerate()
        .for_each(|(y, row)| {
            for x in 0..width {
                let v = left.get(x, y as u32);
                if !left.is_valid_value(v) {
                    continue;
                }
                let d = (v as f32 / DISPARITY_SCALE as f32).round() as i32;
                let xr = x as i32 - d;
                if xr < 0 || xr >= width as i32 {
                    continue;
                }
                let rv = right.get(xr as u32, y as u32);
                if !right.is_valid_value(rv) {
                    continue;
                }
                // Right-matcher disparity is negated by convention.
                if (v as i32 + rv as i32).abs() <= DISPARITY_SCALE {
                    row[x as usize] = 255.0;
                }
            }
        });

    if discontinuity_radius > 0 {
        zero_near_discontinuities(left, &mut conf, discontinuity_radius);
    }
    conf
}

fn zero_near_discontinuities(
    disparity: &DisparityMap,
    confidence: &mut ConfidenceMap,
    radius: i32,
) {
    let width = disparity.width as i32;
    let height = disparity.height as i32;
    let jump = DISPARITY_SCALE;

    let mut edges = vec![false; (width * height) as usize];
    for y in 0..height {
        for x in 0..width {
            let v = disparity.get(x as u32, y as u32) as i32;
            let right_differs = x + 1 < width
                && (disparity.get(x as u32 + 1, y as u32) as i32 - v).abs() > jump;
            let down_differs = y + 1 < height
                && (disparity.get(x as u32, y as u32 + 1) as i32 - v).abs() > jump;
            if right_differs || down_differs {
                edges[(y * width + x) as usize] = true;
            }
        }
    }

    confidence
        .data
        .par_chunks_mut(width as usize)
        .enumerate()
        .for_each(|(y, row)| {
            let y = y as i32;
            for x in 0..width {
                'search: for dy in -radius..=radius {
                    let ny = y + dy;
                    if ny < 0 || ny >= height {
                        continue;
                    }
                    for dx in -radius..=radius {
                        let nx = x + dx;
                        if nx >= 0 && nx < width && edges[(ny * width + nx) as usize] {
                            row[x as usize] = 0.0;
                            break 'search;
                        }
                    }
                }
            }
        });
}

/// Edge-aware weighted smoothing guided by the matcher's left input.
///
/// Low-confidence pixels are re-estimated from their guide-similar neighbors;
/// high-confidence pixels are anchored by their own value. The guide weight
/// falls off with intensity difference scaled by `sigma_color`.
pub fn wls_filter(
    disparity: &mut DisparityMap,
    right_disparity: &DisparityMap,
    guide: &MatcherInput<'_>,
    params: &WlsParams,
    block_size: usize,
) -> ConfidenceMap {
    let radius = params.confidence_radius * block_size as i32;
    let confidence = consistency_confidence(disparity, right_disparity, radius);

    let width = disparity.width as usize;
    let height = disparity.height as usize;
    let smoothness = params.lambda / (params.lambda + 4000.0);
    let edge_scale = (params.sigma_color * 32.0).max(1.0);

    let guide_luma: Vec<f32> = (0..width * height)
        .map(|i| {
            let x = i % width;
            let y = i / width;
            let mut sum = 0.0f32;
            for c in 0..guide.channels as usize {
                sum += guide.sample(x, y, c) as f32;
            }
            sum / guide.channels as f32
        })
        .collect();

    let mut current: Vec<f32> = disparity.data.iter().map(|&v| v as f32).collect();
    let mut next = vec![0.0f32; width * height];

    for _ in 0..4 {
        next.par_chunks_mut(width)
            .enumerate()
            .for_each(|(y, row)| {
                for x in 0..width {
                    let idx = y * width + x;
                    let g = guide_luma[idx];
                    let anchor = confidence.data[idx] / 255.0;

                    let mut weight_sum = 0.0f32;
                    let mut value_sum = 0.0f32;
                    let mut push = |nx: i32, ny: i32| {
                        if nx < 0 || ny < 0 || nx >= width as i32 || ny >= height as i32 {
                            return;
                        }
                        let nidx = ny as usize * width + nx as usize;
                        let w = smoothness * (-(guide_luma[nidx] - g).abs() / edge_scale).exp();
                        weight_sum += w;
                        value_sum += w * current[nidx];
                    };
                    push(x as i32 - 1, y as i32);
                    push(x as i32 + 1, y as i32);
                    push(x as i32, y as i32 - 1);
                    push(x as i32, y as i32 + 1);

                    let denom = anchor + weight_sum;
                    row[x] = if denom > f32::EPSILON {
                        (anchor * current[idx] + value_sum) / denom
                    } else {
                        current[idx]
                    };
                }
            });
        std::mem::swap(&mut current, &mut next);
    }

    let min_fp = (disparity.min_disparity * DISPARITY_SCALE) as f32;
    let max_fp = (disparity.max_disparity * DISPARITY_SCALE) as f32;
    for (dst, &v) in disparity.data.iter_mut().zip(current.iter()) {
        *dst = v.clamp(min_fp, max_fp).round() as i16;
    }

    confidence
}

/// Confidence-weighted iterative bilateral smoothing over the guide image.
pub fn fbs_filter(
    disparity: &mut DisparityMap,
    guide: &MatcherInput<'_>,
    confidence: &ConfidenceMap,
    params: &FbsParams,
) {
    let width = disparity.width as usize;
    let height = disparity.height as usize;
    let radius = 2i32;

    let spatial_sigma2 = 2.0 * params.spatial * params.spatial;
    let luma_sigma2 = 2.0 * params.luma * params.luma;
    let chroma_sigma2 = 2.0 * params.chroma * params.chroma;
    let lambda = params.lambda / 255.0;

    let channels = guide.channels as usize;
    let original: Vec<f32> = disparity.data.iter().map(|&v| v as f32).collect();
    let mut current = original.clone();
    let mut next = vec![0.0f32; width * height];

    for _ in 0..params.iterations {
        next.par_chunks_mut(width)
            .enumerate()
            .for_each(|(y, row)| {
                for x in 0..width {
                    let idx = y * width + x;
                    let anchor = confidence.data[idx] / 255.0;

                    let mut weight_sum = 0.0f32;
                    let mut value_sum = 0.0f32;
                    for dy in -radius..=radius {
                        let ny = y as i32 + dy;
                        if ny < 0 || ny >= height as i32 {
                            continue;
                        }
                        for dx in -radius..=radius {
                            if dx == 0 && dy == 0 {
                                continue;
                            }
                            let nx = x as i32 + dx;
                            if nx < 0 || nx >= width as i32 {
                                continue;
                            }
                            let nidx = ny as usize * width + nx as usize;

                            let spatial = (dx * dx + dy * dy) as f32;
                            let mut luma_diff = guide.sample(nx as usize, ny as usize, 0) as f32
                                - guide.sample(x, y, 0) as f32;
                            let mut chroma_diff = 0.0f32;
                            if channels == 3 {
                                let l0 = (guide.sample(x, y, 0) as f32
                                    + guide.sample(x, y, 1) as f32
                                    + guide.sample(x, y, 2) as f32)
                                    / 3.0;
                                let l1 = (guide.sample(nx as usize, ny as usize, 0) as f32
                                    + guide.sample(nx as usize, ny as usize, 1) as f32
                                    + guide.sample(nx as usize, ny as usize, 2) as f32)
                                    / 3.0;
                                luma_diff = l1 - l0;
                                for c in 0..3 {
                                    let d = guide.sample(nx as usize, ny as usize, c) as f32
                                        - guide.sample(x, y, c) as f32
                                        - luma_diff;
                                    chroma_diff += d * d;
                                }
                            }

                            let w = (-spatial / spatial_sigma2
                                - (luma_diff * luma_diff) / luma_sigma2
                                - chroma_diff / chroma_sigma2)
                                .exp();
                            weight_sum += w;
                            value_sum += w * current[nidx];
                        }
                    }

                    let denom = anchor + lambda * weight_sum;
                    row[x] = if denom > f32::EPSILON {
                        (anchor * original[idx] + lambda * value_sum) / denom
                    } else {
                        current[idx]
                    };
                }
            });
        std::mem::swap(&mut current, &mut next);
    }

    let min_fp = (disparity.min_disparity * DISPARITY_SCALE) as f32;
    let max_fp = (disparity.max_disparity * DISPARITY_SCALE) as f32;
    for (dst, &v) in disparity.data.iter_mut().zip(current.iter()) {
        *dst = v.clamp(min_fp, max_fp).round() as i16;
    }
}

/// Inputs to one post-filter run for a stereo pair.
pub struct PostFilterInput<'a> {
    pub mode: FilterMode,
    /// Raw left-eye disparity from the matcher.
    pub left: DisparityMap,
    /// Complementary or dual-eye right disparity; `None` reuses the left
    /// result for the right eye.
    pub right: Option<DisparityMap>,
    pub guide_left: MatcherInput<'a>,
    pub guide_right: MatcherInput<'a>,
    pub dual_eye: bool,
    pub block_size: usize,
    pub wls: WlsParams,
    pub fbs: FbsParams,
    /// Width the downstream packer expects; narrower outputs get zero
    /// confidence instead of out-of-bounds sampling.
    pub expected_width: u32,
}

pub struct PostFilterOutput {
    pub left: DisparityMap,
    pub left_confidence: ConfidenceMap,
    pub right: DisparityMap,
    pub right_confidence: ConfidenceMap,
}

/// Run the configured filter pipeline over one or both eyes.
pub fn run_post_filter(input: PostFilterInput<'_>) -> PostFilterOutput {
    let PostFilterInput {
        mode,
        mut left,
        right,
        guide_left,
        guide_right,
        dual_eye,
        block_size,
        wls,
        fbs,
        expected_width,
    } = input;

    let width = left.width;
    let height = left.height;

    let (mut left_conf, right_out, mut right_conf) = match mode {
        FilterMode::None => {
            let conf = ConfidenceMap::new_full(width, height);
            let right_out = right.unwrap_or_else(|| left.clone());
            let right_conf = ConfidenceMap::new_full(right_out.width, right_out.height);
            (conf, right_out, right_conf)
        }
        FilterMode::HoleFill | FilterMode::Fbs => {
            let mut conf = ConfidenceMap::new_full(width, height);
            fill_holes(&mut left, &mut conf, true);
            if mode == FilterMode::Fbs {
                fbs_filter(&mut left, &guide_left, &conf, &fbs);
            }

            // The right eye gets the same treatment whether it came from the
            // dual-eye pass or the complementary matcher; only the scan
            // direction differs from the left eye.
            let (right_out, right_conf) = match right {
                Some(mut r) => {
                    let mut rc = ConfidenceMap::new_full(r.width, r.height);
                    fill_holes(&mut r, &mut rc, false);
                    if mode == FilterMode::Fbs {
                        fbs_filter(&mut r, &guide_right, &rc, &fbs);
                    }
                    (r, rc)
                }
                None => (left.clone(), conf.clone()),
            };
            (conf, right_out, right_conf)
        }
        FilterMode::Wls | FilterMode::WlsFbs => {
            let right_raw = right.unwrap_or_else(|| left.clone());
            let left_raw = left.clone();
            let conf = wls_filter(&mut left, &right_raw, &guide_left, &wls, block_size);

            let (mut right_out, right_conf) = if dual_eye {
                let mut r = right_raw;
                let rc = wls_filter(&mut r, &left_raw, &guide_right, &wls, block_size);
                (r, rc)
            } else {
                (right_raw, conf.clone())
            };

            if mode == FilterMode::WlsFbs {
                fbs_filter(&mut left, &guide_left, &conf, &fbs);
                if dual_eye {
                    fbs_filter(&mut right_out, &guide_right, &right_conf, &fbs);
                }
            }
            (conf, right_out, right_conf)
        }
    };

    if left.width < expected_width {
        left_conf = ConfidenceMap::new_zero(left.width, left.height);
    }
    if right_out.width < expected_width {
        right_conf = ConfidenceMap::new_zero(right_out.width, right_out.height);
    }

    PostFilterOutput {
        left,
        left_confidence: left_conf,
        right: right_out,
        right_confidence: right_conf,
    }
}
