//! Semi-global block matching.
//!
//! The matcher is cheap to construct and is rebuilt from the configuration
//! snapshot every cycle. Input images are expected to be pre-extended on the
//! left by the disparity search range so the search never starves at the
//! image boundary.

use depthcv_core::{MatcherParams, MatcherVariant};
use rayon::prelude::*;
use wide::f32x8;

use crate::{
    DisparityMap, DisparityMatcher, Error, MatcherInput, Result, DISPARITY_SCALE,
};

#[derive(Debug, Clone)]
pub struct SgbmMatcher {
    pub min_disparity: i32,
    pub max_disparity: i32,
    pub block_size: usize,
    /// Penalty for a one-step disparity change, pre-scaled by block_size^2.
    pub p1: f32,
    /// Penalty for larger disparity jumps, pre-scaled by block_size^2.
    pub p2: f32,
    pub uniqueness_ratio: i32,
    pub speckle_window_size: i32,
    pub speckle_range: i32,
    pub disp12_max_diff: i32,
    pub pre_filter_cap: i32,
    /// Aggregation directions.
    pub paths: Vec<(i32, i32)>,
    pub parallel: bool,
}

fn paths_for(variant: MatcherVariant) -> Vec<(i32, i32)> {
    match variant {
        MatcherVariant::SinglePass => vec![(1, 0), (-1, 0)],
        MatcherVariant::Standard => vec![(1, 0), (-1, 0), (0, -1), (-1, -1), (1, -1)],
        MatcherVariant::Full => vec![
            (1, 0),
            (-1, 0),
            (0, 1),
            (0, -1),
            (1, 1),
            (-1, 1),
            (1, -1),
            (-1, -1),
        ],
    }
}

impl SgbmMatcher {
    /// Build a matcher from the per-cycle configuration snapshot.
    pub fn from_params(
        min_disparity: i32,
        max_disparity: i32,
        params: &MatcherParams,
        parallel: bool,
    ) -> Self {
        let block_scale = (params.block_size * params.block_size) as f32;
        let p1 = params.p1 as f32 * block_scale;
        let p2 = (params.p2 as f32 * block_scale).max(p1 + 1.0);
        Self {
            min_disparity,
            max_disparity,
            block_size: params.block_size,
            p1,
            p2,
            uniqueness_ratio: params.uniqueness_ratio,
            speckle_window_size: params.speckle_window_size,
            speckle_range: params.effective_speckle_range(),
            disp12_max_diff: params.disp12_max_diff,
            pre_filter_cap: params.pre_filter_cap,
            paths: paths_for(params.variant),
            parallel,
        }
    }

    /// Complementary matcher producing the right-to-left disparity over the
    /// mirrored interval `[-max, -min]`.
    pub fn derive_right_matcher(&self) -> Self {
        let mut right = self.clone();
        right.min_disparity = -self.max_disparity;
        right.max_disparity = -self.min_disparity;
        right
    }

    fn num_disparities(&self) -> usize {
        (self.max_disparity - self.min_disparity) as usize
    }
}

impl DisparityMatcher for SgbmMatcher {
    fn compute(&self, left: &MatcherInput<'_>, right: &MatcherInput<'_>) -> Result<DisparityMap> {
        if left.width != right.width
            || left.height != right.height
            || left.channels != right.channels
        {
            return Err(Error::DimensionMismatch(
                "stereo pair must share dimensions and channel count".to_string(),
            ));
        }
        let num_disparities = self.num_disparities();
        if num_disparities == 0 {
            return Err(Error::InvalidParameters(
                "disparity interval is empty".to_string(),
            ));
        }
        if (left.width as usize) <= num_disparities + self.block_size {
            return Err(Error::DimensionMismatch(
                "input narrower than the disparity search range".to_string(),
            ));
        }

        let width = left.width as usize;
        let height = left.height as usize;

        let left_planes = prefilter_planes(left, self.pre_filter_cap, self.parallel);
        let right_planes = prefilter_planes(right, self.pre_filter_cap, self.parallel);

        let costs = self.matching_costs(&left_planes, &right_planes, width, height);
        let aggregated = self.aggregate_costs(&costs, width, height, num_disparities);

        let mut disparity = DisparityMap::new(
            left.width,
            left.height,
            self.min_disparity,
            self.max_disparity,
        );
        self.winner_take_all(&aggregated, width, num_disparities, &mut disparity);

        if self.disp12_max_diff >= 0 {
            self.left_right_check(&aggregated, width, height, num_disparities, &mut disparity);
        }
        if self.speckle_window_size > 0 {
            filter_speckles(
                &mut disparity,
                self.speckle_window_size,
                self.speckle_range * DISPARITY_SCALE,
            );
        }

        Ok(disparity)
    }
}

/// Clamped horizontal derivative per channel, the texture signal the SAD cost
/// operates on. Output values span `[0, 2 * cap]`.
fn prefilter_planes(input: &MatcherInput<'_>, cap: i32, parallel: bool) -> Vec<Vec<f32>> {
    let width = input.width as usize;
    let height = input.height as usize;
    let cap = cap.max(1) as f32;

    (0..input.channels as usize)
        .map(|c| {
            let mut plane = vec![0.0f32; width * height];
            let fill_row = |y: usize, row: &mut [f32]| {
                let mut raw = vec![0.0f32; width];
                for x in 0..width {
                    let prev = input.sample(x.saturating_sub(1), y, c) as f32;
                    let next = input.sample((x + 1).min(width - 1), y, c) as f32;
                    raw[x] = next - prev;
                }
                let lo = f32x8::splat(-cap);
                let hi = f32x8::splat(cap);
                let offset = f32x8::splat(cap);
                let chunks = width / 8;
                for i in 0..chunks {
                    let mut lane = [0.0f32; 8];
                    lane.copy_from_slice(&raw[i * 8..i * 8 + 8]);
                    let v = (f32x8::from(lane).max(lo).min(hi) + offset).to_array();
                    row[i * 8..i * 8 + 8].copy_from_slice(&v);
                }
                for x in chunks * 8..width {
                    row[x] = raw[x].clamp(-cap, cap) + cap;
                }
            };
            if parallel {
                plane
                    .par_chunks_mut(width)
                    .enumerate()
                    .for_each(|(y, row)| fill_row(y, row));
            } else {
                plane
                    .chunks_mut(width)
                    .enumerate()
                    .for_each(|(y, row)| fill_row(y, row));
            }
            plane
        })
        .collect()
}

impl SgbmMatcher {
    /// Block SAD cost volume, laid out `(y, x, d)`.
    fn matching_costs(
        &self,
        left_planes: &[Vec<f32>],
        right_planes: &[Vec<f32>],
        width: usize,
        height: usize,
    ) -> Vec<f32> {
        let num_disparities = self.num_disparities();
        let half = (self.block_size / 2) as i32;
        let min_d = self.min_disparity;

        let mut costs = vec![0.0f32; width * height * num_disparities];
        let row_stride = width * num_disparities;

        let fill_row = |y: usize, row_costs: &mut [f32]| {
            for x in 0..width {
                for d_idx in 0..num_disparities {
                    let d = min_d + d_idx as i32;
                    let mut cost = 0.0f32;
                    for dy in -half..=half {
                        let ly = (y as i32 + dy).clamp(0, height as i32 - 1) as usize;
                        for dx in -half..=half {
                            let lx = (x as i32 + dx).clamp(0, width as i32 - 1) as usize;
                            let rx = (lx as i32 - d).clamp(0, width as i32 - 1) as usize;
                            for plane in 0..left_planes.len() {
                                let lv = left_planes[plane][ly * width + lx];
                                let rv = right_planes[plane][ly * width + rx];
                                cost += (lv - rv).abs();
                            }
                        }
                    }
                    row_costs[x * num_disparities + d_idx] = cost;
                }
            }
        };

        if self.parallel {
            costs
                .par_chunks_mut(row_stride)
                .enumerate()
                .for_each(|(y, row)| fill_row(y, row));
        } else {
            costs
                .chunks_mut(row_stride)
                .enumerate()
                .for_each(|(y, row)| fill_row(y, row));
        }

        costs
    }

    fn aggregate_costs(
        &self,
        cost_volume: &[f32],
        width: usize,
        height: usize,
        num_disparities: usize,
    ) -> Vec<f32> {
        let mut aggregated = vec![0.0f32; width * height * num_disparities];
        // Scratch reused across directions to avoid allocation churn.
        let mut path_costs = vec![0.0f32; width * height * num_disparities];

        for &(dx, dy) in &self.paths {
            self.aggregate_along_path(
                cost_volume,
                &mut aggregated,
                &mut path_costs,
                width,
                height,
                num_disparities,
                dx,
                dy,
            );
        }

        aggregated
    }

    #[allow(clippy::too_many_arguments)]
    fn aggregate_along_path(
        &self,
        cost_volume: &[f32],
        aggregated: &mut [f32],
        path_costs: &mut [f32],
        width: usize,
        height: usize,
        num_disparities: usize,
        dx: i32,
        dy: i32,
    ) {
        let (x_start, x_end, x_step) = if dx >= 0 {
            (0i32, width as i32, 1i32)
        } else {
            (width as i32 - 1, -1i32, -1i32)
        };
        let (y_start, y_end, y_step) = if dy >= 0 {
            (0i32, height as i32, 1i32)
        } else {
            (height as i32 - 1, -1i32, -1i32)
        };

        let mut y = y_start;
        while y != y_end {
            let mut x = x_start;
            while x != x_end {
                let px = x - dx;
                let py = y - dy;
                let idx_base = (y as usize * width + x as usize) * num_disparities;

                if px >= 0 && px < width as i32 && py >= 0 && py < height as i32 {
                    let prev_idx = (py as usize * width + px as usize) * num_disparities;
                    let mut prev_min = f32::INFINITY;
                    for pd in 0..num_disparities {
                        prev_min = prev_min.min(path_costs[prev_idx + pd]);
                    }
                    let p2_base = prev_min + self.p2;

                    for d in 0..num_disparities {
                        let cd = cost_volume[idx_base + d];
                        let l0 = path_costs[prev_idx + d];
                        let l1 = if d > 0 {
                            path_costs[prev_idx + d - 1] + self.p1
                        } else {
                            f32::INFINITY
                        };
                        let l2 = if d + 1 < num_disparities {
                            path_costs[prev_idx + d + 1] + self.p1
                        } else {
                            f32::INFINITY
                        };
                        let best_prev = l0.min(l1).min(l2).min(p2_base);
                        let lr = cd + best_prev - prev_min;
                        path_costs[idx_base + d] = lr;
                        aggregated[idx_base + d] += lr;
                    }
                } else {
                    for d in 0..num_disparities {
                        let cd = cost_volume[idx_base + d];
                        path_costs[idx_base + d] = cd;
                        aggregated[idx_base + d] += cd;
                    }
                }

                x += x_step;
            }
            y += y_step;
        }
    }

    /// Winner-take-all with uniqueness gating and parabolic sub-pixel
    /// refinement into fixed-point units.
    fn winner_take_all(
        &self,
        aggregated: &[f32],
        width: usize,
        num_disparities: usize,
        disparity: &mut DisparityMap,
    ) {
        let min_d = self.min_disparity;
        let uniqueness = self.uniqueness_ratio;
        let invalid = disparity.invalid_value();

        let fill_row = |y: usize, row: &mut [i16]| {
            for (x, out) in row.iter_mut().enumerate() {
                let idx_base = (y * width + x) * num_disparities;
                let mut best = 0usize;
                let mut min_cost = f32::INFINITY;
                for d in 0..num_disparities {
                    let c = aggregated[idx_base + d];
                    if c < min_cost {
                        min_cost = c;
                        best = d;
                    }
                }

                let mut rejected = false;
                if uniqueness > 0 {
                    let factor = (100 - uniqueness) as f32 / 100.0;
                    for d in 0..num_disparities {
                        if (d as i32 - best as i32).abs() > 1
                            && aggregated[idx_base + d] * factor < min_cost
                        {
                            rejected = true;
                            break;
                        }
                    }
                }
                if rejected {
                    *out = invalid;
                    continue;
                }

                let mut value = (min_d + best as i32) as f32;
                if best > 0 && best + 1 < num_disparities {
                    let c_prev = aggregated[idx_base + best - 1];
                    let c_next = aggregated[idx_base + best + 1];
                    let denom = c_prev + c_next - 2.0 * min_cost;
                    if denom > f32::EPSILON {
                        let offset = ((c_prev - c_next) / (2.0 * denom)).clamp(-0.5, 0.5);
                        value += offset;
                    }
                }
                *out = (value * DISPARITY_SCALE as f32).round() as i16;
            }
        };

        if self.parallel {
            disparity
                .data
                .par_chunks_mut(width)
                .enumerate()
                .for_each(|(y, row)| fill_row(y, row));
        } else {
            disparity
                .data
                .chunks_mut(width)
                .enumerate()
                .for_each(|(y, row)| fill_row(y, row));
        }
    }

    /// Invalidate pixels whose disparity disagrees with the implied
    /// right-image winner by more than `disp12_max_diff`.
    fn left_right_check(
        &self,
        aggregated: &[f32],
        width: usize,
        height: usize,
        num_disparities: usize,
        disparity: &mut DisparityMap,
    ) {
        let min_d = self.min_disparity;
        let max_diff = self.disp12_max_diff;
        let invalid = disparity.invalid_value();

        for y in 0..height {
            // Right-image winner per column, reusing the aggregated volume:
            // the cost of left pixel (xr + d) at disparity d belongs to right
            // pixel xr.
            let mut right_best = vec![i32::MIN; width];
            let mut right_cost = vec![f32::INFINITY; width];
            for xr in 0..width {
                for d_idx in 0..num_disparities {
                    let d = min_d + d_idx as i32;
                    let xl = xr as i32 + d;
                    if xl < 0 || xl >= width as i32 {
                        continue;
                    }
                    let c = aggregated[(y * width + xl as usize) * num_disparities + d_idx];
                    if c < right_cost[xr] {
                        right_cost[xr] = c;
                        right_best[xr] = d;
                    }
                }
            }

            for x in 0..width {
                let v = disparity.get(x as u32, y as u32);
                if v == invalid {
                    continue;
                }
                let d = (v as f32 / DISPARITY_SCALE as f32).round() as i32;
                let xr = x as i32 - d;
                if xr < 0 || xr >= width as i32 {
                    continue;
                }
                let rd = right_best[xr as usize];
                if rd != i32::MIN && (rd - d).abs() > max_diff {
                    disparity.set(x as u32, y as u32, invalid);
                }
            }
        }
    }
}

/// Remove small connected regions of similar disparity.
///
/// `max_diff` is in fixed-point units; regions smaller than `window_size`
/// pixels are marked invalid.
pub fn filter_speckles(disparity: &mut DisparityMap, window_size: i32, max_diff: i32) {
    let width = disparity.width as usize;
    let height = disparity.height as usize;
    let invalid = disparity.invalid_value();

    let mut labels = vec![0u32; width * height];
    let mut region = Vec::new();
    let mut next_label = 1u32;

    for start in 0..width * height {
        if labels[start] != 0 || disparity.data[start] == invalid {
            continue;
        }
        let label = next_label;
        next_label += 1;

        region.clear();
        region.push(start);
        labels[start] = label;
        let mut head = 0;
        while head < region.len() {
            let idx = region[head];
            head += 1;
            let x = idx % width;
            let y = idx / width;
            let value = disparity.data[idx] as i32;

            let mut visit = |nx: usize, ny: usize| {
                let nidx = ny * width + nx;
                if labels[nidx] != 0 {
                    return;
                }
                let nv = disparity.data[nidx];
                if nv != invalid && (nv as i32 - value).abs() <= max_diff {
                    labels[nidx] = label;
                    region.push(nidx);
                }
            };
            if x > 0 {
                visit(x - 1, y);
            }
            if x + 1 < width {
                visit(x + 1, y);
            }
            if y > 0 {
                visit(x, y - 1);
            }
            if y + 1 < height {
                visit(x, y + 1);
            }
        }

        if (region.len() as i32) < window_size {
            for &idx in &region {
                disparity.data[idx] = invalid;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;

    fn texture(x: u32, y: u32) -> u8 {
        // Deterministic high-frequency pattern.
        let h = x.wrapping_mul(31).wrapping_add(y.wrapping_mul(17));
        (h.wrapping_mul(2654435761) >> 24) as u8
    }

    fn shifted_pair(width: u32, height: u32, shift: u32) -> (GrayImage, GrayImage) {
        let left = GrayImage::from_fn(width, height, |x, y| image::Luma([texture(x, y)]));
        let right = GrayImage::from_fn(width, height, |x, y| image::Luma([texture(x + shift, y)]));
        (left, right)
    }

    fn default_matcher(min: i32, max: i32) -> SgbmMatcher {
        let mut params = MatcherParams::default();
        params.speckle_window_size = 0;
        SgbmMatcher::from_params(min, max, &params, true)
    }

    #[test]
    fn recovers_constant_shift() {
        // The right image samples the pattern 5 columns ahead, so every left
        // pixel matches 5 columns to its left: disparity 5.
        let (left, right) = shifted_pair(96, 32, 5);
        let matcher = default_matcher(0, 16);
        let disparity = matcher
            .compute(&MatcherInput::from_gray(&left), &MatcherInput::from_gray(&right))
            .unwrap();

        let mut hits = 0usize;
        let mut total = 0usize;
        for y in 8..24u32 {
            for x in 24..72u32 {
                let v = disparity.get(x, y);
                if v == disparity.invalid_value() {
                    continue;
                }
                total += 1;
                if (v as i32 - 5 * DISPARITY_SCALE).abs() <= DISPARITY_SCALE {
                    hits += 1;
                }
            }
        }
        assert!(total > 0);
        assert!(
            hits * 10 >= total * 8,
            "expected most of the interior at disparity 5, got {hits}/{total}"
        );
    }

    #[test]
    fn right_matcher_mirrors_the_interval() {
        let matcher = default_matcher(0, 16);
        let right = matcher.derive_right_matcher();
        assert_eq!(right.min_disparity, -16);
        assert_eq!(right.max_disparity, 0);

        let (left_img, right_img) = shifted_pair(96, 32, 5);
        let disparity = right
            .compute(
                &MatcherInput::from_gray(&right_img),
                &MatcherInput::from_gray(&left_img),
            )
            .unwrap();

        let mut hits = 0usize;
        let mut total = 0usize;
        for y in 8..24u32 {
            for x in 24..72u32 {
                let v = disparity.get(x, y);
                if v == disparity.invalid_value() {
                    continue;
                }
                total += 1;
                if (v as i32 + 5 * DISPARITY_SCALE).abs() <= DISPARITY_SCALE {
                    hits += 1;
                }
            }
        }
        assert!(total > 0);
        assert!(
            hits * 10 >= total * 8,
            "expected negated disparity from the right matcher, got {hits}/{total}"
        );
    }

    #[test]
    fn rejects_mismatched_inputs() {
        let a = GrayImage::new(64, 32);
        let b = GrayImage::new(64, 16);
        let matcher = default_matcher(0, 16);
        let err = matcher.compute(&MatcherInput::from_gray(&a), &MatcherInput::from_gray(&b));
        assert!(matches!(err, Err(Error::DimensionMismatch(_))));
    }

    #[test]
    fn disparities_stay_in_range() {
        let (left, right) = shifted_pair(96, 32, 3);
        let matcher = default_matcher(0, 16);
        let disparity = matcher
            .compute(&MatcherInput::from_gray(&left), &MatcherInput::from_gray(&right))
            .unwrap();
        for &v in &disparity.data {
            assert!(v == disparity.invalid_value() || disparity.is_valid_value(v));
        }
    }

    #[test]
    fn speckle_filter_drops_small_islands() {
        let mut map = DisparityMap::new(32, 32, 0, 64);
        for v in map.data.iter_mut() {
            *v = 10 * DISPARITY_SCALE as i16;
        }
        // A 2x2 island far from the background value.
        for y in 5..7u32 {
            for x in 5..7u32 {
                map.set(x, y, (40 * DISPARITY_SCALE) as i16);
            }
        }
        filter_speckles(&mut map, 20, DISPARITY_SCALE);
        assert_eq!(map.get(5, 5), map.invalid_value());
        assert_eq!(map.get(0, 0), (10 * DISPARITY_SCALE) as i16);
    }

    #[test]
    fn triple_channel_input_matches() {
        let (left, right) = shifted_pair(96, 32, 4);
        let to_rgb = |g: &GrayImage| {
            image::RgbImage::from_fn(g.width(), g.height(), |x, y| {
                let v = g.get_pixel(x, y)[0];
                image::Rgb([v, v.wrapping_add(3), v.wrapping_mul(2)])
            })
        };
        let left_rgb = to_rgb(&left);
        let right_rgb = to_rgb(&right);
        let matcher = default_matcher(0, 16);
        let disparity = matcher
            .compute(
                &MatcherInput::from_rgb(&left_rgb),
                &MatcherInput::from_rgb(&right_rgb),
            )
            .unwrap();
        let v = disparity.get(48, 16);
        assert!(v == disparity.invalid_value() || disparity.is_valid_value(v));
    }
}
