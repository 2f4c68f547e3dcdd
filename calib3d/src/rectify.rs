//! Stereo rectification solving.
//!
//! Derives rectification rotations, projections and the disparity-to-depth
//! mapping from a calibration snapshot, then bakes per-eye remap tables for
//! the selected lens model. All outputs are tied to the calibration and
//! downscale factor they were built for; the reconstruction loop rebuilds the
//! whole state when either changes.

use depthcv_core::{
    decompose_rigid, rotation_x_180, CalibrationGeometry, CameraIntrinsics, Distortion,
    FisheyeDistortion, FrameLayout, LensModel,
};
use nalgebra::{Matrix3, Matrix3x4, Matrix4, Vector3};
use rayon::prelude::*;

use crate::{CalibError, Result};

/// Source coordinate written for output pixels whose back-projection is
/// degenerate; resolves to the constant border on remap.
const OUT_OF_RANGE: f32 = -1.0;

#[derive(Debug, Clone)]
pub struct StereoRectifyMatrices {
    pub r1: Matrix3<f64>,
    pub r2: Matrix3<f64>,
    pub p1: Matrix3x4<f64>,
    pub p2: Matrix3x4<f64>,
    pub q: Matrix4<f64>,
}

/// One eye's per-pixel output -> source coordinate lookup.
#[derive(Debug, Clone)]
pub struct RemapTable {
    pub map_x: Vec<f32>,
    pub map_y: Vec<f32>,
    pub width: u32,
    pub height: u32,
}

/// Everything derived from one calibration snapshot: remap tables, rectified
/// rotations/projections and the disparity-to-depth transform.
#[derive(Debug, Clone)]
pub struct RectificationState {
    pub map_left: RemapTable,
    pub map_right: RemapTable,
    pub rotation_left: Matrix3<f64>,
    pub rotation_right: Matrix3<f64>,
    pub projection_left: Matrix3x4<f64>,
    pub projection_right: Matrix3x4<f64>,
    pub disparity_to_depth: Matrix4<f64>,
    /// Per-eye frame size at full camera resolution.
    pub frame_width: u32,
    pub frame_height: u32,
    /// Matcher input size after downscaling.
    pub cv_width: u32,
    pub cv_height: u32,
    pub downscale_factor: u32,
}

/// Bouguet-style rectification decomposition for a relative eye transform
/// (`x_right = R x_left + T`).
pub fn rectify_decomposition(
    left: &CameraIntrinsics,
    right: &CameraIntrinsics,
    rel_rotation: &Matrix3<f64>,
    rel_translation: &Vector3<f64>,
) -> Result<StereoRectifyMatrices> {
    if left.is_degenerate() || right.is_degenerate() {
        return Err(CalibError::DegenerateGeometry(
            "rectify_decomposition requires finite non-zero focal lengths".to_string(),
        ));
    }
    let baseline = rel_translation.norm();
    if baseline <= 1e-12 || !baseline.is_finite() {
        return Err(CalibError::DegenerateGeometry(
            "rectify_decomposition requires a non-zero baseline".to_string(),
        ));
    }

    let ex = rel_translation / baseline;
    // Orient the rectified x-axis along the positive baseline direction so
    // the rectified frames keep the source orientation regardless of which
    // eye the calibration measures the translation from.
    let dominant = if ex[0].abs() >= ex[1].abs() { 0 } else { 1 };
    let ex = if ex[dominant] < 0.0 { -ex } else { ex };
    let helper = if ex[2].abs() < 0.9 {
        Vector3::<f64>::new(0.0, 0.0, 1.0)
    } else {
        Vector3::<f64>::new(0.0, 1.0, 0.0)
    };
    let ey = helper.cross(&ex).normalize();
    let ez = ex.cross(&ey).normalize();
    let basis = Matrix3::from_columns(&[ex, ey, ez]);
    let r_rect = basis.transpose();

    let r1 = r_rect;
    let r2 = r_rect * rel_rotation;

    let fx = 0.5 * (left.fx + right.fx);
    let fy = 0.5 * (left.fy + right.fy);
    let cx = 0.5 * (left.cx + right.cx);
    let cy = 0.5 * (left.cy + right.cy);
    let tx = -fx * baseline;

    let p1 = Matrix3x4::new(
        fx, 0.0, cx, 0.0, //
        0.0, fy, cy, 0.0, //
        0.0, 0.0, 1.0, 0.0,
    );
    let p2 = Matrix3x4::new(
        fx, 0.0, cx, tx, //
        0.0, fy, cy, 0.0, //
        0.0, 0.0, 1.0, 0.0,
    );

    let mut q = Matrix4::<f64>::zeros();
    q[(0, 0)] = 1.0;
    q[(0, 3)] = -cx;
    q[(1, 1)] = 1.0;
    q[(1, 3)] = -cy;
    q[(2, 3)] = fx;
    q[(3, 2)] = -1.0 / tx;

    Ok(StereoRectifyMatrices { r1, r2, p1, p2, q })
}

fn projection_intrinsics(p: &Matrix3x4<f64>, width: u32, height: u32) -> CameraIntrinsics {
    CameraIntrinsics::new(p[(0, 0)], p[(1, 1)], p[(0, 2)], p[(1, 2)], width, height)
}

/// Create remap matrices for pinhole undistortion with rectification.
pub fn init_undistort_rectify_map(
    image_size: (u32, u32),
    intrinsics: &CameraIntrinsics,
    distortion: &Distortion,
    rectification: &Matrix3<f64>,
    new_intrinsics: &CameraIntrinsics,
) -> Result<RemapTable> {
    build_rectify_map(image_size, intrinsics, rectification, new_intrinsics, |x, y| {
        distortion.apply(x, y)
    })
}

/// Fisheye variant of [`init_undistort_rectify_map`].
pub fn fisheye_init_undistort_rectify_map(
    image_size: (u32, u32),
    intrinsics: &CameraIntrinsics,
    distortion: &FisheyeDistortion,
    rectification: &Matrix3<f64>,
    new_intrinsics: &CameraIntrinsics,
) -> Result<RemapTable> {
    build_rectify_map(image_size, intrinsics, rectification, new_intrinsics, |x, y| {
        distortion.apply(x, y)
    })
}

fn build_rectify_map<F>(
    image_size: (u32, u32),
    intrinsics: &CameraIntrinsics,
    rectification: &Matrix3<f64>,
    new_intrinsics: &CameraIntrinsics,
    distort: F,
) -> Result<RemapTable>
where
    F: Fn(f64, f64) -> (f64, f64) + Sync,
{
    let (width, height) = image_size;
    if width == 0 || height == 0 {
        return Err(CalibError::InvalidParameters(
            "rectify map requires a non-zero image size".to_string(),
        ));
    }

    let mut map_x = vec![0.0f32; (width * height) as usize];
    let mut map_y = vec![0.0f32; (width * height) as usize];

    let k_new_inv = new_intrinsics.inverse_matrix();
    let r_inv = rectification
        .try_inverse()
        .ok_or_else(|| CalibError::DegenerateGeometry("non-invertible rectification".into()))?;

    map_x
        .par_chunks_mut(width as usize)
        .zip(map_y.par_chunks_mut(width as usize))
        .enumerate()
        .for_each(|(y, (row_x, row_y))| {
            for x in 0..width as usize {
                let dst = Vector3::new(x as f64, y as f64, 1.0);
                let rectified_norm = k_new_inv * dst;
                let original_norm = r_inv * rectified_norm;

                if original_norm[2].abs() <= 1e-12 {
                    row_x[x] = OUT_OF_RANGE;
                    row_y[x] = OUT_OF_RANGE;
                    continue;
                }
                let xn = original_norm[0] / original_norm[2];
                let yn = original_norm[1] / original_norm[2];
                let (xd, yd) = distort(xn, yn);
                let src_x = intrinsics.fx * xd + intrinsics.cx;
                let src_y = intrinsics.fy * yd + intrinsics.cy;

                if src_x.is_finite() && src_y.is_finite() {
                    row_x[x] = src_x as f32;
                    row_y[x] = src_y as f32;
                } else {
                    row_x[x] = OUT_OF_RANGE;
                    row_y[x] = OUT_OF_RANGE;
                }
            }
        });

    Ok(RemapTable {
        map_x,
        map_y,
        width,
        height,
    })
}

fn identity_map(width: u32, height: u32) -> RemapTable {
    let mut map_x = vec![0.0f32; (width * height) as usize];
    let mut map_y = vec![0.0f32; (width * height) as usize];
    for y in 0..height {
        for x in 0..width {
            let idx = (y * width + x) as usize;
            map_x[idx] = x as f32;
            map_y[idx] = y as f32;
        }
    }
    RemapTable {
        map_x,
        map_y,
        width,
        height,
    }
}

/// Derive the full rectification state for a calibration snapshot.
///
/// The eye-to-eye transform is conjugated by a 180 degree X rotation to move
/// the capture convention into the rendering convention, and its translation
/// is scaled by `depth_offset` before decomposition. After rectification the
/// horizontal/vertical focal terms of both projections are divided by
/// `fov_scale`.
pub fn solve_rectification(
    calibration: &CalibrationGeometry,
    texture_width: u32,
    texture_height: u32,
    downscale_factor: u32,
    fov_scale: f64,
    depth_offset: f64,
) -> Result<RectificationState> {
    if downscale_factor == 0 {
        return Err(CalibError::InvalidParameters(
            "downscale factor must be >= 1".to_string(),
        ));
    }
    if fov_scale <= 0.0 || !fov_scale.is_finite() {
        return Err(CalibError::InvalidParameters(
            "field-of-view scale must be positive".to_string(),
        ));
    }

    let (frame_width, frame_height) = calibration
        .layout
        .eye_frame_size(texture_width, texture_height);
    let cv_width = frame_width / downscale_factor;
    let cv_height = frame_height / downscale_factor;

    if calibration.layout == FrameLayout::Mono {
        // No second eye to rectify against; raw intrinsics serve as the
        // rectified projection and disparity maps straight to depth.
        let k = calibration.intrinsics_left;
        let projection = Matrix3x4::new(
            k.fx, 0.0, k.cx, 0.0, //
            0.0, k.fy, k.cy, 0.0, //
            0.0, 0.0, 1.0, 0.0,
        );
        return Ok(RectificationState {
            map_left: identity_map(frame_width, frame_height),
            map_right: identity_map(frame_width, frame_height),
            rotation_left: Matrix3::identity(),
            rotation_right: Matrix3::identity(),
            projection_left: projection,
            projection_right: projection,
            disparity_to_depth: Matrix4::identity(),
            frame_width,
            frame_height,
            cv_width,
            cv_height,
            downscale_factor,
        });
    }

    let flip = rotation_x_180();
    let adjusted = flip * calibration.left_to_right * flip;
    let (rel_rotation, mut rel_translation) = decompose_rigid(&adjusted);
    rel_translation *= depth_offset;

    let mut rect = rectify_decomposition(
        &calibration.intrinsics_left,
        &calibration.intrinsics_right,
        &rel_rotation,
        &rel_translation,
    )?;

    // Widen/narrow the effective field of view without re-deriving the
    // rectification basis.
    for p in [&mut rect.p1, &mut rect.p2] {
        p[(0, 0)] /= fov_scale;
        p[(1, 1)] /= fov_scale;
    }

    let new_left = projection_intrinsics(&rect.p1, frame_width, frame_height);
    let new_right = projection_intrinsics(&rect.p2, frame_width, frame_height);
    let size = (frame_width, frame_height);

    let (map_left, map_right) = match calibration.lens_model {
        LensModel::Pinhole { left, right } => (
            init_undistort_rectify_map(
                size,
                &calibration.intrinsics_left,
                &left,
                &rect.r1,
                &new_left,
            )?,
            init_undistort_rectify_map(
                size,
                &calibration.intrinsics_right,
                &right,
                &rect.r2,
                &new_right,
            )?,
        ),
        LensModel::Fisheye { left, right } => (
            fisheye_init_undistort_rectify_map(
                size,
                &calibration.intrinsics_left,
                &left,
                &rect.r1,
                &new_left,
            )?,
            fisheye_init_undistort_rectify_map(
                size,
                &calibration.intrinsics_right,
                &right,
                &rect.r2,
                &new_right,
            )?,
        ),
    };

    Ok(RectificationState {
        map_left,
        map_right,
        rotation_left: rect.r1,
        rotation_right: rect.r2,
        projection_left: rect.p1,
        projection_right: rect.p2,
        disparity_to_depth: rect.q,
        frame_width,
        frame_height,
        cv_width,
        cv_height,
        downscale_factor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn horizontal_calibration() -> CalibrationGeometry {
        let k = CameraIntrinsics::new(400.0, 400.0, 320.0, 240.0, 640, 480);
        let mut left_to_right = Matrix4::identity();
        left_to_right[(0, 3)] = -0.064;
        CalibrationGeometry {
            intrinsics_left: k,
            intrinsics_right: k,
            lens_model: LensModel::Pinhole {
                left: Distortion::none(),
                right: Distortion::none(),
            },
            layout: FrameLayout::StereoHorizontal,
            left_to_right,
        }
    }

    #[test]
    fn remap_tables_have_no_undefined_entries() {
        let calib = horizontal_calibration();
        for downscale in [1u32, 2, 4] {
            let state = solve_rectification(&calib, 1280, 480, downscale, 1.0, 1.0).unwrap();
            for table in [&state.map_left, &state.map_right] {
                assert!(table.map_x.iter().all(|v| v.is_finite()));
                assert!(table.map_y.iter().all(|v| v.is_finite()));
            }
            assert_eq!(state.cv_width, 640 / downscale);
            assert_eq!(state.cv_height, 480 / downscale);
        }
    }

    #[test]
    fn fisheye_tables_have_no_undefined_entries() {
        let mut calib = horizontal_calibration();
        calib.lens_model = LensModel::Fisheye {
            left: FisheyeDistortion::new(0.02, -0.004, 0.0, 0.0),
            right: FisheyeDistortion::new(0.021, -0.004, 0.0, 0.0),
        };
        let state = solve_rectification(&calib, 1280, 480, 2, 1.0, 1.0).unwrap();
        for table in [&state.map_left, &state.map_right] {
            assert!(table.map_x.iter().all(|v| v.is_finite()));
            assert!(table.map_y.iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn mono_layout_skips_decomposition() {
        let mut calib = horizontal_calibration();
        calib.layout = FrameLayout::Mono;
        let state = solve_rectification(&calib, 640, 480, 1, 1.0, 1.0).unwrap();
        assert_eq!(state.disparity_to_depth, Matrix4::identity());
        assert_eq!(state.rotation_left, Matrix3::identity());
        // Identity maps: pixel maps to itself.
        let idx = (100 * 640 + 33) as usize;
        assert_eq!(state.map_left.map_x[idx], 33.0);
        assert_eq!(state.map_left.map_y[idx], 100.0);
    }

    #[test]
    fn zero_baseline_is_a_structured_failure() {
        let mut calib = horizontal_calibration();
        calib.left_to_right = Matrix4::identity();
        let err = solve_rectification(&calib, 1280, 480, 1, 1.0, 1.0);
        assert!(matches!(err, Err(CalibError::DegenerateGeometry(_))));
    }

    #[test]
    fn degenerate_intrinsics_are_a_structured_failure() {
        let mut calib = horizontal_calibration();
        calib.intrinsics_left.fx = 0.0;
        let err = solve_rectification(&calib, 1280, 480, 1, 1.0, 1.0);
        assert!(matches!(err, Err(CalibError::DegenerateGeometry(_))));
    }

    #[test]
    fn fov_scale_divides_focal_terms() {
        let calib = horizontal_calibration();
        let base = solve_rectification(&calib, 1280, 480, 1, 1.0, 1.0).unwrap();
        let wide = solve_rectification(&calib, 1280, 480, 1, 2.0, 1.0).unwrap();
        assert!(
            (wide.projection_left[(0, 0)] - base.projection_left[(0, 0)] / 2.0).abs() < 1e-9
        );
        assert!(
            (wide.projection_right[(1, 1)] - base.projection_right[(1, 1)] / 2.0).abs() < 1e-9
        );
    }

    #[test]
    fn depth_offset_scales_disparity_to_depth() {
        let calib = horizontal_calibration();
        let base = solve_rectification(&calib, 1280, 480, 1, 1.0, 1.0).unwrap();
        let offset = solve_rectification(&calib, 1280, 480, 1, 1.0, 2.0).unwrap();
        // Doubling the baseline halves -1/tx in Q.
        let q_base = base.disparity_to_depth[(3, 2)];
        let q_offset = offset.disparity_to_depth[(3, 2)];
        assert!((q_offset - q_base / 2.0).abs() < 1e-12);
    }

    #[test]
    fn identity_calibration_maps_are_near_identity() {
        let calib = horizontal_calibration();
        let state = solve_rectification(&calib, 1280, 480, 1, 1.0, 1.0).unwrap();
        // With identical pinhole eyes and a pure X-baseline the rectified
        // frame coincides with the source frame.
        for (x, y) in [(320u32, 240u32), (100, 50), (500, 400)] {
            let idx = (y * 640 + x) as usize;
            assert!((state.map_left.map_x[idx] - x as f32).abs() < 1e-3);
            assert!((state.map_left.map_y[idx] - y as f32).abs() < 1e-3);
            assert!((state.map_right.map_x[idx] - x as f32).abs() < 1e-3);
            assert!((state.map_right.map_y[idx] - y as f32).abs() < 1e-3);
        }
    }
}
