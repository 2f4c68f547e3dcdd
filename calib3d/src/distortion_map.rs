//! Per-texel UV distortion lookup for the external renderer.
//!
//! Unlike the stereo remap tables, this lookup is built from per-eye
//! undistort-only maps (identity rectification) so the renderer can sample
//! distortion in normalized texture space without knowing the stereo basis.

use std::sync::{Arc, RwLock};

use depthcv_core::{matrix_to_f32, rotation_to_homogeneous, CalibrationGeometry, CameraIntrinsics, FrameLayout, LensModel};
use nalgebra::{Matrix3, Matrix4};

use crate::rectify::{fisheye_init_undistort_rectify_map, init_undistort_rectify_map, RemapTable};
use crate::Result;

/// Per-texel (dx, dy) offsets covering the camera's raw texture, plus the
/// projection/rotation matrices the renderer needs to interpret them.
#[derive(Debug, Clone)]
pub struct UvDistortionMap {
    /// Interleaved (dx, dy) pairs, `width * height` texels.
    pub data: Vec<f32>,
    pub width: u32,
    pub height: u32,
    pub fov_scale: f64,
    pub camera_projection_left: Matrix4<f32>,
    pub camera_projection_right: Matrix4<f32>,
    pub rectified_rotation_left: Matrix4<f32>,
    pub rectified_rotation_right: Matrix4<f32>,
}

/// Renderer-facing handle, read independently of the depth frame cadence.
pub type SharedDistortionMap = Arc<RwLock<UvDistortionMap>>;

impl UvDistortionMap {
    pub fn empty() -> Self {
        UvDistortionMap {
            data: Vec::new(),
            width: 0,
            height: 0,
            fov_scale: 1.0,
            camera_projection_left: Matrix4::identity(),
            camera_projection_right: Matrix4::identity(),
            rectified_rotation_left: Matrix4::identity(),
            rectified_rotation_right: Matrix4::identity(),
        }
    }
}

fn scaled_intrinsics(k: &CameraIntrinsics, fov_scale: f64) -> CameraIntrinsics {
    CameraIntrinsics::new(k.fx / fov_scale, k.fy / fov_scale, k.cx, k.cy, k.width, k.height)
}

fn undistort_only_map(
    calibration: &CalibrationGeometry,
    left_eye: bool,
    size: (u32, u32),
    fov_scale: f64,
) -> Result<RemapTable> {
    let intrinsics = if left_eye {
        &calibration.intrinsics_left
    } else {
        &calibration.intrinsics_right
    };
    let new_intrinsics = scaled_intrinsics(intrinsics, fov_scale);
    let identity = Matrix3::identity();
    match calibration.lens_model {
        LensModel::Pinhole { left, right } => {
            let d = if left_eye { left } else { right };
            init_undistort_rectify_map(size, intrinsics, &d, &identity, &new_intrinsics)
        }
        LensModel::Fisheye { left, right } => {
            let d = if left_eye { left } else { right };
            fisheye_init_undistort_rectify_map(size, intrinsics, &d, &identity, &new_intrinsics)
        }
    }
}

fn projection_matrix(k: &CameraIntrinsics) -> Matrix4<f32> {
    let mut m = Matrix4::<f64>::identity();
    m[(0, 0)] = k.fx;
    m[(1, 1)] = k.fy;
    m[(0, 2)] = k.cx;
    m[(1, 2)] = k.cy;
    matrix_to_f32(&m)
}

/// Write one eye's offsets into its slot of the lookup.
///
/// `col_offset`/`row_offset` select the slot in texels; `norm_x`/`norm_y`
/// divide the pixel offsets into normalized texture space.
fn fill_slot(
    data: &mut [f32],
    stride_texels: u32,
    map: &RemapTable,
    col_offset: u32,
    row_offset: u32,
    norm_x: f32,
    norm_y: f32,
) {
    for y in 0..map.height {
        let row_start = (((row_offset + y) * stride_texels + col_offset) * 2) as usize;
        let map_row = (y * map.width) as usize;
        for x in 0..map.width as usize {
            let dx = map.map_x[map_row + x] - x as f32;
            let dy = map.map_y[map_row + x] - y as f32;
            data[row_start + x * 2] = dx / norm_x;
            data[row_start + x * 2 + 1] = dy / norm_y;
        }
    }
}

/// Build the UV distortion lookup for the camera's raw texture layout.
///
/// Horizontal split: left eye in the first half of each row, right in the
/// second, with the horizontal offset normalization additionally halved.
/// Vertical split: left eye in the first half of the lookup's rows even
/// though the camera buffer carries it in the second half, with the vertical
/// normalization halved. Mono: a single slot covering the whole texture.
pub fn build_uv_distortion_map(
    calibration: &CalibrationGeometry,
    texture_width: u32,
    texture_height: u32,
    fov_scale: f64,
) -> Result<UvDistortionMap> {
    let (frame_width, frame_height) = calibration
        .layout
        .eye_frame_size(texture_width, texture_height);
    let size = (frame_width, frame_height);
    let fw = frame_width as f32;
    let fh = frame_height as f32;

    let mut data = vec![0.0f32; (texture_width * texture_height * 2) as usize];

    let left = undistort_only_map(calibration, true, size, fov_scale)?;

    match calibration.layout {
        FrameLayout::StereoHorizontal => {
            let right = undistort_only_map(calibration, false, size, fov_scale)?;
            fill_slot(&mut data, texture_width, &left, 0, 0, fw * 2.0, fh);
            fill_slot(&mut data, texture_width, &right, frame_width, 0, fw * 2.0, fh);
        }
        FrameLayout::StereoVertical => {
            let right = undistort_only_map(calibration, false, size, fov_scale)?;
            fill_slot(&mut data, texture_width, &left, 0, 0, fw, fh * 2.0);
            fill_slot(&mut data, texture_width, &right, 0, frame_height, fw, fh * 2.0);
        }
        FrameLayout::Mono => {
            fill_slot(&mut data, texture_width, &left, 0, 0, fw, fh);
        }
    }

    let projection_left = projection_matrix(&scaled_intrinsics(
        &calibration.intrinsics_left,
        fov_scale,
    ));
    let projection_right = projection_matrix(&scaled_intrinsics(
        &calibration.intrinsics_right,
        fov_scale,
    ));

    Ok(UvDistortionMap {
        data,
        width: texture_width,
        height: texture_height,
        fov_scale,
        camera_projection_left: projection_left,
        camera_projection_right: projection_right,
        rectified_rotation_left: matrix_to_f32(&rotation_to_homogeneous(&Matrix3::identity())),
        rectified_rotation_right: matrix_to_f32(&rotation_to_homogeneous(&Matrix3::identity())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use depthcv_core::Distortion;

    fn calibration(layout: FrameLayout) -> CalibrationGeometry {
        let k = CameraIntrinsics::new(300.0, 300.0, 160.0, 120.0, 320, 240);
        CalibrationGeometry {
            intrinsics_left: k,
            intrinsics_right: k,
            lens_model: LensModel::Pinhole {
                left: Distortion::none(),
                right: Distortion::none(),
            },
            layout,
            left_to_right: {
                let mut m = Matrix4::identity();
                m[(0, 3)] = -0.064;
                m
            },
        }
    }

    fn texel(map: &UvDistortionMap, x: u32, y: u32) -> (f32, f32) {
        let idx = ((y * map.width + x) * 2) as usize;
        (map.data[idx], map.data[idx + 1])
    }

    #[test]
    fn undistorted_lens_produces_zero_offsets() {
        let map = build_uv_distortion_map(&calibration(FrameLayout::StereoHorizontal), 640, 240, 1.0)
            .unwrap();
        assert_eq!(map.data.len(), 640 * 240 * 2);
        let (dx, dy) = texel(&map, 100, 100);
        assert!(dx.abs() < 1e-6 && dy.abs() < 1e-6);
        let (dx, dy) = texel(&map, 320 + 100, 100);
        assert!(dx.abs() < 1e-6 && dy.abs() < 1e-6);
    }

    #[test]
    fn horizontal_layout_halves_horizontal_normalization() {
        let mut calib = calibration(FrameLayout::StereoHorizontal);
        calib.lens_model = LensModel::Pinhole {
            left: Distortion::new(0.1, 0.01, 0.0, 0.0, 0.0),
            right: Distortion::new(0.1, 0.01, 0.0, 0.0, 0.0),
        };
        let map = build_uv_distortion_map(&calib, 640, 240, 1.0).unwrap();
        let mut vert = calib.clone();
        vert.layout = FrameLayout::StereoVertical;
        let vmap = build_uv_distortion_map(&vert, 320, 480, 1.0).unwrap();

        // Same eye-frame pixel offset, different normalization per split axis.
        let (h_dx, h_dy) = texel(&map, 13, 41);
        let (v_dx, v_dy) = texel(&vmap, 13, 41);
        assert!((h_dx * 2.0 - v_dx).abs() < 1e-6);
        assert!((h_dy - v_dy * 2.0).abs() < 1e-6);
    }

    #[test]
    fn vertical_layout_keeps_left_eye_first_in_lookup() {
        let mut calib = calibration(FrameLayout::StereoVertical);
        calib.intrinsics_right = CameraIntrinsics::new(300.0, 300.0, 150.0, 120.0, 320, 240);
        calib.lens_model = LensModel::Pinhole {
            left: Distortion::none(),
            right: Distortion::new(0.05, 0.0, 0.0, 0.0, 0.0),
        };
        let map = build_uv_distortion_map(&calib, 320, 480, 1.0).unwrap();
        // Left eye is undistorted, so the first half of the lookup is zero
        // while the right eye's slot in the second half is not.
        let (dx_top, _) = texel(&map, 30, 40);
        let (dx_bottom, _) = texel(&map, 30, 240 + 40);
        assert!(dx_top.abs() < 1e-6);
        assert!(dx_bottom.abs() > 1e-6);
    }

    #[test]
    fn mono_layout_fills_single_slot() {
        let map = build_uv_distortion_map(&calibration(FrameLayout::Mono), 320, 240, 1.0).unwrap();
        assert_eq!(map.data.len(), 320 * 240 * 2);
        assert_eq!(map.rectified_rotation_left, Matrix4::identity());
    }

    #[test]
    fn fov_scale_is_recorded_with_scaled_projection() {
        let map =
            build_uv_distortion_map(&calibration(FrameLayout::StereoHorizontal), 640, 240, 2.0)
                .unwrap();
        assert_eq!(map.fov_scale, 2.0);
        assert!((map.camera_projection_left[(0, 0)] - 150.0).abs() < 1e-4);
    }
}
