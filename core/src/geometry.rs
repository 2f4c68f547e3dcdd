use nalgebra::{Matrix3, Matrix4, Vector3};

#[derive(Debug, Clone, Copy)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub width: u32,
    pub height: u32,
}

impl CameraIntrinsics {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, width: u32, height: u32) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            width,
            height,
        }
    }

    pub fn new_ideal(width: u32, height: u32) -> Self {
        Self {
            fx: width as f64,
            fy: width as f64,
            cx: width as f64 / 2.0,
            cy: height as f64 / 2.0,
            width,
            height,
        }
    }

    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    pub fn inverse_matrix(&self) -> Matrix3<f64> {
        self.matrix().try_inverse().unwrap_or(Matrix3::identity())
    }

    pub fn is_degenerate(&self) -> bool {
        self.fx.abs() <= 1e-9 || self.fy.abs() <= 1e-9 || !self.fx.is_finite() || !self.fy.is_finite()
    }
}

/// Brown-Conrady radial/tangential distortion for pinhole lenses.
#[derive(Debug, Clone, Copy, Default)]
pub struct Distortion {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
}

impl Distortion {
    pub fn new(k1: f64, k2: f64, p1: f64, p2: f64, k3: f64) -> Self {
        Self { k1, k2, p1, p2, k3 }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let r2 = x * x + y * y;
        let radial = 1.0 + self.k1 * r2 + self.k2 * r2 * r2 + self.k3 * r2 * r2 * r2;
        let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
        (x * radial + dx, y * radial + dy)
    }

    pub fn remove(&self, x: f64, y: f64) -> (f64, f64) {
        let mut xd = x;
        let mut yd = y;
        for _ in 0..10 {
            let (xu, yu) = self.apply(xd, yd);
            xd += x - xu;
            yd += y - yu;
        }
        (xd, yd)
    }
}

/// Equidistant fisheye distortion with a theta polynomial (k1..k4).
#[derive(Debug, Clone, Copy, Default)]
pub struct FisheyeDistortion {
    pub k1: f64,
    pub k2: f64,
    pub k3: f64,
    pub k4: f64,
}

impl FisheyeDistortion {
    pub fn new(k1: f64, k2: f64, k3: f64, k4: f64) -> Self {
        Self { k1, k2, k3, k4 }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let r = (x * x + y * y).sqrt();
        if r < 1e-12 {
            return (x, y);
        }
        let theta = r.atan();
        let t2 = theta * theta;
        let theta_d = theta
            * (1.0 + self.k1 * t2 + self.k2 * t2 * t2 + self.k3 * t2 * t2 * t2
                + self.k4 * t2 * t2 * t2 * t2);
        let scale = theta_d / r;
        (x * scale, y * scale)
    }

    pub fn remove(&self, x: f64, y: f64) -> (f64, f64) {
        let mut xd = x;
        let mut yd = y;
        for _ in 0..10 {
            let (xu, yu) = self.apply(xd, yd);
            xd += x - xu;
            yd += y - yu;
        }
        (xd, yd)
    }
}

/// Lens model tag carrying the per-eye distortion coefficients.
#[derive(Debug, Clone, Copy)]
pub enum LensModel {
    Pinhole {
        left: Distortion,
        right: Distortion,
    },
    Fisheye {
        left: FisheyeDistortion,
        right: FisheyeDistortion,
    },
}

/// How the two eyes are packed into the raw camera texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLayout {
    Mono,
    StereoHorizontal,
    StereoVertical,
}

impl FrameLayout {
    /// Per-eye frame size for a raw texture of the given dimensions.
    pub fn eye_frame_size(&self, texture_width: u32, texture_height: u32) -> (u32, u32) {
        match self {
            FrameLayout::Mono => (texture_width, texture_height),
            FrameLayout::StereoHorizontal => (texture_width / 2, texture_height),
            FrameLayout::StereoVertical => (texture_width, texture_height / 2),
        }
    }
}

/// Read-only calibration snapshot taken from the external calibration store.
#[derive(Debug, Clone, Copy)]
pub struct CalibrationGeometry {
    pub intrinsics_left: CameraIntrinsics,
    pub intrinsics_right: CameraIntrinsics,
    pub lens_model: LensModel,
    pub layout: FrameLayout,
    /// Rigid transform between the eyes in the capture convention.
    pub left_to_right: Matrix4<f64>,
}

/// 180 degree rotation about the X axis, used to move the camera convention
/// into the rendering convention before rectification.
pub fn rotation_x_180() -> Matrix4<f64> {
    let mut m = Matrix4::identity();
    m[(1, 1)] = -1.0;
    m[(2, 2)] = -1.0;
    m
}

/// Split a rigid transform into its rotation block and translation column.
pub fn decompose_rigid(m: &Matrix4<f64>) -> (Matrix3<f64>, Vector3<f64>) {
    let r = Matrix3::from(m.fixed_view::<3, 3>(0, 0));
    let t = Vector3::from(m.fixed_view::<3, 1>(0, 3));
    (r, t)
}

/// Embed a rotation into a homogeneous 4x4 matrix.
pub fn rotation_to_homogeneous(r: &Matrix3<f64>) -> Matrix4<f64> {
    let mut m = Matrix4::identity();
    m.fixed_view_mut::<3, 3>(0, 0).copy_from(r);
    m
}

/// Downcast a geometry matrix to the f32 transforms served to consumers.
pub fn matrix_to_f32(m: &Matrix4<f64>) -> Matrix4<f32> {
    m.map(|v| v as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distortion_remove_inverts_apply() {
        let d = Distortion::new(0.12, -0.05, 0.001, -0.0007, 0.01);
        let (xd, yd) = d.apply(0.21, -0.13);
        let (xu, yu) = d.remove(xd, yd);
        assert!((xu - 0.21).abs() < 1e-6);
        assert!((yu + 0.13).abs() < 1e-6);
    }

    #[test]
    fn fisheye_remove_inverts_apply() {
        let d = FisheyeDistortion::new(0.02, -0.004, 0.001, -0.0002);
        let (xd, yd) = d.apply(0.35, 0.18);
        let (xu, yu) = d.remove(xd, yd);
        assert!((xu - 0.35).abs() < 1e-6);
        assert!((yu - 0.18).abs() < 1e-6);
    }

    #[test]
    fn fisheye_is_identity_at_center() {
        let d = FisheyeDistortion::new(0.1, 0.0, 0.0, 0.0);
        let (x, y) = d.apply(0.0, 0.0);
        assert_eq!((x, y), (0.0, 0.0));
    }

    #[test]
    fn layout_eye_frame_size() {
        assert_eq!(
            FrameLayout::StereoHorizontal.eye_frame_size(1280, 480),
            (640, 480)
        );
        assert_eq!(
            FrameLayout::StereoVertical.eye_frame_size(640, 960),
            (640, 480)
        );
        assert_eq!(FrameLayout::Mono.eye_frame_size(640, 480), (640, 480));
    }

    #[test]
    fn rotation_x_180_flips_y_and_z() {
        let r = rotation_x_180();
        let v = r.transform_vector(&Vector3::new(1.0, 2.0, 3.0));
        assert_eq!(v, Vector3::new(1.0, -2.0, -3.0));
    }
}
