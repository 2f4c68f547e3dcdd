//! External inputs to the reconstruction loop.
//!
//! The camera, configuration store and calibration store are all owned by the
//! host application; the loop only polls them through these traits.

use std::sync::{Arc, RwLock};

use depthcv_core::{CalibrationGeometry, FrameLayout, StereoConfig};
use nalgebra::Matrix4;

/// Raw camera texture snapshot plus capture-time poses.
#[derive(Debug, Clone)]
pub struct CameraFrame {
    /// Monotonically increasing capture counter.
    pub sequence: u64,
    pub layout: FrameLayout,
    pub width: u32,
    pub height: u32,
    /// Interleaved RGBA8, `width * height * 4` bytes.
    pub buffer: Vec<u8>,
    pub view_to_world_left: Matrix4<f32>,
    pub view_to_world_right: Matrix4<f32>,
}

impl CameraFrame {
    pub fn empty() -> Self {
        Self {
            sequence: 0,
            layout: FrameLayout::Mono,
            width: 0,
            height: 0,
            buffer: Vec::new(),
            view_to_world_left: Matrix4::identity(),
            view_to_world_right: Matrix4::identity(),
        }
    }
}

/// The camera's lock is held only while the loop copies the pixel region and
/// poses out of the frame, never across matching.
pub type SharedCameraFrame = Arc<RwLock<CameraFrame>>;

pub trait CameraSource: Send + Sync {
    /// Latest frame, or `None` when the camera has not delivered one yet.
    fn frame(&self) -> Option<SharedCameraFrame>;
}

pub trait ConfigSource: Send + Sync {
    /// Current configuration by value; polled every cycle.
    fn stereo_config(&self) -> StereoConfig;
}

pub trait CalibrationSource: Send + Sync {
    /// Calibration snapshot, read at initialization and on reinit.
    fn calibration(&self) -> CalibrationGeometry;
}
