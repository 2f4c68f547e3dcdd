pub type CalibError = depthcv_core::Error;
pub type Result<T> = depthcv_core::Result<T>;

pub mod distortion_map;
pub mod rectify;

pub use distortion_map::{build_uv_distortion_map, SharedDistortionMap, UvDistortionMap};
pub use rectify::{
    fisheye_init_undistort_rectify_map, init_undistort_rectify_map, rectify_decomposition,
    solve_rectification, RectificationState, RemapTable, StereoRectifyMatrices,
};
