pub use depthcv_calib3d as calib3d;
pub use depthcv_core as core;
pub use depthcv_imgproc as imgproc;
pub use depthcv_runtime as runtime;
pub use depthcv_stereo as stereo;

/// Initialize a single global Rayon thread pool for all CPU-parallel routines.
///
/// Call this once at application startup before running heavy reconstruction
/// workloads. Repeated calls are idempotent and return the first
/// initialization result.
///
/// Priority order:
/// 1. explicit `num_threads`
/// 2. `DEPTHCV_CPU_THREADS` env var
/// 3. Rayon default
pub fn init_thread_pool(num_threads: Option<usize>) -> Result<(), String> {
    depthcv_core::init_global_thread_pool(num_threads)
}
