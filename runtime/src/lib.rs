//! Background depth reconstruction.
//!
//! Ties the geometry, image and matching crates together into a producer
//! thread that polls a camera and a configuration store, reconstructs depth
//! frames, and hands them to consumers through a non-blocking triple buffer.

pub mod debug;
pub mod exchange;
pub mod frame;
pub mod reconstruction;
pub mod sources;

pub use debug::{DebugSink, DebugTexture};
pub use exchange::{DepthFrameExchange, FrameConsumer, FrameProducer};
pub use frame::{DepthFrame, WORLD_DISPARITY_NORM};
pub use reconstruction::{DepthReconstruction, ReconstructionHandles};
pub use sources::{
    CalibrationSource, CameraFrame, CameraSource, ConfigSource, SharedCameraFrame,
};

pub use depthcv_core::{Error, Result};
