pub mod config;
pub mod geometry;
pub mod runtime;

pub use config::*;
pub use geometry::*;
pub use runtime::{current_cpu_threads, init_global_thread_pool};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Degenerate geometry: {0}")]
    DegenerateGeometry(String),

    #[error("Runtime error: {0}")]
    Runtime(String),
}
