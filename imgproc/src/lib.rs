pub mod color;
pub mod geometry;
pub mod resize;

pub use color::*;
pub use geometry::*;
pub use resize::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BorderMode {
    Constant(u8),
    Replicate,
}
