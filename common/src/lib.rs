pub mod codec;
pub mod color;
pub mod coords;
pub mod pixel;
pub mod proto;

pub use color::Color;
pub use pixel::{ChunkPixel, GlobalPixel};
