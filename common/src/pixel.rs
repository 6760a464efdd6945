use glam::{IVec2, U8Vec2};

use crate::color::Color;

/// A pixel addressed on the unbounded canvas.
#[derive(Debug, Clone, Copy)]
pub struct GlobalPixel {
    pub pos: IVec2,
    pub color: Color,
}

/// A pixel addressed inside a single chunk.
#[derive(Debug, Clone, Copy)]
pub struct ChunkPixel {
    pub pos: U8Vec2,
    pub color: Color,
}
