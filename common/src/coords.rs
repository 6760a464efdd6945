use glam::{IVec2, U8Vec2};

/// Chunk edge length in pixels (256x256).
pub const CHUNK_SIZE: i32 = 256;

/// Total chunk image size: 256 * 256 * 3 (RGB) bytes.
pub const CHUNK_IMAGE_BYTES: usize = (CHUNK_SIZE as usize) * (CHUNK_SIZE as usize) * 3;

/// Compute which chunk a global pixel coordinate falls in.
///
/// Floor division, so pixel -1 lands in chunk -1, not 0.
pub fn chunk_pos(global: IVec2) -> IVec2 {
    IVec2::new(
        global.x.div_euclid(CHUNK_SIZE),
        global.y.div_euclid(CHUNK_SIZE),
    )
}

/// Compute the local position within a chunk, always in [0, 255].
pub fn local_pos(global: IVec2) -> U8Vec2 {
    U8Vec2::new(
        global.x.rem_euclid(CHUNK_SIZE) as u8,
        global.y.rem_euclid(CHUNK_SIZE) as u8,
    )
}

/// Byte offset into a chunk image for a local (x, y) coordinate.
pub fn pixel_offset(local: U8Vec2) -> usize {
    (local.y as usize * CHUNK_SIZE as usize + local.x as usize) * 3
}
