/// LZ4 block compression for chunk images, pixel packs and preview tiles.
pub fn compress(raw: &[u8]) -> Vec<u8> {
    lz4_flex::block::compress(raw)
}

/// Decompress to exactly `expected` bytes. Any other outcome is corruption
/// and yields `None`.
pub fn decompress(compressed: &[u8], expected: usize) -> Option<Vec<u8>> {
    match lz4_flex::block::decompress(compressed, expected) {
        Ok(raw) if raw.len() == expected => Some(raw),
        Ok(raw) => {
            tracing::error!("decompressed {} bytes, expected {}", raw.len(), expected);
            None
        }
        Err(e) => {
            tracing::error!("LZ4 decompression failed: {}", e);
            None
        }
    }
}
