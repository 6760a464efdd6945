//! A resident 256x256 RGB tile: authoritative pixel data, compressed cache,
//! and the fanout point for edits to its subscribers.

use std::sync::{Arc, OnceLock};

use bytes::{BufMut, BytesMut};
use glam::{IVec2, U8Vec2};
use tokio::sync::mpsc::UnboundedSender;

use common::proto::{self, Packet};
use common::{codec, coords, ChunkPixel, Color};

/// Compressed all-white tile, generated once per process. Never-drawn chunks
/// encode to this without materializing their pixels.
fn blank_tile() -> Arc<Vec<u8>> {
    static BLANK: OnceLock<Arc<Vec<u8>>> = OnceLock::new();
    BLANK
        .get_or_init(|| Arc::new(codec::compress(&vec![255u8; coords::CHUNK_IMAGE_BYTES])))
        .clone()
}

/// Where a subscriber's packets go: the session's own outbound queue.
/// Pushing never blocks and a dead receiver is simply ignored.
#[derive(Clone)]
pub struct Subscriber {
    pub id: u16,
    pub tx: UnboundedSender<Packet>,
}

pub struct Chunk {
    pos: IVec2,
    /// Loaded from storage but never drawn on; still encodes as all-white.
    blank: bool,
    pixels: Option<Vec<u8>>,
    compressed: Option<Arc<Vec<u8>>>,
    modified: bool,
    subscribers: Vec<Subscriber>,
    queued: Vec<ChunkPixel>,
    bulk_override: bool,
    queue_limit: usize,
    preview_tx: UnboundedSender<IVec2>,
}

impl Chunk {
    pub fn new(
        pos: IVec2,
        compressed: Option<Vec<u8>>,
        queue_limit: usize,
        preview_tx: UnboundedSender<IVec2>,
    ) -> Self {
        let compressed = compressed.filter(|data| !data.is_empty());
        Self {
            pos,
            blank: compressed.is_none(),
            pixels: None,
            compressed: compressed.map(Arc::new),
            modified: false,
            subscribers: Vec::new(),
            queued: Vec::new(),
            bulk_override: false,
            queue_limit,
            preview_tx,
        }
    }

    pub fn pos(&self) -> IVec2 {
        self.pos
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Re-arm the modified flag after a failed save so the next autosave
    /// retries.
    pub fn mark_dirty(&mut self) {
        self.set_modified();
    }

    fn set_modified(&mut self) {
        self.modified = true;
        // The cached compressed form no longer matches the pixels.
        self.compressed = None;
    }

    fn image_mut(&mut self) -> &mut [u8] {
        if self.pixels.is_none() {
            self.blank = false;
            let mut corrupt = false;
            let raw = match &self.compressed {
                Some(lz4) => match codec::decompress(lz4, coords::CHUNK_IMAGE_BYTES) {
                    Some(raw) => raw,
                    None => {
                        corrupt = true;
                        vec![255u8; coords::CHUNK_IMAGE_BYTES]
                    }
                },
                None => vec![255u8; coords::CHUNK_IMAGE_BYTES],
            };
            if corrupt {
                tracing::error!(
                    "corrupt chunk data at ({}, {}), starting blank",
                    self.pos.x,
                    self.pos.y
                );
                self.compressed = None;
            }
            self.pixels = Some(raw);
        }
        self.pixels.as_deref_mut().expect("image just materialized")
    }

    /// Read one pixel, materializing the image if needed.
    pub fn pixel(&mut self, local: U8Vec2) -> Color {
        let offset = coords::pixel_offset(local);
        let img = self.image_mut();
        Color::new(img[offset], img[offset + 1], img[offset + 2])
    }

    /// Idempotent. The new subscriber immediately receives the current image.
    pub fn subscribe(&mut self, sub: Subscriber) {
        if self.subscribers.iter().any(|s| s.id == sub.id) {
            return;
        }
        self.send_image_to(&sub);
        self.subscribers.push(sub);
    }

    /// Idempotent. Returns true when the subscriber set just became empty,
    /// which tells the store a GC pass is warranted.
    pub fn unsubscribe(&mut self, id: u16) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.id != id);
        before > 0 && self.subscribers.is_empty()
    }

    fn send_image_to(&mut self, sub: &Subscriber) {
        let compressed = match &self.compressed {
            Some(data) => data.clone(),
            None => self.encode(false),
        };
        let _ = sub.tx.send(proto::chunk_image(
            self.pos,
            coords::CHUNK_IMAGE_BYTES as u32,
            &compressed,
        ));
    }

    fn send_image_to_all(&mut self) {
        let compressed = match &self.compressed {
            Some(data) => data.clone(),
            None => self.encode(false),
        };
        let packet = proto::chunk_image(self.pos, coords::CHUNK_IMAGE_BYTES as u32, &compressed);
        for sub in &self.subscribers {
            let _ = sub.tx.send(packet.clone());
        }
    }

    /// Apply pixels now and broadcast one pixel pack holding the ones that
    /// actually changed. A write matching the stored color is dropped.
    pub fn write_pixels(&mut self, pixels: &[ChunkPixel]) {
        // Anything still queued goes out first so subscribers observe a
        // monotonic tile.
        self.flush_queue();
        self.write_pixels_inner(pixels, false);
    }

    fn write_pixels_inner(&mut self, pixels: &[ChunkPixel], already_applied: bool) {
        self.image_mut();
        let mut pack = BytesMut::new();
        let mut count: u32 = 0;

        for px in pixels {
            if !already_applied {
                if self.pixel(px.pos) == px.color {
                    continue;
                }
                let offset = coords::pixel_offset(px.pos);
                let img = self.image_mut();
                img[offset] = px.color.r;
                img[offset + 1] = px.color.g;
                img[offset + 2] = px.color.b;
            }
            pack.put_u8(px.pos.x);
            pack.put_u8(px.pos.y);
            pack.put_u8(px.color.r);
            pack.put_u8(px.color.g);
            pack.put_u8(px.color.b);
            count += 1;
        }

        if count == 0 {
            return;
        }

        let lz4 = codec::compress(&pack);
        let packet = proto::chunk_pixel_pack(self.pos, count, pack.len() as u32, &lz4);
        for sub in &self.subscribers {
            let _ = sub.tx.send(packet.clone());
        }
        self.set_modified();
    }

    /// Apply pixels now but defer the broadcast to the periodic flush. When
    /// the queue outgrows its limit the deltas are dropped in favor of a
    /// full-image resend.
    pub fn queue_pixels(&mut self, pixels: &[ChunkPixel]) {
        self.image_mut();
        for px in pixels {
            let offset = coords::pixel_offset(px.pos);
            let img = self.image_mut();
            img[offset] = px.color.r;
            img[offset + 1] = px.color.g;
            img[offset + 2] = px.color.b;

            if !self.bulk_override {
                self.queued.push(*px);
                if self.queued.len() > self.queue_limit {
                    self.queued = Vec::new();
                    self.bulk_override = true;
                }
            }
        }
        self.set_modified();
    }

    pub fn queue_pixel(&mut self, px: ChunkPixel) {
        self.queue_pixels(std::slice::from_ref(&px));
    }

    /// Emit pending deltas: the whole image when the queue overflowed, one
    /// pixel pack otherwise.
    pub fn flush_queue(&mut self) {
        if self.bulk_override {
            self.bulk_override = false;
            self.send_image_to_all();
        } else if !self.queued.is_empty() {
            let queued = std::mem::take(&mut self.queued);
            self.write_pixels_inner(&queued, true);
        }
    }

    /// Compress the tile. With `clear_modified` the pixel buffer is dropped
    /// and the covering preview tile is scheduled for regeneration.
    pub fn encode(&mut self, clear_modified: bool) -> Arc<Vec<u8>> {
        let compressed = if self.blank {
            let data = blank_tile();
            self.compressed = Some(data.clone());
            data
        } else {
            self.image_mut();
            let data = Arc::new(codec::compress(
                self.pixels.as_deref().expect("image just materialized"),
            ));
            self.compressed = Some(data.clone());
            data
        };

        if clear_modified {
            self.modified = false;
            self.pixels = None;

            let parent = IVec2::new(self.pos.x.div_euclid(2), self.pos.y.div_euclid(2));
            let _ = self.preview_tx.send(parent);
        }

        compressed
    }
}
