//! Preview pyramid: each zoom level averages four tiles of the level below
//! into one 256x256 tile. Level 0 means the real chunks.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use glam::IVec2;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use common::{codec, coords};

use crate::stop::Stop;
use crate::storage::Storage;

const TILE_BYTES: usize = coords::CHUNK_IMAGE_BYTES;
/// The composite of four source tiles before downsampling.
const SOURCE_EDGE: usize = (coords::CHUNK_SIZE as usize) * 2;

/// The preview tile covering a tile at the level below.
pub fn parent_of(pos: IVec2) -> IVec2 {
    IVec2::new(pos.x.div_euclid(2), pos.y.div_euclid(2))
}

struct Layer {
    zoom: u8,
    queue: VecDeque<IVec2>,
}

impl Layer {
    /// Deduplicating FIFO: re-enqueueing a queued position is a no-op.
    fn enqueue(&mut self, pos: IVec2) {
        if !self.queue.contains(&pos) {
            self.queue.push_back(pos);
        }
    }
}

pub struct PreviewSystem {
    storage: Arc<Storage>,
    layers: Vec<Layer>,
    rx: UnboundedReceiver<IVec2>,
}

impl PreviewSystem {
    /// Returns the system plus the sender chunk saves feed with parent tile
    /// positions.
    pub fn new(storage: Arc<Storage>, layer_count: u8) -> (Self, UnboundedSender<IVec2>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let layers = (1..=layer_count.max(1))
            .map(|zoom| Layer {
                zoom,
                queue: VecDeque::new(),
            })
            .collect();
        (
            Self {
                storage,
                layers,
                rx,
            },
            tx,
        )
    }

    /// Queue a regeneration for every chunk known to storage.
    pub fn seed_from_storage(&mut self) {
        match self.storage.chunk_positions() {
            Ok(positions) => {
                let count = positions.len();
                for pos in positions {
                    self.layers[0].enqueue(parent_of(pos));
                }
                if count > 0 {
                    tracing::info!("Queued previews for {} stored chunks", count);
                }
            }
            Err(e) => tracing::error!("failed to list chunks for preview seeding: {}", e),
        }
    }

    /// One scheduling step: fold pending chunk saves into the bottom layer,
    /// then rebuild one tile from the lowest non-empty layer so fresh edits
    /// reach zoom 1 before the upper levels rebuild on top of them.
    pub fn step(&mut self) -> bool {
        while let Ok(pos) = self.rx.try_recv() {
            self.layers[0].enqueue(pos);
        }

        for i in 0..self.layers.len() {
            if let Some(pos) = self.layers[i].queue.pop_front() {
                let zoom = self.layers[i].zoom;
                self.regenerate(pos, zoom);
                if i + 1 < self.layers.len() {
                    self.layers[i + 1].enqueue(parent_of(pos));
                }
                tracing::debug!(
                    "Rebuilt preview ({}, {}) at zoom {} ({} queued behind it)",
                    pos.x,
                    pos.y,
                    zoom,
                    self.layers[i].queue.len()
                );
                return true;
            }
        }
        false
    }

    /// Compose the four source tiles, downsample 2x by averaging, store.
    fn regenerate(&self, pos: IVec2, zoom: u8) {
        let mut canvas = vec![255u8; SOURCE_EDGE * SOURCE_EDGE * 3];

        for (index, (dx, dy)) in [(0, 0), (1, 0), (0, 1), (1, 1)].iter().enumerate() {
            let src = IVec2::new(pos.x * 2 + dx, pos.y * 2 + dy);
            let blob = if zoom == 1 {
                self.storage.load_chunk(src)
            } else {
                self.storage.load_preview(src, zoom - 1)
            };
            let blob = match blob {
                Ok(blob) => blob,
                Err(e) => {
                    tracing::error!("preview source load failed at ({}, {}): {}", src.x, src.y, e);
                    None
                }
            };
            // Missing or corrupt sources stay white.
            let Some(blob) = blob else { continue };
            let Some(raw) = codec::decompress(&blob, TILE_BYTES) else {
                continue;
            };
            blit(&mut canvas, &raw, index % 2, index / 2);
        }

        let tile = downsample(&canvas);
        let lz4 = codec::compress(&tile);
        if let Err(e) = self.storage.save_preview(pos, zoom, &lz4) {
            tracing::error!("preview save failed at ({}, {}, z{}): {}", pos.x, pos.y, zoom, e);
        }
    }

    pub async fn run(mut self, stop: Stop) {
        let mut tick = tokio::time::interval(Duration::from_millis(50));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            if stop.is_triggered() {
                break;
            }
            self.step();
        }
    }
}

fn blit(canvas: &mut [u8], tile: &[u8], cell_x: usize, cell_y: usize) {
    let edge = coords::CHUNK_SIZE as usize;
    let pitch_in = edge * 3;
    let pitch_out = SOURCE_EDGE * 3;
    for y in 0..edge {
        let src = y * pitch_in;
        let dst = (cell_y * edge + y) * pitch_out + cell_x * pitch_in;
        canvas[dst..dst + pitch_in].copy_from_slice(&tile[src..src + pitch_in]);
    }
}

fn downsample(canvas: &[u8]) -> Vec<u8> {
    let edge = coords::CHUNK_SIZE as usize;
    let pitch_in = SOURCE_EDGE * 3;
    let mut out = vec![0u8; TILE_BYTES];
    for y in 0..edge {
        for x in 0..edge {
            let top_left = (y * 2) * pitch_in + (x * 2) * 3;
            let bottom_left = top_left + pitch_in;
            for channel in 0..3 {
                let sum = canvas[top_left + channel] as u32
                    + canvas[top_left + 3 + channel] as u32
                    + canvas[bottom_left + channel] as u32
                    + canvas[bottom_left + 3 + channel] as u32;
                out[(y * edge + x) * 3 + channel] = (sum / 4) as u8;
            }
        }
    }
    out
}
