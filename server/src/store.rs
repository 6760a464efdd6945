//! All resident chunks of one room: load on demand, autosave, garbage
//! collection.

use std::collections::HashMap;
use std::num::NonZero;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::IVec2;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;

use crate::chunk::{Chunk, Subscriber};
use crate::stop::Stop;
use crate::storage::Storage;

/// GC runs at least this often even without an eviction signal.
const GC_INTERVAL: Duration = Duration::from_secs(10);
/// Queued pixel deltas broadcast once per second.
const FLUSH_TICKS: u64 = 20;

pub type ChunkSlot = Arc<Mutex<Chunk>>;

struct Resident {
    chunks: HashMap<IVec2, ChunkSlot>,
    /// One-slot cache for burst access to the same chunk.
    last: LruCache<IVec2, ChunkSlot>,
}

pub struct ChunkStore {
    resident: Mutex<Resident>,
    storage: Arc<Storage>,
    preview_tx: UnboundedSender<IVec2>,
    queue_limit: usize,
    gc_requested: AtomicBool,
}

impl ChunkStore {
    pub fn new(
        storage: Arc<Storage>,
        preview_tx: UnboundedSender<IVec2>,
        queue_limit: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            resident: Mutex::new(Resident {
                chunks: HashMap::new(),
                last: LruCache::new(NonZero::new(1).unwrap()),
            }),
            storage,
            preview_tx,
            queue_limit,
            gc_requested: AtomicBool::new(false),
        })
    }

    /// Get a resident chunk, loading it from storage when needed. The store
    /// lock is held across the load, so concurrent requests for the same
    /// coordinate resolve to one chunk.
    pub fn get_or_load(&self, pos: IVec2) -> ChunkSlot {
        let mut resident = self.resident.lock();
        if let Some(slot) = resident.last.get(&pos) {
            return slot.clone();
        }
        if let Some(slot) = resident.chunks.get(&pos) {
            let slot = slot.clone();
            resident.last.put(pos, slot.clone());
            return slot;
        }

        let compressed = match self.storage.load_chunk(pos) {
            Ok(data) => data,
            Err(e) => {
                // Treated as not present; the chunk starts blank.
                tracing::error!("chunk load failed at ({}, {}): {}", pos.x, pos.y, e);
                None
            }
        };
        let slot = Arc::new(Mutex::new(Chunk::new(
            pos,
            compressed,
            self.queue_limit,
            self.preview_tx.clone(),
        )));
        resident.chunks.insert(pos, slot.clone());
        resident.last.put(pos, slot.clone());
        slot
    }

    /// Subscribe a session to a chunk, loading it first if needed. The chunk
    /// pushes its current image to the subscriber.
    pub fn subscribe(&self, pos: IVec2, sub: Subscriber) -> ChunkSlot {
        let slot = self.get_or_load(pos);
        slot.lock().subscribe(sub);
        slot
    }

    pub fn unsubscribe(&self, pos: IVec2, session_id: u16) {
        // Only resident chunks can hold subscribers.
        let slot = self.resident.lock().chunks.get(&pos).cloned();
        if let Some(slot) = slot {
            if slot.lock().unsubscribe(session_id) {
                self.request_gc();
            }
        }
    }

    pub fn request_gc(&self) {
        self.gc_requested.store(true, Ordering::Relaxed);
    }

    pub fn resident_count(&self) -> usize {
        self.resident.lock().chunks.len()
    }

    /// Broadcast every chunk's queued deltas.
    pub fn flush_all(&self) {
        let slots: Vec<ChunkSlot> = self.resident.lock().chunks.values().cloned().collect();
        for slot in slots {
            slot.lock().flush_queue();
        }
    }

    /// Persist every modified chunk inside one transaction.
    pub fn autosave(&self) {
        let start = Instant::now();
        let slots: Vec<ChunkSlot> = self.resident.lock().chunks.values().cloned().collect();
        let total = slots.len();

        let mut encoded: Vec<ChunkSlot> = Vec::new();
        let mut saved: u32 = 0;
        let result = self.storage.batch(|batch| {
            for slot in &slots {
                let mut chunk = slot.lock();
                if chunk.is_modified() {
                    let data = chunk.encode(true);
                    batch.save_chunk(chunk.pos(), &data)?;
                    encoded.push(slot.clone());
                    saved += 1;
                }
            }
            Ok(())
        });

        match result {
            Ok(()) => {
                if saved > 0 {
                    tracing::info!(
                        "Autosaved {} chunks in {}ms ({} chunks loaded)",
                        saved,
                        start.elapsed().as_millis(),
                        total
                    );
                }
            }
            Err(e) => {
                // The transaction rolled back; re-arm the flags so the next
                // cycle retries.
                tracing::error!("autosave failed: {}", e);
                for slot in &encoded {
                    slot.lock().mark_dirty();
                }
            }
        }
    }

    /// Evict chunks nobody subscribes to, saving modified ones first. The
    /// scan restarts until a full pass evicts nothing, draining bursts of
    /// abandoned chunks.
    pub fn collect_garbage(&self) {
        let mut saved: u32 = 0;
        let mut removed: u32 = 0;

        loop {
            let candidates: Vec<(IVec2, ChunkSlot)> = {
                let resident = self.resident.lock();
                resident
                    .chunks
                    .iter()
                    .filter(|(_, slot)| slot.lock().subscriber_count() == 0)
                    .map(|(pos, slot)| (*pos, slot.clone()))
                    .collect()
            };
            if candidates.is_empty() {
                break;
            }

            let mut progressed = false;
            for (pos, slot) in candidates {
                let data_to_save = {
                    let mut chunk = slot.lock();
                    if chunk.subscriber_count() != 0 {
                        continue; // re-subscribed since the scan
                    }
                    if chunk.is_modified() {
                        Some(chunk.encode(true))
                    } else {
                        None
                    }
                };
                if let Some(data) = data_to_save {
                    if let Err(e) = self.storage.save_chunk(pos, &data) {
                        tracing::error!("GC save failed at ({}, {}): {}", pos.x, pos.y, e);
                        slot.lock().mark_dirty();
                        continue; // keep it resident rather than lose pixels
                    }
                    saved += 1;
                }

                let mut resident = self.resident.lock();
                if let Some(current) = resident.chunks.get(&pos) {
                    // A chunk is never destroyed out from under a subscriber;
                    // a subscribe that raced in keeps it resident.
                    if Arc::ptr_eq(current, &slot) && current.lock().subscriber_count() == 0 {
                        resident.chunks.remove(&pos);
                        resident.last.pop(&pos);
                        removed += 1;
                        progressed = true;
                    }
                }
            }
            if !progressed {
                break;
            }
        }

        if saved > 0 || removed > 0 {
            tracing::info!(
                "GC saved {} chunks, removed {} ({} still resident)",
                saved,
                removed,
                self.resident_count()
            );
        }
    }

    /// The room's single background worker: flush tick, autosave, GC. Runs
    /// one final autosave when stopped.
    pub async fn run_maintainer(self: Arc<Self>, autosave_interval: Duration, stop: Stop) {
        let mut tick = tokio::time::interval(Duration::from_millis(50));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut ticks: u64 = 0;
        let mut last_autosave = Instant::now();
        let mut last_gc = Instant::now();

        loop {
            tick.tick().await;
            if stop.is_triggered() {
                break;
            }
            ticks += 1;

            if ticks % FLUSH_TICKS == 0 {
                self.flush_all();
            }

            if last_autosave.elapsed() >= autosave_interval {
                self.autosave();
                last_autosave = Instant::now();
            }

            if last_gc.elapsed() >= GC_INTERVAL {
                self.request_gc();
                last_gc = Instant::now();
            }

            if self.gc_requested.swap(false, Ordering::Relaxed) {
                self.collect_garbage();
            }
        }

        self.autosave();
    }
}
