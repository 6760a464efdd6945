//! A room is one isolated canvas universe: its storage, chunk store,
//! preview pyramid, sessions and background workers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use glam::IVec2;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use common::proto::{self, Packet};

use crate::config::Config;
use crate::ext::ExtensionHost;
use crate::preview::PreviewSystem;
use crate::stop::Stop;
use crate::storage::Storage;
use crate::store::ChunkStore;

/// The slice of a session the room keeps for broadcasts and announcements.
pub struct SessionHandle {
    pub id: u16,
    pub nickname: String,
    pub outbound: UnboundedSender<Packet>,
    pub cursor: Mutex<IVec2>,
    pub stop: Stop,
}

/// Monochrome circular brush bitmap, cached per (size, filled).
pub struct BrushMask {
    size: u8,
    cells: Vec<bool>,
}

impl BrushMask {
    fn generate(size: u8, filled: bool) -> Self {
        let n = size as i32;
        let center = n / 2;
        let mut cells = vec![false; (n * n) as usize];
        for y in 0..n {
            for x in 0..n {
                let dx = (center - x) as f32;
                let dy = (center - y) as f32;
                let distance = (dx * dx + dy * dy).sqrt();
                let inside = distance <= n as f32 / 2.0;
                cells[(y * n + x) as usize] = if filled {
                    inside
                } else {
                    inside && distance >= n as f32 / 2.0 - 2.0
                };
            }
        }
        Self { size, cells }
    }

    pub fn size(&self) -> u8 {
        self.size
    }

    pub fn at(&self, x: u8, y: u8) -> bool {
        self.cells[y as usize * self.size as usize + x as usize]
    }
}

pub struct Room {
    name: String,
    pub storage: Arc<Storage>,
    pub chunks: Arc<ChunkStore>,
    pub ext: Arc<dyn ExtensionHost>,
    sessions: Mutex<HashMap<u16, Arc<SessionHandle>>>,
    masks: Mutex<HashMap<(u8, bool), Arc<BrushMask>>>,
    stop: Stop,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Room {
    /// Open the room's database and spawn its maintainer and preview
    /// workers. Must run inside a tokio runtime.
    pub fn open(name: &str, config: &Config, ext: Arc<dyn ExtensionHost>) -> anyhow::Result<Arc<Self>> {
        std::fs::create_dir_all(&config.rooms_dir)?;
        let path = PathBuf::from(&config.rooms_dir).join(format!("{name}.db"));
        let storage = Arc::new(Storage::open(&path, config.snapshot_interval_s)?);

        let (mut preview, preview_tx) =
            PreviewSystem::new(storage.clone(), config.preview_system.layers);
        if config.preview_system.process_all_at_start {
            preview.seed_from_storage();
        }
        let chunks = ChunkStore::new(storage.clone(), preview_tx, config.pixel_queue_limit);

        let stop = Stop::new();
        ext.load_plugins(&config.plugin_list);

        let workers = vec![
            tokio::spawn(preview.run(stop.clone())),
            tokio::spawn(chunks.clone().run_maintainer(
                Duration::from_millis(config.autosave_interval_ms as u64),
                stop.clone(),
            )),
            tokio::spawn(Self::run_ticker(ext.clone(), stop.clone())),
        ];

        tracing::info!("Opened room {:?}", name);
        Ok(Arc::new(Room {
            name: name.to_string(),
            storage,
            chunks,
            ext,
            sessions: Mutex::new(HashMap::new()),
            masks: Mutex::new(HashMap::new()),
            stop,
            workers: Mutex::new(workers),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Drives the extension host's periodic hook.
    async fn run_ticker(ext: Arc<dyn ExtensionHost>, stop: Stop) {
        let mut tick = tokio::time::interval(Duration::from_millis(50));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            if stop.is_triggered() {
                break;
            }
            ext.tick();
        }
    }

    /// Register a session under the smallest free id.
    pub fn add_session(
        &self,
        nickname: String,
        outbound: UnboundedSender<Packet>,
        stop: Stop,
        cursor: IVec2,
    ) -> Arc<SessionHandle> {
        let mut sessions = self.sessions.lock();
        let mut id: u16 = 0;
        while sessions.contains_key(&id) {
            id += 1;
        }
        let handle = Arc::new(SessionHandle {
            id,
            nickname,
            outbound,
            cursor: Mutex::new(cursor),
            stop,
        });
        let previous = sessions.insert(id, handle.clone());
        assert!(previous.is_none(), "duplicate session id {id}");
        tracing::info!("Room {:?}: session {} joined", self.name, id);
        handle
    }

    /// Drop the session from the registry and tell everyone it left.
    pub fn remove_session(&self, id: u16) {
        let removed = self.sessions.lock().remove(&id);
        if removed.is_some() {
            self.broadcast(proto::user_remove(id), Some(id));
            self.ext.user_leave(id);
            tracing::info!("Room {:?}: session {} left", self.name, id);
        }
    }

    /// Push a packet to every session, skipping `except` when given. The
    /// registry lock is held only for the pushes; each push lands in the
    /// target session's own queue.
    pub fn broadcast(&self, packet: Packet, except: Option<u16>) {
        let sessions = self.sessions.lock();
        for (id, handle) in sessions.iter() {
            if Some(*id) == except {
                continue;
            }
            let _ = handle.outbound.send(packet.clone());
        }
    }

    pub fn peers(&self, except: u16) -> Vec<Arc<SessionHandle>> {
        self.sessions
            .lock()
            .values()
            .filter(|handle| handle.id != except)
            .cloned()
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn stop_sessions(&self) {
        for handle in self.sessions.lock().values() {
            handle.stop.trigger();
        }
    }

    pub fn brush_mask(&self, size: u8, filled: bool) -> Arc<BrushMask> {
        let mut masks = self.masks.lock();
        masks
            .entry((size, filled))
            .or_insert_with(|| Arc::new(BrushMask::generate(size, filled)))
            .clone()
    }

    /// Stop the background workers; the maintainer runs a final autosave on
    /// its way out.
    pub async fn shutdown(&self) {
        self.stop.trigger();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.await;
        }
        tracing::info!("Room {:?} closed", self.name);
    }
}
