use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::Config;
use crate::ext::{ExtensionHost, NoopHost};
use crate::room::Room;

/// Process-wide state: the rooms and the extension host they share.
pub struct App {
    pub config: Config,
    ext: Arc<dyn ExtensionHost>,
    rooms: Mutex<HashMap<String, Arc<Room>>>,
}

impl App {
    pub fn new(config: Config) -> Arc<Self> {
        Self::with_host(config, Arc::new(NoopHost))
    }

    pub fn with_host(config: Config, ext: Arc<dyn ExtensionHost>) -> Arc<Self> {
        Arc::new(Self {
            config,
            ext,
            rooms: Mutex::new(HashMap::new()),
        })
    }

    /// Fetch a room, opening it on first use. The caller has validated the
    /// name; it becomes the database file name.
    pub fn room(&self, name: &str) -> anyhow::Result<Arc<Room>> {
        let mut rooms = self.rooms.lock();
        if let Some(room) = rooms.get(name) {
            return Ok(room.clone());
        }
        let room = Room::open(name, &self.config, self.ext.clone())?;
        rooms.insert(name.to_string(), room.clone());
        Ok(room)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }

    pub fn session_count(&self) -> usize {
        self.rooms.lock().values().map(|room| room.session_count()).sum()
    }

    /// Stop every session, then close each room; room shutdown runs the
    /// final autosave.
    pub async fn shutdown(&self) {
        let rooms: Vec<Arc<Room>> = self.rooms.lock().values().cloned().collect();
        for room in &rooms {
            room.stop_sessions();
        }
        for room in &rooms {
            room.shutdown().await;
        }
    }
}
