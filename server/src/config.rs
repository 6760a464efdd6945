use serde::Deserialize;

/// Runtime settings, read from `settings.json` when present.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    /// Directory holding one database file per room.
    pub rooms_dir: String,
    pub autosave_interval_ms: u32,
    /// Age at which a chunk save starts a new snapshot row instead of
    /// updating the latest one.
    pub snapshot_interval_s: i64,
    /// Queued pixel deltas per chunk before a full-image resend wins.
    pub pixel_queue_limit: usize,
    pub plugin_list: Vec<String>,
    pub preview_system: PreviewConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    /// Rebuild every stored chunk's preview at room startup.
    pub process_all_at_start: bool,
    pub layers: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3000".into(),
            rooms_dir: "rooms".into(),
            autosave_interval_ms: 30_000,
            snapshot_interval_s: 14_400,
            pixel_queue_limit: 5_000,
            plugin_list: Vec::new(),
            preview_system: PreviewConfig::default(),
        }
    }
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            process_all_at_start: false,
            layers: 4,
        }
    }
}

impl Config {
    /// `settings.json` if present, environment overrides on top.
    pub fn load() -> Self {
        let mut config = match std::fs::read("settings.json") {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(config) => config,
                Err(e) => {
                    tracing::error!("Invalid settings.json: {}", e);
                    Config::default()
                }
            },
            Err(_) => Config::default(),
        };
        if let Ok(addr) = std::env::var("LISTEN_ADDR") {
            config.listen_addr = addr;
        }
        config
    }
}
