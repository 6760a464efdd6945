//! Per-room persistence: one SQLite file holding chunk snapshots and
//! preview tiles.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use glam::IVec2;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

/// Compression discriminator stored alongside each blob.
const COMPRESSION_LZ4: i64 = 1;

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// One room's database. The mutex is the storage handle's transactional
/// atomicity guard; every call takes it for its whole duration.
pub struct Storage {
    conn: Mutex<Connection>,
    snapshot_interval_s: i64,
}

impl Storage {
    pub fn open(path: &Path, snapshot_interval_s: i64) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS chunks(
                x INT NOT NULL, y INT NOT NULL,
                data BLOB, compression INT,
                created INT64 NOT NULL, modified INT64 NOT NULL);
            CREATE INDEX IF NOT EXISTS index_chunks_x ON chunks(x);
            CREATE INDEX IF NOT EXISTS index_chunks_y ON chunks(y);
            CREATE TABLE IF NOT EXISTS previews(
                x INT NOT NULL, y INT NOT NULL, zoom INT NOT NULL,
                data BLOB, compression INT,
                modified INT64 NOT NULL,
                PRIMARY KEY(x, y, zoom));",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            snapshot_interval_s,
        })
    }

    /// Newest stored blob for a chunk, `None` when the chunk was never saved
    /// or its latest snapshot holds no data.
    pub fn load_chunk(&self, pos: IVec2) -> rusqlite::Result<Option<Vec<u8>>> {
        let conn = self.conn.lock();
        let data: Option<Option<Vec<u8>>> = conn
            .query_row(
                "SELECT data FROM chunks WHERE x = ?1 AND y = ?2 ORDER BY modified DESC LIMIT 1",
                params![pos.x, pos.y],
                |row| row.get(0),
            )
            .optional()?;
        Ok(data.flatten())
    }

    pub fn save_chunk(&self, pos: IVec2, data: &[u8]) -> rusqlite::Result<()> {
        let conn = self.conn.lock();
        save_chunk_on(&conn, pos, data, self.snapshot_interval_s)
    }

    /// Run `f` with every write batched into one transaction.
    pub fn batch<T>(&self, f: impl FnOnce(&Batch) -> rusqlite::Result<T>) -> rusqlite::Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let out = f(&Batch {
            conn: &*tx,
            snapshot_interval_s: self.snapshot_interval_s,
        })?;
        tx.commit()?;
        Ok(out)
    }

    pub fn load_preview(&self, pos: IVec2, zoom: u8) -> rusqlite::Result<Option<Vec<u8>>> {
        let conn = self.conn.lock();
        let data: Option<Option<Vec<u8>>> = conn
            .query_row(
                "SELECT data FROM previews WHERE x = ?1 AND y = ?2 AND zoom = ?3",
                params![pos.x, pos.y, zoom],
                |row| row.get(0),
            )
            .optional()?;
        Ok(data.flatten())
    }

    /// Preview tiles keep a single row per (x, y, zoom).
    pub fn save_preview(&self, pos: IVec2, zoom: u8, data: &[u8]) -> rusqlite::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO previews(x, y, zoom, data, compression, modified)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
            params![pos.x, pos.y, zoom, data, COMPRESSION_LZ4, unix_now()],
        )?;
        Ok(())
    }

    /// Every chunk coordinate that has ever been saved.
    pub fn chunk_positions(&self) -> rusqlite::Result<Vec<IVec2>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT DISTINCT x, y FROM chunks")?;
        let rows = stmt.query_map([], |row| Ok(IVec2::new(row.get(0)?, row.get(1)?)))?;
        rows.collect()
    }

    /// Snapshot timestamps for one chunk, newest first.
    pub fn snapshot_times(&self, pos: IVec2) -> rusqlite::Result<Vec<i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT modified FROM chunks WHERE x = ?1 AND y = ?2 ORDER BY modified DESC")?;
        let rows = stmt.query_map(params![pos.x, pos.y], |row| row.get(0))?;
        rows.collect()
    }
}

/// Writes grouped under one open transaction; see [`Storage::batch`].
pub struct Batch<'a> {
    conn: &'a Connection,
    snapshot_interval_s: i64,
}

impl Batch<'_> {
    pub fn save_chunk(&self, pos: IVec2, data: &[u8]) -> rusqlite::Result<()> {
        save_chunk_on(self.conn, pos, data, self.snapshot_interval_s)
    }
}

/// Update the newest snapshot in place while it is younger than the snapshot
/// interval; start a new snapshot row otherwise.
fn save_chunk_on(
    conn: &Connection,
    pos: IVec2,
    data: &[u8],
    snapshot_interval_s: i64,
) -> rusqlite::Result<()> {
    let now = unix_now();
    let newest: Option<(i64, i64)> = conn
        .query_row(
            "SELECT rowid, created FROM chunks WHERE x = ?1 AND y = ?2 ORDER BY created DESC LIMIT 1",
            params![pos.x, pos.y],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match newest {
        Some((rowid, created)) if now - created <= snapshot_interval_s => {
            conn.execute(
                "UPDATE chunks SET data = ?1, compression = ?2, modified = ?3 WHERE rowid = ?4",
                params![data, COMPRESSION_LZ4, now, rowid],
            )?;
        }
        _ => {
            conn.execute(
                "INSERT INTO chunks(x, y, data, compression, created, modified)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?5)",
                params![pos.x, pos.y, data, COMPRESSION_LZ4, now],
            )?;
        }
    }
    Ok(())
}
