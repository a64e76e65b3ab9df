use super::data::{ImageFlags, ImageRecord};
use crate::develop::history::{HistoryHash, HistoryItem};
use crate::error::{EngineError, Result};
use crate::raw::Orientation;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};

/// A stored module preset; `autoapply` presets are applied once to new
/// images whose maker/model match the SQL `LIKE` patterns.
#[derive(Debug, Clone, PartialEq)]
pub struct Preset {
    pub name: String,
    pub operation: String,
    pub op_version: u32,
    pub params: Vec<u8>,
    pub enabled: bool,
    pub blend_params: Vec<u8>,
    pub blend_version: u32,
    pub multi_priority: u32,
    pub multi_name: String,
    pub autoapply: bool,
    pub maker: String,
    pub model: String,
}

impl Preset {
    pub fn to_history_item(&self) -> HistoryItem {
        HistoryItem {
            num: 0,
            operation: self.operation.clone(),
            module_version: self.op_version,
            enabled: self.enabled,
            params: self.params.clone(),
            blend_params: self.blend_params.clone(),
            blend_version: self.blend_version,
            multi_priority: self.multi_priority,
            multi_name: self.multi_name.clone(),
        }
    }
}

/// Persistence interface consumed by the caches and the develop
/// orchestrator: an ordered key-value store for images and histories.
pub trait Catalog: Send + Sync {
    /// Database file, `None` for an in-memory catalog.
    fn path(&self) -> Option<PathBuf>;

    fn image(&self, id: u32) -> Result<Option<ImageRecord>>;

    fn update_image(&self, record: &ImageRecord) -> Result<()>;

    fn image_ids(&self) -> Result<Vec<u32>>;

    /// History items ordered by `num`.
    fn history(&self, id: u32) -> Result<Vec<HistoryItem>>;

    /// Replace the whole history of an image in one transaction.
    fn replace_history(&self, id: u32, items: &[HistoryItem], history_end: u32) -> Result<()>;

    fn delete_history(&self, id: u32) -> Result<()>;

    fn history_hash(&self, id: u32) -> Result<Option<HistoryHash>>;

    fn set_history_hash(&self, id: u32, hash: &HistoryHash) -> Result<()>;

    fn auto_presets(&self, record: &ImageRecord) -> Result<Vec<Preset>>;
}

/// The Library manages the SQLite catalog database.
/// It stores image metadata, edit history and presets.
pub struct Library {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

impl Library {
    /// Open (or create) the catalog at `path` and initialize the schema.
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure the parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        tracing::info!("📁 Database initialized at: {}", path.display());
        Self::with_connection(conn, Some(path.to_path_buf()))
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, None)
    }

    fn with_connection(conn: Connection, db_path: Option<PathBuf>) -> Result<Self> {
        let library = Library {
            conn: Mutex::new(conn),
            db_path,
        };
        library.init_schema()?;
        Ok(library)
    }

    /// Where the catalog lives by default:
    /// - Linux: ~/.local/share/raw-develop/library.db
    /// - macOS: ~/Library/Application Support/raw-develop/library.db
    /// - Windows: %APPDATA%\raw-develop\library.db
    pub fn default_path() -> Option<PathBuf> {
        let mut path = dirs::data_dir().or_else(dirs::home_dir)?;
        path.push("raw-develop");
        path.push("library.db");
        Some(path)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;

             CREATE TABLE IF NOT EXISTS images (
                 id               INTEGER PRIMARY KEY AUTOINCREMENT,
                 path             TEXT NOT NULL UNIQUE,
                 filename         TEXT NOT NULL,
                 width            INTEGER NOT NULL DEFAULT 0,
                 height           INTEGER NOT NULL DEFAULT 0,
                 orientation      INTEGER NOT NULL DEFAULT 1,
                 maker            TEXT NOT NULL DEFAULT '',
                 model            TEXT NOT NULL DEFAULT '',
                 flags            INTEGER NOT NULL DEFAULT 0,
                 history_end      INTEGER NOT NULL DEFAULT 0,
                 imported_at      INTEGER NOT NULL,
                 change_timestamp INTEGER
             );

             CREATE TABLE IF NOT EXISTS history (
                 image_id         INTEGER NOT NULL,
                 num              INTEGER NOT NULL,
                 operation        TEXT NOT NULL,
                 module_version   INTEGER NOT NULL,
                 enabled          INTEGER NOT NULL,
                 op_params        BLOB NOT NULL,
                 blendop_params   BLOB NOT NULL,
                 blendop_version  INTEGER NOT NULL,
                 multi_priority   INTEGER NOT NULL DEFAULT 0,
                 multi_name       TEXT NOT NULL DEFAULT '',
                 PRIMARY KEY (image_id, num),
                 FOREIGN KEY (image_id) REFERENCES images(id) ON DELETE CASCADE
             );

             CREATE TABLE IF NOT EXISTS history_hash (
                 image_id         INTEGER PRIMARY KEY,
                 basic_hash       INTEGER,
                 auto_hash        INTEGER,
                 current_hash     INTEGER NOT NULL,
                 FOREIGN KEY (image_id) REFERENCES images(id) ON DELETE CASCADE
             );

             CREATE TABLE IF NOT EXISTS presets (
                 name             TEXT NOT NULL,
                 operation        TEXT NOT NULL,
                 op_version       INTEGER NOT NULL,
                 op_params        BLOB NOT NULL,
                 enabled          INTEGER NOT NULL DEFAULT 1,
                 blendop_params   BLOB NOT NULL DEFAULT x'',
                 blendop_version  INTEGER NOT NULL DEFAULT 0,
                 multi_priority   INTEGER NOT NULL DEFAULT 0,
                 multi_name       TEXT NOT NULL DEFAULT '',
                 autoapply        INTEGER NOT NULL DEFAULT 0,
                 maker            TEXT NOT NULL DEFAULT '%',
                 model            TEXT NOT NULL DEFAULT '%',
                 PRIMARY KEY (operation, name)
             );

             CREATE INDEX IF NOT EXISTS idx_images_imported_at ON images(imported_at DESC);",
        )?;
        tracing::debug!("✅ Database schema initialized");
        Ok(())
    }

    /// Get a count of images in the library
    pub fn image_count(&self) -> Result<u32> {
        let count: u32 = self.conn.lock().query_row("SELECT COUNT(*) FROM images", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Import a source file. Re-importing a known path returns its id.
    pub fn import_image(&self, path: &Path) -> Result<u32> {
        let path_str = path.to_string_lossy();
        let conn = self.conn.lock();
        if let Some(id) = conn
            .query_row("SELECT id FROM images WHERE path = ?1", [path_str.as_ref()], |row| row.get::<_, u32>(0))
            .optional()?
        {
            return Ok(id);
        }

        let record = ImageRecord::new(0, path.to_path_buf());
        conn.execute(
            "INSERT INTO images (path, filename, imported_at) VALUES (?1, ?2, ?3)",
            params![path_str.as_ref(), record.filename, record.imported_at.timestamp()],
        )?;
        let id = conn.last_insert_rowid() as u32;
        tracing::debug!("📥 Imported {} as image {}", path.display(), id);
        Ok(id)
    }

    /// Remove an image together with its history.
    pub fn remove_image(&self, id: u32) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM history WHERE image_id = ?1", [id])?;
        tx.execute("DELETE FROM history_hash WHERE image_id = ?1", [id])?;
        tx.execute("DELETE FROM images WHERE id = ?1", [id])?;
        tx.commit()?;
        Ok(())
    }

    pub fn add_preset(&self, preset: &Preset) -> Result<()> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO presets
                 (name, operation, op_version, op_params, enabled, blendop_params, blendop_version,
                  multi_priority, multi_name, autoapply, maker, model)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                preset.name,
                preset.operation,
                preset.op_version,
                preset.params,
                preset.enabled,
                preset.blend_params,
                preset.blend_version,
                preset.multi_priority,
                preset.multi_name,
                preset.autoapply,
                preset.maker,
                preset.model,
            ],
        )?;
        Ok(())
    }

    fn image_from_row(row: &Row<'_>) -> rusqlite::Result<ImageRecord> {
        let path: String = row.get(1)?;
        let mut record = ImageRecord::new(row.get(0)?, PathBuf::from(path));
        record.filename = row.get(2)?;
        record.width = row.get(3)?;
        record.height = row.get(4)?;
        record.orientation = Orientation(row.get(5)?);
        record.maker = row.get(6)?;
        record.model = row.get(7)?;
        record.flags = ImageFlags(row.get(8)?);
        record.history_end = row.get(9)?;
        let imported_at: i64 = row.get(10)?;
        record.imported_at = Utc.timestamp_opt(imported_at, 0).single().unwrap_or_default();
        let changed: Option<i64> = row.get(11)?;
        record.change_timestamp = changed.and_then(|ts| Utc.timestamp_opt(ts, 0).single());
        Ok(record)
    }

    fn history_from_row(row: &Row<'_>) -> rusqlite::Result<HistoryItem> {
        Ok(HistoryItem {
            num: row.get(0)?,
            operation: row.get(1)?,
            module_version: row.get(2)?,
            enabled: row.get(3)?,
            params: row.get(4)?,
            blend_params: row.get(5)?,
            blend_version: row.get(6)?,
            multi_priority: row.get(7)?,
            multi_name: row.get(8)?,
        })
    }
}

impl Catalog for Library {
    fn path(&self) -> Option<PathBuf> {
        self.db_path.clone()
    }

    fn image(&self, id: u32) -> Result<Option<ImageRecord>> {
        let record = self
            .conn
            .lock()
            .query_row(
                "SELECT id, path, filename, width, height, orientation, maker, model, flags,
                        history_end, imported_at, change_timestamp
                 FROM images WHERE id = ?1",
                [id],
                Self::image_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn update_image(&self, record: &ImageRecord) -> Result<()> {
        let updated = self.conn.lock().execute(
            "UPDATE images SET width = ?1, height = ?2, orientation = ?3, maker = ?4, model = ?5,
                               flags = ?6, history_end = ?7, change_timestamp = ?8
             WHERE id = ?9",
            params![
                record.width,
                record.height,
                record.orientation.0,
                record.maker,
                record.model,
                record.flags.0,
                record.history_end,
                record.change_timestamp.map(|ts| ts.timestamp()),
                record.id,
            ],
        )?;
        if updated == 0 {
            return Err(EngineError::ImageNotFound(record.id));
        }
        Ok(())
    }

    fn image_ids(&self) -> Result<Vec<u32>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id FROM images ORDER BY id")?;
        let ids = stmt.query_map([], |row| row.get(0))?.collect::<rusqlite::Result<Vec<u32>>>()?;
        Ok(ids)
    }

    fn history(&self, id: u32) -> Result<Vec<HistoryItem>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT num, operation, module_version, enabled, op_params, blendop_params,
                    blendop_version, multi_priority, multi_name
             FROM history WHERE image_id = ?1 ORDER BY num",
        )?;
        let items = stmt
            .query_map([id], Self::history_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    fn replace_history(&self, id: u32, items: &[HistoryItem], history_end: u32) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM history WHERE image_id = ?1", [id])?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO history (image_id, num, operation, module_version, enabled, op_params,
                                      blendop_params, blendop_version, multi_priority, multi_name)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for item in items {
                insert.execute(params![
                    id,
                    item.num,
                    item.operation,
                    item.module_version,
                    item.enabled,
                    item.params,
                    item.blend_params,
                    item.blend_version,
                    item.multi_priority,
                    item.multi_name,
                ])?;
            }
        }
        let updated = tx.execute(
            "UPDATE images SET history_end = ?1, change_timestamp = ?2 WHERE id = ?3",
            params![history_end, Utc::now().timestamp(), id],
        )?;
        if updated == 0 {
            return Err(EngineError::ImageNotFound(id));
        }
        tx.commit()?;
        Ok(())
    }

    fn delete_history(&self, id: u32) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM history WHERE image_id = ?1", [id])?;
        tx.execute("DELETE FROM history_hash WHERE image_id = ?1", [id])?;
        tx.execute(
            "UPDATE images SET history_end = 0, change_timestamp = ?1 WHERE id = ?2",
            params![Utc::now().timestamp(), id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn history_hash(&self, id: u32) -> Result<Option<HistoryHash>> {
        let hash = self
            .conn
            .lock()
            .query_row(
                "SELECT basic_hash, auto_hash, current_hash FROM history_hash WHERE image_id = ?1",
                [id],
                |row| {
                    let basic: Option<i64> = row.get(0)?;
                    let auto: Option<i64> = row.get(1)?;
                    let current: i64 = row.get(2)?;
                    Ok(HistoryHash {
                        basic: basic.map(|h| h as u64),
                        auto: auto.map(|h| h as u64),
                        current: current as u64,
                    })
                },
            )
            .optional()?;
        Ok(hash)
    }

    fn set_history_hash(&self, id: u32, hash: &HistoryHash) -> Result<()> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO history_hash (image_id, basic_hash, auto_hash, current_hash)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                id,
                hash.basic.map(|h| h as i64),
                hash.auto.map(|h| h as i64),
                hash.current as i64,
            ],
        )?;
        Ok(())
    }

    fn auto_presets(&self, record: &ImageRecord) -> Result<Vec<Preset>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT name, operation, op_version, op_params, enabled, blendop_params, blendop_version,
                    multi_priority, multi_name, autoapply, maker, model
             FROM presets
             WHERE autoapply = 1 AND ?1 LIKE maker AND ?2 LIKE model
             ORDER BY operation, multi_priority, name",
        )?;
        let presets = stmt
            .query_map(params![record.maker, record.model], |row| {
                Ok(Preset {
                    name: row.get(0)?,
                    operation: row.get(1)?,
                    op_version: row.get(2)?,
                    params: row.get(3)?,
                    enabled: row.get(4)?,
                    blend_params: row.get(5)?,
                    blend_version: row.get(6)?,
                    multi_priority: row.get(7)?,
                    multi_name: row.get(8)?,
                    autoapply: row.get(9)?,
                    maker: row.get(10)?,
                    model: row.get(11)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(presets)
    }
}

// Implement Debug for better error messages
impl std::fmt::Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Library").field("db_path", &self.db_path).finish()
    }
}
