//! MBTiles (SQLite) output.
//!
//! Single-writer by construction: the pipeline funnels encoded blobs through
//! one sink thread. Inserts are batched into transactions of `txn_tiles`
//! tiles; the unique tile index can be deferred until after the bulk load,
//! and the file can be VACUUM/ANALYZEd on close. Rows follow the MBTiles
//! spec: TMS tile rows (y flipped) and gzip MVT in `tile_data`.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};
use tracing::{debug, info};

use crate::config::Bounds;
use crate::coord::TileCoord;
use crate::error::{PipelineError, Result};

/// Metadata written after the last tile.
#[derive(Debug, Clone)]
pub struct MbtilesMetadata {
    pub name: String,
    pub description: String,
    pub bounds: Bounds,
    pub min_zoom: u8,
    pub max_zoom: u8,
    /// The `{"vector_layers": ...}` document from layer stats.
    pub layers_json: String,
}

/// Writer options mirroring the CLI toggles.
#[derive(Debug, Clone)]
pub struct MbtilesOptions {
    pub txn_tiles: usize,
    pub defer_index_creation: bool,
    pub optimize: bool,
}

impl Default for MbtilesOptions {
    fn default() -> Self {
        Self {
            txn_tiles: 1000,
            defer_index_creation: false,
            optimize: false,
        }
    }
}

pub struct MbtilesWriter {
    conn: Connection,
    path: PathBuf,
    options: MbtilesOptions,
    pending: usize,
    in_txn: bool,
    tiles_written: u64,
}

impl MbtilesWriter {
    /// Creates a fresh archive, replacing any stale file at `path`.
    pub fn create(path: impl Into<PathBuf>, options: MbtilesOptions) -> Result<Self> {
        let path = path.into();
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| PipelineError::from_io(&path, e))?;
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| PipelineError::from_io(parent, e))?;
            }
        }
        let conn = Connection::open(&path)?;
        // Bulk-load posture; the file is rebuilt from scratch on failure.
        conn.pragma_update(None, "journal_mode", "OFF")?;
        conn.pragma_update(None, "synchronous", "OFF")?;
        conn.execute_batch(
            "CREATE TABLE metadata (name TEXT, value TEXT);
             CREATE TABLE tiles (
                 zoom_level INTEGER,
                 tile_column INTEGER,
                 tile_row INTEGER,
                 tile_data BLOB
             );",
        )?;
        if !options.defer_index_creation {
            create_tile_index(&conn)?;
        }
        debug!(path = %path.display(), "created mbtiles");
        Ok(Self {
            conn,
            path,
            options,
            pending: 0,
            in_txn: false,
            tiles_written: 0,
        })
    }

    /// Inserts one tile blob. Must be called in ascending tile-id order by
    /// the single sink thread; the writer itself only cares about batching.
    pub fn put_tile(&mut self, tile: TileCoord, data: &[u8]) -> Result<()> {
        if !self.in_txn {
            self.conn.execute_batch("BEGIN")?;
            self.in_txn = true;
        }
        self.conn
            .prepare_cached(
                "INSERT INTO tiles (zoom_level, tile_column, tile_row, tile_data)
                 VALUES (?1, ?2, ?3, ?4)",
            )?
            .execute(params![tile.z, tile.x, tile.tms_row(), data])?;
        self.tiles_written += 1;
        self.pending += 1;
        if self.pending >= self.options.txn_tiles {
            self.conn.execute_batch("COMMIT")?;
            self.in_txn = false;
            self.pending = 0;
        }
        Ok(())
    }

    pub fn tiles_written(&self) -> u64 {
        self.tiles_written
    }

    /// Writes metadata, builds any deferred index, optionally optimizes,
    /// and closes the file.
    pub fn finish(mut self, metadata: &MbtilesMetadata) -> Result<()> {
        if self.in_txn {
            self.conn.execute_batch("COMMIT")?;
            self.in_txn = false;
        }
        if self.options.defer_index_creation {
            debug!("creating deferred tile index");
            create_tile_index(&self.conn)?;
        }
        let center = metadata.bounds.center();
        let rows: Vec<(&str, String)> = vec![
            ("name", metadata.name.clone()),
            ("format", "pbf".to_string()),
            ("description", metadata.description.clone()),
            (
                "bounds",
                format!(
                    "{},{},{},{}",
                    metadata.bounds.min_lon,
                    metadata.bounds.min_lat,
                    metadata.bounds.max_lon,
                    metadata.bounds.max_lat
                ),
            ),
            (
                "center",
                format!("{},{},{}", center.0, center.1, metadata.min_zoom),
            ),
            ("minzoom", metadata.min_zoom.to_string()),
            ("maxzoom", metadata.max_zoom.to_string()),
            ("type", "baselayer".to_string()),
            ("json", metadata.layers_json.clone()),
        ];
        for (name, value) in rows {
            self.conn.execute(
                "INSERT INTO metadata (name, value) VALUES (?1, ?2)",
                params![name, value],
            )?;
        }
        if self.options.optimize {
            info!("optimizing mbtiles (VACUUM, ANALYZE)");
            self.conn.execute_batch("VACUUM; ANALYZE;")?;
        }
        info!(
            tiles = self.tiles_written,
            path = %self.path.display(),
            "finished mbtiles"
        );
        Ok(())
    }

    /// Aborts the write and removes the partial archive.
    pub fn abort(self) -> Result<()> {
        let path = self.path.clone();
        drop(self.conn);
        remove_partial(&path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn create_tile_index(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE UNIQUE INDEX tile_index ON tiles (zoom_level, tile_column, tile_row);",
    )?;
    Ok(())
}

/// Removes a partial output file; used by abort paths outside the writer too.
pub fn remove_partial(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PipelineError::from_io(path, e)),
    }
}
