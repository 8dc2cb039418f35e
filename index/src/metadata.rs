//! SQLite metadata store.
//!
//! Holds everything except the vectors: file records of the committed
//! snapshot, chunk text, index entries with their vector slots, the symbol
//! table used by the quick index, and a small key/value `meta` table.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use compass_change_detector::{FileRecord, Language, Snapshot};
use compass_chunker::{ChunkKind, Symbol};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use tracing::{debug, warn};

use crate::entry::{IndexEntry, QueryFilters};
use crate::error::{IndexError, Result};
use crate::vector::Slot;

/// Schema version stored under `meta.format_version`.
pub const SCHEMA_VERSION: &str = "1";

pub const META_FORMAT_VERSION: &str = "format_version";
pub const META_DIMENSION: &str = "dimension";
pub const META_LAST_BUILD: &str = "last_build_time";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS files (
        path TEXT PRIMARY KEY,
        content_hash TEXT NOT NULL,
        size INTEGER NOT NULL,
        modified TEXT NOT NULL,
        language TEXT NOT NULL,
        git_tracked INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS chunks (
        chunk_id TEXT PRIMARY KEY,
        path TEXT NOT NULL,
        sequence INTEGER NOT NULL,
        kind TEXT NOT NULL,
        name TEXT,
        language TEXT NOT NULL,
        start_line INTEGER NOT NULL,
        end_line INTEGER NOT NULL,
        start_byte INTEGER NOT NULL,
        end_byte INTEGER NOT NULL,
        text TEXT NOT NULL,
        context TEXT
    );

    CREATE TABLE IF NOT EXISTS index_entries (
        chunk_id TEXT PRIMARY KEY,
        slot INTEGER NOT NULL,
        path TEXT NOT NULL,
        sequence INTEGER NOT NULL,
        language TEXT NOT NULL,
        git_tracked INTEGER NOT NULL DEFAULT 0,
        tombstoned INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_entries_path ON index_entries(path, tombstoned);
    CREATE INDEX IF NOT EXISTS idx_entries_slot ON index_entries(slot);

    CREATE TABLE IF NOT EXISTS symbols (
        path TEXT NOT NULL,
        name TEXT NOT NULL,
        kind TEXT NOT NULL,
        line INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_symbols_path ON symbols(path);

    CREATE TABLE IF NOT EXISTS snapshot (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        root_hash TEXT NOT NULL,
        committed_at TEXT,
        file_count INTEGER NOT NULL
    );
";

const ENTRY_COLUMNS: &str = "e.chunk_id, e.slot, e.path, c.sequence, c.kind, c.name, c.language, \
     e.git_tracked, c.start_line, c.end_line, c.start_byte, c.end_byte, c.text, c.context";

/// Entry counts reported by [`MetadataStore::counts`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryCounts {
    pub live: usize,
    pub tombstoned: usize,
    pub files: usize,
}

/// A live entry as seen by reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveEntry {
    pub chunk_id: String,
    pub slot: Slot,
    pub path: String,
}

/// Rows written by one [`MetadataStore::apply_batch`] call.
#[derive(Debug, Default)]
pub struct WriteBatch<'a> {
    /// New entries with the slots their vectors were stored in.
    pub inserts: Vec<(&'a IndexEntry, Slot)>,

    /// Tombstone every live entry of this path whose id is not in the set.
    pub retain: Option<(&'a str, &'a HashSet<String>)>,
}

/// SQLite-backed metadata store.
pub struct MetadataStore {
    conn: Mutex<Connection>,
}

impl MetadataStore {
    /// Open or create the database at `path` in WAL mode.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        match store.meta(META_FORMAT_VERSION)? {
            None => store.set_meta(META_FORMAT_VERSION, SCHEMA_VERSION)?,
            Some(version) if version == SCHEMA_VERSION => {}
            Some(version) => {
                return Err(IndexError::Corruption(format!(
                    "unsupported metadata format version {version}"
                )));
            }
        }
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read a `meta` value.
    pub fn meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn();
        let value = conn
            .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    /// Write a `meta` value.
    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Time of the last finished build.
    pub fn last_build_time(&self) -> Result<Option<DateTime<Utc>>> {
        self.meta(META_LAST_BUILD)?
            .map(|value| parse_time(&value))
            .transpose()
    }

    pub fn set_last_build_time(&self, at: DateTime<Utc>) -> Result<()> {
        self.set_meta(META_LAST_BUILD, &at.to_rfc3339())
    }

    /// Ids of the live entries of one file.
    pub fn live_chunk_ids(&self, path: &str) -> Result<HashSet<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT chunk_id FROM index_entries WHERE path = ?1 AND tombstoned = 0",
        )?;
        let ids = stmt
            .query_map(params![path], |row| row.get(0))?
            .collect::<rusqlite::Result<HashSet<String>>>()?;
        Ok(ids)
    }

    /// Every live entry with its slot.
    pub fn live_entries(&self) -> Result<Vec<LiveEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT chunk_id, slot, path FROM index_entries WHERE tombstoned = 0 ORDER BY slot",
        )?;
        let entries = stmt
            .query_map([], |row| {
                Ok(LiveEntry {
                    chunk_id: row.get(0)?,
                    slot: row.get::<_, i64>(1)? as Slot,
                    path: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Path of a chunk, if its row still exists.
    pub fn chunk_path(&self, chunk_id: &str) -> Result<Option<String>> {
        let conn = self.conn();
        let path = conn
            .query_row(
                "SELECT path FROM chunks WHERE chunk_id = ?1",
                params![chunk_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(path)
    }

    /// Apply inserts and tombstones in one transaction.
    ///
    /// Returns the slots whose entries were tombstoned.
    pub fn apply_batch(&self, batch: &WriteBatch<'_>) -> Result<Vec<Slot>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut tombstoned = Vec::new();

        for (entry, slot) in &batch.inserts {
            {
                let mut prior = tx.prepare_cached(
                    "SELECT chunk_id, slot FROM index_entries
                     WHERE path = ?1 AND sequence = ?2 AND tombstoned = 0 AND chunk_id != ?3",
                )?;
                let replaced = prior
                    .query_map(
                        params![entry.path, entry.sequence as i64, entry.chunk_id],
                        |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as Slot)),
                    )?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                for (chunk_id, old_slot) in replaced {
                    tx.execute(
                        "UPDATE index_entries SET tombstoned = 1 WHERE chunk_id = ?1",
                        params![chunk_id],
                    )?;
                    tombstoned.push(old_slot);
                }
            }

            tx.execute(
                "INSERT OR REPLACE INTO chunks
                 (chunk_id, path, sequence, kind, name, language, start_line, end_line,
                  start_byte, end_byte, text, context)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    entry.chunk_id,
                    entry.path,
                    entry.sequence as i64,
                    entry.kind.as_str(),
                    entry.name,
                    entry.language.as_str(),
                    entry.start_line as i64,
                    entry.end_line as i64,
                    entry.start_byte as i64,
                    entry.end_byte as i64,
                    entry.text,
                    entry.context,
                ],
            )?;
            tx.execute(
                "INSERT INTO index_entries
                 (chunk_id, slot, path, sequence, language, git_tracked, tombstoned)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)
                 ON CONFLICT(chunk_id) DO UPDATE SET
                    slot = excluded.slot,
                    git_tracked = excluded.git_tracked,
                    tombstoned = 0",
                params![
                    entry.chunk_id,
                    *slot as i64,
                    entry.path,
                    entry.sequence as i64,
                    entry.language.as_str(),
                    entry.git_tracked,
                ],
            )?;
        }

        if let Some((path, keep)) = batch.retain {
            let live = {
                let mut stmt = tx.prepare_cached(
                    "SELECT chunk_id, slot FROM index_entries WHERE path = ?1 AND tombstoned = 0",
                )?;
                stmt.query_map(params![path], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as Slot))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?
            };
            for (chunk_id, slot) in live {
                if !keep.contains(&chunk_id) {
                    tx.execute(
                        "UPDATE index_entries SET tombstoned = 1 WHERE chunk_id = ?1",
                        params![chunk_id],
                    )?;
                    tombstoned.push(slot);
                }
            }
        }

        tx.commit()?;
        Ok(tombstoned)
    }

    /// Tombstone every live entry of `path`; returns their slots.
    pub fn tombstone_path(&self, path: &str) -> Result<Vec<Slot>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let slots = {
            let mut stmt = tx.prepare_cached(
                "SELECT slot FROM index_entries WHERE path = ?1 AND tombstoned = 0",
            )?;
            stmt.query_map(params![path], |row| Ok(row.get::<_, i64>(0)? as Slot))?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };
        tx.execute(
            "UPDATE index_entries SET tombstoned = 1 WHERE path = ?1 AND tombstoned = 0",
            params![path],
        )?;
        tx.commit()?;
        Ok(slots)
    }

    /// Tombstone entries by id.
    pub fn tombstone_chunks(&self, chunk_ids: &[String]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for chunk_id in chunk_ids {
            tx.execute(
                "UPDATE index_entries SET tombstoned = 1 WHERE chunk_id = ?1",
                params![chunk_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Slots of live entries passing `filters`.
    pub fn filtered_slots(&self, filters: &QueryFilters) -> Result<HashSet<Slot>> {
        let mut sql = String::from("SELECT slot FROM index_entries WHERE tombstoned = 0");
        let mut values: Vec<String> = Vec::new();

        if !filters.languages.is_empty() {
            let placeholders: Vec<String> = filters
                .languages
                .iter()
                .map(|language| {
                    values.push(language.as_str().to_string());
                    format!("?{}", values.len())
                })
                .collect();
            sql.push_str(&format!(" AND language IN ({})", placeholders.join(", ")));
        }
        if filters.git_only {
            sql.push_str(" AND git_tracked = 1");
        }
        if let Some(prefix) = &filters.path_prefix {
            let prefix = prefix.trim_end_matches('/');
            values.push(prefix.to_string());
            let exact = values.len();
            values.push(format!("{prefix}/"));
            let below = values.len();
            sql.push_str(&format!(
                " AND (path = ?{exact} OR substr(path, 1, length(?{below})) = ?{below})"
            ));
        }

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let slots = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok(row.get::<_, i64>(0)? as Slot)
            })?
            .collect::<rusqlite::Result<HashSet<_>>>()?;
        Ok(slots)
    }

    /// Live entries stored at the given slots.
    pub fn entries_for_slots(&self, slots: &[Slot]) -> Result<HashMap<Slot, IndexEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ENTRY_COLUMNS} FROM index_entries e
             JOIN chunks c ON c.chunk_id = e.chunk_id
             WHERE e.slot = ?1 AND e.tombstoned = 0"
        ))?;

        let mut entries = HashMap::with_capacity(slots.len());
        for slot in slots {
            let found = stmt
                .query_row(params![*slot as i64], read_entry)
                .optional()?;
            if let Some((slot, entry)) = found {
                entries.insert(slot, entry?);
            }
        }
        Ok(entries)
    }

    /// Live entries of one file in sequence order.
    pub fn entries_for_path(&self, path: &str) -> Result<Vec<IndexEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM index_entries e
             JOIN chunks c ON c.chunk_id = e.chunk_id
             WHERE e.path = ?1 AND e.tombstoned = 0
             ORDER BY c.sequence"
        ))?;
        let rows = stmt
            .query_map(params![path], read_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(|(_, entry)| entry).collect()
    }

    /// Live/tombstoned entry counts and the number of files with live entries.
    pub fn counts(&self) -> Result<EntryCounts> {
        let conn = self.conn();
        let (live, tombstoned, files) = conn.query_row(
            "SELECT
                COALESCE(SUM(tombstoned = 0), 0),
                COALESCE(SUM(tombstoned = 1), 0),
                COUNT(DISTINCT CASE WHEN tombstoned = 0 THEN path END)
             FROM index_entries",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        )?;
        Ok(EntryCounts {
            live: live as usize,
            tombstoned: tombstoned as usize,
            files: files as usize,
        })
    }

    /// Committed files per language tag.
    pub fn files_by_language(&self) -> Result<BTreeMap<Language, usize>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT language, COUNT(*) FROM files GROUP BY language")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut counts: BTreeMap<Language, usize> = BTreeMap::new();
        for (language, count) in rows {
            counts.insert(parse_tag(&language)?, count as usize);
        }
        Ok(counts)
    }

    /// Drop tombstoned rows and renumber slots after a vector compaction.
    pub fn apply_compaction(&self, mapping: &[(String, Slot)]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM index_entries WHERE tombstoned = 1", [])?;
        tx.execute(
            "DELETE FROM chunks WHERE chunk_id NOT IN (SELECT chunk_id FROM index_entries)",
            [],
        )?;
        for (chunk_id, slot) in mapping {
            tx.execute(
                "UPDATE index_entries SET slot = ?1 WHERE chunk_id = ?2",
                params![*slot as i64, chunk_id],
            )?;
        }
        tx.commit()?;
        debug!("Removed {removed} tombstoned entries from the metadata store");
        Ok(())
    }

    /// Clear entries, chunks, symbols and the snapshot.
    pub fn reset(&self) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute_batch(
            "DELETE FROM index_entries;
             DELETE FROM chunks;
             DELETE FROM symbols;
             DELETE FROM files;
             DELETE FROM snapshot;",
        )?;
        tx.execute("DELETE FROM meta WHERE key = ?1", params![META_LAST_BUILD])?;
        tx.commit()?;
        Ok(())
    }

    /// Replace the persisted snapshot.
    pub fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM files", [])?;
        {
            let mut insert = tx.prepare_cached(
                "INSERT INTO files (path, content_hash, size, modified, language, git_tracked)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for record in snapshot.records().values() {
                insert.execute(params![
                    record.path,
                    record.content_hash,
                    record.size as i64,
                    record.modified.to_rfc3339(),
                    record.language.as_str(),
                    record.git_tracked,
                ])?;
            }
        }
        tx.execute(
            "INSERT INTO snapshot (id, root_hash, committed_at, file_count) VALUES (1, ?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                root_hash = excluded.root_hash,
                committed_at = excluded.committed_at,
                file_count = excluded.file_count",
            params![
                snapshot.root_hex(),
                snapshot.committed_at().map(|at| at.to_rfc3339()),
                snapshot.len() as i64,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Load the persisted snapshot; empty when none was committed.
    pub fn load_snapshot(&self) -> Result<Snapshot> {
        let conn = self.conn();
        let header: Option<(String, Option<String>)> = conn
            .query_row(
                "SELECT root_hash, committed_at FROM snapshot WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((root_hash, committed_at)) = header else {
            return Ok(Snapshot::empty());
        };

        let mut stmt = conn.prepare(
            "SELECT path, content_hash, size, modified, language, git_tracked FROM files",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, bool>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for (path, content_hash, size, modified, language, git_tracked) in rows {
            records.push(FileRecord {
                path,
                content_hash,
                size: size as u64,
                modified: parse_time(&modified)?,
                language: parse_tag(&language)?,
                git_tracked,
            });
        }

        let mut snapshot = Snapshot::from_records(records);
        if let Some(at) = committed_at {
            snapshot = snapshot.with_committed_at(parse_time(&at)?);
        }
        if snapshot.root_hex() != root_hash {
            warn!("Persisted snapshot root hash does not match its file records; using the records");
        }
        Ok(snapshot)
    }

    /// Replace symbols for `updated` files and drop them for `removed` files.
    pub fn replace_symbols(
        &self,
        updated: &[(String, Vec<Symbol>)],
        removed: &[String],
    ) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for path in removed.iter().chain(updated.iter().map(|(path, _)| path)) {
            tx.execute("DELETE FROM symbols WHERE path = ?1", params![path])?;
        }
        {
            let mut insert = tx.prepare_cached(
                "INSERT INTO symbols (path, name, kind, line) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (path, symbols) in updated {
                for symbol in symbols {
                    insert.execute(params![
                        path,
                        symbol.name,
                        symbol.kind.as_str(),
                        symbol.line as i64
                    ])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// All persisted symbols grouped by path.
    pub fn load_symbols(&self) -> Result<HashMap<String, Vec<Symbol>>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT path, name, kind, line FROM symbols ORDER BY path, line")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut symbols: HashMap<String, Vec<Symbol>> = HashMap::new();
        for (path, name, kind, line) in rows {
            symbols.entry(path).or_default().push(Symbol {
                name,
                kind: parse_tag(&kind)?,
                line: line as usize,
            });
        }
        Ok(symbols)
    }
}

impl std::fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore").finish_non_exhaustive()
    }
}

type EntryRow = (Slot, Result<IndexEntry>);

fn read_entry(row: &Row<'_>) -> rusqlite::Result<EntryRow> {
    let slot = row.get::<_, i64>(1)? as Slot;
    let kind: String = row.get(4)?;
    let language: String = row.get(6)?;

    let entry = match (parse_tag::<ChunkKind>(&kind), parse_tag::<Language>(&language)) {
        (Ok(kind), Ok(language)) => Ok(IndexEntry {
            chunk_id: row.get(0)?,
            path: row.get(2)?,
            sequence: row.get::<_, i64>(3)? as u32,
            kind,
            name: row.get(5)?,
            language,
            git_tracked: row.get(7)?,
            start_line: row.get::<_, i64>(8)? as usize,
            end_line: row.get::<_, i64>(9)? as usize,
            start_byte: row.get::<_, i64>(10)? as usize,
            end_byte: row.get::<_, i64>(11)? as usize,
            text: row.get(12)?,
            context: row.get(13)?,
        }),
        (Err(e), _) | (_, Err(e)) => Err(e),
    };
    Ok((slot, entry))
}

fn parse_tag<T: FromStr<Err = String>>(value: &str) -> Result<T> {
    value.parse().map_err(IndexError::Corruption)
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| IndexError::Corruption(format!("bad timestamp {value}: {e}")))
}
