//! File-based table backend for persistent storage.
//!
//! Layout of a storage directory:
//!
//! ```text
//! <dir>/
//! ├─ LOCK                  # Advisory lock for single-process access
//! ├─ sync_queue.tbl        # One append-only log per table
//! └─ entities.specimen.tbl
//! ```
//!
//! Each log is a sequence of frames:
//!
//! ```text
//! | op (u8) | key_len (u32 LE) | value_len (u32 LE) | key | value |
//! ```
//!
//! `op` is 1 for put and 2 for delete. Logs are replayed into memory on open;
//! a torn trailing frame is truncated away.

use crate::backend::TableBackend;
use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const TABLE_EXT: &str = "tbl";
const FRAME_HEADER: usize = 9;
const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;

/// A file-based table backend.
///
/// Rows survive process restarts. Reads are served from an in-memory index
/// rebuilt at open time; writes append a frame to the table's log.
///
/// # Durability
///
/// - With `sync_writes` enabled every write is followed by `sync_data`
/// - `flush()` syncs every open table log
///
/// # Example
///
/// ```no_run
/// use geode_storage::{FileBackend, TableBackend};
/// use std::path::Path;
///
/// let backend = FileBackend::open(Path::new("cache")).unwrap();
/// backend.put("meta", "schema", b"1").unwrap();
/// backend.flush().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    sync_writes: bool,
    rows: RwLock<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
    logs: Mutex<HashMap<String, File>>,
    _lock_file: File,
}

impl FileBackend {
    /// Opens or creates a storage directory.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - Another process holds the lock (`Locked`)
    /// - A table log contains an unknown frame
    pub fn open(path: &Path) -> StorageResult<Self> {
        fs::create_dir_all(path)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked);
        }

        let mut rows = BTreeMap::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let file_path = entry.path();
            if file_path.extension().and_then(|e| e.to_str()) != Some(TABLE_EXT) {
                continue;
            }
            let Some(table) = file_path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let table = table.to_string();
            let replayed = replay_log(&table, &file_path)?;
            if !replayed.is_empty() {
                rows.insert(table, replayed);
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            sync_writes: false,
            rows: RwLock::new(rows),
            logs: Mutex::new(HashMap::new()),
            _lock_file: lock_file,
        })
    }

    /// Enables `sync_data` after every write.
    #[must_use]
    pub fn with_sync_writes(mut self, sync_writes: bool) -> Self {
        self.sync_writes = sync_writes;
        self
    }

    /// Returns the storage directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrites a table log so it only contains live rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the new log cannot be written or renamed.
    pub fn compact(&self, table: &str) -> StorageResult<()> {
        validate_table_name(table)?;
        let rows = self.rows.read();
        let mut logs = self.logs.lock();

        let final_path = self.table_path(table);
        let temp_path = final_path.with_extension("tbl.tmp");
        {
            let mut temp = File::create(&temp_path)?;
            if let Some(live) = rows.get(table) {
                for (key, value) in live {
                    temp.write_all(&encode_frame(OP_PUT, key, value))?;
                }
            }
            temp.sync_all()?;
        }
        logs.remove(table);
        fs::rename(&temp_path, &final_path)?;
        tracing::debug!(table, "compacted table log");
        Ok(())
    }

    fn table_path(&self, table: &str) -> PathBuf {
        self.path.join(format!("{table}.{TABLE_EXT}"))
    }

    fn append(&self, table: &str, frame: &[u8]) -> StorageResult<()> {
        let mut logs = self.logs.lock();
        if !logs.contains_key(table) {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.table_path(table))?;
            logs.insert(table.to_string(), file);
        }
        let Some(file) = logs.get_mut(table) else {
            return Err(StorageError::corrupted(table, "log handle vanished"));
        };
        file.write_all(frame)?;
        if self.sync_writes {
            file.sync_data()?;
        }
        Ok(())
    }
}

impl TableBackend for FileBackend {
    fn get(&self, table: &str, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self
            .rows
            .read()
            .get(table)
            .and_then(|rows| rows.get(key))
            .cloned())
    }

    fn put(&self, table: &str, key: &str, value: &[u8]) -> StorageResult<()> {
        validate_table_name(table)?;
        self.append(table, &encode_frame(OP_PUT, key, value))?;
        self.rows
            .write()
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, table: &str, key: &str) -> StorageResult<bool> {
        validate_table_name(table)?;
        let exists = self
            .rows
            .read()
            .get(table)
            .is_some_and(|rows| rows.contains_key(key));
        if !exists {
            return Ok(false);
        }
        self.append(table, &encode_frame(OP_DELETE, key, &[]))?;
        let mut rows = self.rows.write();
        if let Some(live) = rows.get_mut(table) {
            live.remove(key);
            if live.is_empty() {
                rows.remove(table);
            }
        }
        Ok(true)
    }

    fn scan(&self, table: &str) -> StorageResult<Vec<(String, Vec<u8>)>> {
        Ok(self
            .rows
            .read()
            .get(table)
            .map(|rows| rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn tables(&self) -> StorageResult<Vec<String>> {
        Ok(self.rows.read().keys().cloned().collect())
    }

    fn flush(&self) -> StorageResult<()> {
        let mut logs = self.logs.lock();
        for file in logs.values_mut() {
            file.flush()?;
            file.sync_all()?;
        }
        Ok(())
    }
}

fn validate_table_name(table: &str) -> StorageResult<()> {
    let valid = !table.is_empty()
        && table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidTableName(table.to_string()))
    }
}

fn encode_frame(op: u8, key: &str, value: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER + key.len() + value.len());
    frame.push(op);
    frame.extend_from_slice(&(key.len() as u32).to_le_bytes());
    frame.extend_from_slice(&(value.len() as u32).to_le_bytes());
    frame.extend_from_slice(key.as_bytes());
    frame.extend_from_slice(value);
    frame
}

fn replay_log(table: &str, path: &Path) -> StorageResult<BTreeMap<String, Vec<u8>>> {
    let mut data = Vec::new();
    File::open(path)?.read_to_end(&mut data)?;

    let mut rows = BTreeMap::new();
    let mut offset = 0usize;
    while offset < data.len() {
        if data.len() - offset < FRAME_HEADER {
            break;
        }
        let op = data[offset];
        let key_len = read_u32(&data[offset + 1..offset + 5]) as usize;
        let value_len = read_u32(&data[offset + 5..offset + 9]) as usize;
        let body_start = offset + FRAME_HEADER;
        let end = body_start
            .checked_add(key_len)
            .and_then(|n| n.checked_add(value_len));
        let Some(end) = end.filter(|end| *end <= data.len()) else {
            break;
        };

        let key = std::str::from_utf8(&data[body_start..body_start + key_len])
            .map_err(|_| StorageError::corrupted(table, format!("non-UTF-8 key at offset {offset}")))?
            .to_string();
        match op {
            OP_PUT => {
                rows.insert(key, data[body_start + key_len..end].to_vec());
            }
            OP_DELETE => {
                rows.remove(&key);
            }
            other => {
                return Err(StorageError::corrupted(
                    table,
                    format!("unknown frame op {other} at offset {offset}"),
                ));
            }
        }
        offset = end;
    }

    if offset < data.len() {
        tracing::warn!(
            table,
            offset,
            len = data.len(),
            "truncating torn frame at end of table log"
        );
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(offset as u64)?;
        file.sync_all()?;
    }

    Ok(rows)
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}
