//! Append-only JSON-lines backing files.
//!
//! Each line is either a full record or a tombstone
//! `{"$$deleted": true, "_id": ...}`. Loading folds the lines in order, so
//! the last line for an id wins. Compaction rewrites the file atomically.

use crate::error::{Result, StoreError};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, instrument, warn};

/// Key marking a tombstone line.
pub const TOMBSTONE_KEY: &str = "$$deleted";
const ID_KEY: &str = "_id";

/// A tombstone line for `id`.
pub fn tombstone(id: impl Into<Value>) -> Value {
    json!({ TOMBSTONE_KEY: true, ID_KEY: id.into() })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Live records, ordered by id. A missing file is an empty journal.
    #[instrument(skip(self), fields(path = %self.path.display()), level = "debug")]
    pub async fn load(&self) -> Result<Vec<Value>> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(format!("reading {}", self.path.display()), e)),
        };
        Ok(fold(&self.path, &text)?.live)
    }

    /// Rewrite the file to its live records once at least `min_dead` lines
    /// are superseded, deleted or corrupt and they make up at least half of
    /// the file. Returns the number of lines dropped.
    #[instrument(skip(self), fields(path = %self.path.display()), level = "debug")]
    pub async fn compact(&self, min_dead: usize) -> Result<usize> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StoreError::io(format!("reading {}", self.path.display()), e)),
        };
        let folded = fold(&self.path, &text)?;
        let dead = folded.dead();
        if dead == 0 || dead < min_dead || dead * 2 < folded.lines {
            return Ok(0);
        }
        self.rewrite(&folded.live).await?;
        debug!(dropped = dead, live = folded.live.len(), "journal compacted");
        Ok(dead)
    }

    /// Append records and flush them to disk.
    ///
    /// A torn last line left by a crash is terminated first, so the new
    /// records start on a line of their own.
    #[instrument(skip(self, records), fields(path = %self.path.display(), count = records.len()), level = "debug")]
    pub async fn append(&self, records: &[Value]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.ensure_parent().await?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| StoreError::io(format!("opening {}", self.path.display()), e))?;

        let mut buf = Vec::new();
        if !ends_with_newline(&mut file)
            .await
            .map_err(|e| StoreError::io(format!("reading {}", self.path.display()), e))?
        {
            warn!(path = %self.path.display(), "terminating torn journal line");
            buf.push(b'\n');
        }
        buf.extend(encode_lines(records)?);

        file.write_all(&buf)
            .await
            .map_err(|e| StoreError::io(format!("appending to {}", self.path.display()), e))?;
        file.sync_data()
            .await
            .map_err(|e| StoreError::io(format!("syncing {}", self.path.display()), e))?;
        Ok(())
    }

    /// Replace the whole file with `records` (temp file + rename).
    #[instrument(skip(self, records), fields(path = %self.path.display(), count = records.len()), level = "debug")]
    pub async fn rewrite(&self, records: &[Value]) -> Result<()> {
        let buf = encode_lines(records)?;
        self.ensure_parent().await?;

        let temp = self.temp_path();
        let mut file = fs::File::create(&temp)
            .await
            .map_err(|e| StoreError::io(format!("creating {}", temp.display()), e))?;
        file.write_all(&buf)
            .await
            .map_err(|e| StoreError::io(format!("writing {}", temp.display()), e))?;
        file.sync_all()
            .await
            .map_err(|e| StoreError::io(format!("syncing {}", temp.display()), e))?;
        drop(file);

        fs::rename(&temp, &self.path)
            .await
            .map_err(|e| StoreError::io(format!("renaming to {}", self.path.display()), e))?;
        debug!(bytes = buf.len(), "journal rewritten");
        Ok(())
    }

    /// Blocking variant of [`Journal::rewrite`], for cleanup paths that cannot
    /// await.
    pub fn rewrite_blocking(&self, records: &[Value]) -> Result<()> {
        use std::io::Write;

        let buf = encode_lines(records)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::io(format!("creating {}", parent.display()), e))?;
        }
        let temp = self.temp_path();
        let mut file = std::fs::File::create(&temp)
            .map_err(|e| StoreError::io(format!("creating {}", temp.display()), e))?;
        file.write_all(&buf)
            .and_then(|_| file.sync_all())
            .map_err(|e| StoreError::io(format!("writing {}", temp.display()), e))?;
        std::fs::rename(&temp, &self.path)
            .map_err(|e| StoreError::io(format!("renaming to {}", self.path.display()), e))
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    async fn ensure_parent(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(format!("creating {}", parent.display()), e))?;
        }
        Ok(())
    }
}

/// Whether the file is empty or its last byte is a newline.
async fn ends_with_newline(file: &mut fs::File) -> std::io::Result<bool> {
    if file.metadata().await?.len() == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::End(-1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    Ok(last[0] == b'\n')
}

fn encode_lines(records: &[Value]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    for record in records {
        serde_json::to_writer(&mut buf, record)?;
        buf.push(b'\n');
    }
    Ok(buf)
}

struct Folded {
    live: Vec<Value>,
    /// Non-empty lines in the file
    lines: usize,
}

impl Folded {
    fn dead(&self) -> usize {
        self.lines.saturating_sub(self.live.len())
    }
}

/// Fold journal lines into live records.
///
/// Unparseable lines are skipped. A single bad line (a torn tail after a
/// crash) is always tolerated; beyond that, more than 10% bad lines means the
/// file cannot be trusted.
fn fold(path: &Path, text: &str) -> Result<Folded> {
    let mut live: BTreeMap<String, Value> = BTreeMap::new();
    let mut total = 0usize;
    let mut corrupt = 0usize;

    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        total += 1;

        let record = match serde_json::from_str::<Value>(line) {
            Ok(record) if record.get(ID_KEY).is_some_and(|id| !id.is_null()) => record,
            _ => {
                corrupt += 1;
                warn!(path = %path.display(), line = lineno + 1, "skipping corrupt journal line");
                continue;
            }
        };

        let key = record.get(ID_KEY).map(id_key).unwrap_or_default();
        if record.get(TOMBSTONE_KEY) == Some(&Value::Bool(true)) {
            live.remove(&key);
        } else {
            live.insert(key, record);
        }
    }

    if corrupt > 1 && corrupt * 10 > total {
        return Err(StoreError::StorageIo(format!(
            "{}: {corrupt} of {total} lines are corrupt",
            path.display()
        )));
    }
    Ok(Folded {
        live: live.into_values().collect(),
        lines: total,
    })
}

/// Ids are strings for documents and numbers for change entries; both map
/// to one key space, padded so numeric ids sort numerically.
fn id_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_u64() {
            Some(u) => format!("{u:020}"),
            None => n.to_string(),
        },
        other => other.to_string(),
    }
}
