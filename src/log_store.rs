//! Durable, append-only record files.
//!
//! One record per line, each a positional JSON array (`[index, term, name, quantity]` for raft
//! proposals, `[number, name, quantity]` for orders). Every mutation is flushed with `fsync`
//! before returning; full rewrites go through a temp file and a rename.

use std::{
    fmt, fs,
    io::{self, BufRead, BufReader, Write},
    marker::PhantomData,
    path::{Path, PathBuf},
};

/// Distance between the value passed to an invalidation and the key it removes.
///
/// Invalidating `n` removes the record keyed `n - 1`; a proposal at index `i` is therefore
/// rolled back with `n = i + 1`.
pub const INVALIDATION_KEY_OFFSET: u64 = 1;

/// The key an invalidation of `n` targets, if any.
pub fn invalidation_target(n: u64) -> Option<u64> {
    n.checked_sub(INVALIDATION_KEY_OFFSET)
}

/// Whether a stored key is removed by an invalidation of `n`.
///
/// Matching is on the decimal prefix of the stored key, so with a long enough log an
/// invalidation of `2` also matches `10..=19` when they sit closer to the tail than `1`.
pub fn invalidation_matches(stored_key: u64, n: u64) -> bool {
    match invalidation_target(n) {
        Some(target) => stored_key.to_string().starts_with(&target.to_string()),
        None => false,
    }
}

/// The invalidation value that rolls back the proposal at `index`.
///
/// Issued indices stay below `u64::MAX`, so the token never wraps.
pub fn rollback_token(index: u64) -> u64 {
    index.saturating_add(INVALIDATION_KEY_OFFSET)
}

pub trait LogRecord: Clone + Send + Sync + 'static {
    /// Short name used in log lines and errors.
    const KIND: &'static str;

    fn key(&self) -> u64;

    fn encode(&self) -> Result<String, serde_json::Error>;

    fn decode(line: &str) -> Result<Self, serde_json::Error>;
}

#[derive(Debug)]
pub enum LogStoreError {
    Io(io::Error),
    Encode(serde_json::Error),
    /// Every key below `u64::MAX` has been issued.
    Exhausted { kind: &'static str },
    /// A replicated record carried a key this log can never issue past.
    KeyOutOfRange { kind: &'static str, key: u64 },
    Corrupt {
        path: PathBuf,
        line: usize,
        source: serde_json::Error,
    },
}

impl fmt::Display for LogStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Encode(e) => write!(f, "encode record: {e}"),
            Self::Exhausted { kind } => write!(f, "{kind} key space exhausted"),
            Self::KeyOutOfRange { kind, key } => write!(f, "{kind} key {key} is out of range"),
            Self::Corrupt { path, line, source } => {
                write!(f, "corrupt record at {}:{line}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for LogStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Corrupt { source, .. } => Some(source),
            Self::Exhausted { .. } | Self::KeyOutOfRange { .. } => None,
        }
    }
}

impl From<io::Error> for LogStoreError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

#[derive(Debug)]
pub struct LogFile<R> {
    path: PathBuf,
    _record: PhantomData<fn() -> R>,
}

impl<R: LogRecord> LogFile<R> {
    /// Creates the parent directory if needed. The file itself is created on first append; a
    /// missing file reads as an empty log.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LogStoreError> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            _record: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &R) -> Result<(), LogStoreError> {
        self.append_all(std::slice::from_ref(entry))
    }

    pub fn append_all(&self, entries: &[R]) -> Result<(), LogStoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut buf = String::new();
        for entry in entries {
            buf.push_str(&entry.encode().map_err(LogStoreError::Encode)?);
            buf.push('\n');
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(buf.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    pub fn read_all(&self) -> Result<Vec<R>, LogStoreError> {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record = R::decode(&line).map_err(|source| LogStoreError::Corrupt {
                path: self.path.clone(),
                line: idx + 1,
                source,
            })?;
            out.push(record);
        }
        Ok(out)
    }

    pub fn last_key(&self) -> Result<Option<u64>, LogStoreError> {
        Ok(self.read_all()?.last().map(|r| r.key()))
    }

    pub fn find(&self, key: u64) -> Result<Option<R>, LogStoreError> {
        Ok(self.read_all()?.into_iter().find(|r| r.key() == key))
    }

    /// Records strictly after the one keyed `start_key`; empty if `start_key` is absent.
    pub fn find_from(&self, start_key: u64) -> Result<Vec<R>, LogStoreError> {
        let records = self.read_all()?;
        match records.iter().position(|r| r.key() == start_key) {
            Some(pos) => Ok(records[pos + 1..].to_vec()),
            None => Ok(Vec::new()),
        }
    }

    /// Scans from the tail and removes the first record matching an invalidation of `n`
    /// (see [`invalidation_matches`]). The file is rewritten even when nothing matched.
    pub fn remove_last_matching(&self, n: u64) -> Result<Option<R>, LogStoreError> {
        let mut records = self.read_all()?;
        let pos = records
            .iter()
            .rposition(|r| invalidation_matches(r.key(), n));
        let removed = pos.map(|pos| records.remove(pos));
        self.rewrite(&records)?;
        Ok(removed)
    }

    /// Reloads every record, sorts by numeric key and rewrites the file in that order.
    pub fn rewrite_sorted(&self) -> Result<(), LogStoreError> {
        let mut records = self.read_all()?;
        records.sort_by_key(|r| r.key());
        self.rewrite(&records)
    }

    fn rewrite(&self, records: &[R]) -> Result<(), LogStoreError> {
        let mut buf = String::new();
        for record in records {
            buf.push_str(&record.encode().map_err(LogStoreError::Encode)?);
            buf.push('\n');
        }
        write_atomic(&self.path, buf.as_bytes())?;
        Ok(())
    }
}

/// On-disk layout of one replica's logs under the data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPaths {
    pub raft: PathBuf,
    pub orders: PathBuf,
}

impl LogPaths {
    pub fn new(data_dir: &Path, replica_id: u64) -> Self {
        Self {
            raft: data_dir
                .join("raft_data")
                .join(format!("raft_log_{replica_id}.jsonl")),
            orders: data_dir
                .join("order_data")
                .join(format!("order_log_{replica_id}.jsonl")),
        }
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), io::Error> {
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp_path = path.with_file_name(format!("{}.tmp", file_name.to_string_lossy()));
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}
