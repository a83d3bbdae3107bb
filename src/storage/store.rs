// Durable storage for a node, everything lives under one directory:
//
//   log       length-prefixed (u32 LE) MessagePack frames of LogEntry
//   snapshot  the 8 byte counter snapshot
//   state     MessagePack NodeState
//
// Writes of `snapshot` and `state` go through a temp file + rename so a
// crash leaves either the old or the new file, never half of one.
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use super::command::Command;

const LOG_FILE: &str = "log";
const SNAPSHOT_FILE: &str = "snapshot";
const STATE_FILE: &str = "state";
const FRAME_HEADER_LEN: usize = 4;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to encode entry: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("failed to decode {file}: {source}")]
    Decode {
        file: &'static str,
        source: rmp_serde::decode::Error,
    },

    #[error("corrupt log frame at byte {offset}")]
    Corrupt { offset: usize },

    #[error("log entry {index} out of order, expected {expected}")]
    OutOfOrder { index: u64, expected: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub command: Command,
}

impl LogEntry {
    pub fn new(index: u64, command: Command) -> LogEntry {
        LogEntry { index, command }
    }
}

#[derive(Debug)]
pub struct LogStore {
    dir: PathBuf,
    log: File,
    entries: Vec<LogEntry>,
}

impl LogStore {
    /// Opens (or creates) the store in `dir` and loads the log.
    ///
    /// A torn frame at the tail, left by a crash mid-append, is cut off.
    /// A complete frame that does not decode is an error.
    pub fn open(dir: impl AsRef<Path>) -> Result<LogStore, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let path = dir.join(LOG_FILE);
        let mut log = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        let mut buf = Vec::new();
        log.read_to_end(&mut buf)?;

        let (entries, valid_len) = decode_frames(&buf)?;
        if valid_len < buf.len() {
            warn!(
                path = %path.display(),
                dropped = buf.len() - valid_len,
                "truncating torn log tail"
            );
            log.set_len(valid_len as u64)?;
            log.sync_all()?;
        }

        Ok(LogStore { dir, log, entries })
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_index(&self) -> Option<u64> {
        self.entries.last().map(|e| e.index)
    }

    /// Appends and fsyncs one entry. Indexes must be consecutive.
    pub fn append(&mut self, entry: LogEntry) -> Result<(), StoreError> {
        if let Some(last) = self.last_index() {
            if entry.index != last + 1 {
                return Err(StoreError::OutOfOrder {
                    index: entry.index,
                    expected: last + 1,
                });
            }
        }

        let payload = rmp_serde::to_vec(&entry)?;
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);

        self.log.write_all(&frame)?;
        self.log.sync_data()?;
        self.entries.push(entry);
        Ok(())
    }

    /// Drops every log entry. Only call once a snapshot covers them.
    pub fn compact(&mut self) -> Result<(), StoreError> {
        self.log.set_len(0)?;
        self.log.sync_all()?;
        self.entries.clear();
        Ok(())
    }

    pub fn read_snapshot(&self) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.dir.join(SNAPSHOT_FILE)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write_snapshot(&self, data: &[u8]) -> Result<(), StoreError> {
        self.write_atomic(SNAPSHOT_FILE, data)
    }

    pub fn read_state<T: DeserializeOwned>(&self) -> Result<Option<T>, StoreError> {
        let data = match fs::read(self.dir.join(STATE_FILE)) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        rmp_serde::from_slice(&data)
            .map(Some)
            .map_err(|source| StoreError::Decode {
                file: STATE_FILE,
                source,
            })
    }

    pub fn write_state<T: Serialize>(&self, state: &T) -> Result<(), StoreError> {
        let data = rmp_serde::to_vec(state)?;
        self.write_atomic(STATE_FILE, &data)
    }

    fn write_atomic(&self, name: &str, data: &[u8]) -> Result<(), StoreError> {
        let tmp = self.dir.join(format!("{}.tmp", name));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, self.dir.join(name))?;
        Ok(())
    }
}

/// Returns the decoded entries and the length of the well-formed prefix.
fn decode_frames(buf: &[u8]) -> Result<(Vec<LogEntry>, usize), StoreError> {
    let mut entries = Vec::new();
    let mut offset = 0;

    while offset < buf.len() {
        let Some(header) = buf.get(offset..offset + FRAME_HEADER_LEN) else {
            break;
        };
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let start = offset + FRAME_HEADER_LEN;
        let Some(payload) = buf.get(start..start + len) else {
            break;
        };
        let entry: LogEntry =
            rmp_serde::from_slice(payload).map_err(|_| StoreError::Corrupt { offset })?;
        entries.push(entry);
        offset = start + len;
    }

    Ok((entries, offset))
}
