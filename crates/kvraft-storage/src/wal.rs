//! # wal
//!
//! why: make every record durable before it is acknowledged, and notice damage on recovery
//! relations: framing shared by the raft log file (raft_log.rs) and the engine wal (engine.rs)
//! what: FsyncPolicy, Wal append/replay, frame encoding, atomic whole-file writes
//!
//! Frame format: `[4-byte length LE][4-byte CRC32 of length LE][4-byte CRC32 of payload LE][JSON payload]`.
//! A frame cut short at the end of the file is a torn write and is dropped
//! (the file is truncated back to the last whole frame). The length is only
//! trusted once its own checksum matches, so a damaged length is corruption
//! and never looks like a torn tail. A whole frame whose payload fails its
//! checksum or does not decode is corruption, unless it is the very last
//! frame, where a half-flushed write can also leave garbage.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};

const HEADER_LEN: usize = 12;

/// Largest payload a frame may carry
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// When appended frames are forced to disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsyncPolicy {
    /// fsync after every frame
    Always,
    /// fsync when the owner calls `sync` at the end of a batch
    #[default]
    Batch,
    /// leave it to the OS
    None,
}

fn checksum(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// Serialize one record into a complete frame
pub fn encode_frame<T: Serialize>(record: &T) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(record)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(StorageError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("record of {} bytes exceeds the frame limit", payload.len()),
        )));
    }
    let len = (payload.len() as u32).to_le_bytes();
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&len);
    frame.extend_from_slice(&checksum(&len).to_le_bytes());
    frame.extend_from_slice(&checksum(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Replace `path` with `bytes` so readers see either the old or the new file
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    let mut file = File::create(&temp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&temp_path, path)?;
    sync_parent(path)
}

/// Make a rename in `path`'s directory durable
#[cfg(unix)]
fn sync_parent(path: &Path) -> Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => {
            File::open(dir)?.sync_all()?;
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> Result<()> {
    Ok(())
}

/// Deferred fsync of frames a `Wal` has already written.
#[derive(Debug)]
pub struct SyncHandle {
    file: File,
    fsync: FsyncPolicy,
}

impl SyncHandle {
    pub fn sync(&self) -> Result<()> {
        if self.fsync != FsyncPolicy::None {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

/// An append-only log of framed records.
#[derive(Debug)]
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    fsync: FsyncPolicy,
}

impl Wal {
    /// Open (or create) the file for appending
    pub fn open(path: &Path, fsync: FsyncPolicy) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            fsync,
        })
    }

    /// Discard all content and start over with an empty file
    pub fn reset(&mut self) -> Result<()> {
        self.writer.flush()?;
        let path = self.path.clone();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        file.sync_all()?;
        drop(file);
        *self = Self::open(&path, self.fsync)?;
        Ok(())
    }

    pub fn append<T: Serialize>(&mut self, record: &T) -> Result<()> {
        let frame = encode_frame(record)?;
        self.writer.write_all(&frame)?;
        self.writer.flush()?;
        if self.fsync == FsyncPolicy::Always {
            self.writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Flush buffered frames to the OS and hand out a handle that can fsync
    /// them later without borrowing the wal
    pub fn sync_handle(&mut self) -> Result<SyncHandle> {
        self.writer.flush()?;
        Ok(SyncHandle {
            file: self.writer.get_ref().try_clone()?,
            fsync: self.fsync,
        })
    }

    /// Force buffered frames to disk unless the policy is `None`
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        if self.fsync != FsyncPolicy::None {
            self.writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every intact record, truncating a torn tail in place.
    pub fn replay<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
        let bytes = match File::open(path) {
            Ok(mut file) => {
                let mut bytes = Vec::new();
                file.read_to_end(&mut bytes)?;
                bytes
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let (records, valid_len) = decode_frames(path, &bytes)?;
        if valid_len < bytes.len() {
            tracing::warn!(
                path = ?path,
                dropped = bytes.len() - valid_len,
                "torn write at end of log, truncating"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len as u64)?;
            file.sync_all()?;
        }
        Ok(records)
    }
}

/// Decode frames from `bytes`; returns the records and the length of the intact prefix
fn decode_frames<T: DeserializeOwned>(path: &Path, bytes: &[u8]) -> Result<(Vec<T>, usize)> {
    let mut records = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let rest = &bytes[pos..];
        if rest.len() < HEADER_LEN {
            break;
        }
        let len_bytes = [rest[0], rest[1], rest[2], rest[3]];
        let len_crc = u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]);
        if checksum(&len_bytes) != len_crc {
            return Err(StorageError::corrupt(
                path,
                format!("damaged frame length at offset {pos}"),
            ));
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_FRAME_LEN {
            return Err(StorageError::corrupt(
                path,
                format!("frame at offset {pos} claims {len} bytes"),
            ));
        }
        let expected = u32::from_le_bytes([rest[8], rest[9], rest[10], rest[11]]);
        if rest.len() - HEADER_LEN < len {
            break;
        }
        let end = HEADER_LEN + len;
        let payload = &rest[HEADER_LEN..end];
        let is_last = pos + end == bytes.len();

        let actual = checksum(payload);
        if actual != expected {
            if is_last {
                break;
            }
            return Err(StorageError::corrupt(
                path,
                format!("crc mismatch at offset {pos}: expected {expected:#010x}, got {actual:#010x}"),
            ));
        }
        let record = serde_json::from_slice(payload).map_err(|e| {
            StorageError::corrupt(path, format!("undecodable frame at offset {pos}: {e}"))
        })?;
        records.push(record);
        pos += end;
    }

    Ok((records, pos))
}
