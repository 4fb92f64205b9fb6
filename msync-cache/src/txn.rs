//! The live cache file: header + field-header chain + record chain on
//! disk, with an in-memory add-buffer that soaks up writes until a soft
//! cap is hit. Grounded on `Bayou::push`'s buffer-then-flush-then-
//! checkpoint shape (`src/bayou.rs`), translated from "append to a K2V
//! value" to "append to a local file under an exclusive lock".

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{CacheError, Result};
use crate::format::{CacheHeader, CacheRecord, FieldDecl, FieldHeaderBlock};

/// Buffered adds soak here until their total size crosses this, per
/// spec.md §4.3's "soft cap (~256 KB)".
pub const SOFT_CAP_BYTES: usize = 256 * 1024;

struct PendingAdd {
    seq: u32,
    field_index: u32,
    data: Vec<u8>,
}

/// A dotlock-style advisory lock: a sidecar file created with `create_new`
/// so two writers can never both succeed, released on drop. Grounded on
/// the original source's maildir dotlock discipline
/// (`UIDLIST_LOCK_STALE_TIMEOUT`), reused here for the cache file's
/// exclusive-writer requirement.
pub struct CacheLock {
    path: PathBuf,
}

impl CacheLock {
    pub fn acquire(cache_path: &Path) -> Result<Self> {
        let path = lock_path(cache_path);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(CacheLock { path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(CacheError::Busy),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn lock_path(cache_path: &Path) -> PathBuf {
    let mut s = cache_path.as_os_str().to_owned();
    s.push(".lock");
    PathBuf::from(s)
}

/// A cache file open for reading and (optionally, while a `CacheLock` is
/// held) appending.
pub struct CacheFile {
    path: PathBuf,
    header: CacheHeader,
    field_header: FieldHeaderBlock,
    pending: Vec<PendingAdd>,
    pending_bytes: usize,
}

impl CacheFile {
    /// Opens an existing cache file, or creates a fresh one if none exists
    /// yet. Rejects (by creating fresh instead of reading) a file whose
    /// header is incompatible or whose `used_file_size` lags the actual
    /// file size in a way that indicates a torn write past recovery —
    /// the "unlink on version/indexid/alignment mismatch" rule of
    /// spec.md §4.3.
    pub fn open_or_create(path: &Path, indexid: u32, file_seq: u32) -> Result<Self> {
        match File::open(path) {
            Ok(mut f) => {
                let mut buf = [0u8; CacheHeader::ENCODED_LEN];
                let len = f.read(&mut buf)?;
                if len == CacheHeader::ENCODED_LEN {
                    if let Some(header) = CacheHeader::decode(&buf) {
                        if header.is_compatible() && header.indexid == indexid {
                            let field_header = read_field_header(&mut f, &header)?;
                            return Ok(CacheFile {
                                path: path.to_path_buf(),
                                header,
                                field_header,
                                pending: Vec::new(),
                                pending_bytes: 0,
                            });
                        }
                        warn!("cache header incompatible or indexid mismatch, recreating");
                    }
                }
                Self::create_fresh(path, indexid, file_seq)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Self::create_fresh(path, indexid, file_seq)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn create_fresh(path: &Path, indexid: u32, file_seq: u32) -> Result<Self> {
        let header = CacheHeader::new(indexid, file_seq);
        let mut f = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        f.write_all(&header.encode())?;
        Ok(CacheFile {
            path: path.to_path_buf(),
            header,
            field_header: FieldHeaderBlock::default(),
            pending: Vec::new(),
            pending_bytes: 0,
        })
    }

    pub fn header(&self) -> &CacheHeader {
        &self.header
    }

    pub fn file_seq(&self) -> u32 {
        self.header.file_seq
    }

    /// Declares a field, appending a new field-header block and
    /// publishing it by overwriting the previous block's `next_offset`
    /// (spec.md §4.3). Requires the caller to hold a `CacheLock`.
    pub fn declare_field(&mut self, _lock: &CacheLock, name: &str, fixed_size: Option<u16>) -> Result<u32> {
        let file_field_index = self.field_header.fields.len() as u32;
        self.field_header.fields.push(FieldDecl {
            file_field_index,
            name: name.to_string(),
            fixed_size,
        });
        self.append_field_header_block()?;
        Ok(file_field_index)
    }

    fn append_field_header_block(&mut self) -> Result<()> {
        let encoded = rmp_serde::to_vec(&self.field_header)
            .map_err(|e| CacheError::Corrupted(e.to_string()))?;
        let mut f = OpenOptions::new().write(true).open(&self.path)?;
        let offset = self.header.used_file_size;
        f.seek(SeekFrom::Start(offset as u64))?;
        f.write_all(&(encoded.len() as u32).to_le_bytes())?;
        f.write_all(&encoded)?;
        self.header.field_header_offset = offset;
        self.header.used_file_size = offset + 4 + encoded.len() as u32;
        f.seek(SeekFrom::Start(0))?;
        f.write_all(&self.header.encode())?;
        Ok(())
    }

    /// Buffers an add in memory; returns the number of bytes now pending.
    pub fn add(&mut self, seq: u32, field_index: u32, data: Vec<u8>) -> usize {
        self.pending_bytes += data.len();
        self.pending.push(PendingAdd {
            seq,
            field_index,
            data,
        });
        self.pending_bytes
    }

    pub fn should_flush(&self) -> bool {
        self.pending_bytes >= SOFT_CAP_BYTES
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Flushes buffered adds under an exclusive lock: appends each
    /// record, chaining same-seq collisions via `prev_offset`, then
    /// updates the header. Requires the caller to hold a `CacheLock`.
    pub fn flush(&mut self, _lock: &CacheLock) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut f = OpenOptions::new().write(true).open(&self.path)?;
        let mut last_offset_by_seq: std::collections::HashMap<u32, u32> =
            std::collections::HashMap::new();
        let mut offset = self.header.used_file_size;
        let pending = std::mem::take(&mut self.pending);
        for p in pending {
            let prev_offset = last_offset_by_seq.get(&p.seq).copied().unwrap_or(0);
            let rec = CacheRecord {
                seq: p.seq,
                field_index: p.field_index,
                data: p.data,
                prev_offset,
            };
            if prev_offset != 0 {
                self.header.continued_record_count += 1;
            }
            let encoded =
                rmp_serde::to_vec(&rec).map_err(|e| CacheError::Corrupted(e.to_string()))?;
            f.seek(SeekFrom::Start(offset as u64))?;
            f.write_all(&(encoded.len() as u32).to_le_bytes())?;
            f.write_all(&encoded)?;
            last_offset_by_seq.insert(p.seq, offset);
            offset += 4 + encoded.len() as u32;
            self.header.record_count += 1;
        }
        self.header.used_file_size = offset;
        f.seek(SeekFrom::Start(0))?;
        f.write_all(&self.header.encode())?;
        f.sync_all()?;
        self.pending_bytes = 0;
        debug!(offset, "cache file flushed");
        Ok(())
    }

    /// Reads every record in a message's chain, oldest first, following
    /// `prev_offset` back to 0.
    pub fn read_chain(&self, seq: u32, head_offset: u32) -> Result<Vec<CacheRecord>> {
        let mut f = File::open(&self.path)?;
        let mut chain = Vec::new();
        let mut offset = head_offset;
        while offset != 0 {
            if offset >= self.header.used_file_size {
                break; // torn tail, ignore until header re-maps
            }
            f.seek(SeekFrom::Start(offset as u64))?;
            let mut len_buf = [0u8; 4];
            f.read_exact(&mut len_buf)?;
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut data = vec![0u8; len];
            f.read_exact(&mut data)?;
            let rec: CacheRecord =
                rmp_serde::from_slice(&data).map_err(|e| CacheError::Corrupted(e.to_string()))?;
            if rec.prev_offset >= offset {
                return Err(CacheError::Corrupted(format!(
                    "record at {} points forward to {}",
                    offset, rec.prev_offset
                )));
            }
            if rec.seq == seq {
                chain.push(rec.clone());
            }
            offset = rec.prev_offset;
        }
        chain.reverse();
        Ok(chain)
    }
}

fn read_field_header(f: &mut File, header: &CacheHeader) -> Result<FieldHeaderBlock> {
    if header.field_header_offset == 0 {
        return Ok(FieldHeaderBlock::default());
    }
    f.seek(SeekFrom::Start(header.field_header_offset as u64))?;
    let mut len_buf = [0u8; 4];
    f.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut data = vec![0u8; len];
    f.read_exact(&mut data)?;
    rmp_serde::from_slice(&data).map_err(|e| CacheError::Corrupted(e.to_string()))
}
