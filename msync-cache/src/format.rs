//! On-disk layout of the cache file: a 64-byte fixed header, a field-header
//! chain, and a record chain. Field names and offsets are exactly the ones
//! spec.md §4.3/§6 names; this module only defines the shapes, `txn.rs`
//! and `compression.rs` own reading and writing them.

use serde::{Deserialize, Serialize};

/// The format version this crate writes and reads. Any other value in a
/// file's header unlinks the file rather than attempting to interpret it
/// (spec.md §4.3's "silent upgrade" failure mode).
pub const CURRENT_VERSION: u8 = 1;

/// Fixed 64-byte header at offset 0 of a cache file, named after spec.md
/// §6's `dovecot.index.cache` field list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheHeader {
    pub version: u8,
    pub compat_sizeof_uoff_t: u8,
    pub indexid: u32,
    pub file_seq: u32,
    pub continued_record_count: u32,
    pub hole_offset: u32,
    pub used_file_size: u32,
    pub deleted_space: u32,
    pub field_header_offset: u32,
    pub record_count: u32,
}

impl CacheHeader {
    pub const ENCODED_LEN: usize = 64;

    pub fn new(indexid: u32, file_seq: u32) -> Self {
        CacheHeader {
            version: CURRENT_VERSION,
            compat_sizeof_uoff_t: std::mem::size_of::<u64>() as u8,
            indexid,
            file_seq,
            continued_record_count: 0,
            hole_offset: 0,
            used_file_size: CacheHeader::ENCODED_LEN as u32,
            deleted_space: 0,
            field_header_offset: 0,
            record_count: 0,
        }
    }

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[0] = self.version;
        buf[1] = self.compat_sizeof_uoff_t;
        buf[4..8].copy_from_slice(&self.indexid.to_le_bytes());
        buf[8..12].copy_from_slice(&self.file_seq.to_le_bytes());
        buf[12..16].copy_from_slice(&self.continued_record_count.to_le_bytes());
        buf[16..20].copy_from_slice(&self.hole_offset.to_le_bytes());
        buf[20..24].copy_from_slice(&self.used_file_size.to_le_bytes());
        buf[24..28].copy_from_slice(&self.deleted_space.to_le_bytes());
        buf[28..32].copy_from_slice(&self.field_header_offset.to_le_bytes());
        buf[32..36].copy_from_slice(&self.record_count.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::ENCODED_LEN {
            return None;
        }
        Some(CacheHeader {
            version: buf[0],
            compat_sizeof_uoff_t: buf[1],
            indexid: u32::from_le_bytes(buf[4..8].try_into().ok()?),
            file_seq: u32::from_le_bytes(buf[8..12].try_into().ok()?),
            continued_record_count: u32::from_le_bytes(buf[12..16].try_into().ok()?),
            hole_offset: u32::from_le_bytes(buf[16..20].try_into().ok()?),
            used_file_size: u32::from_le_bytes(buf[20..24].try_into().ok()?),
            deleted_space: u32::from_le_bytes(buf[24..28].try_into().ok()?),
            field_header_offset: u32::from_le_bytes(buf[28..32].try_into().ok()?),
            record_count: u32::from_le_bytes(buf[32..36].try_into().ok()?),
        })
    }

    /// Whether this header is compatible with the code reading it: wrong
    /// version or a pointer-size mismatch means "unlink and start over",
    /// never "try to interpret anyway".
    pub fn is_compatible(&self) -> bool {
        self.version == CURRENT_VERSION
            && self.compat_sizeof_uoff_t == std::mem::size_of::<u64>() as u8
    }
}

/// A named, typed field as declared in a field-header block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDecl {
    pub file_field_index: u32,
    pub name: String,
    pub fixed_size: Option<u16>,
}

/// One field-header block: a set of field declarations plus the offset of
/// the next block in the chain (0 if this is the newest).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FieldHeaderBlock {
    pub fields: Vec<FieldDecl>,
    pub next_offset: u32,
}

/// One variable-length cache record: the data for one field of one
/// message, chained to any earlier record for the same message via
/// `prev_offset`. `prev_offset` is always strictly less than the offset
/// this record itself is stored at — the append-only invariant spec.md
/// §8 requires.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub seq: u32,
    pub field_index: u32,
    pub data: Vec<u8>,
    pub prev_offset: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_bytes() {
        let h = CacheHeader::new(42, 1);
        let encoded = h.encode();
        let decoded = CacheHeader::decode(&encoded).unwrap();
        assert_eq!(h, decoded);
    }

    #[test]
    fn header_rejects_short_buffers() {
        assert!(CacheHeader::decode(&[0u8; 4]).is_none());
    }

    #[test]
    fn fresh_header_is_compatible() {
        assert!(CacheHeader::new(1, 1).is_compatible());
    }
}
