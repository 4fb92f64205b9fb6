//! Stable identifiers of the data model (spec.md §3).
//!
//! `Uid`/`ModSeq`/`UidValidity` mirror
//! `aero-collections::mail::uidindex`'s newtypes (`ImapUid = NonZeroU32`,
//! `ModSeq = NonZeroU64`) — a message's UID or a mailbox's modseq is never
//! zero, so the niche-optimized `NonZero*` types are both correct and free.

use std::fmt;
use std::num::{NonZeroU32, NonZeroU64};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Unique, monotonic per-mailbox 32-bit identifier of a message.
pub type Uid = NonZeroU32;
/// Per-mailbox integer that changes if UIDs are ever reassigned.
pub type UidValidity = NonZeroU32;
/// 64-bit change counter, per mailbox, advancing on any visible change.
pub type ModSeq = NonZeroU64;
/// 1-based sequence number of a message within a given view.
pub type Seq = NonZeroU32;

/// Content-addressed 128-bit identifier of a message body.
#[derive(Clone, Copy, PartialOrd, Ord, PartialEq, Eq, Hash, Debug)]
pub struct Guid(pub [u8; 16]);

/// Stable digest over a fixed set of message headers, used when no GUID is
/// available (header-hash fallback, spec.md §3/§4.8).
#[derive(Clone, Copy, PartialOrd, Ord, PartialEq, Eq, Hash, Debug)]
pub struct HeaderHash(pub [u8; 16]);

/// Immutable 128-bit identifier of a mailbox.
#[derive(Clone, Copy, PartialOrd, Ord, PartialEq, Eq, Hash, Debug)]
pub struct MailboxGuid(pub [u8; 16]);

macro_rules! hex_id {
    ($ty:ident) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl FromStr for $ty {
            type Err = &'static str;

            fn from_str(s: &str) -> Result<Self, &'static str> {
                let bytes = hex::decode(s).map_err(|_| "invalid hex")?;
                if bytes.len() != 16 {
                    return Err("bad length");
                }
                let mut tmp = [0u8; 16];
                tmp.copy_from_slice(&bytes);
                Ok($ty(tmp))
            }
        }

        impl Serialize for $ty {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D>(d: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let v = String::deserialize(d)?;
                v.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_id!(Guid);
hex_id!(HeaderHash);
hex_id!(MailboxGuid);

/// Content identifier used for the fingerprint map and for GUID-matching
/// during import: a native GUID when the backend supports one, otherwise
/// the header-hash fallback (spec.md §3, §4.8).
#[derive(Clone, Copy, PartialOrd, Ord, PartialEq, Eq, Hash, Debug)]
pub enum ContentId {
    Guid(Guid),
    HeaderHash(HeaderHash),
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentId::Guid(g) => write!(f, "guid:{}", g),
            ContentId::HeaderHash(h) => write!(f, "hdr:{}", h),
        }
    }
}

/// Computes the header-hash fallback used when a backend has no native
/// GUID: a stable digest over a fixed set of selected headers, truncated
/// to 128 bits. Uses `sodiumoxide::crypto::hash`, the same primitive
/// `aero-user/src/storage/in_memory.rs` uses for its own blob etags.
pub fn header_hash(selected_headers: &[u8]) -> HeaderHash {
    let digest = sodiumoxide::crypto::hash::hash(selected_headers);
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest.0[..16]);
    HeaderHash(out)
}

lazy_static::lazy_static! {
    static ref UIDVALIDITY_COUNTER: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);
}

/// Generates a fresh `UidValidity` for a newly created mailbox: the
/// current unix time, a process-wide counter, and a random component
/// folded together so two mailboxes created within the same second on
/// different hosts still don't collide — the same msec+rand shape
/// `Bayou`'s own `Timestamp` uses in `src/bayou.rs`. Grounded on
/// `src/mail/unique_ident.rs`'s `lazy_static` id-generator pattern.
pub fn generate_uid_validity() -> UidValidity {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32;
    let bump = UIDVALIDITY_COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let jitter: u16 = rand::random();
    let candidate = now
        .wrapping_add(bump)
        .wrapping_add(jitter as u32)
        .max(1);
    UidValidity::new(candidate).unwrap_or_else(|| UidValidity::new(1).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guid_roundtrips_through_hex() {
        let g = Guid([0x42; 16]);
        let s = g.to_string();
        let g2: Guid = s.parse().unwrap();
        assert_eq!(g, g2);
    }

    #[test]
    fn guid_rejects_bad_length() {
        assert!("ab".parse::<Guid>().is_err());
    }

    #[test]
    fn header_hash_is_deterministic_and_truncated() {
        let a = header_hash(b"Subject: hi\r\nFrom: a@b\r\n");
        let b = header_hash(b"Subject: hi\r\nFrom: a@b\r\n");
        assert_eq!(a, b);
        assert_eq!(a.0.len(), 16);
    }

    #[test]
    fn header_hash_differs_on_different_input() {
        let a = header_hash(b"Subject: hi\r\n");
        let b = header_hash(b"Subject: bye\r\n");
        assert_ne!(a, b);
    }

    #[test]
    fn generate_uid_validity_is_never_zero_and_advances() {
        let a = generate_uid_validity();
        let b = generate_uid_validity();
        assert!(a.get() > 0);
        assert!(b.get() > 0);
        // the process-wide counter guarantees the two calls don't collide
        // even when the wall clock and jitter happen to line up.
        assert_ne!(a, b);
    }
}
