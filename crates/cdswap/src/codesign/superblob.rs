//! SuperBlob codec for Apple code signatures
//!
//! The SuperBlob is the top-level container for all code signature components.
//! It contains a header followed by an index of blob entries, each pointing
//! to embedded blobs (CodeDirectory, requirements, entitlements, CMS signature, etc.)
//!
//! ## Structure
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ SuperBlob Header (12 bytes)        │
//! │  - magic: 0xfade0cc0 (4 bytes)     │
//! │  - length: total size (4 bytes)    │
//! │  - count: number of blobs (4 bytes)│
//! ├────────────────────────────────────┤
//! │ Index Entry 0 (8 bytes)            │
//! │  - slot_type (4 bytes)             │
//! │  - offset (4 bytes)                │
//! ├────────────────────────────────────┤
//! │ ... more index entries             │
//! ├────────────────────────────────────┤
//! │ Blob 0 data                        │
//! ├────────────────────────────────────┤
//! │ ... more blob data                 │
//! └────────────────────────────────────┘
//! ```
//!
//! Decoding yields a [`SuperBlob`]: an ordered sequence of [`BlobRecord`]s.
//! The index table is not kept; [`SuperBlob::encode`] derives it from the
//! current record order every time.

use super::constants::*;
use crate::{Error, Result};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Size of the SuperBlob header in bytes (magic + length + count)
pub const SUPERBLOB_HEADER_SIZE: usize = 12;

/// Size of each index entry in bytes (slot_type + offset)
pub const INDEX_ENTRY_SIZE: usize = 8;

/// Typed SuperBlob slot identifier.
///
/// Only the slots this crate reasons about get their own variant; every
/// other slot id round-trips through [`SlotType::Other`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SlotType {
    /// Primary CodeDirectory (0x0000).
    CodeDirectory,
    /// Requirements (0x0002).
    Requirements,
    /// XML entitlements (0x0005).
    Entitlements,
    /// DER entitlements (0x0007).
    DerEntitlements,
    /// First alternate CodeDirectory (0x1000).
    AlternateCodeDirectories,
    /// CMS signature wrapper (0x10000).
    Signature,
    /// Any other slot.
    Other(u32),
}

impl From<u32> for SlotType {
    fn from(v: u32) -> Self {
        match v {
            CSSLOT_CODEDIRECTORY => Self::CodeDirectory,
            CSSLOT_REQUIREMENTS => Self::Requirements,
            CSSLOT_ENTITLEMENTS => Self::Entitlements,
            CSSLOT_DER_ENTITLEMENTS => Self::DerEntitlements,
            CSSLOT_ALTERNATE_CODEDIRECTORIES => Self::AlternateCodeDirectories,
            CSSLOT_SIGNATURESLOT => Self::Signature,
            _ => Self::Other(v),
        }
    }
}

impl From<SlotType> for u32 {
    fn from(slot: SlotType) -> u32 {
        match slot {
            SlotType::CodeDirectory => CSSLOT_CODEDIRECTORY,
            SlotType::Requirements => CSSLOT_REQUIREMENTS,
            SlotType::Entitlements => CSSLOT_ENTITLEMENTS,
            SlotType::DerEntitlements => CSSLOT_DER_ENTITLEMENTS,
            SlotType::AlternateCodeDirectories => CSSLOT_ALTERNATE_CODEDIRECTORIES,
            SlotType::Signature => CSSLOT_SIGNATURESLOT,
            SlotType::Other(v) => v,
        }
    }
}

impl fmt::Display for SlotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CodeDirectory => f.write_str("CodeDirectory"),
            Self::Requirements => f.write_str("Requirements"),
            Self::Entitlements => f.write_str("Entitlements"),
            Self::DerEntitlements => f.write_str("DER Entitlements"),
            Self::AlternateCodeDirectories => f.write_str("Alternate CodeDirectory"),
            Self::Signature => f.write_str("Signature"),
            Self::Other(v) => write!(f, "slot {:#x}", v),
        }
    }
}

/// One decoded blob: its slot and its raw bytes (including the blob's own
/// magic/length header).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRecord {
    /// The slot this blob occupies in the index.
    pub slot: SlotType,
    /// The raw blob data.
    pub content: Vec<u8>,
}

impl BlobRecord {
    /// Create a new blob record.
    pub fn new(slot: SlotType, content: Vec<u8>) -> Self {
        Self { slot, content }
    }

    /// The blob's own magic, if the content is long enough to carry one.
    pub fn magic(&self) -> Option<u32> {
        read_be_u32(&self.content, 0)
    }
}

/// A decoded SuperBlob: an insertion-ordered sequence of blob records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuperBlob {
    pub(crate) records: Vec<BlobRecord>,
}

impl SuperBlob {
    /// Create a SuperBlob from records, keeping their order.
    pub fn from_records(records: Vec<BlobRecord>) -> Self {
        Self { records }
    }

    /// Decode a serialized SuperBlob.
    ///
    /// `bytes` may extend past the blob (a code signature region is usually
    /// padded); the header's `length` bounds what is read. Each record spans
    /// from its index offset to the next entry's offset, or to `length` for
    /// the last entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Format`] if the magic is wrong, the header or index
    /// does not fit, or any index offset falls outside the blob.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let magic = read_be_u32(bytes, 0)
            .ok_or_else(|| Error::Format("truncated SuperBlob header".into()))?;
        if magic != CSMAGIC_EMBEDDED_SIGNATURE {
            return Err(Error::Format(format!("bad SuperBlob magic {:#010x}", magic)));
        }

        let length = read_be_u32(bytes, 4)
            .ok_or_else(|| Error::Format("truncated SuperBlob header".into()))?
            as usize;
        let count = read_be_u32(bytes, 8)
            .ok_or_else(|| Error::Format("truncated SuperBlob header".into()))?
            as usize;

        if length < SUPERBLOB_HEADER_SIZE || length > bytes.len() {
            return Err(Error::Format(format!(
                "SuperBlob length {} outside buffer of {} bytes",
                length,
                bytes.len()
            )));
        }
        let bytes = &bytes[..length];

        // Validate the index extent before allocating anything sized by `count`.
        let index_end = count
            .checked_mul(INDEX_ENTRY_SIZE)
            .and_then(|n| n.checked_add(SUPERBLOB_HEADER_SIZE))
            .filter(|&end| end <= length)
            .ok_or_else(|| {
                Error::Format(format!("index of {} entries exceeds SuperBlob length", count))
            })?;

        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let at = SUPERBLOB_HEADER_SIZE + i * INDEX_ENTRY_SIZE;
            let slot = read_be_u32(bytes, at).unwrap_or_default();
            let offset = read_be_u32(bytes, at + 4).unwrap_or_default() as usize;
            if offset < index_end || offset > length {
                return Err(Error::Format(format!(
                    "index entry {} ({}) has offset {:#x} outside blob data",
                    i,
                    SlotType::from(slot),
                    offset
                )));
            }
            entries.push((SlotType::from(slot), offset));
        }

        let mut records = Vec::with_capacity(count);
        for (i, &(slot, start)) in entries.iter().enumerate() {
            let end = entries.get(i + 1).map(|&(_, next)| next).unwrap_or(length);
            if end < start {
                return Err(Error::Format(format!(
                    "index entry {} ({}) overlaps the following entry",
                    i, slot
                )));
            }
            records.push(BlobRecord::new(slot, bytes[start..end].to_vec()));
        }

        Ok(Self { records })
    }

    /// Size of the serialized form of the current sequence.
    pub fn encoded_len(&self) -> usize {
        SUPERBLOB_HEADER_SIZE
            + self.records.len() * INDEX_ENTRY_SIZE
            + self.records.iter().map(|r| r.content.len()).sum::<usize>()
    }

    /// Serialize the sequence in its current order.
    ///
    /// Index offsets are recomputed from cumulative sizes and the header
    /// `length` always equals the returned buffer's size.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Format`] if the result would not fit the 32-bit
    /// length field.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let total_length = self.encoded_len();
        let total = u32::try_from(total_length)
            .map_err(|_| Error::Format(format!("SuperBlob of {} bytes is too large", total_length)))?;

        let mut buf = Vec::with_capacity(total_length);

        // Header (big-endian)
        buf.extend(&CSMAGIC_EMBEDDED_SIGNATURE.to_be_bytes());
        buf.extend(&total.to_be_bytes());
        buf.extend(&(self.records.len() as u32).to_be_bytes());

        // Index entries
        let mut offset = SUPERBLOB_HEADER_SIZE + self.records.len() * INDEX_ENTRY_SIZE;
        for record in &self.records {
            buf.extend(&u32::from(record.slot).to_be_bytes());
            buf.extend(&(offset as u32).to_be_bytes());
            offset += record.content.len();
        }

        // Blob data
        for record in &self.records {
            buf.extend(&record.content);
        }

        debug_assert_eq!(buf.len(), total_length);
        Ok(buf)
    }

    /// Rewrite every record's generic blob `length` field to its content size.
    ///
    /// Records too short to carry a blob header are left alone.
    pub fn fixup_lengths(&mut self) {
        for record in &mut self.records {
            if record.content.len() >= GENERIC_BLOB_HEADER_SIZE {
                let len = record.content.len() as u32;
                record.content[4..8].copy_from_slice(&len.to_be_bytes());
            }
        }
    }

    /// The records in their current order.
    pub fn records(&self) -> &[BlobRecord] {
        &self.records
    }

    /// Slot ids in their current order.
    pub fn slots(&self) -> Vec<SlotType> {
        self.records.iter().map(|r| r.slot).collect()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the sequence is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Wrap a payload in a generic blob header (magic + total length).
pub fn wrap_blob(magic: u32, payload: &[u8]) -> Vec<u8> {
    let total_len = (GENERIC_BLOB_HEADER_SIZE + payload.len()) as u32;
    let mut buf = Vec::with_capacity(total_len as usize);

    buf.extend(&magic.to_be_bytes());
    buf.extend(&total_len.to_be_bytes());
    buf.extend(payload);

    buf
}

/// Build an entitlements blob from XML plist data.
pub fn build_entitlements_blob(plist_data: &[u8]) -> Vec<u8> {
    wrap_blob(CSMAGIC_EMBEDDED_ENTITLEMENTS, plist_data)
}

/// Build a DER entitlements blob.
pub fn build_der_entitlements_blob(der_data: &[u8]) -> Vec<u8> {
    wrap_blob(CSMAGIC_EMBEDDED_DER_ENTITLEMENTS, der_data)
}

/// Build a minimal empty requirements blob (12 bytes, count = 0).
pub fn build_requirements_blob() -> Vec<u8> {
    wrap_blob(CSMAGIC_REQUIREMENTS, &0u32.to_be_bytes())
}

/// Build a CMS signature wrapper blob.
pub fn build_signature_blob(cms_data: &[u8]) -> Vec<u8> {
    wrap_blob(CSMAGIC_BLOBWRAPPER, cms_data)
}

/// Build a zero-filled signature wrapper occupying exactly `total_size` bytes.
///
/// Used as the placeholder that reserves room for the real CMS signature.
pub fn build_placeholder_signature_blob(total_size: usize) -> Vec<u8> {
    let payload = vec![0u8; total_size.saturating_sub(GENERIC_BLOB_HEADER_SIZE)];
    build_signature_blob(&payload)
}

/// Write every record's content to `<dir>/<slot>_<magic>.bin` (both in hex).
///
/// Returns the written paths in record order.
pub fn extract_blobs(superblob: &SuperBlob, dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;

    let mut written = Vec::with_capacity(superblob.len());
    for record in superblob.records() {
        let path = dir.join(format!(
            "{:x}_{:x}.bin",
            u32::from(record.slot),
            record.magic().unwrap_or(0)
        ));
        fs::write(&path, &record.content)?;
        tracing::debug!(path = %path.display(), size = record.content.len(), "extracted blob");
        written.push(path);
    }
    Ok(written)
}

/// Read a big-endian u32 at `offset`, or `None` if it does not fit.
pub(crate) fn read_be_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
