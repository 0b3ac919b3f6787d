//! CodeDirectory header access, team identifier patching and construction
//!
//! The CodeDirectory binds an executable's identity to the hashes of its
//! code pages and special slots (requirements, entitlements, ...). All of
//! its variable-length parts are addressed through byte offsets stored in a
//! fixed, big-endian header:
//!
//! ```text
//! 0x00 magic          0x1c nCodeSlots     0x28 spare2
//! 0x04 length         0x20 codeLimit      0x2c scatterOffset (>= 0x20100)
//! 0x08 version        0x24 hashSize       0x30 teamOffset    (>= 0x20200)
//! 0x0c flags          0x25 hashType       0x34 spare3        (>= 0x20300)
//! 0x10 hashOffset     0x26 platform       0x38 codeLimit64   (>= 0x20300)
//! 0x14 identOffset    0x27 pageSize
//! 0x18 nSpecialSlots
//! ```
//!
//! [`CodeDirectoryHeader`] is the only place byte order is converted; the
//! rest of the crate works on host-order fields.

use super::constants::*;
use super::hashes::digest;
use crate::{Error, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Header size up to and including `spare2`.
const HEADER_SIZE_BASE: usize = 44;
/// Header size with `scatterOffset`.
const HEADER_SIZE_SCATTER: usize = 48;
/// Header size with `teamOffset`.
const HEADER_SIZE_TEAMID: usize = 52;
/// Header size with `spare3` and `codeLimit64`.
const HEADER_SIZE_CODELIMIT64: usize = 64;
/// Exec segment fields written by the builder (execSegBase, execSegLimit, execSegFlags).
const EXEC_SEG_FIELDS_SIZE: usize = 24;

/// Host-order view of a CodeDirectory's fixed header.
///
/// Fields that the header's `version` does not carry parse as zero and are
/// not written back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodeDirectoryHeader {
    pub magic: u32,
    pub length: u32,
    pub version: u32,
    pub flags: u32,
    pub hash_offset: u32,
    pub ident_offset: u32,
    pub n_special_slots: u32,
    pub n_code_slots: u32,
    pub code_limit: u32,
    pub hash_size: u8,
    pub hash_type: u8,
    pub platform: u8,
    /// log2 of the page size; 0 means a single page.
    pub page_size: u8,
    pub spare2: u32,
    pub scatter_offset: u32,
    pub team_offset: u32,
    pub spare3: u32,
    pub code_limit64: u64,
}

impl CodeDirectoryHeader {
    /// Number of header bytes a CodeDirectory of `version` carries.
    pub fn size_for_version(version: u32) -> usize {
        if version >= CODEDIRECTORY_VERSION_CODELIMIT64 {
            HEADER_SIZE_CODELIMIT64
        } else if version >= CODEDIRECTORY_VERSION_TEAMID {
            HEADER_SIZE_TEAMID
        } else if version >= CODEDIRECTORY_VERSION_SCATTER {
            HEADER_SIZE_SCATTER
        } else {
            HEADER_SIZE_BASE
        }
    }

    /// Header size for this header's version.
    pub fn size(&self) -> usize {
        Self::size_for_version(self.version)
    }

    /// Parse the header at the start of `data`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Format`] if the magic is not a CodeDirectory magic or
    /// `data` is shorter than the header its version requires.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE_BASE {
            return Err(Error::Format(format!(
                "CodeDirectory of {} bytes is shorter than its header",
                data.len()
            )));
        }

        let magic = be_u32(data, 0x00);
        if magic != CSMAGIC_CODEDIRECTORY {
            return Err(Error::Format(format!("bad CodeDirectory magic {:#010x}", magic)));
        }

        let version = be_u32(data, 0x08);
        let size = Self::size_for_version(version);
        if data.len() < size {
            return Err(Error::Format(format!(
                "CodeDirectory version {:#x} needs a {}-byte header, blob has {}",
                version,
                size,
                data.len()
            )));
        }

        let mut header = Self {
            magic,
            length: be_u32(data, 0x04),
            version,
            flags: be_u32(data, 0x0c),
            hash_offset: be_u32(data, 0x10),
            ident_offset: be_u32(data, 0x14),
            n_special_slots: be_u32(data, 0x18),
            n_code_slots: be_u32(data, 0x1c),
            code_limit: be_u32(data, 0x20),
            hash_size: data[0x24],
            hash_type: data[0x25],
            platform: data[0x26],
            page_size: data[0x27],
            spare2: be_u32(data, 0x28),
            ..Self::default()
        };

        if size >= HEADER_SIZE_SCATTER {
            header.scatter_offset = be_u32(data, 0x2c);
        }
        if size >= HEADER_SIZE_TEAMID {
            header.team_offset = be_u32(data, 0x30);
        }
        if size >= HEADER_SIZE_CODELIMIT64 {
            header.spare3 = be_u32(data, 0x34);
            header.code_limit64 = u64::from_be_bytes([
                data[0x38], data[0x39], data[0x3a], data[0x3b],
                data[0x3c], data[0x3d], data[0x3e], data[0x3f],
            ]);
        }

        Ok(header)
    }

    /// Serialize the header in big-endian order.
    pub fn to_bytes(&self) -> Vec<u8> {
        let size = self.size();
        let mut buf = Vec::with_capacity(size);

        buf.extend(&self.magic.to_be_bytes());
        buf.extend(&self.length.to_be_bytes());
        buf.extend(&self.version.to_be_bytes());
        buf.extend(&self.flags.to_be_bytes());
        buf.extend(&self.hash_offset.to_be_bytes());
        buf.extend(&self.ident_offset.to_be_bytes());
        buf.extend(&self.n_special_slots.to_be_bytes());
        buf.extend(&self.n_code_slots.to_be_bytes());
        buf.extend(&self.code_limit.to_be_bytes());
        buf.push(self.hash_size);
        buf.push(self.hash_type);
        buf.push(self.platform);
        buf.push(self.page_size);
        buf.extend(&self.spare2.to_be_bytes());
        if size >= HEADER_SIZE_SCATTER {
            buf.extend(&self.scatter_offset.to_be_bytes());
        }
        if size >= HEADER_SIZE_TEAMID {
            buf.extend(&self.team_offset.to_be_bytes());
        }
        if size >= HEADER_SIZE_CODELIMIT64 {
            buf.extend(&self.spare3.to_be_bytes());
            buf.extend(&self.code_limit64.to_be_bytes());
        }

        buf
    }

    /// Write the header over the start of `data`.
    pub fn write_to(&self, data: &mut [u8]) -> Result<()> {
        let bytes = self.to_bytes();
        let target = data.get_mut(..bytes.len()).ok_or_else(|| {
            Error::Integrity("CodeDirectory shorter than its own header".into())
        })?;
        target.copy_from_slice(&bytes);
        Ok(())
    }

    /// The code limit in effect, preferring `codeLimit64` when set.
    pub fn effective_code_limit(&self) -> u64 {
        if self.code_limit64 != 0 {
            self.code_limit64
        } else {
            u64::from(self.code_limit)
        }
    }

    /// Check that every offset lies inside a blob of `blob_len` bytes and
    /// that they appear in the order identifier < team < hashes, with the
    /// scatter vector (if any) before the hashes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Integrity`] describing the first violation.
    pub fn validate_offsets(&self, blob_len: usize) -> Result<()> {
        let header_size = self.size() as u64;
        let blob_len = blob_len as u64;
        let ident = u64::from(self.ident_offset);
        let team = u64::from(self.team_offset);
        let hash = u64::from(self.hash_offset);
        let scatter = u64::from(self.scatter_offset);

        if ident == 0 {
            return Err(Error::Integrity("CodeDirectory has no identifier".into()));
        }
        if ident < header_size || ident >= blob_len {
            return Err(Error::Integrity(format!(
                "identOffset {:#x} outside CodeDirectory body",
                ident
            )));
        }
        if hash < header_size || hash > blob_len {
            return Err(Error::Integrity(format!(
                "hashOffset {:#x} outside CodeDirectory of {} bytes",
                hash, blob_len
            )));
        }
        if team != 0 && (team <= ident || team >= hash) {
            return Err(Error::Integrity(format!(
                "teamOffset {:#x} not between identOffset {:#x} and hashOffset {:#x}",
                team, ident, hash
            )));
        }
        if team == 0 && ident >= hash {
            return Err(Error::Integrity(format!(
                "identOffset {:#x} not before hashOffset {:#x}",
                ident, hash
            )));
        }
        if scatter != 0 && (scatter < header_size || scatter >= hash) {
            return Err(Error::Integrity(format!(
                "scatterOffset {:#x} not before hashOffset {:#x}",
                scatter, hash
            )));
        }
        Ok(())
    }
}

/// Read the NUL-terminated string at `offset`, without its terminator.
///
/// # Errors
///
/// Returns [`Error::Integrity`] if `offset` is outside `data` or no
/// terminator follows it.
pub fn read_cstring(data: &[u8], offset: usize) -> Result<&[u8]> {
    let tail = data
        .get(offset..)
        .ok_or_else(|| Error::Integrity(format!("string offset {:#x} outside blob", offset)))?;
    let end = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::Integrity(format!("unterminated string at {:#x}", offset)))?;
    Ok(&tail[..end])
}

/// Compute the header that results from replacing the team identifier.
///
/// `ident_len`, `old_team_len` and `new_team_len` are byte lengths including
/// the NUL terminator. The new string always lands directly after the
/// identifier. `hashOffset` and `scatterOffset` (when non-zero) move by the
/// exact amount of data removed or inserted in front of them: the old team
/// string is deleted first, then the new one is inserted.
///
/// # Errors
///
/// Returns [`Error::Integrity`] if the identifier offset is zero, an existing
/// team string does not follow the identifier, or a shifted offset no longer
/// fits in 32 bits.
pub fn plan_team_edit(
    header: &CodeDirectoryHeader,
    ident_len: u32,
    old_team_len: Option<u32>,
    new_team_len: u32,
) -> Result<CodeDirectoryHeader> {
    if header.ident_offset == 0 {
        return Err(Error::Integrity("CodeDirectory has no identifier".into()));
    }

    let insert_at = i64::from(header.ident_offset) + i64::from(ident_len);
    let deletion = match old_team_len {
        Some(len) if header.team_offset != 0 => {
            if i64::from(header.team_offset) < insert_at {
                return Err(Error::Integrity(format!(
                    "teamOffset {:#x} overlaps identifier ending at {:#x}",
                    header.team_offset, insert_at
                )));
            }
            Some((i64::from(header.team_offset), i64::from(len)))
        }
        _ => None,
    };

    let relocate = |offset: u32| -> Result<u32> {
        if offset == 0 {
            return Ok(0);
        }
        let mut value = i64::from(offset);
        if let Some((at, len)) = deletion {
            if value > at {
                value -= len;
            }
        }
        if value >= insert_at {
            value += i64::from(new_team_len);
        }
        u32::try_from(value)
            .map_err(|_| Error::Integrity(format!("offset {:#x} cannot be relocated", offset)))
    };

    let mut patched = *header;
    patched.hash_offset = relocate(header.hash_offset)?;
    patched.scatter_offset = relocate(header.scatter_offset)?;
    patched.team_offset = u32::try_from(insert_at)
        .map_err(|_| Error::Integrity("team identifier offset overflows".into()))?;

    Ok(patched)
}

/// Replace (or add) the team identifier of the CodeDirectory in `blob`.
///
/// The existing team string, if any, is removed; `team_id` is inserted
/// directly after the executable identifier; dependent offsets and the
/// blob's `length` field are renormalized and the header written back.
///
/// Returns the updated header.
///
/// # Errors
///
/// - [`Error::Format`] if `blob` is not a CodeDirectory
/// - [`Error::Config`] if `team_id` is empty or contains NUL
/// - [`Error::Integrity`] if the CodeDirectory has no identifier, predates
///   team identifiers, or its strings are out of bounds/unterminated
pub fn set_team_identifier(blob: &mut Vec<u8>, team_id: &str) -> Result<CodeDirectoryHeader> {
    if team_id.is_empty() || team_id.contains('\0') {
        return Err(Error::Config(format!("invalid team identifier {:?}", team_id)));
    }

    let header = CodeDirectoryHeader::parse(blob)?;
    if header.version < CODEDIRECTORY_VERSION_TEAMID {
        return Err(Error::Integrity(format!(
            "CodeDirectory version {:#x} cannot carry a team identifier",
            header.version
        )));
    }
    if header.ident_offset == 0 {
        return Err(Error::Integrity("CodeDirectory has no identifier".into()));
    }

    let ident_len = read_cstring(blob, header.ident_offset as usize)?.len() as u32 + 1;

    let old_team_len = if header.team_offset != 0 {
        let old = read_cstring(blob, header.team_offset as usize)?;
        tracing::debug!(team = %String::from_utf8_lossy(old), "removing existing team identifier");
        Some(old.len() as u32 + 1)
    } else {
        None
    };

    let mut new_team = team_id.as_bytes().to_vec();
    new_team.push(0);

    let mut patched = plan_team_edit(&header, ident_len, old_team_len, new_team.len() as u32)?;

    if let Some(len) = old_team_len {
        let start = header.team_offset as usize;
        blob.drain(start..start + len as usize);
    }
    let insert_at = patched.team_offset as usize;
    blob.splice(insert_at..insert_at, new_team);

    patched.length = u32::try_from(blob.len())
        .map_err(|_| Error::Integrity("CodeDirectory too large".into()))?;
    patched.write_to(blob)?;

    tracing::debug!(
        team_offset = patched.team_offset,
        hash_offset = patched.hash_offset,
        scatter_offset = patched.scatter_offset,
        "team identifier set"
    );

    Ok(patched)
}

/// Builder for creating CodeDirectory blobs.
///
/// Produces version 0x20400 CodeDirectories: header, exec segment fields,
/// identifier, optional team identifier, special slots and code page
/// hashes. Used for reference identities and test fixtures.
///
/// # Example
///
/// ```ignore
/// let cd = CodeDirectoryBuilder::new("com.example.app", code)
///     .team_id("TEAMID1234")
///     .special_slot_hash(CSSLOT_SPECIAL_ENTITLEMENTS, ent_hash)
///     .build(CS_HASHTYPE_SHA256)?;
/// ```
pub struct CodeDirectoryBuilder {
    /// Bundle identifier (e.g., "com.example.app")
    identifier: String,
    /// Team identifier (None for adhoc signing)
    team_id: Option<String>,
    /// Code bytes to hash (executable content)
    code: Vec<u8>,
    /// Special slot hashes keyed by positive slot number (1 = Info.plist)
    special_slots: BTreeMap<u32, Vec<u8>>,
    /// Executable segment limit (__TEXT segment size)
    exec_seg_limit: u64,
    /// Executable segment flags
    exec_seg_flags: u64,
}

impl CodeDirectoryBuilder {
    /// Create a new CodeDirectory builder over `code`.
    pub fn new(identifier: impl Into<String>, code: Vec<u8>) -> Self {
        Self {
            identifier: identifier.into(),
            team_id: None,
            code,
            special_slots: BTreeMap::new(),
            exec_seg_limit: 0,
            exec_seg_flags: 0,
        }
    }

    /// Set the team identifier.
    pub fn team_id(mut self, team_id: impl Into<String>) -> Self {
        self.team_id = Some(team_id.into());
        self
    }

    /// Set the hash stored in special slot `slot` (a negative index such as
    /// [`CSSLOT_SPECIAL_ENTITLEMENTS`]).
    pub fn special_slot_hash(mut self, slot: i32, hash: Vec<u8>) -> Self {
        self.special_slots.insert(slot.unsigned_abs(), hash);
        self
    }

    /// Set the executable segment limit.
    pub fn exec_seg_limit(mut self, limit: u64) -> Self {
        self.exec_seg_limit = limit;
        self
    }

    /// Set the raw executable segment flags.
    pub fn exec_seg_flags(mut self, flags: u64) -> Self {
        self.exec_seg_flags = flags;
        self
    }

    /// Build the CodeDirectory with `hash_type` digests.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Integrity`] for an unsupported hash type.
    pub fn build(&self, hash_type: u8) -> Result<Vec<u8>> {
        let hash_size = digest(hash_type, &[])?.len();

        let code_limit = self.code.len() as u32;
        let n_code_slots = self.code.len().div_ceil(PAGE_SIZE) as u32;
        let n_special_slots = self.special_slots.keys().next_back().copied().unwrap_or(0);

        let ident_offset = (HEADER_SIZE_CODELIMIT64 + EXEC_SEG_FIELDS_SIZE) as u32;
        let ident_len = self.identifier.len() as u32 + 1;
        let team_len = self.team_id.as_ref().map(|t| t.len() as u32 + 1).unwrap_or(0);
        let team_offset = if self.team_id.is_some() {
            ident_offset + ident_len
        } else {
            0
        };

        let hash_offset =
            ident_offset + ident_len + team_len + n_special_slots * hash_size as u32;
        let total_len = hash_offset + n_code_slots * hash_size as u32;

        let header = CodeDirectoryHeader {
            magic: CSMAGIC_CODEDIRECTORY,
            length: total_len,
            version: CODEDIRECTORY_VERSION,
            flags: 0,
            hash_offset,
            ident_offset,
            n_special_slots,
            n_code_slots,
            code_limit,
            hash_size: hash_size as u8,
            hash_type,
            platform: 0,
            page_size: PAGE_SIZE_LOG2,
            spare2: 0,
            scatter_offset: 0,
            team_offset,
            spare3: 0,
            code_limit64: 0,
        };

        let mut buf = Vec::with_capacity(total_len as usize);
        buf.extend(header.to_bytes());
        buf.extend(&0u64.to_be_bytes()); // execSegBase
        buf.extend(&self.exec_seg_limit.to_be_bytes());
        buf.extend(&self.exec_seg_flags.to_be_bytes());

        buf.extend(self.identifier.as_bytes());
        buf.push(0);

        if let Some(ref team) = self.team_id {
            buf.extend(team.as_bytes());
            buf.push(0);
        }

        // Special slots are stored from -n up to -1.
        let empty = vec![0u8; hash_size];
        for slot in (1..=n_special_slots).rev() {
            let hash = self.special_slots.get(&slot).unwrap_or(&empty);
            if hash.len() != hash_size {
                return Err(Error::Integrity(format!(
                    "special slot -{} hash is {} bytes, expected {}",
                    slot,
                    hash.len(),
                    hash_size
                )));
            }
            buf.extend(hash);
        }

        let page_size = 1usize << PAGE_SIZE_LOG2;
        for page in self.code.chunks(page_size) {
            buf.extend(digest(hash_type, page)?);
        }

        debug_assert_eq!(buf.len(), total_len as usize);
        Ok(buf)
    }
}

/// Compute the CDHash (hash of the CodeDirectory blob) using SHA-256.
pub fn compute_cdhash_sha256(code_directory: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(code_directory);
    hasher.finalize().into()
}

fn be_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_with(ident: u32, team: u32, hash: u32, scatter: u32) -> CodeDirectoryHeader {
        CodeDirectoryHeader {
            magic: CSMAGIC_CODEDIRECTORY,
            version: CODEDIRECTORY_VERSION,
            ident_offset: ident,
            team_offset: team,
            hash_offset: hash,
            scatter_offset: scatter,
            ..CodeDirectoryHeader::default()
        }
    }

    #[test]
    fn test_plan_replaces_existing_team() {
        // Identifier at 8 (12 bytes with NUL), 8-byte team at 20, hashes at 40.
        let header = header_with(8, 20, 40, 0);
        let patched = plan_team_edit(&header, 12, Some(8), 12).unwrap();

        assert_eq!(patched.team_offset, 20);
        assert_eq!(patched.hash_offset, 40 + (12 - 8));
        assert_eq!(patched.scatter_offset, 0);
        assert_eq!(patched.ident_offset, 8);
    }

    #[test]
    fn test_plan_without_prior_team() {
        let header = header_with(8, 0, 40, 0);
        let patched = plan_team_edit(&header, 12, None, 11).unwrap();

        assert_eq!(patched.team_offset, 8 + 12);
        assert_eq!(patched.hash_offset, 40 + 11);
    }

    #[test]
    fn test_plan_leaves_leading_scatter_alone() {
        // Scatter vector sits before the identifier; nothing is inserted in front of it.
        let header = header_with(100, 0, 200, 64);
        let patched = plan_team_edit(&header, 10, None, 11).unwrap();

        assert_eq!(patched.scatter_offset, 64);
        assert_eq!(patched.hash_offset, 211);
    }

    #[test]
    fn test_plan_shifts_scatter_after_team() {
        let header = header_with(100, 110, 300, 150);
        let patched = plan_team_edit(&header, 10, Some(11), 5).unwrap();

        assert_eq!(patched.team_offset, 110);
        assert_eq!(patched.scatter_offset, 144);
        assert_eq!(patched.hash_offset, 294);
    }

    #[test]
    fn test_plan_successive_edits_compose() {
        let header = header_with(8, 0, 40, 0);
        let first = plan_team_edit(&header, 12, None, 11).unwrap();
        let second = plan_team_edit(&first, 12, Some(11), 4).unwrap();

        assert_eq!(second.team_offset, 20);
        assert_eq!(second.hash_offset, 40 + 4);
    }

    #[test]
    fn test_plan_zero_ident_rejected() {
        let header = header_with(0, 0, 40, 0);
        assert!(matches!(
            plan_team_edit(&header, 1, None, 5),
            Err(Error::Integrity(_))
        ));
    }

    #[test]
    fn test_plan_team_inside_identifier_rejected() {
        let header = header_with(8, 12, 40, 0);
        assert!(matches!(
            plan_team_edit(&header, 12, Some(4), 5),
            Err(Error::Integrity(_))
        ));
    }

    #[test]
    fn test_header_round_trip() {
        let cd = CodeDirectoryBuilder::new("com.example.app", vec![0u8; 8192])
            .team_id("TEAM123456")
            .build(CS_HASHTYPE_SHA256)
            .unwrap();

        let header = CodeDirectoryHeader::parse(&cd).unwrap();
        assert_eq!(header.to_bytes(), cd[..header.size()].to_vec());
        assert_eq!(header.length as usize, cd.len());
        assert_eq!(header.n_code_slots, 2);
        assert_eq!(header.hash_size as usize, CS_SHA256_LEN);
        assert_eq!(header.page_size, PAGE_SIZE_LOG2);
    }

    #[test]
    fn test_header_version_sizes() {
        assert_eq!(CodeDirectoryHeader::size_for_version(0x20001), 44);
        assert_eq!(CodeDirectoryHeader::size_for_version(0x20100), 48);
        assert_eq!(CodeDirectoryHeader::size_for_version(0x20200), 52);
        assert_eq!(CodeDirectoryHeader::size_for_version(0x20400), 64);
    }

    #[test]
    fn test_header_parse_rejects_bad_magic() {
        let mut cd = CodeDirectoryBuilder::new("x", vec![0u8; 16])
            .build(CS_HASHTYPE_SHA1)
            .unwrap();
        cd[0] = 0;
        assert!(matches!(CodeDirectoryHeader::parse(&cd), Err(Error::Format(_))));
    }

    #[test]
    fn test_header_parse_rejects_short_blob() {
        let cd = CodeDirectoryBuilder::new("x", vec![0u8; 16])
            .build(CS_HASHTYPE_SHA1)
            .unwrap();
        assert!(matches!(CodeDirectoryHeader::parse(&cd[..50]), Err(Error::Format(_))));
    }

    #[test]
    fn test_set_team_identifier_replaces_existing() {
        let mut cd = CodeDirectoryBuilder::new("com.example.app", vec![0xab; 4096])
            .team_id("OLDTEAM")
            .special_slot_hash(CSSLOT_SPECIAL_REQUIREMENTS, vec![0x11; 32])
            .build(CS_HASHTYPE_SHA256)
            .unwrap();
        let before = CodeDirectoryHeader::parse(&cd).unwrap();
        let hashes_before = cd[before.hash_offset as usize - 64..].to_vec();

        let after = set_team_identifier(&mut cd, "T8ALTGMVXN").unwrap();

        assert_eq!(after.team_offset, before.team_offset);
        assert_eq!(after.hash_offset, before.hash_offset + 3);
        assert_eq!(read_cstring(&cd, after.team_offset as usize).unwrap(), b"T8ALTGMVXN");
        assert_eq!(read_cstring(&cd, after.ident_offset as usize).unwrap(), b"com.example.app");
        assert_eq!(cd[after.hash_offset as usize - 64..].to_vec(), hashes_before);
        assert_eq!(after.length as usize, cd.len());
        assert_eq!(CodeDirectoryHeader::parse(&cd).unwrap(), after);
        after.validate_offsets(cd.len()).unwrap();
    }

    #[test]
    fn test_set_team_identifier_adds_missing() {
        let mut cd = CodeDirectoryBuilder::new("com.example.app", vec![0xab; 4096])
            .build(CS_HASHTYPE_SHA1)
            .unwrap();
        let before = CodeDirectoryHeader::parse(&cd).unwrap();
        assert_eq!(before.team_offset, 0);

        let after = set_team_identifier(&mut cd, "TEAM").unwrap();

        let ident_len = "com.example.app".len() as u32 + 1;
        assert_eq!(after.team_offset, before.ident_offset + ident_len);
        assert_eq!(after.hash_offset, before.hash_offset + 5);
        assert_eq!(cd.len(), before.length as usize + 5);
    }

    #[test]
    fn test_set_team_identifier_is_repeatable() {
        let mut cd = CodeDirectoryBuilder::new("id", vec![1u8; 100])
            .team_id("FIRST")
            .build(CS_HASHTYPE_SHA256)
            .unwrap();

        set_team_identifier(&mut cd, "SECOND_TEAM").unwrap();
        let once = cd.clone();
        set_team_identifier(&mut cd, "SECOND_TEAM").unwrap();

        assert_eq!(cd, once);
    }

    #[test]
    fn test_set_team_identifier_rejects_nul() {
        let mut cd = CodeDirectoryBuilder::new("id", vec![]).build(CS_HASHTYPE_SHA256).unwrap();
        assert!(matches!(set_team_identifier(&mut cd, "A\0B"), Err(Error::Config(_))));
        assert!(matches!(set_team_identifier(&mut cd, ""), Err(Error::Config(_))));
    }

    #[test]
    fn test_set_team_identifier_zero_ident() {
        let mut cd = CodeDirectoryBuilder::new("id", vec![]).build(CS_HASHTYPE_SHA256).unwrap();
        cd[0x14..0x18].copy_from_slice(&0u32.to_be_bytes());
        assert!(matches!(set_team_identifier(&mut cd, "TEAM"), Err(Error::Integrity(_))));
    }

    #[test]
    fn test_set_team_identifier_old_version() {
        let mut cd = CodeDirectoryBuilder::new("id", vec![]).build(CS_HASHTYPE_SHA256).unwrap();
        cd[0x08..0x0c].copy_from_slice(&CODEDIRECTORY_VERSION_SCATTER.to_be_bytes());
        assert!(matches!(set_team_identifier(&mut cd, "TEAM"), Err(Error::Integrity(_))));
    }

    #[test]
    fn test_validate_offsets() {
        let cd = CodeDirectoryBuilder::new("id", vec![0u8; 4096])
            .team_id("TEAM")
            .build(CS_HASHTYPE_SHA256)
            .unwrap();
        let header = CodeDirectoryHeader::parse(&cd).unwrap();
        header.validate_offsets(cd.len()).unwrap();

        let mut swapped = header;
        swapped.team_offset = header.hash_offset + 1;
        assert!(matches!(swapped.validate_offsets(cd.len()), Err(Error::Integrity(_))));

        let mut beyond = header;
        beyond.hash_offset = cd.len() as u32 + 1;
        assert!(matches!(beyond.validate_offsets(cd.len()), Err(Error::Integrity(_))));
    }

    #[test]
    fn test_read_cstring_unterminated() {
        assert!(matches!(read_cstring(b"abc", 0), Err(Error::Integrity(_))));
        assert!(matches!(read_cstring(b"abc\0", 9), Err(Error::Integrity(_))));
        assert_eq!(read_cstring(b"ab\0cd\0", 3).unwrap(), b"cd");
    }

    #[test]
    fn test_builder_special_slots() {
        let cd = CodeDirectoryBuilder::new("test", vec![0u8; 4096])
            .special_slot_hash(CSSLOT_SPECIAL_ENTITLEMENTS, vec![0x55; 32])
            .build(CS_HASHTYPE_SHA256)
            .unwrap();
        let header = CodeDirectoryHeader::parse(&cd).unwrap();

        assert_eq!(header.n_special_slots, 5);
        let slot5 = header.hash_offset as usize - 5 * 32;
        assert_eq!(&cd[slot5..slot5 + 32], &[0x55; 32]);
    }

    #[test]
    fn test_builder_empty_code() {
        let cd = CodeDirectoryBuilder::new("test", vec![]).build(CS_HASHTYPE_SHA256).unwrap();
        let header = CodeDirectoryHeader::parse(&cd).unwrap();
        assert_eq!(header.n_code_slots, 0);
        assert_eq!(header.code_limit, 0);
        assert_eq!(header.hash_offset as usize, cd.len());
    }

    #[test]
    fn test_cdhash_computation() {
        let cd = CodeDirectoryBuilder::new("test", vec![0u8; 4096])
            .build(CS_HASHTYPE_SHA256)
            .unwrap();
        assert_eq!(compute_cdhash_sha256(&cd), compute_cdhash_sha256(&cd));
        assert_eq!(
            compute_cdhash_sha256(&cd).to_vec(),
            digest(CS_HASHTYPE_SHA256, &cd).unwrap()
        );

        let short = hex::encode(&compute_cdhash_sha256(&cd)[..20]);
        assert_eq!(short.len(), 40);
        assert!(short.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(hex::decode(&short).unwrap(), compute_cdhash_sha256(&cd)[..20].to_vec());
    }
}
