//! Page and special-slot hash recomputation for CodeDirectories

use super::code_directory::CodeDirectoryHeader;
use super::constants::*;
use crate::{Error, Result};
use sha1::{Digest, Sha1};
use sha2::{Sha256, Sha384};

/// Digest `data` with the CodeDirectory hash algorithm `hash_type`.
///
/// SHA-256 truncated (type 3) yields the first 20 bytes of SHA-256.
///
/// # Errors
///
/// Returns [`Error::Integrity`] for an unknown hash type.
pub fn digest(hash_type: u8, data: &[u8]) -> Result<Vec<u8>> {
    match hash_type {
        CS_HASHTYPE_SHA1 => Ok(Sha1::digest(data).to_vec()),
        CS_HASHTYPE_SHA256 => Ok(Sha256::digest(data).to_vec()),
        CS_HASHTYPE_SHA256_TRUNCATED => Ok(Sha256::digest(data)[..CS_SHA1_LEN].to_vec()),
        CS_HASHTYPE_SHA384 => Ok(Sha384::digest(data).to_vec()),
        other => Err(Error::Integrity(format!("unsupported hash type {}", other))),
    }
}

/// Recompute every code page hash of the CodeDirectory in `cd` over `code`.
///
/// `code` is the container image; the first `codeLimit` bytes are hashed in
/// pages of `1 << pageSize` bytes (one page when `pageSize` is 0), the last
/// page possibly short. Digests are written in place starting at
/// `hashOffset`.
///
/// # Errors
///
/// Returns [`Error::Integrity`] if the header offsets are out of order, the
/// digest size disagrees with `hashSize`, the page count disagrees with
/// `nCodeSlots`, the table runs past the blob, or `code` is shorter than
/// `codeLimit`.
pub fn recompute_code_hashes(code: &[u8], cd: &mut [u8]) -> Result<CodeDirectoryHeader> {
    let header = CodeDirectoryHeader::parse(cd)?;
    header.validate_offsets(cd.len())?;

    let hash_size = usize::from(header.hash_size);
    let algorithm_size = digest(header.hash_type, &[])?.len();
    if algorithm_size != hash_size {
        return Err(Error::Integrity(format!(
            "hashSize {} does not match hash type {} ({} bytes)",
            hash_size, header.hash_type, algorithm_size
        )));
    }

    let code_limit = usize::try_from(header.effective_code_limit())
        .map_err(|_| Error::Integrity("codeLimit does not fit in memory".into()))?;
    if code.len() < code_limit {
        return Err(Error::Integrity(format!(
            "codeLimit {:#x} exceeds container size {:#x}",
            code_limit,
            code.len()
        )));
    }

    let page_size = match header.page_size {
        0 => code_limit.max(1),
        shift if shift < 32 => 1usize << shift,
        shift => {
            return Err(Error::Integrity(format!("page size 2^{} unsupported", shift)));
        }
    };
    let pages = code_limit.div_ceil(page_size);
    if pages != header.n_code_slots as usize {
        return Err(Error::Integrity(format!(
            "codeLimit {:#x} spans {} pages but nCodeSlots is {}",
            code_limit, pages, header.n_code_slots
        )));
    }

    let start = header.hash_offset as usize;
    let end = start + pages * hash_size;
    let table = cd.get_mut(start..end).ok_or_else(|| {
        Error::Integrity(format!("hash table {:#x}..{:#x} runs past CodeDirectory", start, end))
    })?;

    for (slot, page) in table
        .chunks_exact_mut(hash_size)
        .zip(code[..code_limit].chunks(page_size))
    {
        slot.copy_from_slice(&digest(header.hash_type, page)?);
    }

    tracing::debug!(pages, page_size, code_limit, "recomputed code page hashes");
    Ok(header)
}

/// Refresh special slot hashes from the blobs they cover.
///
/// `blobs` pairs a special slot index (e.g. [`CSSLOT_SPECIAL_ENTITLEMENTS`])
/// with the full bytes of the blob it hashes. A slot is only rewritten when
/// the CodeDirectory reserves it and its current hash is non-zero. Returns
/// the number of slots rewritten.
pub fn refresh_special_slots(cd: &mut [u8], blobs: &[(i32, &[u8])]) -> Result<usize> {
    let header = CodeDirectoryHeader::parse(cd)?;
    header.validate_offsets(cd.len())?;
    let hash_size = usize::from(header.hash_size);

    let mut refreshed = 0;
    for &(slot, blob) in blobs {
        let index = slot.unsigned_abs();
        if slot >= 0 || index > header.n_special_slots {
            continue;
        }

        let start = (header.hash_offset as usize)
            .checked_sub(index as usize * hash_size)
            .ok_or_else(|| {
                Error::Integrity(format!("special slot {} precedes CodeDirectory", slot))
            })?;
        let current = &mut cd[start..start + hash_size];
        if current.iter().all(|&b| b == 0) {
            continue;
        }

        let hash = digest(header.hash_type, blob)?;
        if hash.len() != hash_size {
            return Err(Error::Integrity(format!(
                "hashSize {} does not match hash type {}",
                hash_size, header.hash_type
            )));
        }
        current.copy_from_slice(&hash);
        refreshed += 1;
    }

    Ok(refreshed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codesign::code_directory::CodeDirectoryBuilder;

    fn page_hashes(cd: &[u8]) -> Vec<u8> {
        let header = CodeDirectoryHeader::parse(cd).unwrap();
        cd[header.hash_offset as usize..].to_vec()
    }

    #[test]
    fn test_digest_lengths() {
        assert_eq!(digest(CS_HASHTYPE_SHA1, b"x").unwrap().len(), CS_SHA1_LEN);
        assert_eq!(digest(CS_HASHTYPE_SHA256, b"x").unwrap().len(), CS_SHA256_LEN);
        assert_eq!(digest(CS_HASHTYPE_SHA256_TRUNCATED, b"x").unwrap().len(), CS_SHA1_LEN);
        assert_eq!(digest(CS_HASHTYPE_SHA384, b"x").unwrap().len(), CS_SHA384_LEN);
        assert!(matches!(digest(9, b"x"), Err(Error::Integrity(_))));
    }

    #[test]
    fn test_truncated_is_sha256_prefix() {
        let full = digest(CS_HASHTYPE_SHA256, b"page").unwrap();
        let truncated = digest(CS_HASHTYPE_SHA256_TRUNCATED, b"page").unwrap();
        assert_eq!(&full[..20], truncated.as_slice());
    }

    #[test]
    fn test_recompute_matches_builder() {
        let code: Vec<u8> = (0..10000u32).map(|i| i as u8).collect();
        let expected = CodeDirectoryBuilder::new("id", code.clone())
            .build(CS_HASHTYPE_SHA256)
            .unwrap();

        let mut cd = expected.clone();
        let header = CodeDirectoryHeader::parse(&cd).unwrap();
        let start = header.hash_offset as usize;
        cd[start..].fill(0);

        recompute_code_hashes(&code, &mut cd).unwrap();
        assert_eq!(cd, expected);
    }

    #[test]
    fn test_recompute_is_stable() {
        let code = vec![0x5a; 8192];
        let mut cd = CodeDirectoryBuilder::new("id", code.clone())
            .build(CS_HASHTYPE_SHA1)
            .unwrap();

        recompute_code_hashes(&code, &mut cd).unwrap();
        let first = page_hashes(&cd);
        recompute_code_hashes(&code, &mut cd).unwrap();
        assert_eq!(page_hashes(&cd), first);
    }

    #[test]
    fn test_recompute_ignores_bytes_past_code_limit() {
        let code = vec![1u8; 4096];
        let mut cd = CodeDirectoryBuilder::new("id", code.clone())
            .build(CS_HASHTYPE_SHA256)
            .unwrap();
        let expected = cd.clone();

        let mut longer = code.clone();
        longer.extend([0xff; 512]);
        recompute_code_hashes(&longer, &mut cd).unwrap();
        assert_eq!(cd, expected);
    }

    #[test]
    fn test_recompute_short_code() {
        let mut cd = CodeDirectoryBuilder::new("id", vec![0u8; 4096])
            .build(CS_HASHTYPE_SHA256)
            .unwrap();
        assert!(matches!(
            recompute_code_hashes(&[0u8; 100], &mut cd),
            Err(Error::Integrity(_))
        ));
    }

    #[test]
    fn test_recompute_slot_count_mismatch() {
        let code = vec![0u8; 8192];
        let mut cd = CodeDirectoryBuilder::new("id", code.clone())
            .build(CS_HASHTYPE_SHA256)
            .unwrap();
        // Claim one slot while codeLimit still spans two pages.
        cd[0x1c..0x20].copy_from_slice(&1u32.to_be_bytes());
        assert!(matches!(recompute_code_hashes(&code, &mut cd), Err(Error::Integrity(_))));
    }

    #[test]
    fn test_recompute_hash_size_mismatch() {
        let code = vec![0u8; 4096];
        let mut cd = CodeDirectoryBuilder::new("id", code.clone())
            .build(CS_HASHTYPE_SHA256)
            .unwrap();
        cd[0x24] = CS_SHA1_LEN as u8;
        assert!(matches!(recompute_code_hashes(&code, &mut cd), Err(Error::Integrity(_))));
    }

    #[test]
    fn test_recompute_single_page_mode() {
        let code = vec![7u8; 6000];
        let mut cd = CodeDirectoryBuilder::new("id", code[..4096].to_vec())
            .build(CS_HASHTYPE_SHA256)
            .unwrap();
        // One page covering 6000 bytes.
        cd[0x20..0x24].copy_from_slice(&6000u32.to_be_bytes());
        cd[0x27] = 0;

        let header = recompute_code_hashes(&code, &mut cd).unwrap();
        let start = header.hash_offset as usize;
        assert_eq!(&cd[start..start + 32], digest(CS_HASHTYPE_SHA256, &code).unwrap().as_slice());
    }

    #[test]
    fn test_refresh_special_slots() {
        let entitlements = b"<plist/>".to_vec();
        let mut cd = CodeDirectoryBuilder::new("id", vec![0u8; 4096])
            .special_slot_hash(CSSLOT_SPECIAL_ENTITLEMENTS, vec![0xee; 32])
            .build(CS_HASHTYPE_SHA256)
            .unwrap();

        let refreshed = refresh_special_slots(
            &mut cd,
            &[
                (CSSLOT_SPECIAL_ENTITLEMENTS, entitlements.as_slice()),
                (CSSLOT_SPECIAL_REQUIREMENTS, &b"req"[..]),
                (CSSLOT_SPECIAL_DER_ENTITLEMENTS, &b"der"[..]),
            ],
        )
        .unwrap();

        // Requirements slot is zero, DER slot is not reserved.
        assert_eq!(refreshed, 1);
        let header = CodeDirectoryHeader::parse(&cd).unwrap();
        let start = header.hash_offset as usize - 5 * 32;
        assert_eq!(
            &cd[start..start + 32],
            digest(CS_HASHTYPE_SHA256, &entitlements).unwrap().as_slice()
        );
        let req = header.hash_offset as usize - 2 * 32;
        assert!(cd[req..req + 32].iter().all(|&b| b == 0));
    }
}
