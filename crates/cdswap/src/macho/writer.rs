//! Mach-O layout patching for replaced code signatures.
//!
//! The signature SuperBlob is always the last region of the file, so a new
//! signature never moves code: only LC_CODE_SIGNATURE's recorded size, the
//! __LINKEDIT segment extent and the file length change. This module
//! handles:
//! - Rewriting LC_CODE_SIGNATURE's dataoff/datasize
//! - Growing or shrinking __LINKEDIT to cover the signature
//! - Resizing the file to end at the signature
//! - Writing the final SuperBlob into the reserved region

use super::parser::{CodeSignatureLocation, LinkeditSegment, MachOFile};
use crate::{Error, Result};

/// Alignment applied to __LINKEDIT's vmsize.
const SEGMENT_ALIGNMENT: usize = 0x4000;

/// Overwrites the LC_CODE_SIGNATURE command's offset and size fields.
///
/// ```text
/// u32 cmd       (0)
/// u32 cmdsize   (4)
/// u32 dataoff   (8)
/// u32 datasize  (12)
/// ```
pub fn update_signature_reference(
    data: &mut [u8],
    location: &CodeSignatureLocation,
    new_offset: u32,
    new_size: u32,
    big_endian: bool,
) -> Result<()> {
    let offset = location.command_offset;
    if offset + 16 > data.len() {
        return Err(Error::MachO("LC_CODE_SIGNATURE outside file".into()));
    }

    write_u32(data, offset + 8, new_offset, big_endian);
    write_u32(data, offset + 12, new_size, big_endian);

    tracing::debug!(dataoff = new_offset, datasize = new_size, "updated LC_CODE_SIGNATURE");
    Ok(())
}

/// Updates the __LINKEDIT segment so it ends at `new_end`.
///
/// vmsize only grows, rounded up to the segment alignment.
pub fn update_linkedit_segment(
    data: &mut [u8],
    segment: &LinkeditSegment,
    new_end: u64,
    is_64: bool,
    big_endian: bool,
) -> Result<()> {
    // Segment64 structure:             Segment32 structure:
    // u32 cmd (0)                      u32 cmd (0)
    // u32 cmdsize (4)                  u32 cmdsize (4)
    // char[16] segname (8)             char[16] segname (8)
    // u64 vmaddr (24)                  u32 vmaddr (24)
    // u64 vmsize (32)                  u32 vmsize (28)
    // u64 fileoff (40)                 u32 fileoff (32)
    // u64 filesize (48)                u32 filesize (36)

    let new_filesize = new_end.checked_sub(segment.fileoff).ok_or_else(|| {
        Error::MachO("code signature starts before __LINKEDIT".into())
    })?;
    let aligned = align_to(new_filesize as usize, SEGMENT_ALIGNMENT) as u64;
    let new_vmsize = segment.vmsize.max(aligned);

    let offset = segment.command_offset;
    if is_64 {
        if offset + 56 > data.len() {
            return Err(Error::MachO("__LINKEDIT command outside file".into()));
        }
        write_u64(data, offset + 32, new_vmsize, big_endian);
        write_u64(data, offset + 48, new_filesize, big_endian);
    } else {
        if offset + 40 > data.len() {
            return Err(Error::MachO("__LINKEDIT command outside file".into()));
        }
        let narrow = |v: u64| {
            u32::try_from(v).map_err(|_| Error::MachO("__LINKEDIT exceeds 32-bit range".into()))
        };
        write_u32(data, offset + 28, narrow(new_vmsize)?, big_endian);
        write_u32(data, offset + 36, narrow(new_filesize)?, big_endian);
    }

    tracing::debug!(filesize = new_filesize, vmsize = new_vmsize, "updated __LINKEDIT");
    Ok(())
}

/// Reserves `size` bytes for the signature at its current offset.
///
/// Rewrites the load commands and resizes the file so it ends exactly at
/// the end of the reserved region. The reserved bytes are zeroed.
pub fn reserve_signature_space(macho: MachOFile, size: u32) -> Result<Vec<u8>> {
    let location = macho.code_signature();
    let linkedit = macho.linkedit();
    let is_64 = macho.is_64();
    let big_endian = macho.is_big_endian();
    let mut data = macho.into_data();

    let end = location.dataoff as u64 + size as u64;

    update_signature_reference(&mut data, &location, location.dataoff, size, big_endian)?;
    if let Some(segment) = linkedit {
        update_linkedit_segment(&mut data, &segment, end, is_64, big_endian)?;
    }

    let start = location.dataoff as usize;
    data.truncate(start);
    data.resize(end as usize, 0);

    Ok(data)
}

/// Writes `signature` into the reserved region at `dataoff`, zero padding
/// the remainder.
///
/// # Errors
///
/// Returns [`Error::Signing`] if the signature is larger than the reservation.
pub fn replace_code_signature(
    data: &mut [u8],
    dataoff: u32,
    reserved: u32,
    signature: &[u8],
) -> Result<()> {
    if signature.len() > reserved as usize {
        return Err(Error::Signing(format!(
            "signature of {} bytes exceeds reserved {} bytes",
            signature.len(),
            reserved
        )));
    }

    let start = dataoff as usize;
    let region = data
        .get_mut(start..start + reserved as usize)
        .ok_or_else(|| Error::MachO("reserved signature region outside file".into()))?;

    region[..signature.len()].copy_from_slice(signature);
    region[signature.len()..].fill(0);
    Ok(())
}

/// Aligns a value up to the specified alignment.
pub fn align_to(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Writes a u32 to a byte slice at the given offset.
fn write_u32(data: &mut [u8], offset: usize, value: u32, big_endian: bool) {
    let bytes = if big_endian {
        value.to_be_bytes()
    } else {
        value.to_le_bytes()
    };
    data[offset..offset + 4].copy_from_slice(&bytes);
}

/// Writes a u64 to a byte slice at the given offset.
fn write_u64(data: &mut [u8], offset: usize, value: u64, big_endian: bool) {
    let bytes = if big_endian {
        value.to_be_bytes()
    } else {
        value.to_le_bytes()
    };
    data[offset..offset + 8].copy_from_slice(&bytes);
}
