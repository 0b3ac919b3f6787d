//! Mach-O file parsing using goblin: slice selection and signature lookup

use crate::codesign::constants::*;
use crate::{Error, Result};
use goblin::mach::load_command::CommandVariant;
use goblin::mach::{Mach, MachO};
use std::fmt;
use std::str::FromStr;

/// Architecture to pick from a FAT/universal container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ArchPreference {
    #[default]
    Arm64,
    Arm64e,
    X86_64,
}

impl ArchPreference {
    fn matches(self, cputype: u32, cpusubtype: u32) -> bool {
        let subtype = cpusubtype & CPU_SUBTYPE_MASK;
        match self {
            Self::Arm64 => cputype == CPU_TYPE_ARM64 && subtype != CPU_SUBTYPE_ARM64E,
            Self::Arm64e => cputype == CPU_TYPE_ARM64 && subtype == CPU_SUBTYPE_ARM64E,
            Self::X86_64 => cputype == CPU_TYPE_X86_64,
        }
    }
}

impl fmt::Display for ArchPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Arm64 => "arm64",
            Self::Arm64e => "arm64e",
            Self::X86_64 => "x86_64",
        })
    }
}

impl FromStr for ArchPreference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "arm64" => Ok(Self::Arm64),
            "arm64e" => Ok(Self::Arm64e),
            "x86_64" => Ok(Self::X86_64),
            other => Err(Error::Config(format!("unknown architecture {:?}", other))),
        }
    }
}

/// Return the bytes of a single-architecture Mach-O.
///
/// Thin inputs are returned unchanged. For FAT inputs the first slice
/// matching `preference` is returned, falling back to the first slice.
pub fn extract_preferred_slice(data: &[u8], preference: ArchPreference) -> Result<Vec<u8>> {
    let mach = Mach::parse(data).map_err(|e| Error::MachO(format!("Failed to parse: {}", e)))?;

    let fat = match mach {
        Mach::Binary(_) => return Ok(data.to_vec()),
        Mach::Fat(fat) => fat,
    };

    let arches = fat
        .iter_arches()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::MachO(format!("Failed to read FAT arches: {}", e)))?;

    let (index, arch) = match arches
        .iter()
        .enumerate()
        .find(|(_, a)| preference.matches(a.cputype as u32, a.cpusubtype as u32))
    {
        Some(found) => found,
        None => {
            let first = arches
                .first()
                .ok_or_else(|| Error::MachO("Empty FAT binary".into()))?;
            tracing::warn!(%preference, "no matching slice, using first slice");
            (0, first)
        }
    };

    let start = arch.offset as usize;
    let end = start
        .checked_add(arch.size as usize)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| {
            Error::MachO(format!(
                "slice {} ({:#x}+{:#x}) extends past end of file",
                index, arch.offset, arch.size
            ))
        })?;

    tracing::debug!(index, offset = start, size = end - start, "selected FAT slice");
    Ok(data[start..end].to_vec())
}

/// Location of the LC_CODE_SIGNATURE load command and the data it references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeSignatureLocation {
    /// File offset of the load command itself
    pub command_offset: usize,
    /// File offset of the signature SuperBlob
    pub dataoff: u32,
    /// Size reserved for the signature
    pub datasize: u32,
}

/// The __LINKEDIT segment command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkeditSegment {
    /// File offset of the segment command
    pub command_offset: usize,
    pub fileoff: u64,
    pub filesize: u64,
    pub vmsize: u64,
}

/// A parsed single-architecture, signed Mach-O
pub struct MachOFile {
    /// Raw file data
    data: Vec<u8>,
    /// Is 64-bit
    is_64: bool,
    /// Load commands are big-endian
    big_endian: bool,
    code_signature: CodeSignatureLocation,
    linkedit: Option<LinkeditSegment>,
}

impl MachOFile {
    /// Parse a thin Mach-O that carries a code signature.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MachO`] for FAT inputs (select a slice first), for
    /// binaries without LC_CODE_SIGNATURE, and when the signature extends past
    /// the end of the file.
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        let (is_64, big_endian, code_signature, linkedit) = {
            let macho = match Mach::parse(&data)
                .map_err(|e| Error::MachO(format!("Failed to parse: {}", e)))?
            {
                Mach::Binary(macho) => macho,
                Mach::Fat(_) => {
                    return Err(Error::MachO("FAT binary; select a slice first".into()))
                }
            };
            let (code_signature, linkedit) = Self::scan_load_commands(&macho)?;
            (macho.is_64, !macho.little_endian, code_signature, linkedit)
        };

        let end = code_signature.dataoff as u64 + code_signature.datasize as u64;
        if end > data.len() as u64 {
            return Err(Error::MachO(format!(
                "code signature {:#x}+{:#x} extends past end of file ({:#x})",
                code_signature.dataoff,
                code_signature.datasize,
                data.len()
            )));
        }

        Ok(Self {
            data,
            is_64,
            big_endian,
            code_signature,
            linkedit,
        })
    }

    fn scan_load_commands(
        macho: &MachO,
    ) -> Result<(CodeSignatureLocation, Option<LinkeditSegment>)> {
        let mut code_signature = None;
        let mut linkedit = None;

        for lc in &macho.load_commands {
            match &lc.command {
                CommandVariant::CodeSignature(cs) => {
                    code_signature = Some(CodeSignatureLocation {
                        command_offset: lc.offset,
                        dataoff: cs.dataoff,
                        datasize: cs.datasize,
                    });
                }
                CommandVariant::Segment64(seg) if seg.segname.starts_with(b"__LINKEDIT") => {
                    linkedit = Some(LinkeditSegment {
                        command_offset: lc.offset,
                        fileoff: seg.fileoff,
                        filesize: seg.filesize,
                        vmsize: seg.vmsize,
                    });
                }
                CommandVariant::Segment32(seg) if seg.segname.starts_with(b"__LINKEDIT") => {
                    linkedit = Some(LinkeditSegment {
                        command_offset: lc.offset,
                        fileoff: u64::from(seg.fileoff),
                        filesize: u64::from(seg.filesize),
                        vmsize: u64::from(seg.vmsize),
                    });
                }
                _ => {}
            }
        }

        let code_signature = code_signature
            .ok_or_else(|| Error::MachO("binary has no LC_CODE_SIGNATURE".into()))?;
        Ok((code_signature, linkedit))
    }

    /// Take ownership of the raw data
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn is_64(&self) -> bool {
        self.is_64
    }

    pub fn is_big_endian(&self) -> bool {
        self.big_endian
    }

    pub fn code_signature(&self) -> CodeSignatureLocation {
        self.code_signature
    }

    pub fn linkedit(&self) -> Option<LinkeditSegment> {
        self.linkedit
    }

    /// The embedded signature bytes referenced by LC_CODE_SIGNATURE
    pub fn signature_bytes(&self) -> &[u8] {
        let start = self.code_signature.dataoff as usize;
        &self.data[start..start + self.code_signature.datasize as usize]
    }
}
