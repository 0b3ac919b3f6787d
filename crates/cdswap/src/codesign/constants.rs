//! Apple code signing constants and magic numbers
//!
//! These constants define the binary format for Apple code signatures,
//! including SuperBlob structures, CodeDirectory formats, and hash types.

// =============================================================================
// Blob Magic Numbers
// =============================================================================

/// SuperBlob containing all signature components (embedded signature)
pub const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xfade0cc0;

/// CodeDirectory blob magic
pub const CSMAGIC_CODEDIRECTORY: u32 = 0xfade0c02;

/// Requirements blob magic
pub const CSMAGIC_REQUIREMENTS: u32 = 0xfade0c01;

/// Embedded entitlements (XML plist format)
pub const CSMAGIC_EMBEDDED_ENTITLEMENTS: u32 = 0xfade7171;

/// Embedded DER entitlements (ASN.1 DER format)
pub const CSMAGIC_EMBEDDED_DER_ENTITLEMENTS: u32 = 0xfade7172;

/// CMS signature wrapper blob
pub const CSMAGIC_BLOBWRAPPER: u32 = 0xfade0b01;

/// Size of the generic blob header (magic + length)
pub const GENERIC_BLOB_HEADER_SIZE: usize = 8;

// =============================================================================
// Slot Types (for SuperBlob index)
// =============================================================================

/// Main code directory slot
pub const CSSLOT_CODEDIRECTORY: u32 = 0x0000;

/// Code requirements slot
pub const CSSLOT_REQUIREMENTS: u32 = 0x0002;

/// Entitlements slot (XML format)
pub const CSSLOT_ENTITLEMENTS: u32 = 0x0005;

/// DER entitlements slot
pub const CSSLOT_DER_ENTITLEMENTS: u32 = 0x0007;

/// First alternate code directory slot
pub const CSSLOT_ALTERNATE_CODEDIRECTORIES: u32 = 0x1000;

/// CMS signature slot
pub const CSSLOT_SIGNATURESLOT: u32 = 0x10000;

// =============================================================================
// Special Slot Indices (negative, for CodeDirectory)
// =============================================================================

/// Requirements special slot index
pub const CSSLOT_SPECIAL_REQUIREMENTS: i32 = -2;

/// Entitlements special slot index
pub const CSSLOT_SPECIAL_ENTITLEMENTS: i32 = -5;

/// DER entitlements special slot index
pub const CSSLOT_SPECIAL_DER_ENTITLEMENTS: i32 = -7;

// =============================================================================
// Hash Types
// =============================================================================

/// SHA-1 hash (160-bit / 20 bytes)
pub const CS_HASHTYPE_SHA1: u8 = 1;

/// SHA-256 hash (256-bit / 32 bytes)
pub const CS_HASHTYPE_SHA256: u8 = 2;

/// SHA-256 truncated to 20 bytes (legacy compatibility)
pub const CS_HASHTYPE_SHA256_TRUNCATED: u8 = 3;

/// SHA-384 hash (384-bit / 48 bytes)
pub const CS_HASHTYPE_SHA384: u8 = 4;

/// SHA-1 hash size in bytes
pub const CS_SHA1_LEN: usize = 20;

/// SHA-256 hash size in bytes
pub const CS_SHA256_LEN: usize = 32;

/// SHA-384 hash size in bytes
pub const CS_SHA384_LEN: usize = 48;

// =============================================================================
// CodeDirectory Versions
// =============================================================================

/// First version with a scatter vector
pub const CODEDIRECTORY_VERSION_SCATTER: u32 = 0x20100;

/// First version with a team identifier
pub const CODEDIRECTORY_VERSION_TEAMID: u32 = 0x20200;

/// First version with a 64-bit code limit
pub const CODEDIRECTORY_VERSION_CODELIMIT64: u32 = 0x20300;

/// First version with exec segment fields
pub const CODEDIRECTORY_VERSION_EXECSEG: u32 = 0x20400;

/// Version written by [`crate::codesign::CodeDirectoryBuilder`]
pub const CODEDIRECTORY_VERSION: u32 = CODEDIRECTORY_VERSION_EXECSEG;

// =============================================================================
// Page Size
// =============================================================================

/// Code page size used when building CodeDirectories
pub const PAGE_SIZE: usize = 4096;

/// log2 of [`PAGE_SIZE`], as stored in the CodeDirectory header
pub const PAGE_SIZE_LOG2: u8 = 12;

// =============================================================================
// Mach-O
// =============================================================================

/// ARM64 CPU type
pub const CPU_TYPE_ARM64: u32 = 0x0100_000c;

/// x86_64 CPU type
pub const CPU_TYPE_X86_64: u32 = 0x0100_0007;

/// arm64e CPU subtype
pub const CPU_SUBTYPE_ARM64E: u32 = 2;

/// Mask removing capability bits from a CPU subtype
pub const CPU_SUBTYPE_MASK: u32 = 0x00ff_ffff;
