//! On-disk layout of the TNPUBIN graph container.
//!
//! A compiled graph arrives either as a TNPUBIN file (text magic, flat
//! section table) or as an ELF64-LE object carrying the same payloads as
//! named sections. Both containers are little-endian throughout.
//!
//! TNPUBIN top header (40 bytes):
//!
//! ```text
//! 0   magic[8]       "TNPUBIN\0"
//! 8   device         packed arch/version/config/revision
//! 12  version        graph format version in bits [31:24]
//! 16  build_version
//! 20  header_size    40 + 12 * section_cnt
//! 24  file_size
//! 28  type
//! 32  flag           asid[3:0], ASID_EN[4], REMAP_EN[8], SRAM_EN[12]
//! 36  section_cnt
//! ```
//!
//! followed by `section_cnt` table entries `{kind, offset, size}`.

use crate::error::{GraphError, Result};

/// Text magic opening a TNPUBIN container.
pub const MAGIC: [u8; 8] = *b"TNPUBIN\0";

/// ELF identification prefix.
pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

/// Identification probe length read before choosing a container path.
pub const IDENT_LEN: usize = 16;

/// TNPUBIN top header length.
pub const HEADER_LEN: usize = 40;

/// Length of one section-table entry.
pub const SECTION_ENTRY_LEN: usize = 12;

/// ELF note section carrying the 20-byte top header
/// `{device, version, build_version, type, flag}`.
pub const ELF_HEADER_NOTE: &str = ".note.tnpu.header";

/// Parsed top header, container-independent.
#[derive(Debug, Clone, Copy)]
pub struct BinHeader {
    /// Packed target device word.
    pub device: u32,
    /// Graph format version word.
    pub version: u32,
    /// Compiler build version.
    pub build_version: u32,
    /// Header size in bytes (TNPUBIN only; 0 for ELF).
    pub header_size: u32,
    /// Total file size recorded by the compiler.
    pub file_size: u32,
    /// Graph type.
    pub bin_type: u32,
    /// Feature flag word.
    pub flag: u32,
    /// Number of section-table entries (TNPUBIN only).
    pub section_cnt: u32,
}

impl BinHeader {
    /// Parse a TNPUBIN top header. The caller has already matched the magic.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(GraphError::invalid("file shorter than top header"));
        }
        let u = |off: usize| u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]]);
        let header = Self {
            device: u(8),
            version: u(12),
            build_version: u(16),
            header_size: u(20),
            file_size: u(24),
            bin_type: u(28),
            flag: u(32),
            section_cnt: u(36),
        };
        let table_end = HEADER_LEN as u64 + u64::from(header.section_cnt) * SECTION_ENTRY_LEN as u64;
        if u64::from(header.header_size) < table_end {
            return Err(GraphError::invalid("header size does not cover section table"));
        }
        Ok(header)
    }
}

/// Section kinds in the TNPUBIN table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    /// Executable text.
    Text,
    /// Read-only literal pool, relocated per job.
    Rodata,
    /// Descriptor region.
    Dcr,
    /// Weight payload (one per BSS, in BSS order).
    Weight,
    /// BSS descriptor tables.
    Bss,
    /// Address remap entries.
    Remap,
    /// GM window configuration note.
    GmConfig,
    /// SegMMU configuration note.
    SegMmu,
    /// Model global-parameter note.
    GlobalParam,
    /// Subgraph table.
    Subgraph,
}

impl SectionKind {
    /// Decode a table entry kind.
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::Text),
            2 => Some(Self::Rodata),
            3 => Some(Self::Dcr),
            4 => Some(Self::Weight),
            5 => Some(Self::Bss),
            6 => Some(Self::Remap),
            7 => Some(Self::GmConfig),
            8 => Some(Self::SegMmu),
            9 => Some(Self::GlobalParam),
            10 => Some(Self::Subgraph),
            _ => None,
        }
    }

    /// Table code of this kind.
    pub fn code(self) -> u32 {
        match self {
            Self::Text => 1,
            Self::Rodata => 2,
            Self::Dcr => 3,
            Self::Weight => 4,
            Self::Bss => 5,
            Self::Remap => 6,
            Self::GmConfig => 7,
            Self::SegMmu => 8,
            Self::GlobalParam => 9,
            Self::Subgraph => 10,
        }
    }

    /// The ELF section name carrying the same payload.
    pub fn elf_name(self) -> &'static str {
        match self {
            Self::Text => ".text",
            Self::Rodata => ".rodata",
            Self::Dcr => ".dcr",
            Self::Weight => ".weight",
            Self::Bss => ".bss",
            Self::Remap => ".remap",
            Self::GmConfig => ".note.tnpu.gmconfig",
            Self::SegMmu => ".note.tnpu.segmmu",
            Self::GlobalParam => ".note.tnpu.globalparam",
            Self::Subgraph => ".subgraph",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_codes_roundtrip() {
        for code in 1..=10 {
            let kind = SectionKind::from_u32(code).unwrap();
            assert_eq!(kind.code(), code);
        }
        assert!(SectionKind::from_u32(0).is_none());
        assert!(SectionKind::from_u32(11).is_none());
    }

    #[test]
    fn header_too_short() {
        assert!(BinHeader::parse(&[0u8; 16]).is_err());
    }

    #[test]
    fn header_fields() {
        let mut buf = vec![0u8; HEADER_LEN];
        buf[..8].copy_from_slice(&MAGIC);
        buf[8..12].copy_from_slice(&0x0412_3400u32.to_le_bytes());
        buf[20..24].copy_from_slice(&40u32.to_le_bytes());
        buf[36..40].copy_from_slice(&0u32.to_le_bytes());
        let h = BinHeader::parse(&buf).unwrap();
        assert_eq!(h.device, 0x0412_3400);
        assert_eq!(h.section_cnt, 0);
    }
}
