//! Container readers: TNPUBIN section table and ELF64-LE sections.
//!
//! The reader's only job is to turn the file image into typed byte views
//! for each named section. All structural interpretation happens in the
//! BSS / subgraph / note parsers.

use crate::error::{GraphError, Result};
use crate::format::{
    BinHeader, SectionKind, ELF_HEADER_NOTE, ELF_MAGIC, HEADER_LEN, IDENT_LEN, MAGIC,
    SECTION_ENTRY_LEN,
};
use bytes::Bytes;
use tern_chip::arch::{graph_version, GRAPH_ELF_V0, GRAPH_V0005};

/// Typed views over the named sections of a graph binary.
#[derive(Debug, Default)]
pub struct RawSections {
    /// `.text`
    pub text: Option<Bytes>,
    /// `.rodata`
    pub rodata: Option<Bytes>,
    /// `.dcr`
    pub dcr: Option<Bytes>,
    /// `.weight<n>`, in BSS order.
    pub weights: Vec<Bytes>,
    /// `.bss`
    pub bss: Option<Bytes>,
    /// `.remap`
    pub remap: Option<Bytes>,
    /// `.note.tnpu.gmconfig`
    pub gmconfig: Option<Bytes>,
    /// `.note.tnpu.segmmu`
    pub segmmu: Option<Bytes>,
    /// `.note.tnpu.globalparam`
    pub globalparam: Option<Bytes>,
    /// `.subgraph`
    pub subgraph: Option<Bytes>,
}

/// Probe the identification bytes and report the container's graph
/// version without committing to a full parse.
pub fn identify(data: &[u8]) -> Result<u32> {
    if data.len() < IDENT_LEN {
        return Err(GraphError::UnknownBinary);
    }
    if data[..8] == MAGIC {
        return Ok(GRAPH_V0005);
    }
    if data[..4] == ELF_MAGIC {
        return Ok(GRAPH_ELF_V0);
    }
    Err(GraphError::UnknownBinary)
}

fn slice_checked(data: &Bytes, offset: u64, size: u64, what: &str) -> Result<Bytes> {
    let end = offset
        .checked_add(size)
        .ok_or_else(|| GraphError::invalid(format!("{what}: offset overflow")))?;
    if end > data.len() as u64 {
        return Err(GraphError::invalid(format!(
            "{what}: [{offset:#x}, {end:#x}) exceeds file size {:#x}",
            data.len()
        )));
    }
    Ok(data.slice(offset as usize..end as usize))
}

/// Read a TNPUBIN container: top header plus section table.
pub fn read_tnpubin(data: &Bytes) -> Result<(BinHeader, RawSections)> {
    let header = BinHeader::parse(data)?;
    if graph_version(header.version) != GRAPH_V0005 {
        return Err(GraphError::UnsupportedVersion {
            version: graph_version(header.version),
        });
    }
    if u64::from(header.file_size) > data.len() as u64 {
        return Err(GraphError::invalid("declared file size exceeds image"));
    }

    let mut sections = RawSections::default();
    for i in 0..header.section_cnt as usize {
        let base = HEADER_LEN + i * SECTION_ENTRY_LEN;
        if base + SECTION_ENTRY_LEN > data.len() {
            return Err(GraphError::invalid("section table truncated"));
        }
        let u = |off: usize| {
            u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
        };
        let kind_raw = u(base);
        let offset = u64::from(u(base + 4));
        let size = u64::from(u(base + 8));
        let Some(kind) = SectionKind::from_u32(kind_raw) else {
            tracing::warn!("ignoring unknown section kind {kind_raw}");
            continue;
        };
        let view = slice_checked(data, offset, size, kind.elf_name())?;
        match kind {
            SectionKind::Text => sections.text = Some(view),
            SectionKind::Rodata => sections.rodata = Some(view),
            SectionKind::Dcr => sections.dcr = Some(view),
            SectionKind::Weight => sections.weights.push(view),
            SectionKind::Bss => sections.bss = Some(view),
            SectionKind::Remap => sections.remap = Some(view),
            SectionKind::GmConfig => sections.gmconfig = Some(view),
            SectionKind::SegMmu => sections.segmmu = Some(view),
            SectionKind::GlobalParam => sections.globalparam = Some(view),
            SectionKind::Subgraph => sections.subgraph = Some(view),
        }
    }
    Ok((header, sections))
}

/// Read an ELF64-LE object: walk the section headers and extract the
/// named sections, including the header note.
pub fn read_elf(data: &Bytes) -> Result<(BinHeader, RawSections)> {
    if data.len() < 64 {
        return Err(GraphError::invalid("ELF header truncated"));
    }
    // EI_CLASS = ELFCLASS64, EI_DATA = ELFDATA2LSB
    if data[4] != 2 || data[5] != 1 {
        return Err(GraphError::invalid("only ELF64 little-endian is supported"));
    }
    let u16_at = |off: usize| u16::from_le_bytes([data[off], data[off + 1]]);
    let u64_at = |off: usize| {
        let mut b = [0u8; 8];
        b.copy_from_slice(&data[off..off + 8]);
        u64::from_le_bytes(b)
    };

    let shoff = u64_at(40);
    let shentsize = u16_at(58) as u64;
    let shnum = u16_at(60) as u64;
    let shstrndx = u16_at(62) as u64;
    if shentsize < 64 || shstrndx >= shnum {
        return Err(GraphError::invalid("bad ELF section header table"));
    }

    let shdr = |idx: u64| -> Result<(u32, u64, u64)> {
        let base = shoff + idx * shentsize;
        if base + 64 > data.len() as u64 {
            return Err(GraphError::invalid("ELF section header out of range"));
        }
        let base = base as usize;
        let name = u32::from_le_bytes([data[base], data[base + 1], data[base + 2], data[base + 3]]);
        Ok((name, u64_at(base + 24), u64_at(base + 32)))
    };

    let (_, strtab_off, strtab_size) = shdr(shstrndx)?;
    let strtab = slice_checked(data, strtab_off, strtab_size, ".shstrtab")?;
    let name_at = |off: u32| -> &str {
        let off = off as usize;
        if off >= strtab.len() {
            return "";
        }
        let end = strtab[off..]
            .iter()
            .position(|&b| b == 0)
            .map_or(strtab.len(), |p| off + p);
        std::str::from_utf8(&strtab[off..end]).unwrap_or("")
    };

    let mut sections = RawSections::default();
    let mut header_note: Option<Bytes> = None;
    let mut weights: Vec<(u32, Bytes)> = Vec::new();

    for idx in 0..shnum {
        let (name_off, offset, size) = shdr(idx)?;
        let name = name_at(name_off);
        if name.is_empty() {
            continue;
        }
        let view = || slice_checked(data, offset, size, name);
        if let Some(rest) = name.strip_prefix(".weight") {
            let ord: u32 = rest.parse().unwrap_or(0);
            weights.push((ord, view()?));
            continue;
        }
        match name {
            ".text" => sections.text = Some(view()?),
            ".rodata" => sections.rodata = Some(view()?),
            ".dcr" => sections.dcr = Some(view()?),
            ".bss" => sections.bss = Some(view()?),
            ".remap" => sections.remap = Some(view()?),
            ".note.tnpu.gmconfig" => sections.gmconfig = Some(view()?),
            ".note.tnpu.segmmu" => sections.segmmu = Some(view()?),
            ".note.tnpu.globalparam" => sections.globalparam = Some(view()?),
            ".subgraph" => sections.subgraph = Some(view()?),
            ELF_HEADER_NOTE => header_note = Some(view()?),
            _ => {}
        }
    }

    weights.sort_by_key(|(ord, _)| *ord);
    sections.weights = weights.into_iter().map(|(_, v)| v).collect();

    let note = header_note
        .ok_or_else(|| GraphError::invalid(format!("missing {ELF_HEADER_NOTE} section")))?;
    if note.len() < 20 {
        return Err(GraphError::invalid("header note truncated"));
    }
    let u = |off: usize| u32::from_le_bytes([note[off], note[off + 1], note[off + 2], note[off + 3]]);
    let header = BinHeader {
        device: u(0),
        version: u(4),
        build_version: u(8),
        header_size: 0,
        file_size: data.len() as u32,
        bin_type: u(12),
        flag: u(16),
        section_cnt: 0,
    };
    if graph_version(header.version) != GRAPH_ELF_V0 {
        return Err(GraphError::UnsupportedVersion {
            version: graph_version(header.version),
        });
    }
    Ok((header, sections))
}
