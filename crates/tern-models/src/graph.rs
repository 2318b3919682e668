//! The normalized in-memory graph.
//!
//! `Graph::parse` drives the container reader and the section parsers,
//! then owns every byte view for the life of the graph. Jobs hold the
//! graph behind an `Arc`; a graph outlives all of its jobs.

use crate::bss::parse_bss_region;
use crate::error::{GraphError, Result};
use crate::notes::{
    parse_globalparam_section, parse_gmconfig_section, parse_remap_section,
    parse_segmmu_section, parse_subgraph_section,
};
use crate::reader::{identify, read_elf, read_tnpubin};
use crate::section::{
    Bss, GmConfig, IoTensors, ModelGlobalParam, ParamReloc, RemapEntry, SectionDesc,
    SegMmuConfig, Subgraph,
};
use bytes::Bytes;
use tern_chip::arch::{
    device_arch, device_config, device_revision, device_version, flag_asid,
    flag_asid_enabled, flag_remap_enabled, flag_sram_enabled, graph_version, GRAPH_ELF_V0,
};

/// A parsed, validated graph binary.
#[derive(Debug)]
pub struct Graph {
    /// Target architecture code.
    pub arch: u32,
    /// Target ISA version.
    pub isa_version: u32,
    /// Target configuration (e.g. 1408).
    pub config: u32,
    /// Target revision.
    pub revision: u32,
    /// Graph format version (V0005 or ELF_V0).
    pub gversion: u32,
    /// Compiler build version word.
    pub build_version: u32,
    /// ASID field from the header flags.
    pub asid_flag: u32,
    /// ASID windows enabled.
    pub asid_enabled: bool,
    /// Rodata remap enabled.
    pub remap_enabled: bool,
    /// SRAM residency requested.
    pub sram_enabled: bool,

    /// `.text` image.
    pub text: Bytes,
    /// `.rodata` template (relocated per job).
    pub rodata: Bytes,
    /// `.dcr` template.
    pub dcr: Bytes,
    /// Weight file payloads, one per BSS.
    pub weights: Vec<Bytes>,

    /// Per-bucket stack and static tables.
    pub bss: Vec<Bss>,
    /// Reuse sections in global index order.
    pub reuse_sections: Vec<SectionDesc>,
    /// The graph's I/O tensor set.
    pub io: IoTensors,
    /// Parameter-relocation map.
    pub param_map: Vec<ParamReloc>,
    /// Subgraphs in chain order.
    pub subgraphs: Vec<Subgraph>,
    /// Remap entries (applied only when `remap_enabled`).
    pub remaps: Vec<RemapEntry>,
    /// GM window configuration, when present.
    pub gm_config: Option<GmConfig>,
    /// Number of SegMMU configs declared by the compiler.
    pub segmmu_num: u32,
    /// SegMMU configurations (shared when `segmmu_num == 1`).
    pub segmmu: Vec<SegMmuConfig>,
    /// Global-param note header plus its raw bytes.
    pub global_param: Option<(ModelGlobalParam, Bytes)>,
}

impl Graph {
    /// Parse a graph binary image.
    ///
    /// # Errors
    ///
    /// `UnknownBinary` when neither magic matches, `UnsupportedVersion`
    /// for foreign graph versions, `InvalidBinary` for structural
    /// corruption.
    pub fn parse(data: impl Into<Bytes>) -> Result<Self> {
        let data: Bytes = data.into();
        let container = identify(&data)?;
        tracing::debug!("parsing graph binary ({} bytes)", data.len());

        let (header, sections) = if container == GRAPH_ELF_V0 {
            read_elf(&data)?
        } else {
            read_tnpubin(&data)?
        };

        let text = sections.text.unwrap_or_else(Bytes::new);
        let rodata = sections
            .rodata
            .ok_or_else(|| GraphError::invalid("missing .rodata section"))?;
        let dcr = sections.dcr.unwrap_or_else(Bytes::new);
        let bss_bytes = sections
            .bss
            .ok_or_else(|| GraphError::invalid("missing .bss section"))?;

        let parsed = parse_bss_region(&bss_bytes, &sections.weights)?;

        let subgraphs = match &sections.subgraph {
            Some(sg) => parse_subgraph_section(sg)?,
            None => Vec::new(),
        };
        for sg in &subgraphs {
            if sg.bss_idx as usize >= parsed.bss.len() {
                return Err(GraphError::invalid(format!(
                    "subgraph {} references BSS {} of {}",
                    sg.id,
                    sg.bss_idx,
                    parsed.bss.len()
                )));
            }
        }

        let remaps = match &sections.remap {
            Some(r) => parse_remap_section(r)?,
            None => Vec::new(),
        };
        let gm_config = match &sections.gmconfig {
            Some(g) => Some(parse_gmconfig_section(g)?),
            None => None,
        };
        let (segmmu_num, segmmu) = match &sections.segmmu {
            Some(s) => parse_segmmu_section(s)?,
            None => (0, Vec::new()),
        };
        let global_param = match &sections.globalparam {
            Some(gp) => Some((parse_globalparam_section(gp)?, gp.clone())),
            None => None,
        };

        let graph = Self {
            arch: device_arch(header.device),
            isa_version: device_version(header.device),
            config: device_config(header.device),
            revision: device_revision(header.device),
            gversion: graph_version(header.version),
            build_version: header.build_version,
            asid_flag: flag_asid(header.flag),
            asid_enabled: flag_asid_enabled(header.flag),
            remap_enabled: flag_remap_enabled(header.flag),
            sram_enabled: flag_sram_enabled(header.flag),
            text,
            rodata,
            dcr,
            weights: sections.weights,
            bss: parsed.bss,
            reuse_sections: parsed.reuse_sections,
            io: parsed.io,
            param_map: parsed.param_map,
            subgraphs,
            remaps,
            gm_config,
            segmmu_num,
            segmmu,
            global_param,
        };

        tracing::info!(
            "graph: config {} rev {}, {} subgraph(s), {} reuse section(s), {} reloc(s)",
            graph.config,
            graph.revision,
            graph.subgraphs.len(),
            graph.reuse_sections.len(),
            graph.param_map.len()
        );
        Ok(graph)
    }

    /// Number of subgraphs in the chain.
    pub fn subgraph_cnt(&self) -> u32 {
        self.subgraphs.len() as u32
    }

    /// Number of BSS buckets.
    pub fn bss_cnt(&self) -> u32 {
        self.bss.len() as u32
    }

    /// True when the graph carries dynamic-shape machinery: a global
    /// parameter block plus output-shape tensors.
    pub fn is_dynamic_shape(&self) -> bool {
        self.global_param.is_some() && !self.io.outputs_shape.is_empty()
    }

    /// Whether the GM path is requested by the compiler.
    pub fn gm_requested(&self) -> bool {
        self.gm_config.is_some_and(|c| c.gm_control != 0)
    }
}
