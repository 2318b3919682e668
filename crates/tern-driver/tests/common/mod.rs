#![allow(dead_code)]

//! Synthetic graph binaries for the integration suite.
//!
//! Assembles TNPUBIN images the way the compiler would: top header,
//! section table, then the payloads. Defaults give a runnable graph
//! with one static (weight) section and one input/one output reuse
//! section; tests layer subgraph chains, dynamic-shape notes and
//! SegMMU notes on top.

use std::sync::Once;

pub const MAGIC: [u8; 8] = *b"TNPUBIN\0";
pub const HEADER_LEN: usize = 40;
pub const SECTION_ENTRY_LEN: usize = 12;

pub const SEC_TEXT: u32 = 1;
pub const SEC_RODATA: u32 = 2;
pub const SEC_DCR: u32 = 3;
pub const SEC_WEIGHT: u32 = 4;
pub const SEC_BSS: u32 = 5;
pub const SEC_GMCONFIG: u32 = 7;
pub const SEC_SEGMMU: u32 = 8;
pub const SEC_GLOBALPARAM: u32 = 9;
pub const SEC_SUBGRAPH: u32 = 10;

pub const TY_CONSTANT: u32 = 0;
pub const TY_INPUT: u32 = 2;
pub const TY_OUTPUT: u32 = 3;
pub const TY_SEGMMU: u32 = 9;
pub const TY_OUT_SHAPE: u32 = 10;

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .try_init();
    });
}

/// One sub-section of a static or reuse section.
#[derive(Clone)]
pub struct SubSpec {
    pub ty: u32,
    pub size: u32,
    pub id: u32,
    pub offset: u32,
    pub mask: u32,
    pub ro_offsets: Vec<u32>,
    pub data_type: u32,
}

impl SubSpec {
    pub fn new(ty: u32, size: u32, id: u32, offset: u32, ro: &[u32]) -> Self {
        Self {
            ty,
            size,
            id,
            offset,
            mask: 0xFFFF_F000,
            ro_offsets: ro.to_vec(),
            data_type: 0,
        }
    }

    pub fn with_mask(mut self, mask: u32) -> Self {
        self.mask = mask;
        self
    }

    pub fn with_data_type(mut self, dt: u32) -> Self {
        self.data_type = dt;
        self
    }

    fn emit(&self, out: &mut Vec<u8>) {
        for word in [
            self.ty,
            self.size,
            self.id,
            self.offset,
            self.mask,
            self.ro_offsets.len() as u32,
            1.0f32.to_bits(),
            0,
            self.data_type,
            0,
        ] {
            out.extend_from_slice(&word.to_le_bytes());
        }
        for ro in &self.ro_offsets {
            out.extend_from_slice(&ro.to_le_bytes());
        }
    }
}

#[derive(Clone)]
pub struct SectionSpec {
    pub size: u32,
    pub align_bytes: u32,
    pub subs: Vec<SubSpec>,
}

#[derive(Clone)]
pub struct SubgraphSpec {
    pub precursor_cnt: i32,
    pub precursors: Vec<u32>,
    pub private_data_size: u32,
    pub private_buffers: Vec<(u32, u32)>,
    /// `(offset_in_ro, buf_index, sub_index, offset_in_section, mask)`
    pub private_map: Vec<(u32, u32, u32, u32, u32)>,
    pub printfifo_size: u32,
    pub profiler_buf_size: u32,
    pub warmup_len: u32,
}

impl Default for SubgraphSpec {
    fn default() -> Self {
        Self {
            precursor_cnt: 0,
            precursors: Vec::new(),
            private_data_size: 0x100,
            private_buffers: vec![(0x1000, 4096)],
            private_map: Vec::new(),
            printfifo_size: 0,
            profiler_buf_size: 0,
            warmup_len: 4,
        }
    }
}

pub struct GraphBuilder {
    pub rodata: Vec<u8>,
    pub text: Vec<u8>,
    pub dcr: Vec<u8>,
    pub statics: Vec<(Vec<u8>, SectionSpec)>,
    pub reuses: Vec<SectionSpec>,
    pub subgraphs: Vec<SubgraphSpec>,
    pub stack_size: u32,
    pub global_param: Option<(u32, Vec<u32>)>,
    pub segmmu: Option<Vec<u8>>,
}

impl GraphBuilder {
    /// A runnable baseline: one weight section relocated at rodata
    /// `0x10`, input 0 at `0x20`, output 0 at `0x30`.
    pub fn new() -> Self {
        let mut rodata = vec![0u8; 256];
        for (i, b) in rodata.iter_mut().enumerate() {
            *b = (i & 0xFF) as u8;
        }
        rodata[0x10..0x14].copy_from_slice(&0xEEEE_EEEEu32.to_le_bytes());

        Self {
            rodata,
            text: vec![0x90; 128],
            dcr: Vec::new(),
            statics: vec![(
                vec![0xAB; 32],
                SectionSpec {
                    size: 32,
                    align_bytes: 4096,
                    subs: vec![SubSpec::new(TY_CONSTANT, 32, 0, 0, &[0x10])],
                },
            )],
            reuses: vec![
                SectionSpec {
                    size: 64,
                    align_bytes: 4096,
                    subs: vec![SubSpec::new(TY_INPUT, 64, 0, 0, &[0x20])],
                },
                SectionSpec {
                    size: 64,
                    align_bytes: 4096,
                    subs: vec![SubSpec::new(TY_OUTPUT, 64, 0, 0, &[0x30])],
                },
            ],
            subgraphs: vec![SubgraphSpec::default()],
            stack_size: 0x1000,
            global_param: None,
            segmmu: None,
        }
    }

    pub fn with_subgraphs(mut self, sgs: Vec<SubgraphSpec>) -> Self {
        self.subgraphs = sgs;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        // weight payload: static sections back to back
        let mut weight = Vec::new();
        let mut offsets = Vec::new();
        for (bytes, _) in &self.statics {
            offsets.push(weight.len() as u32);
            weight.extend_from_slice(bytes);
        }

        // BSS payload
        let mut bss = Vec::new();
        bss.extend_from_slice(&1u32.to_le_bytes());
        bss.extend_from_slice(&self.stack_size.to_le_bytes());
        bss.extend_from_slice(&4096u32.to_le_bytes());
        bss.extend_from_slice(&(self.statics.len() as u32).to_le_bytes());
        bss.extend_from_slice(&(self.reuses.len() as u32).to_le_bytes());
        for (i, (_, spec)) in self.statics.iter().enumerate() {
            bss.extend_from_slice(&spec.size.to_le_bytes());
            bss.extend_from_slice(&spec.align_bytes.to_le_bytes());
            bss.extend_from_slice(&offsets[i].to_le_bytes());
            bss.extend_from_slice(&(spec.subs.len() as u32).to_le_bytes());
            for sub in &spec.subs {
                sub.emit(&mut bss);
            }
        }
        for spec in &self.reuses {
            bss.extend_from_slice(&spec.size.to_le_bytes());
            bss.extend_from_slice(&spec.align_bytes.to_le_bytes());
            bss.extend_from_slice(&0u32.to_le_bytes());
            bss.extend_from_slice(&(spec.subs.len() as u32).to_le_bytes());
            for sub in &spec.subs {
                sub.emit(&mut bss);
            }
        }

        // subgraph payload
        let mut sg = Vec::new();
        sg.extend_from_slice(&(self.subgraphs.len() as u32).to_le_bytes());
        for (id, spec) in self.subgraphs.iter().enumerate() {
            sg.extend_from_slice(&(id as u32).to_le_bytes());
            sg.extend_from_slice(&0u32.to_le_bytes()); // bss_idx
            for view in [(0u32, 64u32), (0, 64), (0, 0)] {
                sg.extend_from_slice(&view.0.to_le_bytes());
                sg.extend_from_slice(&view.1.to_le_bytes());
            }
            sg.extend_from_slice(&spec.printfifo_size.to_le_bytes());
            sg.extend_from_slice(&spec.profiler_buf_size.to_le_bytes());
            sg.extend_from_slice(&spec.private_data_size.to_le_bytes());
            sg.extend_from_slice(&spec.warmup_len.to_le_bytes());
            sg.extend_from_slice(&spec.precursor_cnt.to_le_bytes());
            for slot in 0..4 {
                let p = spec.precursors.get(slot).copied().unwrap_or(0);
                sg.extend_from_slice(&p.to_le_bytes());
            }
            sg.extend_from_slice(&(spec.private_buffers.len() as u32).to_le_bytes());
            sg.extend_from_slice(&(spec.private_map.len() as u32).to_le_bytes());
            for (size, align) in &spec.private_buffers {
                sg.extend_from_slice(&size.to_le_bytes());
                sg.extend_from_slice(&align.to_le_bytes());
            }
            for entry in &spec.private_map {
                for word in [entry.0, entry.1, entry.2, entry.3, entry.4] {
                    sg.extend_from_slice(&word.to_le_bytes());
                }
            }
        }

        let mut sections: Vec<(u32, Vec<u8>)> = vec![
            (SEC_TEXT, self.text.clone()),
            (SEC_RODATA, self.rodata.clone()),
            (SEC_WEIGHT, weight),
            (SEC_BSS, bss),
            (SEC_SUBGRAPH, sg),
        ];
        if !self.dcr.is_empty() {
            sections.push((SEC_DCR, self.dcr.clone()));
        }
        if let Some((shape_offset, params)) = &self.global_param {
            let mut gp = Vec::new();
            gp.extend_from_slice(&shape_offset.to_le_bytes());
            gp.extend_from_slice(&(params.len() as u32).to_le_bytes());
            for p in params {
                gp.extend_from_slice(&p.to_le_bytes());
            }
            sections.push((SEC_GLOBALPARAM, gp));
        }
        if let Some(segmmu) = &self.segmmu {
            sections.push((SEC_SEGMMU, segmmu.clone()));
        }

        build_container(&sections)
    }
}

pub fn build_container(sections: &[(u32, Vec<u8>)]) -> Vec<u8> {
    let table_len = sections.len() * SECTION_ENTRY_LEN;
    let mut payload_off = HEADER_LEN + table_len;

    let mut header = vec![0u8; HEADER_LEN];
    header[..8].copy_from_slice(&MAGIC);
    // arch 0, ISA v3.1 (4), config 1408, revision 0
    let device = (4u32 << 24) | (1408 << 8);
    header[8..12].copy_from_slice(&device.to_le_bytes());
    header[12..16].copy_from_slice(&(5u32 << 24).to_le_bytes()); // V0005
    header[16..20].copy_from_slice(&0x0003_0100u32.to_le_bytes());
    header[20..24].copy_from_slice(&((HEADER_LEN + table_len) as u32).to_le_bytes());
    header[36..40].copy_from_slice(&(sections.len() as u32).to_le_bytes());

    let mut table = Vec::new();
    let mut payload = Vec::new();
    for (kind, bytes) in sections {
        table.extend_from_slice(&kind.to_le_bytes());
        table.extend_from_slice(&(payload_off as u32).to_le_bytes());
        table.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        payload_off += bytes.len();
        payload.extend_from_slice(bytes);
    }

    let mut out = header;
    out.extend_from_slice(&table);
    out.extend_from_slice(&payload);
    let total = out.len() as u32;
    out[24..28].copy_from_slice(&total.to_le_bytes());
    out
}

/// A 56-byte SegMMU note with one shared config.
pub fn segmmu_note() -> Vec<u8> {
    let mut note = 1u32.to_le_bytes().to_vec();
    for _ in 0..14 {
        note.extend_from_slice(&0u32.to_le_bytes());
    }
    note
}

/// Chain of `n` subgraphs where subgraph `i > 0` depends on `i - 1`.
pub fn linear_chain(n: usize) -> Vec<SubgraphSpec> {
    (0..n)
        .map(|i| SubgraphSpec {
            precursor_cnt: i32::from(i > 0),
            precursors: if i > 0 { vec![i as u32 - 1] } else { Vec::new() },
            ..SubgraphSpec::default()
        })
        .collect()
}
