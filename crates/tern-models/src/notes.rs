//! Parsers for the auxiliary sections: remap table, GM config note,
//! SegMMU note, model global-param note, and the subgraph table.

use crate::bss::Cursor;
use crate::error::{GraphError, Result};
use crate::section::{
    BssBufferIndex, GmConfig, ModelGlobalParam, ParamReloc, RelocLoadType, RemapEntry, SectionDesc,
    SectionType, SegMmuConfig, Subgraph, SubgraphSection, PRE_ALL,
};
use bytes::Bytes;
use tern_chip::arch::pages_for_align;

/// Parse the `.remap` payload: a count then that many 16-byte entries.
pub fn parse_remap_section(remap: &Bytes) -> Result<Vec<RemapEntry>> {
    let mut cur = Cursor::new(remap);
    let entry_cnt = cur.u32()?;
    let mut entries = Vec::with_capacity(entry_cnt as usize);
    for _ in 0..entry_cnt {
        let ctrl = cur.u32()?;
        let src_addr = cur.u32()?;
        let dst_addr = cur.u32()?;
        let _reserved = cur.u32()?;
        entries.push(RemapEntry {
            ctrl,
            src_addr,
            dst_addr,
        });
    }
    Ok(entries)
}

/// Parse the GM configuration note (56 bytes).
pub fn parse_gmconfig_section(gm: &Bytes) -> Result<GmConfig> {
    let mut cur = Cursor::new(gm);
    let gm_control = cur.u32()?;
    let gm_region_ctrl = [cur.u32()?, cur.u32()?];
    for _ in 0..3 {
        let _reserved = cur.u32()?;
    }
    let mut gm_buf_idx = [BssBufferIndex::default(); 2];
    for idx in &mut gm_buf_idx {
        idx.fm_index = cur.u32()?;
        idx.buf_type = cur.u32()?;
        idx.buf_index = cur.u32()?;
        let _reserved = cur.u32()?;
    }
    Ok(GmConfig {
        gm_control,
        gm_region_ctrl,
        gm_buf_idx,
    })
}

/// Parse the SegMMU note: a config count then that many 56-byte entries.
pub fn parse_segmmu_section(segmmu: &Bytes) -> Result<(u32, Vec<SegMmuConfig>)> {
    let mut cur = Cursor::new(segmmu);
    let num_mmu = cur.u32()?;
    let mut configs = Vec::with_capacity(num_mmu as usize);
    for _ in 0..num_mmu {
        let mut cfg = SegMmuConfig::default();
        for seg in &mut cfg.seg {
            seg[0] = cur.u32()?;
            seg[1] = cur.u32()?;
        }
        cfg.ctl = cur.u32()?;
        cfg.remap = cur.u32()?;
        for _ in 0..4 {
            let _reserved = cur.u32()?;
        }
        configs.push(cfg);
    }
    Ok((num_mmu, configs))
}

/// Parse the model global-param note header; the raw section bytes are
/// retained alongside so a job can seed its own copy.
pub fn parse_globalparam_section(gp: &Bytes) -> Result<ModelGlobalParam> {
    let mut cur = Cursor::new(gp);
    let input_shape_offset = cur.u32()?;
    let num_params = cur.u32()?;
    let declared_end = u64::from(input_shape_offset);
    if declared_end > gp.len() as u64 {
        return Err(GraphError::invalid(
            "global-param input shape offset outside section",
        ));
    }
    Ok(ModelGlobalParam {
        input_shape_offset,
        num_params,
    })
}

/// Parse the subgraph table.
pub fn parse_subgraph_section(sg: &Bytes) -> Result<Vec<Subgraph>> {
    let mut cur = Cursor::new(sg);
    let sg_cnt = cur.u32()?;
    let mut subgraphs = Vec::with_capacity(sg_cnt as usize);

    for _ in 0..sg_cnt {
        let id = cur.u32()?;
        let bss_idx = cur.u32()?;
        let text = read_view(&mut cur)?;
        let rodata = read_view(&mut cur)?;
        let dcr = read_view(&mut cur)?;
        let printfifo_size = cur.u32()?;
        let profiler_buf_size = cur.u32()?;
        let private_data_size = cur.u32()?;
        let warmup_len = cur.u32()?;
        let precursor_cnt = cur.i32()?;
        let mut precursors = Vec::new();
        for slot in 0..4u32 {
            let p = cur.u32()?;
            if precursor_cnt > 0 && slot < precursor_cnt as u32 {
                precursors.push(p);
            }
        }
        let private_buffer_cnt = cur.u32()?;
        let private_map_cnt = cur.u32()?;

        if precursor_cnt != PRE_ALL && !(0..=4).contains(&precursor_cnt) {
            // carried through; the job builder rejects it with full context
            tracing::warn!("subgraph {id}: precursor count {precursor_cnt} outside 0..=4 / PRE_ALL");
        }

        let mut private_buffers = Vec::with_capacity(private_buffer_cnt as usize);
        for slot in 0..private_buffer_cnt {
            let size = cur.u32()?;
            let align_bytes = cur.u32()?;
            private_buffers.push(SectionDesc {
                size,
                align_in_page: pages_for_align(align_bytes),
                slot_index: slot,
                ..SectionDesc::new()
            });
        }

        let mut private_buffers_map = Vec::with_capacity(private_map_cnt as usize);
        for _ in 0..private_map_cnt {
            let offset_in_ro = cur.u32()?;
            let buf_index = cur.u32()?;
            let sub_index = cur.u32()?;
            let offset_in_section = cur.u32()?;
            let addr_mask = cur.u32()?;
            private_buffers_map.push(ParamReloc {
                offset_in_ro,
                load_type: RelocLoadType::Reuse,
                sub_type: SectionType::InterDump,
                buf_index,
                sub_index,
                offset_in_section,
                addr_mask,
            });
        }

        subgraphs.push(Subgraph {
            id,
            bss_idx,
            text,
            rodata,
            dcr,
            printfifo_size,
            profiler_buf_size,
            private_data_size,
            warmup_len,
            precursor_cnt,
            precursors,
            private_buffers,
            private_buffers_map,
        });
    }

    Ok(subgraphs)
}

fn read_view(cur: &mut Cursor) -> Result<SubgraphSection> {
    Ok(SubgraphSection {
        offset: cur.u32()?,
        size: cur.u32()?,
    })
}
