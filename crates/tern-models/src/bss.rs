//! BSS section walker.
//!
//! The `.bss` payload describes, per BSS bucket, the stack requirement
//! and two descriptor tables: static (weight) sections and reuse
//! (feature-map) sections. Every sub-section contributes relocation
//! entries; reuse sub-sections with an I/O type additionally contribute
//! tensor descriptors. Any cursor excursion past the region is treated
//! as corrupt input, not a driver bug.

use crate::error::{GraphError, Result};
use crate::section::{
    Bss, IoTensorDesc, IoTensors, ParamReloc, RelocLoadType, SectionDesc, SectionType,
    SubSectionDesc, DataType,
};
use bytes::Bytes;
use tern_chip::arch::{align_up, pages_for_align};

/// Default weight placeholder when a graph declares no const data; the
/// rest of the flow always sees a non-empty weight buffer.
pub const CONST_PLACEHOLDER: u32 = 4096;

/// Bounds-checked little-endian cursor over a section payload.
pub(crate) struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&e| e <= self.buf.len())
            .ok_or_else(|| GraphError::invalid("section walk out of range"))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }

    pub(crate) fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.u32()?))
    }
}

/// Everything extracted from the `.bss` payload.
#[derive(Debug, Default)]
pub struct BssParseResult {
    /// Per-bucket stack and static tables.
    pub bss: Vec<Bss>,
    /// Reuse sections aggregated across buckets, in global index order.
    pub reuse_sections: Vec<SectionDesc>,
    /// The graph's I/O tensor set (always carried by bucket 0).
    pub io: IoTensors,
    /// Relocation entries, static and reuse, in emit order.
    pub param_map: Vec<ParamReloc>,
}

struct SubSectionLoad {
    sec_type: SectionType,
    size: u32,
    id: u32,
    offset_in_section_exec: u32,
    addr_mask: u32,
    scale: f32,
    zero_point: i32,
    data_type: DataType,
    ro_offsets: Vec<u32>,
}

fn read_sub_section(cur: &mut Cursor) -> Result<SubSectionLoad> {
    let type_raw = cur.u32()?;
    let sec_type = SectionType::from_u32(type_raw)
        .ok_or(GraphError::InvalidTensorType { kind: type_raw })?;
    let size = cur.u32()?;
    let id = cur.u32()?;
    let offset_in_section_exec = cur.u32()?;
    let addr_mask = cur.u32()?;
    let ro_cnt = cur.u32()?;
    let scale = cur.f32()?;
    let zero_point = cur.i32()?;
    let data_type = DataType::from_u32(cur.u32()?);
    let _reserved = cur.u32()?;

    let mut ro_offsets = Vec::with_capacity(ro_cnt as usize);
    for _ in 0..ro_cnt {
        ro_offsets.push(cur.u32()?);
    }
    Ok(SubSectionLoad {
        sec_type,
        size,
        id,
        offset_in_section_exec,
        addr_mask,
        scale,
        zero_point,
        data_type,
        ro_offsets,
    })
}

fn io_list_for<'a>(io: &'a mut IoTensors, sec_type: SectionType) -> &'a mut Vec<IoTensorDesc> {
    match sec_type {
        SectionType::Input => &mut io.inputs,
        SectionType::Output => &mut io.outputs,
        SectionType::InterDump => &mut io.inter_dumps,
        SectionType::Profiler => &mut io.profiler,
        SectionType::Printf => &mut io.printf,
        SectionType::LayerCounter => &mut io.layer_counter,
        SectionType::ErrorCode => &mut io.err_code,
        SectionType::SegMmu => &mut io.segmmus,
        SectionType::OutTensorShape => &mut io.outputs_shape,
        SectionType::Constant | SectionType::ZeroCopyConstant => unreachable!(),
    }
}

/// Walk the full `.bss` payload: a `u32` bucket count followed by that
/// many BSS blocks laid out back to back.
pub fn parse_bss_region(bss: &Bytes, weights: &[Bytes]) -> Result<BssParseResult> {
    let mut cur = Cursor::new(bss);
    let bss_cnt = cur.u32()?;
    if bss_cnt == 0 {
        return Err(GraphError::invalid("BSS bucket count is zero"));
    }

    let mut out = BssParseResult::default();
    let mut static_buf_idx = 0u32;
    let mut reuse_buf_idx = 0u32;

    for bss_id in 0..bss_cnt {
        parse_bss_section(
            &mut cur,
            bss_id,
            weights.get(bss_id as usize),
            &mut static_buf_idx,
            &mut reuse_buf_idx,
            &mut out,
        )?;
    }

    sort_io(&mut out.io)?;
    Ok(out)
}

/// Parse one BSS block at the cursor, appending into `out`. The cursor
/// is left at the start of the next block.
fn parse_bss_section(
    cur: &mut Cursor,
    bss_id: u32,
    weight: Option<&Bytes>,
    static_buf_idx: &mut u32,
    reuse_buf_idx: &mut u32,
    out: &mut BssParseResult,
) -> Result<()> {
    let stack_size = cur.u32()?;
    let stack_align_bytes = cur.u32()?;
    let static_cnt = cur.u32()?;
    let reuse_cnt = cur.u32()?;

    if stack_size == 0 || stack_align_bytes == 0 || reuse_cnt == 0 {
        return Err(GraphError::invalid(format!(
            "BSS {bss_id} header: stack {stack_size}/{stack_align_bytes}, reuse count {reuse_cnt}"
        )));
    }

    let mut bss = Bss {
        id: bss_id,
        stack_size,
        stack_align_in_page: pages_for_align(stack_align_bytes),
        const_size: 0,
        zerocpy_const_size: 0,
        static_sections: Vec::with_capacity(static_cnt as usize),
    };

    let mut const_start = 0u32;
    let mut zerocpy_const_start = 0u32;

    for slot in 0..static_cnt {
        let size = cur.u32()?;
        let align_bytes = cur.u32()?;
        let offset_in_file = cur.u32()?;
        let sub_cnt = cur.u32()?;

        let mut section = SectionDesc {
            size,
            align_in_page: pages_for_align(align_bytes),
            offset_in_file,
            slot_index: slot,
            ..SectionDesc::new()
        };

        for sub_iter in 0..sub_cnt {
            let sub = read_sub_section(cur)?;
            section.sub_sections.push(SubSectionDesc {
                offset_in_section: sub.offset_in_section_exec,
            });
            section.sec_type = sub.sec_type;
            for &offset_in_ro in &sub.ro_offsets {
                out.param_map.push(ParamReloc {
                    offset_in_ro,
                    load_type: RelocLoadType::Static,
                    sub_type: sub.sec_type,
                    buf_index: *static_buf_idx,
                    sub_index: sub_iter,
                    offset_in_section: sub.offset_in_section_exec,
                    addr_mask: sub.addr_mask,
                });
            }
        }

        if section.sec_type == SectionType::ZeroCopyConstant {
            section.relative_addr = align_up(u64::from(zerocpy_const_start), u64::from(align_bytes)) as u32;
            zerocpy_const_start = section.relative_addr + size;
        } else {
            section.relative_addr = align_up(u64::from(const_start), u64::from(align_bytes)) as u32;
            const_start = section.relative_addr + size;
        }

        if size != 0 {
            let w = weight.ok_or_else(|| {
                GraphError::invalid(format!("BSS {bss_id}: static section without weight payload"))
            })?;
            let end = offset_in_file
                .checked_add(size)
                .filter(|&e| e as usize <= w.len())
                .ok_or_else(|| {
                    GraphError::invalid(format!(
                        "BSS {bss_id}: static load source [{offset_in_file:#x} +{size:#x}) outside weight section"
                    ))
                })?;
            section.load_src = Some(w.slice(offset_in_file as usize..end as usize));
        }

        bss.static_sections.push(section);
        *static_buf_idx += 1;
    }

    // A graph with no const data still reserves a placeholder so the
    // weight buffer exists for the whole flow.
    bss.const_size = if const_start == 0 {
        CONST_PLACEHOLDER
    } else {
        const_start
    };
    bss.zerocpy_const_size = zerocpy_const_start;
    tracing::debug!(
        "BSS {bss_id}: const {:#x}, zerocpy {:#x}, statics {}, reuses {}",
        bss.const_size,
        bss.zerocpy_const_size,
        static_cnt,
        reuse_cnt
    );

    for _ in 0..reuse_cnt {
        let size = cur.u32()?;
        let align_bytes = cur.u32()?;
        let _offset_in_file = cur.u32()?;
        let sub_cnt = cur.u32()?;

        let mut section = SectionDesc {
            size,
            align_in_page: pages_for_align(align_bytes),
            slot_index: *reuse_buf_idx,
            ..SectionDesc::new()
        };
        section.sec_type = SectionType::Input;

        for sub_iter in 0..sub_cnt {
            let sub = read_sub_section(cur)?;
            if sub.sec_type.is_io_tensor() {
                io_list_for(&mut out.io, sub.sec_type).push(IoTensorDesc {
                    id: sub.id,
                    size: sub.size,
                    ref_section_iter: *reuse_buf_idx,
                    offset_in_section: sub.offset_in_section_exec,
                    scale: sub.scale,
                    zero_point: sub.zero_point,
                    data_type: sub.data_type,
                });
            }
            section.sub_sections.push(SubSectionDesc {
                offset_in_section: sub.offset_in_section_exec,
            });
            section.sec_type = sub.sec_type;
            for &offset_in_ro in &sub.ro_offsets {
                out.param_map.push(ParamReloc {
                    offset_in_ro,
                    load_type: RelocLoadType::Reuse,
                    sub_type: sub.sec_type,
                    buf_index: *reuse_buf_idx,
                    sub_index: sub_iter,
                    offset_in_section: sub.offset_in_section_exec,
                    addr_mask: sub.addr_mask,
                });
            }
        }

        out.reuse_sections.push(section);
        *reuse_buf_idx += 1;
    }

    out.bss.push(bss);
    Ok(())
}

/// Enforce the tensor-id permutation on every ordered I/O list: after
/// sorting, `tensors[i].id == i`. An id at or past the list length means
/// the compiler's declaration is inconsistent.
pub fn sort_io(io: &mut IoTensors) -> Result<()> {
    sort_io_tensors(&mut io.inputs)?;
    sort_io_tensors(&mut io.outputs)?;
    sort_io_tensors(&mut io.inter_dumps)?;
    sort_io_tensors(&mut io.outputs_shape)?;
    Ok(())
}

fn sort_io_tensors(tensors: &mut [IoTensorDesc]) -> Result<()> {
    let snapshot = tensors.to_vec();
    for (i, desc) in snapshot.into_iter().enumerate() {
        if desc.id as usize >= tensors.len() {
            return Err(GraphError::invalid(format!(
                "tensor id {} out of range (list size {})",
                desc.id,
                tensors.len()
            )));
        }
        if desc.id as usize != i {
            let id = desc.id as usize;
            tensors[id] = desc;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(id: u32) -> IoTensorDesc {
        IoTensorDesc {
            id,
            size: 16,
            ref_section_iter: 0,
            offset_in_section: 0,
            scale: 1.0,
            zero_point: 0,
            data_type: DataType::U8,
        }
    }

    #[test]
    fn sort_io_is_identity_permutation() {
        let mut v = vec![tensor(2), tensor(0), tensor(1)];
        sort_io_tensors(&mut v).unwrap();
        for (i, t) in v.iter().enumerate() {
            assert_eq!(t.id as usize, i);
        }
    }

    #[test]
    fn sort_io_rejects_out_of_range_id() {
        let mut v = vec![tensor(0), tensor(5)];
        assert!(matches!(
            sort_io_tensors(&mut v),
            Err(GraphError::InvalidBinary { .. })
        ));
    }

    #[test]
    fn cursor_overflow_is_invalid_bin() {
        let mut cur = Cursor::new(&[1, 2, 3]);
        assert!(matches!(
            cur.u32(),
            Err(GraphError::InvalidBinary { .. })
        ));
    }

    #[test]
    fn empty_region_rejected() {
        let data = Bytes::from_static(&[0, 0, 0, 0]);
        assert!(parse_bss_region(&data, &[]).is_err());
    }

    #[test]
    fn bad_header_rejected() {
        // one bucket, zero stack size
        let mut buf = 1u32.to_le_bytes().to_vec();
        buf.extend_from_slice(&0u32.to_le_bytes()); // stack_size
        buf.extend_from_slice(&4096u32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        let data = Bytes::from(buf);
        assert!(parse_bss_region(&data, &[]).is_err());
    }
}
