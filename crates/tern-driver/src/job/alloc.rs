//! Job buffer allocation and rodata relocation.
//!
//! Allocation tries three policies in order: centralized (one carve per
//! buffer out of a single `tot_reuse` / `tot_priv` pair, the fast path
//! for device-side TLB pressure), scatter (individual allocations), and
//! hybrid rules that always apply: GM-backed sections go through the GM
//! helper, region-pinned sections are always scatter-allocated.

use super::{Job, JobIoBuffer, SubGraphTask, TaskSlots};
use crate::error::{Result, UmdError};
use crate::memory::{BufferDesc, MemRegion};
use std::sync::Arc;
use tern_chip::arch::{align_page, lo, PAGE_SIZE};
use tern_chip::tcb::TCB_SIZE;
use tern_models::{IoTensorDesc, ParamReloc, RelocLoadType, GM_BUF_TYPE_REUSE, PRE_ALL};

impl Job {
    /// Allocate and load every job buffer. Any failure unwinds through
    /// `free_job_buffers` in the caller.
    pub(crate) fn alloc_load_job_buffers(&mut self) -> Result<()> {
        let graph = Arc::clone(&self.graph);
        let g = graph.graph();

        // 0. model global parameter, patched with the configured shapes
        if let (Some(ds), Some((gp, gp_bytes))) =
            (self.dynshape.as_ref(), g.global_param.as_ref())
        {
            if ds.config_shape_cnt() > 0 {
                let buf = self
                    .mem
                    .alloc(gp_bytes.len() as u64, 0, "modelparam", MemRegion::Default)?;
                self.mem.write(buf.pa, gp_bytes)?;
                ds.patch_global_param(&self.mem, buf.pa + u64::from(gp.input_shape_offset))?;
                self.model_global_param = Some(buf);
            }
        }

        // 1. rodata copy
        if !g.rodata.is_empty() {
            let buf = self
                .mem
                .alloc(g.rodata.len() as u64, 0, "rodata", MemRegion::Default)?;
            self.mem.write(buf.pa, &g.rodata)?;
            self.rodata = Some(buf);
        }

        // 2. descriptor copy
        if !g.dcr.is_empty() {
            let buf = self
                .mem
                .alloc(g.dcr.len() as u64, 0, "dcr", MemRegion::Default)?;
            self.mem.write(buf.pa, &g.dcr)?;
            self.descriptor = Some(buf);
        }

        // 3. TCB chain storage
        let tcb_bytes = u64::from(self.tot_tcb_cnt) * TCB_SIZE as u64;
        let tcbs = self.mem.alloc(tcb_bytes, 0, "tcbs", MemRegion::Default)?;
        self.mem.zeroize(tcbs.pa, tcb_bytes)?;
        self.tcbs = Some(tcbs);

        // 4. subgraph buffers: centralized unless a region pin forces
        //    scatter, with scatter as the exhaustion fallback
        let centralized_ok = if self.cfg.fm_mem_region == MemRegion::Default {
            self.alloc_subgraph_buffers_centralized()?
        } else {
            tracing::debug!("feature-map region pinned, skipping centralized allocation");
            false
        };
        if !centralized_ok {
            self.alloc_subgraph_buffers_scatter()?;
        }

        // 5. per-task stacks and private data
        self.init_per_task_data()?;

        // 6. tensor placements over the shared reuse buffers
        self.create_io_buffers();

        if self.sg_cnt == 0 {
            return Ok(());
        }

        // 7. relocate rodata/descriptor, then the per-subgraph private
        //    buffer addresses
        self.setup_rodata_global()?;
        for sg_idx in 0..self.sg_cnt as usize {
            let sg = &g.subgraphs[sg_idx];
            if sg.private_buffers_map.is_empty() {
                continue;
            }
            self.apply_relocs(
                &sg.private_buffers_map,
                &self.sg_tasks[sg_idx].priv_bufs,
                &[],
            )?;
        }

        // 8. header-enabled remap entries
        self.setup_remap()?;

        // 9. SegMMU controls
        self.setup_segmmu()?;

        Ok(())
    }

    /// Centralized policy: one buffer per kind, sections become views.
    /// `Ok(false)` means exhaustion: fall back to scatter. GM or
    /// pinned-section allocation failures are hard errors.
    fn alloc_subgraph_buffers_centralized(&mut self) -> Result<bool> {
        let graph = Arc::clone(&self.graph);
        let g = graph.graph();

        // private footprint: max across dependency chains, chains reset
        // at PRE_ALL barriers so disjoint phases overlap storage
        let mut private_size = 0u64;
        let mut max_private_size = 0u64;
        for sg in &g.subgraphs {
            if sg.precursor_cnt == PRE_ALL {
                private_size = 0;
            }
            for section in &sg.private_buffers {
                private_size += align_page(u64::from(section.size));
            }
            max_private_size = max_private_size.max(private_size);
        }

        let mut reuse_total = 0u64;
        for (k, section) in g.reuse_sections.iter().enumerate() {
            let k = k as u32;
            if self.gm.is_gm_buffer(k, GM_BUF_TYPE_REUSE) || self.cfg.fm_idxes.contains(&k) {
                continue;
            }
            reuse_total += align_page(u64::from(section.size));
            self.top_reuse_idx.insert(k);
        }

        if max_private_size > 0 {
            match self.mem.alloc(max_private_size, 0, "tot_priv", MemRegion::Default) {
                Ok(buf) => self.top_priv = Some(buf),
                Err(_) => {
                    tracing::debug!(
                        "centralized private allocation {max_private_size:#x} failed, trying scatter"
                    );
                    self.top_reuse_idx.clear();
                    return Ok(false);
                }
            }
        }

        if reuse_total > 0 {
            match self.mem.alloc(reuse_total, 0, "tot_reuse", MemRegion::Default) {
                Ok(buf) => self.top_reuse = Some(buf),
                Err(_) => {
                    tracing::debug!(
                        "centralized reuse allocation {reuse_total:#x} failed, trying scatter"
                    );
                    if let Some(buf) = self.top_priv.take() {
                        let _ = self.mem.release(&buf);
                    }
                    self.top_reuse_idx.clear();
                    return Ok(false);
                }
            }
        }

        // carve private views, restarting the running offset after each
        // PRE_ALL barrier
        let mut priv_offset = 0u64;
        for (sg_idx, sg) in g.subgraphs.iter().enumerate() {
            let mut sg_task = SubGraphTask {
                id: sg.id,
                bss_idx: sg.bss_idx,
                ..SubGraphTask::default()
            };
            if sg.precursor_cnt == PRE_ALL {
                priv_offset = 0;
            }
            for (k, section) in sg.private_buffers.iter().enumerate() {
                if section.size == 0 {
                    tracing::warn!("subgraph {sg_idx} private buffer {k}: size == 0");
                    continue;
                }
                let top = self.top_priv.as_ref().expect("sized above");
                let view = top.view(
                    priv_offset,
                    u64::from(section.size),
                    format!("priv_{sg_idx}_{k}"),
                );
                priv_offset += align_page(u64::from(section.size));
                if self.cfg.dump.dump_reuse {
                    self.mem.zeroize(view.pa, view.size)?;
                }
                sg_task.priv_bufs.push(view);
            }
            self.sg_tasks.push(sg_task);
        }

        // carve reuse views; GM and pinned sections keep their own path
        let mut offset = 0u64;
        for (k, section) in g.reuse_sections.iter().enumerate() {
            let k32 = k as u32;
            let buf = if section.size == 0 {
                tracing::warn!("reuse {k}: size == 0");
                BufferDesc::null(format!("reuse_{k}"))
            } else if self.gm.is_gm_buffer(k32, GM_BUF_TYPE_REUSE) {
                self.gm.gm_malloc(
                    &self.mem,
                    k32,
                    u64::from(section.size),
                    &format!("gm_reuse_{k}"),
                )?
            } else if self.cfg.fm_idxes.contains(&k32) {
                self.mem.alloc(
                    u64::from(section.size),
                    section.align_in_page,
                    &format!("reuse_{k}"),
                    self.cfg.fm_mem_region,
                )?
            } else {
                let top = self.top_reuse.as_ref().expect("sized above");
                let view = top.view(offset, u64::from(section.size), format!("reuse_{k}"));
                offset += align_page(u64::from(section.size));
                view
            };
            if self.cfg.dump.dump_reuse && buf.size > 0 {
                self.mem.zeroize(buf.pa, buf.size)?;
            }
            self.reuses.push(buf);
        }

        self.alloc_printf_fifo()?;
        self.optimized_reuse_alloc = true;
        Ok(true)
    }

    /// Scatter policy: every section gets its own allocation.
    fn alloc_subgraph_buffers_scatter(&mut self) -> Result<()> {
        let graph = Arc::clone(&self.graph);
        let g = graph.graph();

        for (sg_idx, sg) in g.subgraphs.iter().enumerate() {
            let mut sg_task = SubGraphTask {
                id: sg.id,
                bss_idx: sg.bss_idx,
                ..SubGraphTask::default()
            };
            for (k, section) in sg.private_buffers.iter().enumerate() {
                if section.size == 0 {
                    tracing::warn!("subgraph {sg_idx} private buffer {k}: size == 0");
                    continue;
                }
                let buf = self.mem.alloc(
                    u64::from(section.size),
                    section.align_in_page,
                    &format!("priv_{sg_idx}_{k}"),
                    MemRegion::Default,
                )?;
                if self.cfg.dump.dump_reuse {
                    self.mem.zeroize(buf.pa, buf.size)?;
                }
                sg_task.priv_bufs.push(buf);
            }
            self.sg_tasks.push(sg_task);
        }

        for (k, section) in g.reuse_sections.iter().enumerate() {
            let k32 = k as u32;
            let buf = if section.size == 0 {
                tracing::warn!("reuse {k}: size == 0");
                BufferDesc::null(format!("reuse_{k}"))
            } else if self.gm.is_gm_buffer(k32, GM_BUF_TYPE_REUSE) {
                self.gm.gm_malloc(
                    &self.mem,
                    k32,
                    u64::from(section.size),
                    &format!("gm_reuse_{k}"),
                )?
            } else {
                let region = if self.cfg.fm_idxes.contains(&k32)
                    || self.cfg.fm_mem_region != MemRegion::Default
                {
                    self.cfg.fm_mem_region
                } else {
                    MemRegion::Default
                };
                self.mem.alloc(
                    u64::from(section.size),
                    section.align_in_page,
                    &format!("reuse_{k}"),
                    region,
                )?
            };
            if self.cfg.dump.dump_reuse && buf.size > 0 {
                self.mem.zeroize(buf.pa, buf.size)?;
            }
            self.reuses.push(buf);
        }

        self.alloc_printf_fifo()
    }

    fn alloc_printf_fifo(&mut self) -> Result<()> {
        let graph = Arc::clone(&self.graph);
        let g = graph.graph();
        if self.sg_cnt > 0 && g.subgraphs[0].printfifo_size > 0 {
            let buf = self.mem.alloc(
                u64::from(self.sg_cnt) * PAGE_SIZE,
                0,
                "printf",
                MemRegion::Default,
            )?;
            self.pprint = Some(buf);
        }
        Ok(())
    }

    /// Stacks and private-data buffers per task. After a PRE_ALL
    /// barrier, downstream subgraphs reuse the buffers of the chain
    /// that completed before the barrier.
    fn init_per_task_data(&mut self) -> Result<()> {
        let graph = Arc::clone(&self.graph);
        let g = graph.graph();
        let tcbs_pa = self.tcbs.as_ref().expect("allocated").pa;
        let task_per_sg = self.task_per_sg;

        let mut dep_all = false;
        let mut share_idx = 0usize;
        let mut allocated: Vec<usize> = Vec::new();

        for i in 0..self.sg_cnt as usize {
            let sg = &g.subgraphs[i];
            let task_tcb_pa = |j: u32| {
                tcbs_pa + u64::from(2 + i as u32 * (1 + task_per_sg) + j) * TCB_SIZE as u64
            };

            if i != 0 {
                if sg.precursor_cnt == PRE_ALL {
                    share_idx = 0;
                    dep_all = true;
                }
                if dep_all && share_idx < allocated.len() {
                    let donor = allocated[share_idx];
                    let donor_tasks: Vec<(BufferDesc, Option<BufferDesc>)> = self.sg_tasks[donor]
                        .tasks
                        .iter()
                        .map(|t| (t.stack.alias(), t.private_data.as_ref().map(BufferDesc::alias)))
                        .collect();
                    for (j, (stack, private_data)) in donor_tasks.into_iter().enumerate() {
                        self.sg_tasks[i].tasks.push(TaskSlots {
                            tcb_pa: task_tcb_pa(j as u32),
                            stack,
                            private_data,
                        });
                    }
                    share_idx += 1;
                    continue;
                }
                dep_all = false;
            }

            let bss = &g.bss[sg.bss_idx as usize];
            for j in 0..self.task_per_sg {
                let stack = self.mem.alloc(
                    u64::from(bss.stack_size),
                    bss.stack_align_in_page,
                    "stack",
                    MemRegion::Default,
                )?;
                let private_data = if sg.private_data_size > 0 {
                    let dp = self.mem.alloc(
                        u64::from(sg.private_data_size),
                        0,
                        "dp_data",
                        MemRegion::Default,
                    )?;
                    self.mem.zeroize(dp.pa, dp.size)?;
                    Some(dp)
                } else {
                    None
                };
                self.sg_tasks[i].tasks.push(TaskSlots {
                    tcb_pa: task_tcb_pa(j),
                    stack,
                    private_data,
                });
            }
            allocated.push(i);
        }
        Ok(())
    }

    /// Resolve every tensor against its carrying reuse buffer.
    pub(crate) fn create_io_buffers(&mut self) {
        let graph = Arc::clone(&self.graph);
        let gio = &graph.graph().io;
        let place = |reuses: &[BufferDesc], list: &[IoTensorDesc]| -> Vec<JobIoBuffer> {
            list.iter()
                .map(|t| {
                    let section = &reuses[t.ref_section_iter as usize];
                    JobIoBuffer {
                        id: t.id,
                        size: u64::from(t.size),
                        pa: section.pa + u64::from(t.offset_in_section),
                        align_asid_pa: section.align_asid_pa + u64::from(t.offset_in_section),
                        ref_section_iter: t.ref_section_iter,
                        data_type: t.data_type,
                        scale: t.scale,
                        zero_point: t.zero_point,
                        dmabuf_fd: None,
                        dump_ignore: false,
                    }
                })
                .collect()
        };

        self.io = super::JobIo {
            inputs: place(&self.reuses, &gio.inputs),
            outputs: place(&self.reuses, &gio.outputs),
            inter_dumps: place(&self.reuses, &gio.inter_dumps),
            profiler: place(&self.reuses, &gio.profiler),
            printf: place(&self.reuses, &gio.printf),
            layer_counter: place(&self.reuses, &gio.layer_counter),
            err_code: place(&self.reuses, &gio.err_code),
            segmmus: place(&self.reuses, &gio.segmmus),
            outputs_shape: place(&self.reuses, &gio.outputs_shape),
        };
    }

    /// Run the graph-wide relocation map against this job's buffers.
    pub(crate) fn setup_rodata_global(&mut self) -> Result<()> {
        let graph = Arc::clone(&self.graph);
        let g = graph.graph();
        self.apply_relocs(&g.param_map, &self.reuses, graph.static_views())
    }

    /// Patch `rodata[offset] = (old & !mask) | ((pa + off) & mask)` for
    /// every entry, mirroring into the descriptor copy when present.
    pub(crate) fn apply_relocs(
        &self,
        param_map: &[ParamReloc],
        reuse_bufs: &[BufferDesc],
        static_bufs: &[BufferDesc],
    ) -> Result<()> {
        let Some(rodata) = self.rodata.as_ref() else {
            return Ok(());
        };

        for entry in param_map {
            let base = match entry.load_type {
                RelocLoadType::Static => static_bufs.get(entry.buf_index as usize),
                RelocLoadType::Reuse => reuse_bufs.get(entry.buf_index as usize),
            }
            .ok_or_else(|| {
                UmdError::invalid_bin(format!(
                    "relocation references {:?} buffer {} of {}",
                    entry.load_type,
                    entry.buf_index,
                    match entry.load_type {
                        RelocLoadType::Static => static_bufs.len(),
                        RelocLoadType::Reuse => reuse_bufs.len(),
                    }
                ))
            })?
            .pa;

            let resolved = lo(base + u64::from(entry.offset_in_section));
            let offset = u64::from(entry.offset_in_ro);
            let mask = entry.addr_mask;

            let mut patched = false;
            if offset + 4 <= rodata.req_size {
                let old = self.mem.read_u32(rodata.pa + offset)?;
                self.mem
                    .write_u32(rodata.pa + offset, (old & !mask) | (resolved & mask))?;
                patched = true;
            }
            if let Some(dcr) = self.descriptor.as_ref() {
                if offset + 4 <= dcr.req_size {
                    let old = self.mem.read_u32(dcr.pa + offset)?;
                    self.mem
                        .write_u32(dcr.pa + offset, (old & !mask) | (resolved & mask))?;
                    patched = true;
                }
            }
            if !patched {
                return Err(UmdError::invalid_bin(format!(
                    "relocation offset {offset:#x} outside rodata and descriptor"
                )));
            }
        }
        Ok(())
    }

    /// Apply `.remap` entries when the graph header enables remap.
    fn setup_remap(&mut self) -> Result<()> {
        let graph = Arc::clone(&self.graph);
        let g = graph.graph();
        if !g.remap_enabled || g.remaps.is_empty() {
            return Ok(());
        }
        let Some(rodata) = self.rodata.as_ref() else {
            return Ok(());
        };
        for entry in &g.remaps {
            let offset = u64::from(entry.src_addr);
            if offset + 4 > rodata.req_size {
                return Err(UmdError::invalid_bin(format!(
                    "remap source {offset:#x} outside rodata"
                )));
            }
            self.mem.write_u32(rodata.pa + offset, entry.dst_addr)?;
        }
        Ok(())
    }

    /// Materialize per-core SegMMU controls and fold tagged I/O buffer
    /// addresses into the segment control words.
    fn setup_segmmu(&mut self) -> Result<()> {
        let graph = Arc::clone(&self.graph);
        let g = graph.graph();
        if g.segmmu_num == 0 {
            return Ok(());
        }

        use tern_chip::tcb::segmmu::{MEM_CTRL_EN, REMAP_SHARE_EN};

        self.segmmu_sec.clear();
        for core in 0..self.core_cnt as usize {
            let idx = if g.segmmu_num == 1 { 0 } else { core };
            let mut cfg = *g.segmmu.get(idx).ok_or_else(|| {
                UmdError::invalid_bin(format!(
                    "SegMMU config {idx} missing (declared {})",
                    g.segmmu_num
                ))
            })?;
            cfg.ctl = REMAP_SHARE_EN | MEM_CTRL_EN;
            cfg.remap = 0;
            self.segmmu_sec.push(cfg);
        }

        let tagged: Vec<(u32, u64)> = self.io.segmmus.iter().map(|b| (b.id, b.pa)).collect();
        for (id, pa) in tagged {
            let ctrl_idx = (id & 0xFF) as usize;
            let seg_idx = ((id >> 8) & 0xFF) as usize;
            let core_mask = id >> 16;

            if core_mask & ((1 << self.core_cnt) - 1) == 0 {
                return Err(UmdError::invalid_bin(format!(
                    "SegMMU core mask {core_mask:#x} selects no core"
                )));
            }
            if seg_idx >= 4 || ctrl_idx >= 2 {
                return Err(UmdError::invalid_bin(format!(
                    "SegMMU selector out of range (seg {seg_idx}, ctrl {ctrl_idx})"
                )));
            }

            for core in 0..self.core_cnt as usize {
                if core_mask & (1 << core) == 0 {
                    continue;
                }
                let ctrl = &mut self.segmmu_sec[core].seg[seg_idx][ctrl_idx];
                *ctrl = (*ctrl & 0x3FFF) | (lo(pa) & !0x3FFF);
            }
        }
        Ok(())
    }

    /// Whether a SegMMU copy must be programmed into group-init records.
    pub(crate) fn segmmu_active(&self) -> bool {
        !self.segmmu_sec.is_empty()
    }
}

impl BufferDesc {
    /// Placeholder for a zero-sized section so reuse indexes stay dense.
    pub(crate) fn null(name: String) -> Self {
        Self {
            pa: 0,
            size: 0,
            req_size: 0,
            asid_base: 0,
            align_asid_pa: 0,
            region: MemRegion::Default,
            owned: false,
            name,
        }
    }
}
