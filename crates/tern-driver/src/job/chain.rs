//! TCB chain construction.
//!
//! For `S` subgraphs and `T` tasks per subgraph the chain is
//! `1 + S*(T+1)` contiguous records:
//!
//! ```text
//! [ GRID_INIT ]
//! [ GROUP_INIT_0 ][ TASK_0_0 .. TASK_0_3 ]
//! [ GROUP_INIT_1 ][ TASK_1_0 .. TASK_1_3 ]
//! ...
//! ```
//!
//! Subgraphs arrive topologically sorted from the compiler; the builder
//! never reorders them.

use super::Job;
use crate::error::{Result, UmdError};
use std::sync::Arc;
use tern_chip::arch::{hi, lo, PAGE_SIZE};
use tern_chip::tcb::{
    self, grid_irq, tec_irq, GridInitTcb, GroupInitTcb, TaskTcb, Tcb, ASID_RD, ASID_WR,
    EN_GROUP_DEPEND, GROUP_ID_MASK, TCB_SIZE,
};
use tern_models::{Subgraph, PRE_ALL};

impl Job {
    /// Build and flush the full chain, then store the debugger tail
    /// words after the text image.
    pub(crate) fn setup_tcb_chain(&mut self) -> Result<()> {
        let graph = Arc::clone(&self.graph);
        let g = graph.graph();
        let tcbs_pa = self.tcbs.as_ref().expect("chain storage").pa;

        // grid init record
        let mut grid = GridInitTcb {
            flag: tcb::TASK_TYPE_GRID_INIT | tcb::FLAG_L2D_FLUSH,
            group_num: self.sg_cnt,
            interrupt_en: grid_irq::ALL,
            grid_id: self.grid_id,
            group_id: self.group_id_idx,
            ..GridInitTcb::default()
        };
        self.setup_gm_sync_from_ddr(&mut grid);
        self.mem.write(tcbs_pa, &Tcb::GridInit(grid).encode())?;

        for (i, sg) in g.subgraphs.iter().enumerate() {
            let mut group = GroupInitTcb {
                flag: tcb::TASK_TYPE_GROUP_INIT | tcb::FLAG_GRID_INIT,
                grid_id: self.grid_id,
                group_id: self.group_id_idx,
                ..GroupInitTcb::default()
            };

            let (dep_flag, deps) = self.config_tcb_deps(sg)?;
            group.flag |= dep_flag;
            group.group_deps = deps;

            self.config_tcb_segmmu(&mut group);

            // ASID0: the shared feature-map window
            let asid0 = self.mem.asid_base(0);
            group.asids[0] = lo(asid0) | ASID_RD | ASID_WR;
            group.asids[1] = hi(asid0);

            // ASID1: this subgraph's weight window; multi-bucket graphs
            // place each bucket in its own window
            let asid1 = if g.weights.is_empty() {
                self.mem.asid_base(1)
            } else {
                graph.weight_info(sg.bss_idx).wb_asid_base
            };
            group.asids[2] = lo(asid1) | ASID_RD | ASID_WR;
            group.asids[3] = hi(asid1);
            for slot in 4..8 {
                group.asids[slot] = 0;
            }

            let group_pa = tcbs_pa + (1 + i as u64 * u64::from(self.task_per_sg + 1)) * TCB_SIZE as u64;
            self.mem.write(group_pa, &Tcb::GroupInit(group).encode())?;

            for t in 0..self.task_per_sg {
                self.setup_task_tcb(i, t)?;
            }
            self.group_id_idx += 1;
        }

        // aligned text and rodata bases after the text image, for the
        // debugger
        let text = graph.text();
        let tail = text.pa + graph.text_len();
        self.mem.write_u32(tail, lo(text.align_asid_pa))?;
        if let Some(ro) = self.rodata.as_ref() {
            self.mem.write_u32(tail + 4, lo(ro.align_asid_pa))?;
        }

        Ok(())
    }

    /// Encode one task record.
    fn setup_task_tcb(&mut self, sg_idx: usize, task_id: u32) -> Result<()> {
        let graph = Arc::clone(&self.graph);
        let g = graph.graph();
        let sg = &g.subgraphs[sg_idx];
        let task = &self.sg_tasks[sg_idx].tasks[task_id as usize];
        let tcbs = self.tcbs.as_ref().expect("chain storage");

        let mut rec = TaskTcb {
            flag: tcb::TASK_TYPE_TASK,
            interrupt_en: tec_irq::ALL,
            spc: lo(graph.text().align_asid_pa + u64::from(sg.text.offset)),
            group_id: self.group_id_idx,
            grid_id: self.grid_id,
            task_id: task_id as u16,
            warmup_len: sg.warmup_len as u16,
            grid_dim: [1, 1, 1],
            group_dim: [self.task_per_sg as u16, 1, 1],
            group_coord: [1, 0, 0],
            task_coord: [task_id as u16, 0, 0],
            tcbp: lo(task.tcb_pa - tcbs.asid_base),
            sp: lo(task.stack.align_asid_pa),
            dp: task.private_data.as_ref().map_or(0, |b| lo(b.align_asid_pa)),
            ..TaskTcb::default()
        };

        if let Some(ro) = self.rodata.as_ref() {
            rec.pp = lo(ro.align_asid_pa + u64::from(sg.rodata.offset));
        }

        // const rodata (zero-copy const bucket)
        if let Some(cro) = graph.crodata(sg.bss_idx) {
            rec.cp = lo(cro.align_asid_pa);
        }

        // profile buffer offset steps per subgraph
        if let Some(prof) = self.io.profiler.first() {
            rec.pprofiler = lo(prof.align_asid_pa + u64::from(sg.profiler_buf_size));
        }

        if sg.printfifo_size > 0 {
            if let Some(pprint) = self.pprint.as_ref() {
                let pa = pprint.align_asid_pa
                    + PAGE_SIZE * sg_idx as u64
                    + 1024 * u64::from(task_id);
                rec.pprint = lo(pa);
                rec.interrupt_en |= tec_irq::SIGNAL;
            }
        }

        if let Some(gp) = self.model_global_param.as_ref() {
            rec.global_param = lo(gp.align_asid_pa);
        }

        if task_id == self.task_per_sg - 1 {
            rec.flag |= tcb::END_TYPE_GROUP_END;
        }
        if sg_idx as u32 == self.sg_cnt - 1 && task_id == self.task_per_sg - 1 {
            rec.flag |= tcb::END_TYPE_GRID_END;
        }

        // only the first task of a group carries the dependency flags
        if task_id == 0 {
            let (dep_flag, deps) = self.config_tcb_deps(sg)?;
            rec.flag |= dep_flag;
            rec.group_deps = deps;
        }

        self.mem.write(task.tcb_pa, &Tcb::Task(rec).encode())
    }

    /// Dependency encoding for one subgraph's records.
    pub(crate) fn config_tcb_deps(&self, sg: &Subgraph) -> Result<(u32, [u16; 4])> {
        let mut deps = [0u16; 4];
        match sg.precursor_cnt {
            0 => Ok((tcb::DEP_TYPE_NONE, deps)),
            1..=4 => {
                for (slot, &precursor) in sg.precursors.iter().enumerate() {
                    if precursor > u32::from(GROUP_ID_MASK) {
                        tracing::error!("subgraph {}: precursor group {precursor} invalid", sg.id);
                        return Err(UmdError::invalid_bin(format!(
                            "precursor group id {precursor}"
                        )));
                    }
                    let dep = (precursor as u16).wrapping_add(self.start_group_id) & GROUP_ID_MASK;
                    deps[slot] = EN_GROUP_DEPEND | dep;
                }
                Ok((tcb::DEP_TYPE_GROUP, deps))
            }
            PRE_ALL => Ok((tcb::DEP_TYPE_PRE_ALL, deps)),
            other => {
                tracing::error!("subgraph {}: precursor count {other}", sg.id);
                Err(UmdError::invalid_bin(format!(
                    "subgraph {} precursor count {other}",
                    sg.id
                )))
            }
        }
    }

    /// Copy the per-core SegMMU controls into a group-init record
    /// (single shared config only; per-core configs are programmed by
    /// the following group records on multi-core chains).
    fn config_tcb_segmmu(&self, group: &mut GroupInitTcb) {
        if !self.segmmu_active() {
            return;
        }
        let cfg = &self.segmmu_sec[0];
        group.segmmu_ctrl = cfg.ctl;
        group.segmmu_remap_ctrl0 = cfg.remap;
        group.segmmu_remap_ctrl1 = cfg.remap;
        for seg in 0..4 {
            group.segmmu_seg_ctrl[2 * seg] = cfg.seg[seg][0];
            group.segmmu_seg_ctrl[2 * seg + 1] = cfg.seg[seg][1];
        }
    }

    /// Program the grid-init GM fields when the GM path needs a remap.
    fn setup_gm_sync_from_ddr(&self, grid: &mut GridInitTcb) {
        if !self.mem.gm_enabled() || !self.gm.need_remap() {
            return;
        }
        let remap_mode = 0u32; // time priority
        let remap_size = (self.mem.gm_size() >> 18).saturating_sub(1) as u32;
        grid.gm_ctrl = ((remap_size & 0xFF) << 8) | (remap_mode & 0x1) << 1 | tcb::GM_CTRL_REMAP_EN;
        grid.gm_addr_low = lo(self.gm.gm_buf_base);
        grid.gm_addr_high = hi(self.gm.gm_buf_base);

        if self.gm.gm_buf_sync_size != 0 {
            grid.gm_sync = tcb::GM_SYNC_DDR_TO_GM;
        }
    }
}
