//! GM (graph memory) placement helper.
//!
//! The compiler can pin reuse or weight buffers into the on-chip GM
//! window. The helper answers "is buffer k GM-backed?" during
//! allocation, carves those buffers from the GM backing window, and
//! accumulates the DDR→GM sync footprint the grid-init record needs.

use crate::error::Result;
use crate::memory::{BufferDesc, MemoryManager};
use std::collections::HashSet;
use tern_models::{Graph, GM_BUF_TYPE_REUSE, GM_BUF_TYPE_WEIGHT};

/// Per-job GM state.
#[derive(Debug, Default)]
pub struct GmHelper {
    active: bool,
    reuse_idx: HashSet<u32>,
    weight_idx: HashSet<u32>,
    /// Inputs referencing a GM reuse buffer require an initial sync.
    sync_inputs: HashSet<u32>,
    /// Base of the first GM carve; the grid-init remap target.
    pub gm_buf_base: u64,
    /// Bytes to sync from DDR into GM before the first run.
    pub gm_buf_sync_size: u64,
}

impl GmHelper {
    /// Evaluate the graph's GM request against the device's GM window.
    pub fn new(mem: &MemoryManager, graph: &Graph) -> Self {
        let active = mem.gm_enabled() && graph.gm_requested();
        let mut helper = Self {
            active,
            ..Self::default()
        };
        if !active {
            return helper;
        }
        let cfg = graph.gm_config.expect("gm_requested implies config");
        for idx in cfg.gm_buf_idx {
            match idx.buf_type {
                GM_BUF_TYPE_REUSE => {
                    helper.reuse_idx.insert(idx.buf_index);
                }
                GM_BUF_TYPE_WEIGHT => {
                    helper.weight_idx.insert(idx.buf_index);
                }
                other => tracing::warn!("unknown GM buffer type {other}"),
            }
        }
        for input in &graph.io.inputs {
            if helper.reuse_idx.contains(&input.ref_section_iter) {
                helper.sync_inputs.insert(input.ref_section_iter);
            }
        }
        helper
    }

    /// Whether the GM path is active for this job.
    pub fn active(&self) -> bool {
        self.active
    }

    /// Whether reuse (or weight) buffer `index` is GM-backed.
    pub fn is_gm_buffer(&self, index: u32, buf_type: u32) -> bool {
        if !self.active {
            return false;
        }
        match buf_type {
            GM_BUF_TYPE_REUSE => self.reuse_idx.contains(&index),
            GM_BUF_TYPE_WEIGHT => self.weight_idx.contains(&index),
            _ => false,
        }
    }

    /// Whether the grid-init record must program the GM remap.
    pub fn need_remap(&self) -> bool {
        self.active
    }

    /// Carve reuse buffer `index` out of the GM window.
    pub fn gm_malloc(
        &mut self,
        mem: &MemoryManager,
        index: u32,
        size: u64,
        name: &str,
    ) -> Result<BufferDesc> {
        let buf = mem.gm_alloc(size, name)?;
        if self.gm_buf_base == 0 {
            self.gm_buf_base = buf.pa;
        }
        if self.sync_inputs.contains(&index) {
            self.gm_buf_sync_size += size;
        }
        Ok(buf)
    }
}
