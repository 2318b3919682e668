//! Device-resident graph state.
//!
//! A [`LoadedGraph`] owns the working set loaded once per graph and
//! shared by every job created from it: the text image (with two
//! debugger tail words reserved) and, per BSS bucket, the weight buffer
//! with one view per static section plus the optional zero-copy const
//! buffer. Weight buffers live in ASID1; each bucket gets its own base
//! so multi-bucket graphs see a private weight window.

use crate::device::Device;
use crate::error::{Result, UmdError};
use crate::job::{Job, JobConfig};
use crate::memory::{BufferDesc, MemRegion, MemoryManager};
use std::sync::Arc;
use tern_models::{Graph, SectionType};

/// Weight-side buffers of one BSS bucket.
#[derive(Debug)]
pub struct WeightBufferInfo {
    /// The bucket's combined weight buffer.
    pub wb_weight: Option<BufferDesc>,
    /// The bucket's zero-copy const buffer, if any.
    pub wb_zerocpy_const: Option<BufferDesc>,
    /// One view per static section, in slot order.
    pub wb_weights: Vec<BufferDesc>,
    /// ASID1 window base the bucket's group-init records program.
    pub wb_asid_base: u64,
}

/// A graph loaded into device memory.
#[derive(Debug)]
pub struct LoadedGraph {
    graph: Graph,
    mem: Arc<MemoryManager>,
    text: BufferDesc,
    weights: Vec<WeightBufferInfo>,
    /// Static-section views flattened across buckets, in the global
    /// static-buffer index order the relocation map uses.
    static_views: Vec<BufferDesc>,
}

impl LoadedGraph {
    /// Load a parsed graph into device memory.
    ///
    /// # Errors
    ///
    /// `BufferAllocFailed` when the weight or text windows are
    /// exhausted.
    pub fn load(mem: &Arc<MemoryManager>, graph: Graph) -> Result<Arc<Self>> {
        // two tail words after the text image carry the aligned text/ro
        // bases for the debugger
        let text_size = graph.text.len() as u64 + 8;
        let text = mem.alloc(text_size, 0, "text", MemRegion::Asid0)?;
        if !graph.text.is_empty() {
            mem.write(text.pa, &graph.text)?;
        }

        let mut weights = Vec::with_capacity(graph.bss.len());
        let mut static_views = Vec::new();
        for bss in &graph.bss {
            let wb_weight = mem.alloc(
                u64::from(bss.const_size),
                0,
                &format!("weight{}", bss.id),
                MemRegion::Asid1,
            )?;
            let wb_zerocpy_const = if bss.zerocpy_const_size > 0 {
                Some(mem.alloc(
                    u64::from(bss.zerocpy_const_size),
                    0,
                    &format!("zerocpy_const{}", bss.id),
                    MemRegion::Asid1,
                )?)
            } else {
                None
            };

            let mut wb_weights = Vec::with_capacity(bss.static_sections.len());
            for section in &bss.static_sections {
                let parent = if section.sec_type == SectionType::ZeroCopyConstant {
                    wb_zerocpy_const.as_ref().ok_or_else(|| {
                        UmdError::invalid_bin("zero-copy section without zero-copy bucket")
                    })?
                } else {
                    &wb_weight
                };
                let view = parent.view(
                    u64::from(section.relative_addr),
                    u64::from(section.size),
                    format!("static_{}_{}", bss.id, section.slot_index),
                );
                if let Some(src) = &section.load_src {
                    mem.write(view.pa, src)?;
                }
                wb_weights.push(view.clone());
                static_views.push(view);
            }

            weights.push(WeightBufferInfo {
                wb_asid_base: wb_weight.pa,
                wb_weight: Some(wb_weight),
                wb_zerocpy_const,
                wb_weights,
            });
        }

        tracing::info!(
            "graph loaded: text {:#x} bytes, {} weight bucket(s)",
            text.req_size,
            weights.len()
        );

        Ok(Arc::new(Self {
            graph,
            mem: Arc::clone(mem),
            text,
            weights,
            static_views,
        }))
    }

    /// The parsed graph.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// The memory manager this graph was loaded through.
    pub fn mem(&self) -> &Arc<MemoryManager> {
        &self.mem
    }

    /// Device-resident text buffer.
    pub fn text(&self) -> &BufferDesc {
        &self.text
    }

    /// Length of the text image (excluding the debugger tail words).
    pub fn text_len(&self) -> u64 {
        self.graph.text.len() as u64
    }

    /// Weight buffers of one bucket.
    pub fn weight_info(&self, bss_idx: u32) -> &WeightBufferInfo {
        &self.weights[bss_idx as usize]
    }

    /// Static views in global static-buffer index order.
    pub fn static_views(&self) -> &[BufferDesc] {
        &self.static_views
    }

    /// The const-rodata pointer of a bucket (`cp` in task records).
    pub fn crodata(&self, bss_idx: u32) -> Option<&BufferDesc> {
        self.weights
            .get(bss_idx as usize)
            .and_then(|w| w.wb_zerocpy_const.as_ref())
    }

    /// Create a job over this graph.
    ///
    /// # Errors
    ///
    /// `TargetNotFound` when the device cannot execute this graph's
    /// target.
    pub fn create_job(
        self: &Arc<Self>,
        dev: &Arc<dyn Device>,
        config: JobConfig,
    ) -> Result<Job> {
        let g = &self.graph;
        if !dev.has_target(g.arch, g.isa_version, g.config, g.revision) {
            return Err(UmdError::TargetNotFound {
                reason: format!(
                    "graph targets arch {} v{} config {} rev {}",
                    g.arch, g.isa_version, g.config, g.revision
                ),
            });
        }
        Ok(Job::new(Arc::clone(self), Arc::clone(dev), config))
    }
}

impl Drop for LoadedGraph {
    fn drop(&mut self) {
        let _ = self.mem.release(&self.text);
        for w in &self.weights {
            if let Some(b) = &w.wb_weight {
                let _ = self.mem.release(b);
            }
            if let Some(b) = &w.wb_zerocpy_const {
                let _ = self.mem.release(b);
            }
        }
    }
}
