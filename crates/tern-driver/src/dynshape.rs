//! Dynamic-shape helper.
//!
//! Before submission the configured input shapes are written into the
//! job's model-global-param copy; after completion the real output
//! sizes are read back from the output-shape tensors and folded into
//! the job's output descriptors. The discovery is idempotent per job,
//! and partial results are cleared on failure so a retry starts clean.

use crate::error::{Result, UmdError};
use crate::memory::MemoryManager;
use tern_models::DataType;

/// Per-job dynamic-shape state.
#[derive(Debug)]
pub struct DynamicShape {
    shapes: Vec<Vec<u32>>,
    out_sizes: Vec<u64>,
    updated: bool,
}

impl DynamicShape {
    /// Capture the user-configured input shapes (one entry per input;
    /// an empty dimension list means "not configured").
    pub fn new(shapes: Vec<Vec<u32>>) -> Self {
        Self {
            shapes,
            out_sizes: Vec::new(),
            updated: false,
        }
    }

    /// Number of configured input shapes.
    pub fn config_shape_cnt(&self) -> usize {
        self.shapes.len()
    }

    /// Whether every declared input carries a shape.
    pub fn fully_configured(&self, input_cnt: usize) -> bool {
        self.shapes.len() == input_cnt && self.shapes.iter().all(|s| !s.is_empty())
    }

    /// Write each configured dimension into the model-global-param
    /// buffer starting at `shape_pa` (`input_shape_offset` resolved by
    /// the caller).
    ///
    /// # Errors
    ///
    /// `ShapeNotConfigured` on the first input lacking a shape.
    pub fn patch_global_param(&self, mem: &MemoryManager, shape_pa: u64) -> Result<()> {
        let mut cursor = shape_pa;
        for (input_idx, shape) in self.shapes.iter().enumerate() {
            if shape.is_empty() {
                tracing::error!("input shape {input_idx} is not configured");
                return Err(UmdError::ShapeNotConfigured {
                    input: input_idx as u32,
                });
            }
            for &dim in shape {
                mem.write_u32(cursor, dim)?;
                cursor += 4;
            }
        }
        Ok(())
    }

    /// Whether output sizes have already been discovered for this run.
    pub fn outputs_updated(&self) -> bool {
        self.updated
    }

    /// Fold a completed run's output-shape tensors into byte sizes:
    /// `Π dims × bytes_per_element`. Each entry of `shape_views` is the
    /// device placement `(pa, size)` of one output-shape tensor, and
    /// `out_dtypes` the matching output element types.
    ///
    /// # Errors
    ///
    /// `ZeroTensorSize` when a dimension product is zero; partial
    /// results are discarded.
    pub fn discover_output_sizes(
        &mut self,
        mem: &MemoryManager,
        shape_views: &[(u64, u64)],
        out_dtypes: &[DataType],
    ) -> Result<&[u64]> {
        if self.updated {
            return Ok(&self.out_sizes);
        }
        if shape_views.len() != out_dtypes.len() {
            return Err(UmdError::OutputShapeMismatch {
                got: shape_views.len() as u32,
                expected: out_dtypes.len() as u32,
            });
        }

        for (i, &(pa, size)) in shape_views.iter().enumerate() {
            let raw = mem.read_vec(pa, size)?;
            let mut elements = 1u64;
            for dims in raw.chunks_exact(4) {
                elements *= u64::from(u32::from_le_bytes([dims[0], dims[1], dims[2], dims[3]]));
            }
            if elements == 0 {
                self.out_sizes.clear();
                tracing::error!("dynamic output {i} resolved to zero elements");
                return Err(UmdError::ZeroTensorSize { tensor: i as u32 });
            }
            self.out_sizes.push(elements * out_dtypes[i].bytes_per_element());
        }

        self.updated = true;
        Ok(&self.out_sizes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemLayout, MemRegion, MemoryManager, RegionCfg};

    fn mem() -> std::sync::Arc<MemoryManager> {
        MemoryManager::new(MemLayout {
            regions: [
                RegionCfg {
                    base: 0x1000_0000,
                    size: 1 << 20,
                },
                RegionCfg { base: 0, size: 0 },
                RegionCfg { base: 0, size: 0 },
                RegionCfg { base: 0, size: 0 },
            ],
        })
    }

    #[test]
    fn patch_writes_dims_in_order() {
        let mem = mem();
        let buf = mem.alloc(0x1000, 0, "gp", MemRegion::Default).unwrap();
        let ds = DynamicShape::new(vec![vec![1, 3, 224, 224]]);
        ds.patch_global_param(&mem, buf.pa + 16).unwrap();
        assert_eq!(mem.read_u32(buf.pa + 16).unwrap(), 1);
        assert_eq!(mem.read_u32(buf.pa + 20).unwrap(), 3);
        assert_eq!(mem.read_u32(buf.pa + 28).unwrap(), 224);
    }

    #[test]
    fn unconfigured_shape_is_rejected() {
        let mem = mem();
        let ds = DynamicShape::new(vec![vec![1, 2], vec![]]);
        assert!(matches!(
            ds.patch_global_param(&mem, 0x1000_0000),
            Err(UmdError::ShapeNotConfigured { input: 1 })
        ));
    }

    #[test]
    fn byte_accounting_per_dtype() {
        let mem = mem();
        let buf = mem.alloc(0x1000, 0, "shape", MemRegion::Default).unwrap();
        mem.write_u32(buf.pa, 2).unwrap();
        mem.write_u32(buf.pa + 4, 10).unwrap();

        for (dtype, expect) in [
            (DataType::U8, 20u64),
            (DataType::F16, 40),
            (DataType::F32, 80),
        ] {
            let mut ds = DynamicShape::new(vec![vec![1]]);
            let sizes = ds
                .discover_output_sizes(&mem, &[(buf.pa, 8)], &[dtype])
                .unwrap();
            assert_eq!(sizes, &[expect]);
        }
    }

    #[test]
    fn zero_dim_clears_partials() {
        let mem = mem();
        let buf = mem.alloc(0x1000, 0, "shape", MemRegion::Default).unwrap();
        // first tensor fine, second has a zero dim
        mem.write_u32(buf.pa, 4).unwrap();
        mem.write_u32(buf.pa + 16, 0).unwrap();
        let mut ds = DynamicShape::new(vec![vec![1]]);
        let r = ds.discover_output_sizes(
            &mem,
            &[(buf.pa, 4), (buf.pa + 16, 4)],
            &[DataType::U8, DataType::U8],
        );
        assert!(matches!(r, Err(UmdError::ZeroTensorSize { tensor: 1 })));
        assert!(!ds.outputs_updated());
        assert!(ds.out_sizes.is_empty());
    }

    #[test]
    fn discovery_is_idempotent() {
        let mem = mem();
        let buf = mem.alloc(0x1000, 0, "shape", MemRegion::Default).unwrap();
        mem.write_u32(buf.pa, 5).unwrap();
        let mut ds = DynamicShape::new(vec![vec![1]]);
        ds.discover_output_sizes(&mem, &[(buf.pa, 4)], &[DataType::U8])
            .unwrap();
        // device memory changes after completion must not re-resolve
        mem.write_u32(buf.pa, 9).unwrap();
        let sizes = ds
            .discover_output_sizes(&mem, &[(buf.pa, 4)], &[DataType::U8])
            .unwrap();
        assert_eq!(sizes, &[5]);
    }

    #[test]
    fn shape_count_mismatch() {
        let mem = mem();
        let mut ds = DynamicShape::new(vec![vec![1]]);
        let r = ds.discover_output_sizes(&mem, &[(0, 4)], &[DataType::U8, DataType::U8]);
        assert!(matches!(r, Err(UmdError::OutputShapeMismatch { .. })));
    }
}
