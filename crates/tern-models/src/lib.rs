//! Graph binary handling for the Tern NPU v3.1.
//!
//! A compiler-produced loadable (TNPUBIN or ELF container) is parsed
//! into a normalized [`Graph`]: typed section views, BSS bucket tables,
//! I/O tensor descriptors, parameter-relocation entries and the
//! subgraph chain. The driver crate turns a `Graph` into device-resident
//! state and jobs; nothing in this crate touches the device.
//!
//! ```no_run
//! use tern_models::Graph;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let bytes = std::fs::read("model.tbin")?;
//! let graph = Graph::parse(bytes)?;
//! println!(
//!     "config {}: {} subgraphs, {} inputs, {} outputs",
//!     graph.config,
//!     graph.subgraph_cnt(),
//!     graph.io.inputs.len(),
//!     graph.io.outputs.len()
//! );
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bss;
mod error;
pub mod format;
pub mod notes;
pub mod reader;
pub mod section;

mod graph;

pub use error::{GraphError, Result};
pub use graph::Graph;
pub use section::{
    Bss, BssBufferIndex, DataType, GmConfig, IoTensorDesc, IoTensors, ModelGlobalParam,
    ParamReloc, RelocLoadType, RemapEntry, SectionDesc, SectionType, SegMmuConfig, Subgraph,
    SubgraphSection, GM_BUF_TYPE_REUSE, GM_BUF_TYPE_WEIGHT, PRE_ALL,
};
