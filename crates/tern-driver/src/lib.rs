//! User-mode driver for the Tern NPU v3.1.
//!
//! The driver loads a compiler-produced graph binary, allocates and
//! populates device-visible memory, builds the TCB chain encoding the
//! graph's dataflow dependencies, submits it to a real device or the
//! in-process simulator, and reports completion per job.
//!
//! # Back end hierarchy
//!
//! ```text
//! Production:
//!   KernelDevice — /dev/tern-npu* ioctl surface
//!
//! Development / CI:
//!   SimDevice    — in-process instruction simulator, no hardware
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tern_driver::prelude::*;
//!
//! # fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! let dev: Arc<dyn Device> = SimDevice::new(SimConfig::default())?;
//! let graph = tern_models::Graph::parse(std::fs::read("model.tbin")?)?;
//! let loaded = LoadedGraph::load(dev.mem(), graph)?;
//!
//! let mut job = loaded.create_job(&dev, JobConfig::default())?;
//! job.init()?;
//! job.write_input(0, &[0u8; 1024])?;
//! job.schedule()?;
//! job.wait(-1)?;
//! let mut out = vec![0u8; job.output(0)?.size as usize];
//! job.read_output(0, &mut out)?;
//! job.destroy()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod device;
pub mod dump;
mod dynshape;
mod error;
mod gm;
mod job;
mod loading;
pub mod memory;

pub use device::kernel::KernelDevice;
pub use device::simulator::{SimConfig, SimDevice};
pub use device::{
    Device, DmaBufInfo, IoctlCmd, IoctlReply, JobDesc, PollOutcome, PoolMode, QosLevel,
    MAX_GROUP_ID,
};
pub use dump::{dump_combined, DumpConfig};
pub use dynshape::DynamicShape;
pub use error::{Result, UmdError};
pub use gm::GmHelper;
pub use job::{
    Job, JobConfig, JobIoBuffer, JobState, ShareCase, SharedTensorInfo, TensorKind, WaitStatus,
    TASK_PER_SUBGRAPH,
};
pub use loading::{LoadedGraph, WeightBufferInfo};
pub use memory::{BufferDesc, MemLayout, MemRegion, MemoryManager, RegionCfg, ASID_MAX};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        Device, DumpConfig, Job, JobConfig, JobState, LoadedGraph, MemRegion, MemoryManager,
        QosLevel, Result, ShareCase, SharedTensorInfo, SimConfig, SimDevice, TensorKind, UmdError,
        WaitStatus,
    };
}
