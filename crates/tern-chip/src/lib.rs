//! Hardware definitions for the Tern NPU v3.1.
//!
//! Everything in this crate is a direct transcription of the v3.1
//! programming model: the 128-byte task-control-block record the TSM
//! consumes, the command-pool register map, and the packed device word
//! carried in graph binaries. No I/O happens here; the driver crate
//! decides where these bits go.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod arch;
pub mod regs;
pub mod tcb;

pub use arch::{hi, lo, ARCH_TERN, ISA_V3_1, PAGE_SIZE};
pub use tcb::{GridInitTcb, GroupInitTcb, TaskTcb, Tcb, TCB_SIZE};
