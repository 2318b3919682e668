//! Error types for driver operations

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, UmdError>;

/// Errors that can occur while building, scheduling or tearing down jobs
#[derive(Debug, Error)]
pub enum UmdError {
    /// Graph parsing failed
    #[error(transparent)]
    Graph(#[from] tern_models::GraphError),

    /// The graph binary is structurally valid but semantically corrupt
    /// for job construction (bad precursors, dangling indexes, ...)
    #[error("Invalid graph binary: {reason}")]
    InvalidBinary {
        /// What check failed
        reason: String,
    },

    /// Tensor index out of range for its list
    #[error("Invalid tensor id {index} (have {count})")]
    InvalidTensorId {
        /// Requested index
        index: u32,
        /// Number of tensors in the list
        count: u32,
    },

    /// Partition index out of range
    #[error("Invalid partition id {id} (have {count})")]
    InvalidPartitionId {
        /// Requested partition
        id: u32,
        /// Number of partitions
        count: u32,
    },

    /// Operation not permitted in the current state
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Why the operation is rejected
        reason: String,
    },

    /// Dynamic-shape input has no configured shape
    #[error("Input shape {input} is not configured")]
    ShapeNotConfigured {
        /// Input tensor index
        input: u32,
    },

    /// Output-shape tensor count does not match the output tensor count
    #[error("Dynamic output shape count {got} != output tensor count {expected}")]
    OutputShapeMismatch {
        /// Output-shape tensors found
        got: u32,
        /// Output tensors declared
        expected: u32,
    },

    /// A discovered dynamic output has zero elements
    #[error("Dynamic output {tensor} has zero size")]
    ZeroTensorSize {
        /// Output tensor index
        tensor: u32,
    },

    /// The dma-buf target reuse section backs both an input and an output
    #[error("Reuse section {reuse_index} is shared between input and output")]
    DmabufSharedIo {
        /// Offending reuse section index
        reuse_index: u32,
    },

    /// Device memory exhausted
    #[error("Buffer allocation failed: {name} ({size:#x} bytes)")]
    BufferAllocFailed {
        /// Buffer debug name
        name: String,
        /// Requested size
        size: u64,
    },

    /// Grid id space exhausted
    #[error("Grid id allocation failed")]
    GridIdExhausted,

    /// No contiguous group-id run of the requested length
    #[error("Group id allocation failed for run of {requested}")]
    GroupIdExhausted {
        /// Requested run length
        requested: u32,
    },

    /// No device matches the graph's target
    #[error("Target not found: {reason}")]
    TargetNotFound {
        /// What was requested
        reason: String,
    },

    /// The device reported an exception for this job
    #[error("Job exception on grid {grid_id}")]
    JobException {
        /// Grid id of the failed job
        grid_id: u16,
    },

    /// Dynamic input shapes were required but not (fully) supplied
    #[error("Setting input shapes failed: {reason}")]
    SetShapeFailed {
        /// What is missing
        reason: String,
    },

    /// A dump file could not be created
    #[error("Failed to open {path}: {source}")]
    OpenFileFailed {
        /// Target path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// Poll deadline elapsed; job state is unchanged
    #[error("Timed out after {timeout_ms}ms")]
    Timeout {
        /// Requested timeout
        timeout_ms: i64,
    },

    /// I/O error talking to the device node
    #[error("I/O error: {source}")]
    Io {
        /// Underlying error
        #[from]
        source: std::io::Error,
    },
}

impl UmdError {
    /// Create an invalid-binary error
    pub fn invalid_bin(reason: impl Into<String>) -> Self {
        Self::InvalidBinary {
            reason: reason.into(),
        }
    }

    /// Create an invalid-operation error
    pub fn invalid_op(reason: impl Into<String>) -> Self {
        Self::InvalidOperation {
            reason: reason.into(),
        }
    }

    /// Create a buffer-allocation error
    pub fn alloc_fail(name: impl Into<String>, size: u64) -> Self {
        Self::BufferAllocFailed {
            name: name.into(),
            size,
        }
    }
}
