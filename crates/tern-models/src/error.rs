//! Error types for graph parsing

use thiserror::Error;

/// Result type alias for graph parsing operations
pub type Result<T> = std::result::Result<T, GraphError>;

/// Errors produced while reading or parsing a graph binary
#[derive(Debug, Error)]
pub enum GraphError {
    /// The file is neither a TNPUBIN nor an ELF loadable
    #[error("Unknown binary format")]
    UnknownBinary,

    /// The file claims a container we recognize but its contents are corrupt
    #[error("Invalid graph binary: {reason}")]
    InvalidBinary {
        /// What check failed
        reason: String,
    },

    /// Graph format version not supported by this driver
    #[error("Unsupported graph version: {version}")]
    UnsupportedVersion {
        /// Version found in the header
        version: u32,
    },

    /// A sub-section declared a tensor type code we do not know
    #[error("Invalid tensor type code: {kind}")]
    InvalidTensorType {
        /// Raw type code
        kind: u32,
    },
}

impl GraphError {
    /// Create an invalid-binary error
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidBinary {
            reason: reason.into(),
        }
    }
}
