//! GPU error types.

use ash::vk;
use thiserror::Error;

/// Device-level errors.
///
/// Variants produced by program compilation and linking keep the device's
/// diagnostic log so the caller can surface it.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Transfer touching bytes outside of any live allocation.
    #[error("Out of bounds access: {len} bytes at {address:#x}")]
    OutOfBounds { address: u64, len: usize },

    /// Device program blob could not be turned into a module.
    #[error("Module compilation failed: {message}\n{log}")]
    ModuleCompilation { message: String, log: String },

    /// Program group creation failed.
    #[error("Program group creation failed: {message}\n{log}")]
    ProgramGroupCreation { message: String, log: String },

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {message}\n{log}")]
    PipelineCreation { message: String, log: String },

    /// Acceleration structure build or compaction failed.
    #[error("Acceleration structure build failed: {0}")]
    AccelBuild(String),

    /// Launch rejected or failed during execution.
    #[error("Launch failed: {0}")]
    Launch(String),

    /// Dispatch record layout disagrees with the device.
    #[error("Record layout mismatch: {0}")]
    RecordLayout(String),

    /// Handle not created by this device or already destroyed.
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl GpuError {
    /// Device diagnostic log attached to this error, if any.
    #[must_use]
    pub fn log(&self) -> Option<&str> {
        match self {
            Self::ModuleCompilation { log, .. }
            | Self::ProgramGroupCreation { log, .. }
            | Self::PipelineCreation { log, .. } => Some(log),
            _ => None,
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
