//! GPU error types.

use ash::vk;
use thiserror::Error;

/// Errors reported by the device layer and everything built on it.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// A named Vulkan call failed.
    #[error("{call} failed: {result}")]
    VulkanCall {
        call: &'static str,
        result: vk::Result,
    },

    /// The device was lost. Every object created from it must be rebuilt.
    #[error("Device lost")]
    DeviceLost,

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Shader compilation failed.
    #[error("Shader compilation failed: {0}")]
    ShaderCompilation(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The caller broke an ordering or ownership rule.
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    /// A fixed-size pool has nothing left to hand out.
    #[error("{what} exhausted: requested {requested}, {available} available")]
    PoolExhausted {
        what: &'static str,
        requested: usize,
        available: usize,
    },

    /// A single transfer was larger than one staging buffer.
    #[error("Transfer of {bytes} bytes exceeds the {max} byte staging limit")]
    TransferTooLarge { bytes: u64, max: u64 },

    /// A bounded wait ran out of time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl GpuError {
    /// Wrap the result of a named Vulkan call.
    pub fn vulkan(call: &'static str, result: vk::Result) -> Self {
        if result == vk::Result::ERROR_DEVICE_LOST {
            Self::DeviceLost
        } else {
            Self::VulkanCall { call, result }
        }
    }

    /// Whether the caller can wait, poll or grow a pool and try again.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. } | Self::Timeout(_))
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
