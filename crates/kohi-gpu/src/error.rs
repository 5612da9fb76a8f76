//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
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

    /// No memory type satisfies both the resource requirements and the requested properties.
    #[error("No suitable memory type for properties {0:?}")]
    NoSuitableMemoryType(vk::MemoryPropertyFlags),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Sub-allocation was requested from a buffer created without a freelist.
    #[error("Buffer was not created with a freelist")]
    BufferHasNoFreelist,

    /// A freelist has no contiguous range large enough.
    #[error("Out of space: requested {requested} bytes, largest free block is {largest_free} bytes")]
    OutOfSpace { requested: u64, largest_free: u64 },

    /// A range handed back to a freelist was never allocated (or already freed).
    #[error("Invalid free of {size} bytes at offset {offset}")]
    InvalidFree { offset: u64, size: u64 },

    /// A write or read fell outside of the buffer.
    #[error("Range {offset}..{end} is out of bounds for a buffer of {size} bytes")]
    OutOfBounds { offset: u64, end: u64, size: u64 },

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// Shader compilation failed.
    #[error("Shader compilation failed: {0}")]
    ShaderCompilation(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Push constant configuration exceeds what the pipeline builder accepts.
    #[error("Push constant limit exceeded: {0}")]
    PushConstantLimit(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
