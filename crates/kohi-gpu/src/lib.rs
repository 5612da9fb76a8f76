//! Vulkan layer for the Kohi engine.
//!
//! This crate provides:
//! - Vulkan instance, device and queue setup
//! - GPU capability detection and memory-type selection
//! - Buffers with freelist sub-allocation
//! - Renderpasses and graphics pipelines
//! - Command buffer state tracking and frame synchronization
//! - Surface and swapchain handling

pub mod buffer;
pub mod capabilities;
pub mod command;
pub mod context;
pub mod deferred;
pub mod descriptors;
pub mod error;
pub mod freelist;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod renderpass;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use ash;

pub use buffer::{Buffer, BufferDesc};
pub use capabilities::{find_memory_type_index, GpuCapabilities, GpuVendor};
pub use command::{CommandBuffer, CommandBufferState, CommandPool};
pub use context::{GpuContext, GpuContextBuilder};
pub use deferred::DeferredQueue;
pub use descriptors::{
    write_combined_image_samplers, write_uniform_buffer, DescriptorPool,
    DescriptorSetLayoutBuilder,
};
pub use error::{GpuError, Result};
pub use freelist::Freelist;
pub use memory::{create_image_view, GpuAllocator, GpuImage};
pub use pipeline::{CullMode, GraphicsPipeline, GraphicsPipelineConfig, PipelineStage, VertexAttribute};
pub use renderpass::{Renderpass, RenderpassClearFlags, RenderpassConfig};
pub use surface::{SurfaceCapabilities, SurfaceContext};
pub use swapchain::{AcquireOutcome, PresentOutcome, Swapchain};
pub use sync::{create_fence, create_semaphore, FrameSync};
