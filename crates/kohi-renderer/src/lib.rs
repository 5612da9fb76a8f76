//! Vulkan rendering backend for the Kohi engine.
//!
//! This crate provides:
//! - Shader objects with global, instance and local uniform scopes
//! - The frame loop (acquire, record, submit, present, swapchain recreation)
//! - Builtin world and UI renderpasses
//! - Texture bindings and the fallback texture

pub mod backend;
pub mod config;
pub mod error;
pub mod frame;
pub mod presenter;
pub mod shader;
pub mod texture;

pub use backend::RendererBackend;
pub use config::{RendererConfig, ShaderLimits};
pub use error::{RendererError, Result};
pub use frame::{FrameContext, FrameDevice, FrameLoop, FramePhase, FrameStatus};
pub use presenter::{BuiltinRenderpass, PresenterFrame, SwapchainPresenter};
pub use shader::{
    AttributeType, Scope, Shader, ShaderConfig, ShaderInitContext, ShaderStage, ShaderState,
    UniformHandle, UniformType,
};
pub use texture::{DefaultTexture, TextureBinding, DEFAULT_TEXTURE_ID};
