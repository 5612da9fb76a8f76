//! Renderer error types.

use kohi_gpu::GpuError;
use thiserror::Error;

use crate::shader::ShaderState;

/// Renderer errors.
#[derive(Error, Debug)]
pub enum RendererError {
    /// An operation was attempted in the wrong shader state.
    #[error("Shader '{shader}' is {actual:?}, operation requires {expected:?}")]
    InvalidState {
        shader: String,
        expected: ShaderState,
        actual: ShaderState,
    },

    /// A uniform with this name was already declared.
    #[error("Uniform '{0}' already exists")]
    DuplicateUniform(String),

    /// Uniform names must be non-empty.
    #[error("Invalid uniform name '{0}'")]
    InvalidUniformName(String),

    /// The shader already declares the maximum number of uniforms.
    #[error("Uniform capacity of {0} reached")]
    UniformCapacityExceeded(usize),

    /// Initialization needs at least one stage.
    #[error("Shader '{0}' declares no stages")]
    NoStages(String),

    /// The shader already declares the maximum number of stages.
    #[error("Stage capacity of {0} reached")]
    StageCapacityExceeded(usize),

    /// Too many samplers at one scope.
    #[error("Texture capacity of {max} reached at {scope} scope")]
    TextureCapacityExceeded { scope: &'static str, max: usize },

    /// Local uniforms were declared on a shader without push constant support.
    #[error("Shader '{0}' does not use local uniforms")]
    LocalsNotSupported(String),

    /// Instance uniforms were declared on a shader without instance support.
    #[error("Shader '{0}' does not use instances")]
    InstancesNotSupported(String),

    /// Samplers cannot be push constants.
    #[error("Sampler '{0}' cannot be declared at local scope")]
    SamplerAtLocalScope(String),

    /// Push constants would exceed the portable limits.
    #[error("Push constant limit exceeded: {0}")]
    PushConstantLimit(String),

    /// No uniform with this name or location.
    #[error("Unknown uniform '{0}'")]
    UnknownUniform(String),

    /// The value written does not match the declared size.
    #[error("Uniform '{name}' is {expected} bytes, got {actual}")]
    UniformSizeMismatch {
        name: String,
        expected: u32,
        actual: usize,
    },

    /// A sampler was set through the value path or vice versa.
    #[error("Uniform '{0}' has the wrong kind for this operation")]
    UniformKindMismatch(String),

    /// Every instance slot is in use.
    #[error("Instance capacity of {0} exceeded")]
    InstanceCapacityExceeded(usize),

    /// The uniform buffer has no room for another instance region.
    #[error("Out of uniform buffer space")]
    OutOfUniformSpace,

    /// No live instance with this id.
    #[error("Unknown instance {0}")]
    UnknownInstance(u32),

    /// No instance is bound.
    #[error("No instance bound")]
    NoInstanceBound,

    /// A compiled stage binary could not be loaded.
    #[error("Failed to load shader module '{path}': {source}")]
    ShaderModuleLoadFailed {
        path: String,
        #[source]
        source: kohi_core::Error,
    },

    /// Frame protocol violated (e.g. `end_frame` without `begin_frame`).
    #[error("Frame state error: {0}")]
    FrameState(String),

    /// GPU error.
    #[error(transparent)]
    Gpu(#[from] GpuError),

    /// Core error.
    #[error(transparent)]
    Core(#[from] kohi_core::Error),
}

impl From<ash::vk::Result> for RendererError {
    fn from(result: ash::vk::Result) -> Self {
        Self::Gpu(GpuError::Vulkan(result))
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, RendererError>;
