//! Renderer configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Per-shader capacity limits.
///
/// Shaders copy these at creation and may override them individually.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShaderLimits {
    pub max_stages: usize,
    pub max_uniforms: usize,
    pub max_global_textures: usize,
    pub max_instance_textures: usize,
    pub max_instances: usize,
    pub max_push_constant_ranges: usize,
    pub max_push_constant_bytes: u32,
}

impl Default for ShaderLimits {
    fn default() -> Self {
        Self {
            max_stages: 8,
            max_uniforms: 128,
            max_global_textures: 31,
            max_instance_textures: 31,
            max_instances: 1024,
            max_push_constant_ranges: kohi_gpu::pipeline::MAX_PUSH_CONSTANT_RANGES,
            max_push_constant_bytes: kohi_gpu::pipeline::MAX_PUSH_CONSTANT_BYTES,
        }
    }
}

/// Renderer configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    pub app_name: String,
    /// Enable Vulkan validation layers.
    pub validation: bool,
    pub vsync: bool,
    pub max_frames_in_flight: usize,
    /// Directory compiled shaders and other assets are loaded from.
    pub asset_root: PathBuf,
    pub clear_colour: [f32; 4],
    pub shader_limits: ShaderLimits,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            app_name: "Kohi".to_string(),
            validation: cfg!(debug_assertions),
            vsync: true,
            max_frames_in_flight: 2,
            asset_root: PathBuf::from(kohi_core::constants::DEFAULT_ASSET_ROOT),
            clear_colour: [0.0, 0.0, 0.2, 1.0],
            shader_limits: ShaderLimits::default(),
        }
    }
}

impl RendererConfig {
    /// Create a config for the named application.
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            ..Default::default()
        }
    }

    /// Enable or disable validation layers.
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    /// Enable or disable vsync.
    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    /// Set the number of frames that may be in flight, clamped to at least one.
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.max_frames_in_flight = frames.max(1);
        self
    }

    /// Set the asset root directory.
    pub fn with_asset_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.asset_root = root.into();
        self
    }

    /// Set the world pass clear colour.
    pub fn with_clear_colour(mut self, colour: [f32; 4]) -> Self {
        self.clear_colour = colour;
        self
    }

    /// Replace the default shader limits.
    pub fn with_shader_limits(mut self, limits: ShaderLimits) -> Self {
        self.shader_limits = limits;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RendererConfig::default();
        assert_eq!(config.max_frames_in_flight, 2);
        assert_eq!(config.asset_root, PathBuf::from("assets"));
        assert_eq!(config.shader_limits.max_instances, 1024);
        assert_eq!(config.shader_limits.max_push_constant_ranges, 32);
        assert_eq!(config.shader_limits.max_push_constant_bytes, 128);
    }

    #[test]
    fn frames_in_flight_never_zero() {
        let config = RendererConfig::new("test").with_frames_in_flight(0);
        assert_eq!(config.max_frames_in_flight, 1);
    }
}
