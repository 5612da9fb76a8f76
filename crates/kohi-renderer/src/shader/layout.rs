//! Shader declarations and uniform buffer layout.
//!
//! [`ShaderLayout`] holds everything declared about a shader before it touches
//! the device: stages, vertex attributes and the uniform table. It also computes
//! the aligned region sizes the uniform buffer is built from.

use ash::vk;
use hashbrown::HashMap;
use kohi_core::{align_up, aligned_range, AlignedRange};
use kohi_gpu::CullMode;

use crate::config::ShaderLimits;
use crate::error::{RendererError, Result};

use super::types::{Attribute, AttributeType, Scope, ShaderStage, Uniform, UniformHandle, UniformType};

/// Push constant ranges and offsets are 4-byte aligned.
const PUSH_CONSTANT_ALIGNMENT: u64 = 4;

/// Uniform handles and locations are 16-bit, which caps any configured limit.
const MAX_UNIFORM_SLOTS: usize = u16::MAX as usize + 1;

/// Lifecycle of a shader.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ShaderState {
    /// Destroyed, or never created.
    #[default]
    NotCreated,
    /// Accepting declarations.
    Uninitialized,
    /// Device resources built; declarations are frozen.
    Initialized,
}

/// Creation parameters for a shader.
#[derive(Clone, Debug)]
pub struct ShaderConfig {
    pub name: String,
    /// Enable the instance descriptor set and per-instance uniform regions.
    pub use_instances: bool,
    /// Enable push-constant (local) uniforms.
    pub use_locals: bool,
    pub cull_mode: CullMode,
    pub wireframe: bool,
    pub depth_test: bool,
    pub limits: ShaderLimits,
}

impl ShaderConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            use_instances: false,
            use_locals: false,
            cull_mode: CullMode::Back,
            wireframe: false,
            depth_test: true,
            limits: ShaderLimits::default(),
        }
    }

    pub fn with_instances(mut self, enabled: bool) -> Self {
        self.use_instances = enabled;
        self
    }

    pub fn with_locals(mut self, enabled: bool) -> Self {
        self.use_locals = enabled;
        self
    }

    pub fn with_cull_mode(mut self, cull_mode: CullMode) -> Self {
        self.cull_mode = cull_mode;
        self
    }

    pub fn with_wireframe(mut self, wireframe: bool) -> Self {
        self.wireframe = wireframe;
        self
    }

    pub fn with_depth_test(mut self, depth_test: bool) -> Self {
        self.depth_test = depth_test;
        self
    }

    pub fn with_limits(mut self, limits: ShaderLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// Aligned sizes of the uniform buffer regions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UboLayout {
    pub global_stride: u64,
    /// Zero when instances are disabled.
    pub instance_stride: u64,
    pub max_instances: u64,
}

impl UboLayout {
    /// Bytes needed for the global region plus every instance region.
    pub const fn total_size(&self) -> u64 {
        self.global_stride + self.instance_stride * self.max_instances
    }
}

/// A descriptor set the shader needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetLayoutDesc {
    pub scope: Scope,
    /// Whether binding 0 (the uniform buffer region) is present.
    pub has_ubo: bool,
    /// Length of the sampler array at binding 1; zero means no sampler binding.
    pub sampler_count: u32,
}

/// Declared stages, attributes and uniforms of a shader.
#[derive(Clone, Debug)]
pub struct ShaderLayout {
    config: ShaderConfig,
    state: ShaderState,
    stages: Vec<ShaderStage>,
    attributes: Vec<Attribute>,
    attribute_stride: u32,
    uniforms: Vec<Uniform>,
    lookup: HashMap<String, UniformHandle>,
    global_ubo_size: u64,
    ubo_size: u64,
    push_constant_size: u64,
    push_constant_ranges: Vec<AlignedRange>,
    global_texture_count: usize,
    instance_texture_count: usize,
}

impl ShaderLayout {
    /// Start declaring a shader.
    pub fn new(config: ShaderConfig) -> Self {
        Self {
            config,
            state: ShaderState::Uninitialized,
            stages: Vec::new(),
            attributes: Vec::new(),
            attribute_stride: 0,
            uniforms: Vec::new(),
            lookup: HashMap::new(),
            global_ubo_size: 0,
            ubo_size: 0,
            push_constant_size: 0,
            push_constant_ranges: Vec::new(),
            global_texture_count: 0,
            instance_texture_count: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ShaderConfig {
        &self.config
    }

    pub fn state(&self) -> ShaderState {
        self.state
    }

    pub fn stages(&self) -> &[ShaderStage] {
        &self.stages
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// Sum of all attribute sizes, in declaration order.
    pub fn attribute_stride(&self) -> u32 {
        self.attribute_stride
    }

    pub fn uniforms(&self) -> &[Uniform] {
        &self.uniforms
    }

    /// Bytes of global uniforms before alignment.
    pub fn global_ubo_size(&self) -> u64 {
        self.global_ubo_size
    }

    /// Bytes of instance uniforms before alignment.
    pub fn ubo_size(&self) -> u64 {
        self.ubo_size
    }

    pub fn push_constant_size(&self) -> u64 {
        self.push_constant_size
    }

    pub fn push_constant_ranges(&self) -> &[AlignedRange] {
        &self.push_constant_ranges
    }

    pub fn global_texture_count(&self) -> usize {
        self.global_texture_count
    }

    pub fn instance_texture_count(&self) -> usize {
        self.instance_texture_count
    }

    /// Fail unless the shader is in `expected` state.
    pub fn require_state(&self, expected: ShaderState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(RendererError::InvalidState {
                shader: self.config.name.clone(),
                expected,
                actual: self.state,
            })
        }
    }

    pub(crate) fn set_state(&mut self, state: ShaderState) {
        self.state = state;
    }

    /// Declare a stage. Stages are loaded in declaration order.
    pub fn add_stage(&mut self, stage: ShaderStage) -> Result<()> {
        self.require_state(ShaderState::Uninitialized)?;
        if self.stages.len() >= self.config.limits.max_stages {
            return Err(RendererError::StageCapacityExceeded(
                self.config.limits.max_stages,
            ));
        }
        if !self.stages.contains(&stage) {
            self.stages.push(stage);
        }
        Ok(())
    }

    /// Declare the next vertex attribute.
    pub fn add_attribute(&mut self, name: impl Into<String>, ty: AttributeType) -> Result<()> {
        self.require_state(ShaderState::Uninitialized)?;
        self.attributes.push(Attribute {
            name: name.into(),
            ty,
        });
        self.attribute_stride += ty.size();
        Ok(())
    }

    /// Declare a sampler at global or instance scope.
    pub fn add_sampler(&mut self, name: &str, scope: Scope) -> Result<UniformHandle> {
        self.add_uniform(name, UniformType::Sampler, scope)
    }

    /// Declare a uniform.
    ///
    /// Nothing is modified when this returns an error.
    pub fn add_uniform(&mut self, name: &str, ty: UniformType, scope: Scope) -> Result<UniformHandle> {
        self.require_state(ShaderState::Uninitialized)?;

        if name.is_empty() {
            return Err(RendererError::InvalidUniformName(name.to_string()));
        }
        if self.lookup.contains_key(name) {
            return Err(RendererError::DuplicateUniform(name.to_string()));
        }
        let max_uniforms = self.config.limits.max_uniforms.min(MAX_UNIFORM_SLOTS);
        let handle = match u16::try_from(self.uniforms.len()) {
            Ok(index) if usize::from(index) < max_uniforms => UniformHandle(index),
            _ => return Err(RendererError::UniformCapacityExceeded(max_uniforms)),
        };

        match scope {
            Scope::Instance if !self.config.use_instances => {
                return Err(RendererError::InstancesNotSupported(self.config.name.clone()));
            }
            Scope::Local if ty.is_sampler() => {
                return Err(RendererError::SamplerAtLocalScope(name.to_string()));
            }
            Scope::Local if !self.config.use_locals => {
                return Err(RendererError::LocalsNotSupported(self.config.name.clone()));
            }
            _ => {}
        }

        let mut uniform = Uniform {
            name: name.to_string(),
            scope,
            ty,
            offset: 0,
            size: ty.size(),
            location: handle.0,
            handle,
        };

        if ty.is_sampler() {
            let (count, max) = match scope {
                Scope::Global => (self.global_texture_count, self.config.limits.max_global_textures),
                _ => (self.instance_texture_count, self.config.limits.max_instance_textures),
            };
            let max = max.min(MAX_UNIFORM_SLOTS);
            uniform.location = match u16::try_from(count) {
                Ok(location) if count < max => location,
                _ => {
                    return Err(RendererError::TextureCapacityExceeded {
                        scope: scope.as_str(),
                        max,
                    })
                }
            };
            match scope {
                Scope::Global => self.global_texture_count += 1,
                _ => self.instance_texture_count += 1,
            }
        } else {
            match scope {
                Scope::Global => {
                    uniform.offset = self.global_ubo_size;
                    self.global_ubo_size += u64::from(uniform.size);
                }
                Scope::Instance => {
                    uniform.offset = self.ubo_size;
                    self.ubo_size += u64::from(uniform.size);
                }
                Scope::Local => {
                    let range = self.next_push_constant_range(name, uniform.size)?;
                    uniform.offset = range.offset;
                    uniform.size = range.size as u32;
                    self.push_constant_ranges.push(range);
                    self.push_constant_size += range.size;
                }
            }
        }

        tracing::trace!(
            "Shader '{}': added {} uniform '{}' ({:?}, offset {}, size {})",
            self.config.name,
            scope,
            name,
            ty,
            uniform.offset,
            uniform.size
        );

        self.lookup.insert(uniform.name.clone(), handle);
        self.uniforms.push(uniform);
        Ok(handle)
    }

    fn next_push_constant_range(&self, name: &str, size: u32) -> Result<AlignedRange> {
        let limits = &self.config.limits;
        if self.push_constant_ranges.len() >= limits.max_push_constant_ranges {
            return Err(RendererError::PushConstantLimit(format!(
                "'{name}' would exceed {} ranges",
                limits.max_push_constant_ranges
            )));
        }

        let range = aligned_range(self.push_constant_size, u64::from(size), PUSH_CONSTANT_ALIGNMENT);
        if range.end() > u64::from(limits.max_push_constant_bytes) {
            return Err(RendererError::PushConstantLimit(format!(
                "'{name}' would end at byte {}, limit is {}",
                range.end(),
                limits.max_push_constant_bytes
            )));
        }
        Ok(range)
    }

    /// Look up a uniform by name.
    pub fn uniform_location(&self, name: &str) -> Option<UniformHandle> {
        self.lookup.get(name).copied()
    }

    pub fn uniform(&self, handle: UniformHandle) -> Option<&Uniform> {
        self.uniforms.get(handle.index())
    }

    /// Look up a uniform by name, failing if it does not exist.
    pub fn uniform_by_name(&self, name: &str) -> Result<&Uniform> {
        self.uniform_location(name)
            .and_then(|handle| self.uniform(handle))
            .ok_or_else(|| RendererError::UnknownUniform(name.to_string()))
    }

    /// Region sizes for a device with the given uniform buffer offset alignment.
    pub fn ubo_layout(&self, alignment: u64) -> UboLayout {
        let (instance_stride, max_instances) = if self.config.use_instances {
            (
                align_up(self.ubo_size, alignment),
                self.config.limits.max_instances as u64,
            )
        } else {
            (0, 0)
        };

        UboLayout {
            global_stride: align_up(self.global_ubo_size, alignment),
            instance_stride,
            max_instances,
        }
    }

    /// Descriptor sets in set-index order: global always, instance when enabled.
    pub fn set_layouts(&self) -> Vec<SetLayoutDesc> {
        let mut sets = vec![SetLayoutDesc {
            scope: Scope::Global,
            has_ubo: self.global_ubo_size > 0,
            sampler_count: self.global_texture_count as u32,
        }];
        if self.config.use_instances {
            sets.push(SetLayoutDesc {
                scope: Scope::Instance,
                has_ubo: self.ubo_size > 0,
                sampler_count: self.instance_texture_count as u32,
            });
        }
        sets
    }

    /// Push constant ranges in the form pipeline creation expects.
    ///
    /// Every local uniform is visible to both stages and two ranges may not
    /// share a stage, so the per-uniform ranges collapse into one block.
    pub fn vk_push_constant_ranges(&self) -> Vec<vk::PushConstantRange> {
        let Some(last) = self.push_constant_ranges.last() else {
            return Vec::new();
        };
        vec![vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .offset(0)
            .size(last.end() as u32)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world_shader() -> ShaderLayout {
        ShaderLayout::new(
            ShaderConfig::new("Builtin.WorldShader")
                .with_instances(true)
                .with_locals(true),
        )
    }

    #[test]
    fn offsets_accumulate_per_scope() {
        let mut layout = world_shader();
        let projection = layout
            .add_uniform("projection", UniformType::Matrix4, Scope::Global)
            .unwrap();
        let view = layout
            .add_uniform("view", UniformType::Matrix4, Scope::Global)
            .unwrap();
        let colour = layout
            .add_uniform("colour", UniformType::Float32x4, Scope::Instance)
            .unwrap();

        assert_eq!(layout.uniform(projection).unwrap().offset, 0);
        assert_eq!(layout.uniform(view).unwrap().offset, 64);
        assert_eq!(layout.uniform(colour).unwrap().offset, 0);
        assert_eq!(layout.global_ubo_size(), 128);
        assert_eq!(layout.ubo_size(), 16);
    }

    #[test]
    fn scenario_strides_are_aligned() {
        let mut layout = world_shader();
        layout
            .add_uniform("projection", UniformType::Matrix4, Scope::Global)
            .unwrap();
        layout
            .add_uniform("colour", UniformType::Float32x4, Scope::Instance)
            .unwrap();

        let ubo = layout.ubo_layout(256);
        assert!(ubo.global_stride >= 64);
        assert_eq!(ubo.global_stride % 256, 0);
        assert!(ubo.instance_stride >= 16);
        assert_eq!(ubo.instance_stride % 256, 0);
        assert_eq!(ubo.total_size(), 256 + 256 * 1024);
    }

    #[test]
    fn samplers_take_texture_slots() {
        let mut layout = world_shader();
        let diffuse = layout.add_sampler("diffuse", Scope::Instance).unwrap();
        let specular = layout.add_sampler("specular", Scope::Instance).unwrap();
        let shadow = layout.add_sampler("shadow", Scope::Global).unwrap();

        assert_eq!(layout.uniform(diffuse).unwrap().location, 0);
        assert_eq!(layout.uniform(specular).unwrap().location, 1);
        assert_eq!(layout.uniform(shadow).unwrap().location, 0);
        assert_eq!(layout.ubo_size(), 0);
        assert_eq!(layout.instance_texture_count(), 2);

        let sets = layout.set_layouts();
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].sampler_count, 1);
        assert_eq!(sets[1].sampler_count, 2);
        assert!(!sets[0].has_ubo);
        assert!(!sets[1].has_ubo);
    }

    #[test]
    fn local_uniforms_become_aligned_push_ranges() {
        let mut layout = world_shader();
        let model = layout
            .add_uniform("model", UniformType::Matrix4, Scope::Local)
            .unwrap();
        let id = layout
            .add_uniform("id", UniformType::UInt8, Scope::Local)
            .unwrap();
        let tint = layout
            .add_uniform("tint", UniformType::Float32x3, Scope::Local)
            .unwrap();

        assert_eq!(layout.uniform(model).unwrap().offset, 0);
        assert_eq!(layout.uniform(id).unwrap().offset, 64);
        assert_eq!(layout.uniform(id).unwrap().size, 4);
        assert_eq!(layout.uniform(tint).unwrap().offset, 68);
        assert_eq!(layout.push_constant_size(), 80);
        assert_eq!(layout.push_constant_ranges().len(), 3);
        let vk_ranges = layout.vk_push_constant_ranges();
        assert_eq!(vk_ranges.len(), 1);
        assert_eq!(vk_ranges[0].size, 80);
    }

    #[test]
    fn push_constant_bytes_capped() {
        let mut layout = world_shader();
        layout
            .add_uniform("model", UniformType::Matrix4, Scope::Local)
            .unwrap();
        layout
            .add_uniform("normal", UniformType::Matrix4, Scope::Local)
            .unwrap();
        let err = layout
            .add_uniform("extra", UniformType::Float32, Scope::Local)
            .unwrap_err();

        assert!(matches!(err, RendererError::PushConstantLimit(_)));
        assert_eq!(layout.uniforms().len(), 2);
        assert!(layout.uniform_location("extra").is_none());
    }

    #[test]
    fn rejects_duplicates_and_bad_scopes() {
        let mut layout = ShaderLayout::new(ShaderConfig::new("plain"));
        layout
            .add_uniform("projection", UniformType::Matrix4, Scope::Global)
            .unwrap();

        assert!(matches!(
            layout.add_uniform("projection", UniformType::Matrix4, Scope::Global),
            Err(RendererError::DuplicateUniform(_))
        ));
        assert!(matches!(
            layout.add_uniform("colour", UniformType::Float32x4, Scope::Instance),
            Err(RendererError::InstancesNotSupported(_))
        ));
        assert!(matches!(
            layout.add_uniform("model", UniformType::Matrix4, Scope::Local),
            Err(RendererError::LocalsNotSupported(_))
        ));
        assert!(matches!(
            world_shader().add_sampler("tex", Scope::Local),
            Err(RendererError::SamplerAtLocalScope(_))
        ));
        assert!(matches!(
            layout.add_uniform("", UniformType::Float32, Scope::Global),
            Err(RendererError::InvalidUniformName(_))
        ));
    }

    #[test]
    fn uniform_capacity_boundary() {
        let limits = ShaderLimits {
            max_uniforms: 4,
            ..ShaderLimits::default()
        };
        let mut layout = ShaderLayout::new(ShaderConfig::new("small").with_limits(limits));
        for i in 0..4 {
            layout
                .add_uniform(&format!("u{i}"), UniformType::Float32, Scope::Global)
                .unwrap();
        }

        let before = layout.global_ubo_size();
        assert!(matches!(
            layout.add_uniform("u4", UniformType::Float32, Scope::Global),
            Err(RendererError::UniformCapacityExceeded(4))
        ));
        assert_eq!(layout.uniforms().len(), 4);
        assert_eq!(layout.global_ubo_size(), before);
    }

    #[test]
    fn unbounded_uniform_limit_stops_at_handle_range() {
        let limits = ShaderLimits {
            max_uniforms: usize::MAX,
            ..ShaderLimits::default()
        };
        let mut layout = ShaderLayout::new(ShaderConfig::new("huge").with_limits(limits));
        for i in 0..=usize::from(u16::MAX) {
            layout
                .add_uniform(&format!("u{i}"), UniformType::Float32, Scope::Global)
                .unwrap();
        }

        let last = layout.uniforms().last().unwrap();
        assert_eq!(last.handle, UniformHandle(u16::MAX));
        assert_eq!(last.location, u16::MAX);
        assert!(matches!(
            layout.add_uniform("overflow", UniformType::Float32, Scope::Global),
            Err(RendererError::UniformCapacityExceeded(65536))
        ));
        assert_eq!(layout.uniforms().len(), 65536);
    }

    #[test]
    fn declarations_frozen_after_initialize() {
        let mut layout = world_shader();
        layout.add_stage(ShaderStage::Vertex).unwrap();
        layout.set_state(ShaderState::Initialized);

        assert!(matches!(
            layout.add_stage(ShaderStage::Fragment),
            Err(RendererError::InvalidState { .. })
        ));
        assert!(layout
            .add_attribute("in_position", AttributeType::Float32x3)
            .is_err());
        assert!(layout
            .add_uniform("late", UniformType::Float32, Scope::Global)
            .is_err());
    }

    #[test]
    fn attribute_stride_accumulates() {
        let mut layout = world_shader();
        layout
            .add_attribute("in_position", AttributeType::Float32x3)
            .unwrap();
        layout
            .add_attribute("in_texcoord", AttributeType::Float32x2)
            .unwrap();
        assert_eq!(layout.attribute_stride(), 20);
        assert_eq!(layout.attributes().len(), 2);
    }

    #[test]
    fn instances_disabled_means_no_instance_region() {
        let mut layout = ShaderLayout::new(ShaderConfig::new("ui"));
        layout
            .add_uniform("projection", UniformType::Matrix4, Scope::Global)
            .unwrap();
        let ubo = layout.ubo_layout(64);
        assert_eq!(ubo.instance_stride, 0);
        assert_eq!(ubo.total_size(), 64);
        assert_eq!(layout.set_layouts().len(), 1);
    }
}
