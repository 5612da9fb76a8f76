//! Shader programs: declaration, GPU resources and per-draw uniform updates.
//!
//! A [`Shader`] starts out in [`ShaderState::Uninitialized`], accepts stage,
//! attribute and uniform declarations, and becomes usable after
//! [`Shader::initialize`] builds its pipeline, descriptor sets and uniform
//! buffer. Uniform storage is split by [`Scope`]:
//!
//! - global values live in one region of the uniform buffer shared by all draws,
//! - instance values get a region per acquired instance id,
//! - local values are push constants written straight into the command buffer.

mod descriptor_state;
mod instances;
mod layout;
mod types;

use std::io::Cursor;

use ash::vk;
use bytemuck::Pod;
use kohi_core::{Extent, ResourceKind, ResourceLoader};
use kohi_gpu::descriptors::{write_combined_image_samplers, write_uniform_buffer};
use kohi_gpu::pipeline::create_shader_module;
use kohi_gpu::{
    Buffer, BufferDesc, DescriptorPool, DescriptorSetLayoutBuilder, GpuContext,
    GpuError, GraphicsPipeline, GraphicsPipelineConfig, PipelineStage, Renderpass,
    VertexAttribute,
};

use crate::error::{RendererError, Result};
use crate::frame::FrameContext;
use crate::texture::{self, TextureBinding};

pub use descriptor_state::{buffer_stamp, needs_write, DescriptorState, ResourceStamp};
pub use instances::{InstanceLedger, InstanceSlots, InstanceState};
pub use layout::{SetLayoutDesc, ShaderConfig, ShaderLayout, ShaderState, UboLayout};
pub use types::{
    Attribute, AttributeType, DescriptorBinding, Scope, ShaderStage, Uniform, UniformHandle,
    UniformType,
};

/// Everything [`Shader::initialize`] needs from the renderer.
pub struct ShaderInitContext<'a> {
    pub gpu: &'a GpuContext,
    pub loader: &'a dyn ResourceLoader,
    pub renderpass: &'a Renderpass,
    pub extent: Extent,
    pub frames_in_flight: usize,
    /// Bound in place of any sampler slot without a loaded texture.
    pub default_texture: TextureBinding,
}

/// Which uniform buffer region subsequent writes go to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BindState {
    global_offset: u64,
    bound_ubo_offset: u64,
    bound_instance: Option<u32>,
}

impl BindState {
    pub fn new(global_offset: u64) -> Self {
        Self {
            global_offset,
            bound_ubo_offset: global_offset,
            bound_instance: None,
        }
    }

    pub fn bind_globals(&mut self) {
        self.bound_ubo_offset = self.global_offset;
        self.bound_instance = None;
    }

    pub fn bind_instance(&mut self, id: u32, offset: u64) {
        self.bound_ubo_offset = offset;
        self.bound_instance = Some(id);
    }

    /// Forget `id` if it is the bound instance.
    pub fn unbind_instance(&mut self, id: u32) {
        if self.bound_instance == Some(id) {
            self.bind_globals();
        }
    }

    #[inline]
    pub fn global_offset(&self) -> u64 {
        self.global_offset
    }

    #[inline]
    pub fn bound_ubo_offset(&self) -> u64 {
        self.bound_ubo_offset
    }

    #[inline]
    pub fn bound_instance(&self) -> Option<u32> {
        self.bound_instance
    }

    /// Start of the uniform buffer region a uniform at `scope` is written to.
    pub fn region_offset(&self, scope: Scope) -> Result<u64> {
        match scope {
            Scope::Global => Ok(self.global_offset),
            Scope::Instance => self
                .bound_instance
                .map(|_| self.bound_ubo_offset)
                .ok_or(RendererError::NoInstanceBound),
            Scope::Local => Ok(0),
        }
    }
}

/// Copy `value` into `dst` at `region_offset + uniform.offset`.
///
/// `dst` is the whole mapped uniform buffer.
pub fn write_uniform_bytes(
    dst: &mut [u8],
    region_offset: u64,
    uniform: &Uniform,
    value: &[u8],
) -> Result<()> {
    if uniform.is_sampler() {
        return Err(RendererError::UniformKindMismatch(uniform.name.clone()));
    }
    if value.len() != uniform.size as usize {
        return Err(RendererError::UniformSizeMismatch {
            name: uniform.name.clone(),
            expected: uniform.size,
            actual: value.len(),
        });
    }

    let start = region_offset + uniform.offset;
    let end = kohi_gpu::buffer::check_range(start, value.len() as u64, dst.len() as u64)?;
    dst[start as usize..end as usize].copy_from_slice(value);
    Ok(())
}

/// Descriptor pool sizing for a shader.
fn descriptor_pool_sizes(layout: &ShaderLayout, frames: u32) -> (u32, [vk::DescriptorPoolSize; 2]) {
    let limits = &layout.config().limits;
    let instances = if layout.config().use_instances {
        limits.max_instances as u32
    } else {
        0
    };
    let max_sets = frames * (1 + instances);
    let samplers = frames
        * (layout.global_texture_count() as u32
            + instances * layout.instance_texture_count() as u32);

    // Pool sizes must be non-zero even for shaders without samplers.
    let sizes = [
        vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(max_sets.max(1)),
        vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(samplers.max(1)),
    ];
    (max_sets.max(1), sizes)
}

/// Image infos for `slots`, substituting the default texture where needed.
fn resolve_textures(
    slots: &[Option<TextureBinding>],
    default: &TextureBinding,
) -> (Vec<ResourceStamp>, Vec<vk::DescriptorImageInfo>) {
    slots
        .iter()
        .map(|slot| {
            let texture = texture::resolve(slot.as_ref(), default);
            let stamp = ResourceStamp::new(u64::from(texture.id), texture.generation.unwrap_or(0));
            (stamp, texture.image_info())
        })
        .unzip()
}

/// GPU objects owned by an initialized shader.
struct ShaderResources {
    descriptor_pool: DescriptorPool,
    /// Indexed by set number: global first, instance second if enabled.
    set_layouts: Vec<vk::DescriptorSetLayout>,
    pipeline: GraphicsPipeline,
    uniform_buffer: Buffer,
    ubo: UboLayout,
    global_offset: u64,
    global_sets: Vec<vk::DescriptorSet>,
    global_state: DescriptorState,
}

impl ShaderResources {
    unsafe fn destroy(&mut self, device: &ash::Device) {
        self.uniform_buffer.destroy(device);
        self.pipeline.destroy(device);
        self.descriptor_pool.destroy(device);
        for layout in self.set_layouts.drain(..) {
            device.destroy_descriptor_set_layout(layout, None);
        }
        self.global_sets.clear();
    }
}

/// A shader program and the GPU state backing its uniforms.
pub struct Shader {
    layout: ShaderLayout,
    resources: Option<ShaderResources>,
    bind: BindState,
    global_textures: Vec<Option<TextureBinding>>,
    instances: InstanceLedger<InstanceState>,
    default_texture: Option<TextureBinding>,
}

impl Shader {
    /// A new shader ready to accept declarations.
    pub fn new(config: ShaderConfig) -> Self {
        let max_instances = instance_capacity(&config);
        Self {
            layout: ShaderLayout::new(config),
            resources: None,
            bind: BindState::default(),
            global_textures: Vec::new(),
            instances: InstanceLedger::new(max_instances, 1),
            default_texture: None,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.layout.name()
    }

    #[inline]
    pub fn state(&self) -> ShaderState {
        self.layout.state()
    }

    #[inline]
    pub fn layout(&self) -> &ShaderLayout {
        &self.layout
    }

    #[inline]
    pub fn bind_state(&self) -> &BindState {
        &self.bind
    }

    /// Number of live instances.
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Released instances still waiting to be reclaimed. Their ids stay
    /// reserved until then.
    pub fn pending_releases(&self) -> usize {
        self.instances.pending()
    }

    /// Pipeline layout, once initialized.
    pub fn pipeline_layout(&self) -> Option<vk::PipelineLayout> {
        self.resources.as_ref().map(|r| r.pipeline.layout)
    }

    pub fn add_stage(&mut self, stage: ShaderStage) -> Result<()> {
        self.layout.add_stage(stage)
    }

    pub fn add_attribute(&mut self, name: impl Into<String>, ty: AttributeType) -> Result<()> {
        self.layout.add_attribute(name, ty)
    }

    pub fn add_uniform(&mut self, name: &str, ty: UniformType, scope: Scope) -> Result<UniformHandle> {
        self.layout.add_uniform(name, ty, scope)
    }

    pub fn add_sampler(&mut self, name: &str, scope: Scope) -> Result<UniformHandle> {
        self.layout.add_sampler(name, scope)
    }

    /// Handle of the uniform called `name`.
    pub fn uniform_location(&self, name: &str) -> Option<UniformHandle> {
        self.layout.uniform_location(name)
    }

    fn resources(&self) -> Result<&ShaderResources> {
        self.layout.require_state(ShaderState::Initialized)?;
        self.resources
            .as_ref()
            .ok_or_else(|| RendererError::FrameState(format!("shader '{}' has no resources", self.name())))
    }

    /// Build stage modules, descriptor layouts, the pipeline and the uniform buffer.
    ///
    /// # Safety
    /// The GPU context and renderpass must be valid and outlive the shader.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(skip_all, fields(shader = self.name())))]
    pub unsafe fn initialize(&mut self, ctx: &ShaderInitContext<'_>) -> Result<()> {
        self.layout.require_state(ShaderState::Uninitialized)?;
        if self.layout.stages().is_empty() {
            return Err(RendererError::NoStages(self.name().to_string()));
        }

        let device = ctx.gpu.device();
        let frames = ctx.frames_in_flight.max(1);

        // Modules are only needed until the pipeline exists.
        let mut stages = Vec::with_capacity(self.layout.stages().len());
        for &stage in self.layout.stages() {
            match load_stage_module(device, ctx.loader, self.layout.name(), stage) {
                Ok(module) => stages.push(PipelineStage {
                    stage: stage.to_vk(),
                    module,
                }),
                Err(e) => {
                    destroy_stage_modules(device, &stages);
                    return Err(e);
                }
            }
        }

        let result = self.create_resources(ctx, &stages, frames);
        destroy_stage_modules(device, &stages);
        let resources = result?;

        self.bind = BindState::new(resources.global_offset);
        self.global_textures = vec![None; self.layout.global_texture_count()];
        self.instances = InstanceLedger::new(instance_capacity(self.layout.config()), frames);
        self.default_texture = Some(ctx.default_texture);
        self.resources = Some(resources);
        self.layout.set_state(ShaderState::Initialized);

        tracing::info!(
            "Shader '{}' initialized ({} uniforms, {} stages)",
            self.name(),
            self.layout.uniforms().len(),
            self.layout.stages().len()
        );
        Ok(())
    }

    unsafe fn create_resources(
        &self,
        ctx: &ShaderInitContext<'_>,
        stages: &[PipelineStage],
        frames: usize,
    ) -> Result<ShaderResources> {
        let device = ctx.gpu.device();

        let (max_sets, pool_sizes) = descriptor_pool_sizes(&self.layout, frames as u32);
        let descriptor_pool = DescriptorPool::new(device, max_sets, &pool_sizes)?;

        let mut set_layouts = Vec::new();
        for desc in self.layout.set_layouts() {
            let mut builder = DescriptorSetLayoutBuilder::new();
            if desc.has_ubo {
                builder = builder.uniform_buffer(
                    DescriptorBinding::UniformBuffer.index(),
                    vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                );
            }
            if desc.sampler_count > 0 {
                builder = builder.combined_image_samplers(
                    DescriptorBinding::Samplers.index(),
                    desc.sampler_count,
                    vk::ShaderStageFlags::FRAGMENT,
                );
            }
            match builder.build(device) {
                Ok(layout) => set_layouts.push(layout),
                Err(e) => {
                    destroy_partial(device, &descriptor_pool, &set_layouts);
                    return Err(e.into());
                }
            }
        }

        let attributes: Vec<VertexAttribute> = self
            .layout
            .attributes()
            .iter()
            .map(|a| VertexAttribute {
                format: a.ty.format(),
                size: a.ty.size(),
            })
            .collect();
        let push_constant_ranges = self.layout.vk_push_constant_ranges();

        // Flipped so that +Y is up in clip space.
        let viewport = vk::Viewport {
            x: 0.0,
            y: ctx.extent.height as f32,
            width: ctx.extent.width as f32,
            height: -(ctx.extent.height as f32),
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D {
                width: ctx.extent.width,
                height: ctx.extent.height,
            },
        };

        let config = self.layout.config();
        let pipeline = match GraphicsPipeline::new(
            device,
            &GraphicsPipelineConfig {
                renderpass: ctx.renderpass.handle(),
                stride: self.layout.attribute_stride(),
                attributes: &attributes,
                descriptor_set_layouts: &set_layouts,
                stages,
                viewport,
                scissor,
                cull_mode: config.cull_mode,
                wireframe: config.wireframe,
                has_depth: ctx.renderpass.has_depth(),
                depth_test: config.depth_test,
                push_constant_ranges: &push_constant_ranges,
            },
        ) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                destroy_partial(device, &descriptor_pool, &set_layouts);
                return Err(e.into());
            }
        };

        let ubo = self.layout.ubo_layout(ctx.gpu.uniform_buffer_alignment());
        let (uniform_buffer, global_offset, global_sets) =
            match self.create_uniform_storage(ctx, &descriptor_pool, set_layouts[0], ubo, frames) {
                Ok(storage) => storage,
                Err(e) => {
                    let mut pipeline = pipeline;
                    pipeline.destroy(device);
                    destroy_partial(device, &descriptor_pool, &set_layouts);
                    return Err(e);
                }
            };

        Ok(ShaderResources {
            descriptor_pool,
            set_layouts,
            pipeline,
            uniform_buffer,
            ubo,
            global_offset,
            global_sets,
            global_state: DescriptorState::new(frames, self.layout.global_texture_count()),
        })
    }

    /// Create and map the uniform buffer, reserve the global region and
    /// allocate one global descriptor set per frame.
    unsafe fn create_uniform_storage(
        &self,
        ctx: &ShaderInitContext<'_>,
        pool: &DescriptorPool,
        global_layout: vk::DescriptorSetLayout,
        ubo: UboLayout,
        frames: usize,
    ) -> Result<(Buffer, u64, Vec<vk::DescriptorSet>)> {
        let device = ctx.gpu.device();
        // Zero-sized buffers are invalid; keep one aligned block at minimum.
        let size = ubo
            .total_size()
            .max(ctx.gpu.uniform_buffer_alignment().max(1));
        let usage = vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST;
        let preferred = vk::MemoryPropertyFlags::DEVICE_LOCAL
            | vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT;
        let name = format!("{}.uniforms", self.name());

        let mut buffer = match Buffer::new(
            device,
            ctx.gpu.memory_properties(),
            &BufferDesc::new(&name, size, usage, preferred).with_freelist(),
        ) {
            Ok(buffer) => buffer,
            Err(GpuError::NoSuitableMemoryType(_)) => {
                tracing::warn!(
                    "No device-local host-visible memory for '{}', using host memory",
                    name
                );
                Buffer::new(
                    device,
                    ctx.gpu.memory_properties(),
                    &BufferDesc::new(
                        &name,
                        size,
                        usage,
                        vk::MemoryPropertyFlags::HOST_VISIBLE
                            | vk::MemoryPropertyFlags::HOST_COHERENT,
                    )
                    .with_freelist(),
                )?
            }
            Err(e) => return Err(e.into()),
        };

        let storage = (|| -> Result<(u64, Vec<vk::DescriptorSet>)> {
            let global_offset = if ubo.global_stride > 0 {
                buffer.allocate(ubo.global_stride)?
            } else {
                0
            };
            buffer.map_persistent(device)?;
            let sets = pool.allocate(device, &vec![global_layout; frames])?;
            Ok((global_offset, sets))
        })();

        match storage {
            Ok((global_offset, sets)) => Ok((buffer, global_offset, sets)),
            Err(e) => {
                buffer.destroy(device);
                Err(e)
            }
        }
    }

    /// Bind the pipeline for subsequent draws.
    ///
    /// # Safety
    /// The command buffer must be recording inside a compatible renderpass.
    pub unsafe fn use_shader(&self, device: &ash::Device, frame: &FrameContext) -> Result<()> {
        let resources = self.resources()?;
        resources.pipeline.bind(device, frame.command_buffer);
        Ok(())
    }

    /// Direct uniform writes at the global region.
    pub fn bind_globals(&mut self) -> Result<()> {
        self.layout.require_state(ShaderState::Initialized)?;
        self.bind.bind_globals();
        Ok(())
    }

    /// Direct uniform writes at instance `id`'s region.
    pub fn bind_instance(&mut self, id: u32) -> Result<()> {
        self.layout.require_state(ShaderState::Initialized)?;
        let instance = self
            .instances
            .get(id)
            .ok_or(RendererError::UnknownInstance(id))?;
        self.bind.bind_instance(id, instance.offset);
        Ok(())
    }

    /// Write and bind the global descriptor set for this frame.
    ///
    /// The uniform buffer descriptor is written every call; samplers only when
    /// the texture bound to a slot changed since this frame slot last wrote it.
    ///
    /// # Safety
    /// The command buffer must be recording with this shader's pipeline bound.
    pub unsafe fn apply_globals(&mut self, device: &ash::Device, frame: &FrameContext) -> Result<()> {
        self.layout.require_state(ShaderState::Initialized)?;
        let default = self.default_texture()?;
        let global_offset = self.bind.global_offset();
        let Some(resources) = self.resources.as_mut() else {
            return Err(missing_resources(self.layout.name()));
        };

        let set = *resources.global_sets.get(frame.frame_index).ok_or_else(|| {
            RendererError::FrameState(format!("no global descriptor set for frame {}", frame.frame_index))
        })?;

        if resources.ubo.global_stride > 0 {
            write_uniform_buffer(
                device,
                set,
                DescriptorBinding::UniformBuffer.index(),
                resources.uniform_buffer.handle(),
                global_offset,
                resources.ubo.global_stride,
            );
        }

        if !self.global_textures.is_empty() {
            let (stamps, infos) = resolve_textures(&self.global_textures, &default);
            if resources.global_state.samplers_need_write(frame.frame_index, &stamps) {
                write_combined_image_samplers(device, set, DescriptorBinding::Samplers.index(), &infos);
                resources.global_state.mark_samplers_written(frame.frame_index, &stamps);
            }
        }

        device.cmd_bind_descriptor_sets(
            frame.command_buffer,
            vk::PipelineBindPoint::GRAPHICS,
            resources.pipeline.layout,
            0,
            &[set],
            &[],
        );
        Ok(())
    }

    /// Write (if stale) and bind the bound instance's descriptor set for this frame.
    ///
    /// # Safety
    /// The command buffer must be recording with this shader's pipeline bound.
    pub unsafe fn apply_instance(&mut self, device: &ash::Device, frame: &FrameContext) -> Result<()> {
        self.layout.require_state(ShaderState::Initialized)?;
        if !self.layout.config().use_instances {
            return Err(RendererError::InstancesNotSupported(self.name().to_string()));
        }
        let default = self.default_texture()?;
        let id = self.bind.bound_instance().ok_or(RendererError::NoInstanceBound)?;
        let Some(resources) = self.resources.as_ref() else {
            return Err(missing_resources(self.layout.name()));
        };
        let instance = self
            .instances
            .get_mut(id)
            .ok_or(RendererError::UnknownInstance(id))?;

        let set = *instance.descriptor_sets.get(frame.frame_index).ok_or_else(|| {
            RendererError::FrameState(format!("no instance descriptor set for frame {}", frame.frame_index))
        })?;

        if resources.ubo.instance_stride > 0 {
            let buffer = &resources.uniform_buffer;
            let stamp = buffer_stamp(buffer.handle(), buffer.generation());
            if instance.descriptor_state.ubo_needs_write(frame.frame_index, stamp) {
                write_uniform_buffer(
                    device,
                    set,
                    DescriptorBinding::UniformBuffer.index(),
                    buffer.handle(),
                    instance.offset,
                    resources.ubo.instance_stride,
                );
                instance.descriptor_state.mark_ubo_written(frame.frame_index, stamp);
            }
        }

        if !instance.textures.is_empty() {
            let (stamps, infos) = resolve_textures(&instance.textures, &default);
            if instance.descriptor_state.samplers_need_write(frame.frame_index, &stamps) {
                write_combined_image_samplers(device, set, DescriptorBinding::Samplers.index(), &infos);
                instance.descriptor_state.mark_samplers_written(frame.frame_index, &stamps);
            }
        }

        device.cmd_bind_descriptor_sets(
            frame.command_buffer,
            vk::PipelineBindPoint::GRAPHICS,
            resources.pipeline.layout,
            1,
            &[set],
            &[],
        );
        Ok(())
    }

    fn default_texture(&self) -> Result<TextureBinding> {
        self.default_texture
            .ok_or_else(|| missing_resources(self.layout.name()))
    }

    /// Set a uniform value by name.
    ///
    /// # Safety
    /// For local uniforms the frame's command buffer must be recording with
    /// this shader's pipeline bound.
    pub unsafe fn set_uniform(
        &mut self,
        device: &ash::Device,
        frame: &FrameContext,
        name: &str,
        value: &[u8],
    ) -> Result<()> {
        let handle = self
            .uniform_location(name)
            .ok_or_else(|| RendererError::UnknownUniform(name.to_string()))?;
        self.set_uniform_by_location(device, frame, handle, value)
    }

    /// Set a uniform from any plain-old-data value.
    ///
    /// # Safety
    /// See [`Shader::set_uniform`].
    pub unsafe fn set_uniform_value<T: Pod>(
        &mut self,
        device: &ash::Device,
        frame: &FrameContext,
        name: &str,
        value: &T,
    ) -> Result<()> {
        self.set_uniform(device, frame, name, bytemuck::bytes_of(value))
    }

    /// Set a uniform value by handle.
    ///
    /// Global and instance values are copied into the mapped uniform buffer at
    /// the region picked by the last bind. Local values are pushed as constants.
    ///
    /// # Safety
    /// See [`Shader::set_uniform`].
    pub unsafe fn set_uniform_by_location(
        &mut self,
        device: &ash::Device,
        frame: &FrameContext,
        handle: UniformHandle,
        value: &[u8],
    ) -> Result<()> {
        self.layout.require_state(ShaderState::Initialized)?;
        let uniform = self
            .layout
            .uniform(handle)
            .ok_or_else(|| RendererError::UnknownUniform(format!("#{}", handle.index())))?;

        if uniform.is_sampler() {
            return Err(RendererError::UniformKindMismatch(uniform.name.clone()));
        }

        let Some(resources) = self.resources.as_mut() else {
            return Err(missing_resources(self.layout.name()));
        };

        if uniform.scope == Scope::Local {
            if value.is_empty() || value.len() > uniform.size as usize {
                return Err(RendererError::UniformSizeMismatch {
                    name: uniform.name.clone(),
                    expected: uniform.size,
                    actual: value.len(),
                });
            }
            // Push sizes must be multiples of four; the range itself already is.
            let padded;
            let bytes = if value.len() % 4 == 0 {
                value
            } else {
                let mut block = vec![0u8; uniform.size as usize];
                block[..value.len()].copy_from_slice(value);
                padded = block;
                padded.as_slice()
            };
            device.cmd_push_constants(
                frame.command_buffer,
                resources.pipeline.layout,
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                uniform.offset as u32,
                bytes,
            );
            return Ok(());
        }

        let region = self.bind.region_offset(uniform.scope)?;
        let mapped = resources
            .uniform_buffer
            .mapped_slice_mut()
            .ok_or_else(|| RendererError::FrameState("uniform buffer is not mapped".to_string()))?;
        write_uniform_bytes(mapped, region, uniform, value)
    }

    /// Point a sampler slot at `texture`.
    ///
    /// Instance samplers apply to the bound instance. The descriptor is
    /// rewritten on the next apply for each frame slot.
    pub fn set_sampler(&mut self, handle: UniformHandle, texture: TextureBinding) -> Result<()> {
        self.layout.require_state(ShaderState::Initialized)?;
        let uniform = self
            .layout
            .uniform(handle)
            .ok_or_else(|| RendererError::UnknownUniform(format!("#{}", handle.index())))?;
        if !uniform.is_sampler() {
            return Err(RendererError::UniformKindMismatch(uniform.name.clone()));
        }

        let slot = uniform.location as usize;
        let slots = match uniform.scope {
            Scope::Global => &mut self.global_textures,
            Scope::Instance => {
                let id = self.bind.bound_instance().ok_or(RendererError::NoInstanceBound)?;
                &mut self
                    .instances
                    .get_mut(id)
                    .ok_or(RendererError::UnknownInstance(id))?
                    .textures
            }
            Scope::Local => return Err(RendererError::SamplerAtLocalScope(uniform.name.clone())),
        };
        let entry = slots
            .get_mut(slot)
            .ok_or_else(|| RendererError::UnknownUniform(uniform.name.clone()))?;
        *entry = Some(texture);
        Ok(())
    }

    /// Point the sampler called `name` at `texture`.
    pub fn set_sampler_by_name(&mut self, name: &str, texture: TextureBinding) -> Result<()> {
        let handle = self
            .uniform_location(name)
            .ok_or_else(|| RendererError::UnknownUniform(name.to_string()))?;
        self.set_sampler(handle, texture)
    }

    /// Reserve a uniform region and descriptor sets for a new instance.
    ///
    /// Every sampler slot starts out showing the default texture.
    ///
    /// # Safety
    /// The device must be the one the shader was initialized with.
    pub unsafe fn acquire_instance_resources(&mut self, device: &ash::Device) -> Result<u32> {
        self.layout.require_state(ShaderState::Initialized)?;
        if !self.layout.config().use_instances {
            return Err(RendererError::InstancesNotSupported(self.name().to_string()));
        }
        if self.instances.next_id().is_none() {
            tracing::error!(
                "Shader '{}' has no free instance slots (capacity {})",
                self.layout.name(),
                self.instances.capacity()
            );
            return Err(RendererError::InstanceCapacityExceeded(self.instances.capacity()));
        }

        let frames = self.instances.frames_in_flight();
        let texture_count = self.layout.instance_texture_count();
        let Some(resources) = self.resources.as_mut() else {
            return Err(missing_resources(self.layout.name()));
        };

        let stride = resources.ubo.instance_stride;
        let offset = if stride > 0 {
            resources
                .uniform_buffer
                .allocate(stride)
                .map_err(|e| match e {
                    GpuError::OutOfSpace { .. } => RendererError::OutOfUniformSpace,
                    other => other.into(),
                })?
        } else {
            0
        };

        let instance_layout = resources.set_layouts[1];
        let descriptor_sets = match resources
            .descriptor_pool
            .allocate(device, &vec![instance_layout; frames])
        {
            Ok(sets) => sets,
            Err(e) => {
                if stride > 0 {
                    resources.uniform_buffer.free(stride, offset)?;
                }
                return Err(e.into());
            }
        };

        let state = InstanceState {
            offset,
            descriptor_sets,
            descriptor_state: DescriptorState::new(frames, texture_count),
            textures: vec![None; texture_count],
        };

        match self.instances.insert(state) {
            Ok(id) => Ok(id),
            Err(state) => {
                resources
                    .descriptor_pool
                    .free(device, &state.descriptor_sets)?;
                if stride > 0 {
                    resources.uniform_buffer.free(stride, state.offset)?;
                }
                Err(RendererError::InstanceCapacityExceeded(self.instances.capacity()))
            }
        }
    }

    /// Release instance `id` during frame `frame_number`.
    ///
    /// Its uniform region and descriptor sets are reclaimed by
    /// [`Shader::collect_garbage`] once every frame that could still reference
    /// them has completed. The id is not handed out again before that.
    pub fn release_instance_resources(&mut self, id: u32, frame_number: u64) -> Result<()> {
        self.layout.require_state(ShaderState::Initialized)?;
        if !self.instances.release(id, frame_number) {
            return Err(RendererError::UnknownInstance(id));
        }
        self.bind.unbind_instance(id);
        Ok(())
    }

    /// Reclaim released instance resources no frame in flight can still use.
    ///
    /// # Safety
    /// The device must be the one the shader was initialized with.
    pub unsafe fn collect_garbage(&mut self, device: &ash::Device, frame_number: u64) -> Result<usize> {
        let mut ready = Vec::new();
        let count = self.instances.collect(frame_number, |item| ready.push(item));
        if let Some(resources) = self.resources.as_mut() {
            reclaim(device, resources, ready)?;
        }
        Ok(count)
    }

    /// Destroy every GPU object the shader owns.
    ///
    /// Waits for the device to go idle first, so pending releases are reclaimed
    /// immediately. The shader returns to [`ShaderState::NotCreated`].
    ///
    /// # Safety
    /// The GPU context must be the one the shader was initialized with.
    pub unsafe fn destroy(&mut self, gpu: &GpuContext) -> Result<()> {
        let device = gpu.device();
        if let Some(mut resources) = self.resources.take() {
            gpu.wait_idle()?;

            let mut ready = Vec::new();
            self.instances.flush(|item| ready.push(item));
            if let Err(e) = reclaim(device, &mut resources, ready) {
                tracing::warn!("Releasing instances of '{}' failed: {e}", self.name());
            }
            // Their descriptor sets go with the pool.
            self.instances.drain().for_each(drop);

            resources.destroy(device);
            tracing::debug!("Shader '{}' destroyed", self.name());
        }

        self.global_textures.clear();
        self.bind = BindState::default();
        self.default_texture = None;
        self.layout.set_state(ShaderState::NotCreated);
        Ok(())
    }
}

fn missing_resources(name: &str) -> RendererError {
    RendererError::FrameState(format!("shader '{name}' has no GPU resources"))
}

unsafe fn reclaim(
    device: &ash::Device,
    resources: &mut ShaderResources,
    released: Vec<InstanceState>,
) -> Result<()> {
    let stride = resources.ubo.instance_stride;
    for item in released {
        if !item.descriptor_sets.is_empty() {
            resources.descriptor_pool.free(device, &item.descriptor_sets)?;
        }
        if stride > 0 {
            resources.uniform_buffer.free(stride, item.offset)?;
        }
    }
    Ok(())
}

/// Instance slots a shader reserves storage for.
fn instance_capacity(config: &ShaderConfig) -> usize {
    if config.use_instances {
        config.limits.max_instances
    } else {
        0
    }
}

unsafe fn load_stage_module(
    device: &ash::Device,
    loader: &dyn ResourceLoader,
    shader_name: &str,
    stage: ShaderStage,
) -> Result<vk::ShaderModule> {
    let path = stage.binary_path(shader_name);
    let resource = loader
        .load(&path, ResourceKind::Binary)
        .map_err(|source| RendererError::ShaderModuleLoadFailed {
            path: path.clone(),
            source,
        })?;
    let code = ash::util::read_spv(&mut Cursor::new(&resource.data)).map_err(|e| {
        RendererError::ShaderModuleLoadFailed {
            path: path.clone(),
            source: kohi_core::Error::InvalidData(e.to_string()),
        }
    })?;
    tracing::debug!("Loaded {} ({} bytes)", path, resource.size());
    Ok(create_shader_module(device, &code)?)
}

unsafe fn destroy_stage_modules(device: &ash::Device, stages: &[PipelineStage]) {
    for stage in stages {
        device.destroy_shader_module(stage.module, None);
    }
}

unsafe fn destroy_partial(
    device: &ash::Device,
    pool: &DescriptorPool,
    set_layouts: &[vk::DescriptorSetLayout],
) {
    for &layout in set_layouts {
        device.destroy_descriptor_set_layout(layout, None);
    }
    pool.destroy(device);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShaderLimits;
    use ash::vk::Handle;

    fn world_layout() -> ShaderLayout {
        let mut layout = ShaderLayout::new(
            ShaderConfig::new("Builtin.WorldShader")
                .with_instances(true)
                .with_locals(true),
        );
        layout
            .add_uniform("projection", UniformType::Matrix4, Scope::Global)
            .unwrap();
        layout
            .add_uniform("view", UniformType::Matrix4, Scope::Global)
            .unwrap();
        layout
            .add_uniform("diffuse_colour", UniformType::Float32x4, Scope::Instance)
            .unwrap();
        layout
            .add_uniform("model", UniformType::Matrix4, Scope::Local)
            .unwrap();
        layout
    }

    #[test]
    fn bind_globals_is_idempotent() {
        let mut bind = BindState::new(0);
        bind.bind_instance(3, 512);
        bind.bind_globals();
        let once = bind;
        bind.bind_globals();
        assert_eq!(bind, once);
        assert_eq!(bind.bound_ubo_offset(), bind.global_offset());
        assert_eq!(bind.bound_instance(), None);
    }

    #[test]
    fn instance_region_requires_bound_instance() {
        let mut bind = BindState::new(0);
        assert!(matches!(
            bind.region_offset(Scope::Instance),
            Err(RendererError::NoInstanceBound)
        ));
        bind.bind_instance(0, 256);
        assert_eq!(bind.region_offset(Scope::Instance).unwrap(), 256);
        assert_eq!(bind.region_offset(Scope::Global).unwrap(), 0);
    }

    #[test]
    fn releasing_bound_instance_unbinds_it() {
        let mut bind = BindState::new(0);
        bind.bind_instance(2, 256);
        bind.unbind_instance(1);
        assert_eq!(bind.bound_instance(), Some(2));
        bind.unbind_instance(2);
        assert_eq!(bind.bound_instance(), None);
        assert_eq!(bind.bound_ubo_offset(), 0);
    }

    #[test]
    fn uniform_writes_land_at_region_plus_offset() {
        let layout = world_layout();
        let ubo = layout.ubo_layout(256);
        let mut mapped = vec![0u8; ubo.total_size() as usize];
        let mut bind = BindState::new(0);

        let view = layout.uniform_by_name("view").unwrap();
        let value: Vec<u8> = (0..64).collect();
        write_uniform_bytes(&mut mapped, bind.region_offset(view.scope).unwrap(), view, &value)
            .unwrap();
        assert_eq!(&mapped[64..128], value.as_slice());

        // Second instance region.
        let colour = layout.uniform_by_name("diffuse_colour").unwrap();
        let instance_offset = ubo.global_stride + ubo.instance_stride;
        bind.bind_instance(1, instance_offset);
        let rgba = bytemuck::bytes_of(&[1.0f32, 0.5, 0.25, 1.0]).to_vec();
        write_uniform_bytes(
            &mut mapped,
            bind.region_offset(colour.scope).unwrap(),
            colour,
            &rgba,
        )
        .unwrap();
        let start = instance_offset as usize;
        assert_eq!(&mapped[start..start + 16], rgba.as_slice());
        assert!(mapped[ubo.global_stride as usize..start].iter().all(|&b| b == 0));
    }

    #[test]
    fn uniform_write_rejects_wrong_size() {
        let layout = world_layout();
        let mut mapped = vec![0u8; 1024];
        let projection = layout.uniform_by_name("projection").unwrap();
        let err = write_uniform_bytes(&mut mapped, 0, projection, &[0u8; 16]).unwrap_err();
        assert!(matches!(
            err,
            RendererError::UniformSizeMismatch {
                expected: 64,
                actual: 16,
                ..
            }
        ));
        assert!(mapped.iter().all(|&b| b == 0));
    }

    #[test]
    fn uniform_write_rejects_out_of_bounds() {
        let layout = world_layout();
        let mut mapped = vec![0u8; 100];
        let view = layout.uniform_by_name("view").unwrap();
        assert!(matches!(
            write_uniform_bytes(&mut mapped, 0, view, &[0u8; 64]),
            Err(RendererError::Gpu(GpuError::OutOfBounds { .. }))
        ));
    }

    #[test]
    fn pool_sizing_covers_every_instance() {
        let mut layout = ShaderLayout::new(
            ShaderConfig::new("ui")
                .with_instances(true)
                .with_limits(ShaderLimits {
                    max_instances: 10,
                    ..ShaderLimits::default()
                }),
        );
        layout.add_sampler("atlas", Scope::Global).unwrap();
        layout.add_sampler("diffuse", Scope::Instance).unwrap();
        layout.add_sampler("normal", Scope::Instance).unwrap();

        let (max_sets, sizes) = descriptor_pool_sizes(&layout, 3);
        assert_eq!(max_sets, 33);
        assert_eq!(sizes[0].descriptor_count, 33);
        assert_eq!(sizes[1].descriptor_count, 3 * (1 + 10 * 2));
    }

    #[test]
    fn pool_sizing_never_zero() {
        let layout = ShaderLayout::new(ShaderConfig::new("bare"));
        let (max_sets, sizes) = descriptor_pool_sizes(&layout, 2);
        assert_eq!(max_sets, 2);
        assert_eq!(sizes[1].descriptor_count, 1);
    }

    #[test]
    fn unloaded_textures_resolve_to_default() {
        let default = TextureBinding {
            id: texture::DEFAULT_TEXTURE_ID,
            generation: Some(0),
            view: vk::ImageView::from_raw(1),
            sampler: vk::Sampler::from_raw(2),
        };
        let loaded = TextureBinding {
            id: 7,
            generation: Some(3),
            view: vk::ImageView::from_raw(3),
            sampler: vk::Sampler::from_raw(4),
        };
        let pending = TextureBinding {
            generation: None,
            ..loaded
        };

        let (stamps, infos) = resolve_textures(&[None, Some(loaded), Some(pending)], &default);
        assert_eq!(stamps[0].id, u64::from(texture::DEFAULT_TEXTURE_ID));
        assert_eq!(stamps[1], ResourceStamp::new(7, 3));
        assert_eq!(stamps[2].id, u64::from(texture::DEFAULT_TEXTURE_ID));
        assert_eq!(infos[1].image_view, loaded.view);
    }

    #[test]
    fn shader_operations_require_initialization() {
        let mut shader = Shader::new(ShaderConfig::new("uninit").with_instances(true));
        assert!(matches!(
            shader.bind_globals(),
            Err(RendererError::InvalidState { .. })
        ));
        assert!(matches!(
            shader.release_instance_resources(0, 1),
            Err(RendererError::InvalidState { .. })
        ));
        assert_eq!(shader.state(), ShaderState::Uninitialized);
    }
}
