//! Graphics pipeline creation.

use std::ffi::CStr;

use crate::error::{GpuError, Result};
use ash::vk;

/// Most push-constant ranges a pipeline may declare.
pub const MAX_PUSH_CONSTANT_RANGES: usize = 32;

/// Push-constant bytes every Vulkan implementation guarantees.
pub const MAX_PUSH_CONSTANT_BYTES: u32 = 128;

const ENTRY_POINT: &CStr = c"main";

/// Face culling mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CullMode {
    None,
    Front,
    #[default]
    Back,
    FrontAndBack,
}

impl CullMode {
    /// Vulkan cull mode flags.
    pub const fn to_vk(self) -> vk::CullModeFlags {
        match self {
            Self::None => vk::CullModeFlags::NONE,
            Self::Front => vk::CullModeFlags::FRONT,
            Self::Back => vk::CullModeFlags::BACK,
            Self::FrontAndBack => vk::CullModeFlags::FRONT_AND_BACK,
        }
    }
}

/// One vertex attribute: its format and how many bytes it occupies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexAttribute {
    pub format: vk::Format,
    pub size: u32,
}

/// A compiled shader stage.
#[derive(Clone, Copy, Debug)]
pub struct PipelineStage {
    pub stage: vk::ShaderStageFlags,
    pub module: vk::ShaderModule,
}

/// Attribute descriptions for binding 0, with offsets accumulated in declaration order.
pub fn vertex_attribute_descriptions(
    attributes: &[VertexAttribute],
) -> Vec<vk::VertexInputAttributeDescription> {
    let mut offset = 0;
    attributes
        .iter()
        .enumerate()
        .map(|(location, attribute)| {
            let description = vk::VertexInputAttributeDescription::default()
                .binding(0)
                .location(location as u32)
                .format(attribute.format)
                .offset(offset);
            offset += attribute.size;
            description
        })
        .collect()
}

/// Check push-constant ranges against the portable limits.
pub fn validate_push_constant_ranges(ranges: &[vk::PushConstantRange]) -> Result<()> {
    if ranges.len() > MAX_PUSH_CONSTANT_RANGES {
        return Err(GpuError::PushConstantLimit(format!(
            "{} ranges requested, at most {} supported",
            ranges.len(),
            MAX_PUSH_CONSTANT_RANGES
        )));
    }

    if let Some(range) = ranges
        .iter()
        .find(|r| r.offset + r.size > MAX_PUSH_CONSTANT_BYTES)
    {
        return Err(GpuError::PushConstantLimit(format!(
            "range {}..{} exceeds {} bytes",
            range.offset,
            range.offset + range.size,
            MAX_PUSH_CONSTANT_BYTES
        )));
    }

    Ok(())
}

/// Create a shader module from SPIR-V words.
///
/// # Safety
/// The device must be valid and `code` must be valid SPIR-V.
pub unsafe fn create_shader_module(device: &ash::Device, code: &[u32]) -> Result<vk::ShaderModule> {
    let info = vk::ShaderModuleCreateInfo::default().code(code);
    device
        .create_shader_module(&info, None)
        .map_err(|e| GpuError::ShaderCompilation(e.to_string()))
}

/// Everything needed to build a graphics pipeline against a renderpass.
#[derive(Clone, Copy)]
pub struct GraphicsPipelineConfig<'a> {
    pub renderpass: vk::RenderPass,
    pub stride: u32,
    pub attributes: &'a [VertexAttribute],
    pub descriptor_set_layouts: &'a [vk::DescriptorSetLayout],
    pub stages: &'a [PipelineStage],
    pub viewport: vk::Viewport,
    pub scissor: vk::Rect2D,
    pub cull_mode: CullMode,
    pub wireframe: bool,
    /// Whether `renderpass` has a depth attachment.
    pub has_depth: bool,
    pub depth_test: bool,
    pub push_constant_ranges: &'a [vk::PushConstantRange],
}

/// Graphics pipeline and its layout.
pub struct GraphicsPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl GraphicsPipeline {
    /// Create a graphics pipeline.
    ///
    /// Viewport, scissor and line width are dynamic. Alpha blending is always on.
    ///
    /// # Safety
    /// The device, renderpass, set layouts and shader modules must be valid.
    pub unsafe fn new(device: &ash::Device, config: &GraphicsPipelineConfig<'_>) -> Result<Self> {
        validate_push_constant_ranges(config.push_constant_ranges).inspect_err(|e| {
            tracing::error!("Pipeline creation rejected: {e}");
        })?;

        let viewports = [config.viewport];
        let scissors = [config.scissor];
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewports(&viewports)
            .scissors(&scissors);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(if config.wireframe {
                vk::PolygonMode::LINE
            } else {
                vk::PolygonMode::FILL
            })
            .line_width(1.0)
            .cull_mode(config.cull_mode.to_vk())
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .sample_shading_enable(false)
            .min_sample_shading(1.0);

        let depth_stencil = depth_stencil_state(config.has_depth, config.depth_test);

        let blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD)
            .color_write_mask(vk::ColorComponentFlags::RGBA)];

        let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .logic_op(vk::LogicOp::COPY)
            .attachments(&blend_attachments);

        let dynamic_states = [
            vk::DynamicState::VIEWPORT,
            vk::DynamicState::SCISSOR,
            vk::DynamicState::LINE_WIDTH,
        ];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let bindings = [vk::VertexInputBindingDescription::default()
            .binding(0)
            .stride(config.stride)
            .input_rate(vk::VertexInputRate::VERTEX)];
        let attributes = vertex_attribute_descriptions(config.attributes);
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(config.descriptor_set_layouts)
            .push_constant_ranges(config.push_constant_ranges);

        let layout = device.create_pipeline_layout(&layout_info, None).map_err(|e| {
            tracing::error!("Failed to create pipeline layout: {e}");
            GpuError::PipelineCreation(e.to_string())
        })?;

        let stages: Vec<_> = config
            .stages
            .iter()
            .map(|stage| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage.stage)
                    .module(stage.module)
                    .name(ENTRY_POINT)
            })
            .collect();

        let mut pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisampling)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(config.renderpass)
            .subpass(0)
            .base_pipeline_index(-1);
        if let Some(depth_stencil) = depth_stencil.as_ref() {
            pipeline_info = pipeline_info.depth_stencil_state(depth_stencil);
        }

        let pipeline = match device.create_graphics_pipelines(
            vk::PipelineCache::null(),
            &[pipeline_info],
            None,
        ) {
            Ok(pipelines) => pipelines[0],
            Err((_pipelines, e)) => {
                tracing::error!("Failed to create graphics pipeline: {e}");
                device.destroy_pipeline_layout(layout, None);
                return Err(GpuError::PipelineCreation(e.to_string()));
            }
        };

        tracing::debug!(
            "Created graphics pipeline ({} stages, {} attributes, {} push ranges)",
            config.stages.len(),
            attributes.len(),
            config.push_constant_ranges.len()
        );

        Ok(Self { pipeline, layout })
    }

    /// Bind the pipeline for drawing.
    ///
    /// # Safety
    /// The device and command buffer must be valid and recording.
    pub unsafe fn bind(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline);
    }

    /// Destroy the pipeline.
    ///
    /// # Safety
    /// The device must be valid and the pipeline must not be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        if self.pipeline != vk::Pipeline::null() {
            device.destroy_pipeline(self.pipeline, None);
            self.pipeline = vk::Pipeline::null();
        }
        if self.layout != vk::PipelineLayout::null() {
            device.destroy_pipeline_layout(self.layout, None);
            self.layout = vk::PipelineLayout::null();
        }
    }
}

/// Depth-stencil state for a pipeline.
///
/// Vulkan requires the state whenever the subpass has a depth attachment, so
/// pipelines that skip depth testing get one with test and write disabled.
/// Renderpasses without depth take none.
pub fn depth_stencil_state(
    has_depth: bool,
    depth_test: bool,
) -> Option<vk::PipelineDepthStencilStateCreateInfo<'static>> {
    has_depth.then(|| {
        vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(depth_test)
            .depth_write_enable(depth_test)
            .depth_compare_op(vk::CompareOp::LESS)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(offset: u32, size: u32) -> vk::PushConstantRange {
        vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .offset(offset)
            .size(size)
    }

    #[test]
    fn attribute_offsets_accumulate() {
        let attributes = [
            VertexAttribute {
                format: vk::Format::R32G32B32_SFLOAT,
                size: 12,
            },
            VertexAttribute {
                format: vk::Format::R32G32_SFLOAT,
                size: 8,
            },
            VertexAttribute {
                format: vk::Format::R32G32B32A32_SFLOAT,
                size: 16,
            },
        ];

        let descriptions = vertex_attribute_descriptions(&attributes);
        let offsets: Vec<u32> = descriptions.iter().map(|d| d.offset).collect();
        let locations: Vec<u32> = descriptions.iter().map(|d| d.location).collect();

        assert_eq!(offsets, vec![0, 12, 20]);
        assert_eq!(locations, vec![0, 1, 2]);
        assert!(descriptions.iter().all(|d| d.binding == 0));
    }

    #[test]
    fn push_constant_range_count_limit() {
        let ranges: Vec<_> = (0..MAX_PUSH_CONSTANT_RANGES as u32)
            .map(|i| range(i * 4, 4))
            .collect();
        assert!(validate_push_constant_ranges(&ranges).is_ok());

        let mut too_many = ranges;
        too_many.push(range(0, 4));
        assert!(matches!(
            validate_push_constant_ranges(&too_many),
            Err(GpuError::PushConstantLimit(_))
        ));
    }

    #[test]
    fn push_constant_byte_limit() {
        assert!(validate_push_constant_ranges(&[range(64, 64)]).is_ok());
        assert!(validate_push_constant_ranges(&[range(64, 68)]).is_err());
    }

    #[test]
    fn cull_mode_mapping() {
        assert_eq!(CullMode::None.to_vk(), vk::CullModeFlags::NONE);
        assert_eq!(CullMode::default().to_vk(), vk::CullModeFlags::BACK);
        assert_eq!(
            CullMode::FrontAndBack.to_vk(),
            vk::CullModeFlags::FRONT_AND_BACK
        );
    }

    #[test]
    fn depth_state_follows_renderpass() {
        assert!(depth_stencil_state(false, true).is_none());
        assert!(depth_stencil_state(false, false).is_none());

        let tested = depth_stencil_state(true, true).unwrap();
        assert_eq!(tested.depth_test_enable, vk::TRUE);
        assert_eq!(tested.depth_write_enable, vk::TRUE);
        assert_eq!(tested.depth_compare_op, vk::CompareOp::LESS);

        // Overlay pipelines on a depth renderpass still carry the state.
        let untested = depth_stencil_state(true, false).unwrap();
        assert_eq!(untested.depth_test_enable, vk::FALSE);
        assert_eq!(untested.depth_write_enable, vk::FALSE);
        assert_eq!(untested.stencil_test_enable, vk::FALSE);
    }
}
