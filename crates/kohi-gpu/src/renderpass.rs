//! Renderpass creation and begin/end recording.
//!
//! Attachment load/store ops and layout transitions are derived from a
//! [`RenderpassConfig`] by [`plan_attachments`], which has no device
//! dependency so pass chaining can be checked in isolation.

use ash::vk;
use bitflags::bitflags;
use kohi_core::Rect;

use crate::command::CommandBuffer;
use crate::error::Result;

bitflags! {
    /// Which attachments a renderpass clears when it begins.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RenderpassClearFlags: u8 {
        /// Clear the colour attachment.
        const COLOUR  = 0b0000_0001;
        /// Clear (and attach) the depth buffer.
        const DEPTH   = 0b0000_0010;
        /// Clear the stencil aspect of the depth buffer.
        const STENCIL = 0b0000_0100;
    }
}

/// Declarative description of a renderpass.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenderpassConfig {
    pub render_area: Rect,
    pub clear_colour: [f32; 4],
    pub depth: f32,
    pub stencil: u32,
    pub clear_flags: RenderpassClearFlags,
    /// Another pass renders into the same target before this one.
    pub has_prev_pass: bool,
    /// Another pass renders into the same target after this one.
    pub has_next_pass: bool,
}

impl Default for RenderpassConfig {
    fn default() -> Self {
        Self {
            render_area: Rect::default(),
            clear_colour: [0.0, 0.0, 0.0, 1.0],
            depth: 1.0,
            stencil: 0,
            clear_flags: RenderpassClearFlags::empty(),
            has_prev_pass: false,
            has_next_pass: false,
        }
    }
}

/// Attachment descriptions for a renderpass, colour first.
#[derive(Clone, Copy, Debug)]
pub struct AttachmentPlan {
    pub colour: vk::AttachmentDescription,
    pub depth: Option<vk::AttachmentDescription>,
}

impl AttachmentPlan {
    /// Attachments in framebuffer order.
    pub fn descriptions(&self) -> Vec<vk::AttachmentDescription> {
        std::iter::once(self.colour).chain(self.depth).collect()
    }
}

/// Work out load/store ops and layouts for the pass's attachments.
pub fn plan_attachments(
    config: &RenderpassConfig,
    colour_format: vk::Format,
    depth_format: vk::Format,
) -> AttachmentPlan {
    let clear_colour = config.clear_flags.contains(RenderpassClearFlags::COLOUR);

    let colour = vk::AttachmentDescription::default()
        .format(colour_format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(if clear_colour {
            vk::AttachmentLoadOp::CLEAR
        } else {
            vk::AttachmentLoadOp::LOAD
        })
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(if config.has_prev_pass {
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        } else {
            vk::ImageLayout::UNDEFINED
        })
        .final_layout(if config.has_next_pass {
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        } else {
            vk::ImageLayout::PRESENT_SRC_KHR
        });

    // Depth is rebuilt every frame, so nothing is ever loaded from or stored to it
    // beyond the clear.
    let depth = config
        .clear_flags
        .contains(RenderpassClearFlags::DEPTH)
        .then(|| {
            vk::AttachmentDescription::default()
                .format(depth_format)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::DONT_CARE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        });

    AttachmentPlan { colour, depth }
}

/// Clear values in attachment order: colour if cleared, then depth/stencil if cleared.
///
/// Clear values are indexed by attachment number, so a depth clear always
/// occupies slot 1 even when the colour attachment is loaded.
pub fn clear_values(config: &RenderpassConfig) -> Vec<vk::ClearValue> {
    let mut values = Vec::with_capacity(2);

    if config
        .clear_flags
        .intersects(RenderpassClearFlags::COLOUR | RenderpassClearFlags::DEPTH)
    {
        values.push(vk::ClearValue {
            color: vk::ClearColorValue {
                float32: config.clear_colour,
            },
        });
    }

    if config.clear_flags.contains(RenderpassClearFlags::DEPTH) {
        let stencil = if config.clear_flags.contains(RenderpassClearFlags::STENCIL) {
            config.stencil
        } else {
            0
        };
        values.push(vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: config.depth,
                stencil,
            },
        });
    }

    values
}

/// A renderpass object and the configuration it was built from.
pub struct Renderpass {
    handle: vk::RenderPass,
    config: RenderpassConfig,
    has_depth: bool,
}

impl Renderpass {
    /// Create a single-subpass renderpass.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        config: RenderpassConfig,
        colour_format: vk::Format,
        depth_format: vk::Format,
    ) -> Result<Self> {
        let plan = plan_attachments(&config, colour_format, depth_format);
        let attachments = plan.descriptions();

        let colour_refs = [vk::AttachmentReference::default()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)];
        let depth_ref = vk::AttachmentReference::default()
            .attachment(1)
            .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);

        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&colour_refs);
        if plan.depth.is_some() {
            subpass = subpass.depth_stencil_attachment(&depth_ref);
        }

        let dependency = vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_READ
                    | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            );

        let subpasses = [subpass];
        let dependencies = [dependency];
        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let handle = device.create_render_pass(&create_info, None)?;

        tracing::debug!(
            "Created renderpass ({} attachments, prev: {}, next: {})",
            attachments.len(),
            config.has_prev_pass,
            config.has_next_pass
        );

        Ok(Self {
            handle,
            config,
            has_depth: plan.depth.is_some(),
        })
    }

    /// Raw handle.
    #[inline]
    pub fn handle(&self) -> vk::RenderPass {
        self.handle
    }

    /// Configuration the pass was created with.
    #[inline]
    pub fn config(&self) -> &RenderpassConfig {
        &self.config
    }

    /// Returns true if framebuffers for this pass need a depth view.
    #[inline]
    pub fn has_depth(&self) -> bool {
        self.has_depth
    }

    /// Update the render area, e.g. after a resize.
    pub fn set_render_area(&mut self, area: Rect) {
        self.config.render_area = area;
    }

    /// Begin the pass on `cmd` targeting `framebuffer`.
    ///
    /// # Safety
    /// The device, command buffer and framebuffer must be valid and compatible.
    pub unsafe fn begin(
        &self,
        device: &ash::Device,
        cmd: &mut CommandBuffer,
        framebuffer: vk::Framebuffer,
    ) -> Result<()> {
        cmd.mark_in_render_pass()?;

        let area = self.config.render_area;
        let render_area = vk::Rect2D {
            offset: vk::Offset2D {
                x: area.x as i32,
                y: area.y as i32,
            },
            extent: vk::Extent2D {
                width: area.width as u32,
                height: area.height as u32,
            },
        };
        let clears = clear_values(&self.config);

        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(self.handle)
            .framebuffer(framebuffer)
            .render_area(render_area)
            .clear_values(&clears);

        device.cmd_begin_render_pass(cmd.handle(), &begin_info, vk::SubpassContents::INLINE);
        Ok(())
    }

    /// End the pass on `cmd`.
    ///
    /// # Safety
    /// The device and command buffer must be valid.
    pub unsafe fn end(&self, device: &ash::Device, cmd: &mut CommandBuffer) -> Result<()> {
        cmd.mark_render_pass_ended()?;
        device.cmd_end_render_pass(cmd.handle());
        Ok(())
    }

    /// Destroy the pass.
    ///
    /// # Safety
    /// The device must be valid and the pass must not be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        if self.handle != vk::RenderPass::null() {
            device.destroy_render_pass(self.handle, None);
            self.handle = vk::RenderPass::null();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COLOUR: vk::Format = vk::Format::B8G8R8A8_UNORM;
    const DEPTH: vk::Format = vk::Format::D32_SFLOAT;

    fn world_pass() -> RenderpassConfig {
        RenderpassConfig {
            clear_flags: RenderpassClearFlags::COLOUR
                | RenderpassClearFlags::DEPTH
                | RenderpassClearFlags::STENCIL,
            has_prev_pass: false,
            has_next_pass: true,
            ..Default::default()
        }
    }

    fn ui_pass() -> RenderpassConfig {
        RenderpassConfig {
            has_prev_pass: true,
            has_next_pass: false,
            ..Default::default()
        }
    }

    #[test]
    fn first_pass_layouts() {
        let plan = plan_attachments(&world_pass(), COLOUR, DEPTH);
        assert_eq!(plan.colour.initial_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(
            plan.colour.final_layout,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
    }

    #[test]
    fn last_pass_layouts() {
        let plan = plan_attachments(&ui_pass(), COLOUR, DEPTH);
        assert_eq!(
            plan.colour.initial_layout,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
        assert_eq!(plan.colour.final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
    }

    #[test]
    fn colour_load_op_follows_clear_flag() {
        let cleared = plan_attachments(&world_pass(), COLOUR, DEPTH);
        assert_eq!(cleared.colour.load_op, vk::AttachmentLoadOp::CLEAR);

        let preserved = plan_attachments(&ui_pass(), COLOUR, DEPTH);
        assert_eq!(preserved.colour.load_op, vk::AttachmentLoadOp::LOAD);
        assert_eq!(preserved.colour.store_op, vk::AttachmentStoreOp::STORE);
    }

    #[test]
    fn depth_only_with_depth_clear() {
        let world = plan_attachments(&world_pass(), COLOUR, DEPTH);
        let depth = world.depth.unwrap();
        assert_eq!(depth.format, DEPTH);
        assert_eq!(depth.store_op, vk::AttachmentStoreOp::DONT_CARE);
        assert_eq!(depth.stencil_load_op, vk::AttachmentLoadOp::DONT_CARE);
        assert_eq!(world.descriptions().len(), 2);

        let ui = plan_attachments(&ui_pass(), COLOUR, DEPTH);
        assert!(ui.depth.is_none());
        assert_eq!(ui.descriptions().len(), 1);
    }

    #[test]
    fn clear_values_are_positional() {
        let mut config = world_pass();
        config.clear_colour = [0.1, 0.2, 0.3, 1.0];
        config.stencil = 7;

        let values = clear_values(&config);
        assert_eq!(values.len(), 2);
        unsafe {
            assert_eq!(values[0].color.float32, [0.1, 0.2, 0.3, 1.0]);
            assert_eq!(values[1].depth_stencil.stencil, 7);
        }

        config.clear_flags = RenderpassClearFlags::DEPTH;
        let values = clear_values(&config);
        assert_eq!(values.len(), 2);
        unsafe {
            assert_eq!(values[1].depth_stencil.depth, 1.0);
            assert_eq!(values[1].depth_stencil.stencil, 0);
        }

        assert!(clear_values(&ui_pass()).is_empty());
    }
}
