//! Swapchain-backed implementation of [`FrameDevice`].

use ash::vk;
use gpu_allocator::MemoryLocation;
use kohi_core::{Extent, Rect};
use kohi_gpu::capabilities::{detect_depth_format, format_has_stencil};
use kohi_gpu::command::submit_command_buffers;
use kohi_gpu::{
    create_image_view, AcquireOutcome, CommandBuffer, CommandPool, FrameSync, GpuContext,
    GpuError, GpuImage, PresentOutcome, Renderpass, RenderpassClearFlags, RenderpassConfig,
    SurfaceContext, Swapchain,
};

use crate::error::{RendererError, Result};
use crate::frame::FrameDevice;

/// The renderpasses every frame goes through, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BuiltinRenderpass {
    /// Clears colour and depth, hands the image on to the UI pass.
    World,
    /// Draws over the world pass and leaves the image ready to present.
    Ui,
}

struct DepthAttachment {
    image: GpuImage,
    view: vk::ImageView,
}

impl DepthAttachment {
    unsafe fn new(gpu: &GpuContext, format: vk::Format, extent: vk::Extent2D) -> Result<Self> {
        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let mut image = gpu
            .allocator()
            .lock()
            .create_image(&create_info, MemoryLocation::GpuOnly, "depth attachment")?;

        let mut aspect = vk::ImageAspectFlags::DEPTH;
        if format_has_stencil(format) {
            aspect |= vk::ImageAspectFlags::STENCIL;
        }
        match create_image_view(gpu.device(), image.image, format, aspect) {
            Ok(view) => Ok(Self { image, view }),
            Err(e) => {
                if let Err(free_err) = gpu.allocator().lock().free_image(&mut image) {
                    tracing::warn!("Failed to free depth attachment after error: {free_err}");
                }
                Err(e.into())
            }
        }
    }

    unsafe fn destroy(&mut self, gpu: &GpuContext) {
        gpu.device().destroy_image_view(self.view, None);
        self.view = vk::ImageView::null();
        if let Err(e) = gpu.allocator().lock().free_image(&mut self.image) {
            tracing::error!("Failed to free depth attachment: {e}");
        }
    }
}

/// Swapchain, builtin renderpasses and the per-image and per-frame objects
/// sized by them.
pub struct SwapchainPresenter {
    surface: SurfaceContext,
    swapchain: Swapchain,
    vsync: bool,
    depth_format: vk::Format,
    depth: Option<DepthAttachment>,
    world_pass: Renderpass,
    ui_pass: Renderpass,
    world_framebuffers: Vec<vk::Framebuffer>,
    ui_framebuffers: Vec<vk::Framebuffer>,
    command_pool: CommandPool,
    /// One per swapchain image.
    command_buffers: Vec<CommandBuffer>,
    /// One per frame in flight.
    sync: Vec<FrameSync>,
}

impl SwapchainPresenter {
    /// Build the swapchain and everything that depends on it.
    ///
    /// # Safety
    /// The GPU context must be valid and outlive the presenter.
    pub unsafe fn new(
        gpu: &GpuContext,
        surface: SurfaceContext,
        extent: Extent,
        vsync: bool,
        frames_in_flight: usize,
        clear_colour: [f32; 4],
    ) -> Result<Self> {
        let device = gpu.device();

        let depth_format = detect_depth_format(gpu.instance(), gpu.physical_device())
            .ok_or_else(|| GpuError::Other("no supported depth format".to_string()))
            .inspect_err(|e| tracing::error!("{e}"))?;

        let swapchain = surface.create_swapchain(gpu, extent.width, extent.height, vsync, None)?;
        let area = Rect::new(
            0.0,
            0.0,
            swapchain.extent.width as f32,
            swapchain.extent.height as f32,
        );

        let world_pass = Renderpass::new(
            device,
            RenderpassConfig {
                render_area: area,
                clear_colour,
                depth: 1.0,
                stencil: 0,
                clear_flags: RenderpassClearFlags::COLOUR
                    | RenderpassClearFlags::DEPTH
                    | RenderpassClearFlags::STENCIL,
                has_prev_pass: false,
                has_next_pass: true,
            },
            swapchain.format,
            depth_format,
        )?;
        let ui_pass = Renderpass::new(
            device,
            RenderpassConfig {
                render_area: area,
                clear_flags: RenderpassClearFlags::empty(),
                has_prev_pass: true,
                has_next_pass: false,
                ..RenderpassConfig::default()
            },
            swapchain.format,
            depth_format,
        )?;

        let command_pool = CommandPool::new(
            device,
            gpu.graphics_queue_family(),
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )?;

        let mut sync = Vec::with_capacity(frames_in_flight);
        for _ in 0..frames_in_flight {
            sync.push(FrameSync::new(device)?);
        }

        let mut presenter = Self {
            surface,
            swapchain,
            vsync,
            depth_format,
            depth: None,
            world_pass,
            ui_pass,
            world_framebuffers: Vec::new(),
            ui_framebuffers: Vec::new(),
            command_pool,
            command_buffers: Vec::new(),
            sync,
        };
        if let Err(e) = presenter.create_sized_resources(gpu) {
            presenter.destroy(gpu);
            return Err(e);
        }

        tracing::info!(
            "Presenter ready: {}x{}, {} images, {} frames in flight, depth {:?}",
            presenter.swapchain.extent.width,
            presenter.swapchain.extent.height,
            presenter.swapchain.image_count(),
            frames_in_flight,
            depth_format
        );
        Ok(presenter)
    }

    /// Depth image, framebuffers and command buffers for the current swapchain.
    unsafe fn create_sized_resources(&mut self, gpu: &GpuContext) -> Result<()> {
        let device = gpu.device();
        let extent = self.swapchain.extent;

        let depth = DepthAttachment::new(gpu, self.depth_format, extent)?;
        let depth_view = depth.view;
        self.depth = Some(depth);

        for &colour in &self.swapchain.image_views {
            let world = create_framebuffer(device, &self.world_pass, &[colour, depth_view], extent)?;
            self.world_framebuffers.push(world);
            let ui = create_framebuffer(device, &self.ui_pass, &[colour], extent)?;
            self.ui_framebuffers.push(ui);
        }

        self.command_buffers = self
            .command_pool
            .allocate_tracked(device, self.swapchain.image_count() as u32)?;

        let area = Rect::new(0.0, 0.0, extent.width as f32, extent.height as f32);
        self.world_pass.set_render_area(area);
        self.ui_pass.set_render_area(area);
        Ok(())
    }

    unsafe fn destroy_sized_resources(&mut self, gpu: &GpuContext) {
        let device = gpu.device();
        self.command_pool
            .free_tracked(device, &mut self.command_buffers);
        for framebuffer in self
            .world_framebuffers
            .drain(..)
            .chain(self.ui_framebuffers.drain(..))
        {
            device.destroy_framebuffer(framebuffer, None);
        }
        if let Some(mut depth) = self.depth.take() {
            depth.destroy(gpu);
        }
    }

    /// Rebuild the swapchain at `extent` along with everything sized by it.
    ///
    /// # Safety
    /// The device must be idle.
    pub unsafe fn rebuild(&mut self, gpu: &GpuContext, extent: Extent) -> Result<()> {
        // The format cannot change on the same device, but a failed query
        // means the device is in trouble.
        if detect_depth_format(gpu.instance(), gpu.physical_device()) != Some(self.depth_format) {
            tracing::warn!("Depth format support changed, keeping {:?}", self.depth_format);
        }

        self.destroy_sized_resources(gpu);
        self.surface.recreate_swapchain(
            gpu,
            &mut self.swapchain,
            extent.width,
            extent.height,
            self.vsync,
        )?;
        self.create_sized_resources(gpu)
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    #[inline]
    pub fn image_count(&self) -> usize {
        self.swapchain.image_count()
    }

    #[inline]
    pub fn colour_format(&self) -> vk::Format {
        self.swapchain.format
    }

    #[inline]
    pub fn depth_format(&self) -> vk::Format {
        self.depth_format
    }

    /// Pool command buffers are allocated from; also used for one-off uploads.
    #[inline]
    pub fn command_pool(&self) -> &CommandPool {
        &self.command_pool
    }

    pub fn renderpass(&self, pass: BuiltinRenderpass) -> &Renderpass {
        match pass {
            BuiltinRenderpass::World => &self.world_pass,
            BuiltinRenderpass::Ui => &self.ui_pass,
        }
    }

    /// Begin `pass` on the command buffer of `image_index`.
    ///
    /// # Safety
    /// The command buffer must be recording.
    pub unsafe fn begin_renderpass(
        &mut self,
        device: &ash::Device,
        pass: BuiltinRenderpass,
        image_index: u32,
    ) -> Result<()> {
        let image = image_index as usize;
        let (renderpass, framebuffers) = match pass {
            BuiltinRenderpass::World => (&self.world_pass, &self.world_framebuffers),
            BuiltinRenderpass::Ui => (&self.ui_pass, &self.ui_framebuffers),
        };
        let framebuffer = *framebuffers
            .get(image)
            .ok_or_else(|| RendererError::FrameState(format!("no framebuffer for image {image}")))?;
        let cmd = self
            .command_buffers
            .get_mut(image)
            .ok_or_else(|| RendererError::FrameState(format!("no command buffer for image {image}")))?;
        renderpass.begin(device, cmd, framebuffer)?;
        Ok(())
    }

    /// End `pass` on the command buffer of `image_index`.
    ///
    /// # Safety
    /// `pass` must have been begun on that command buffer.
    pub unsafe fn end_renderpass(
        &mut self,
        device: &ash::Device,
        pass: BuiltinRenderpass,
        image_index: u32,
    ) -> Result<()> {
        let image = image_index as usize;
        let renderpass = match pass {
            BuiltinRenderpass::World => &self.world_pass,
            BuiltinRenderpass::Ui => &self.ui_pass,
        };
        let cmd = self
            .command_buffers
            .get_mut(image)
            .ok_or_else(|| RendererError::FrameState(format!("no command buffer for image {image}")))?;
        renderpass.end(device, cmd)?;
        Ok(())
    }

    /// Destroy everything, including the surface.
    ///
    /// # Safety
    /// The device must be idle.
    pub unsafe fn destroy(&mut self, gpu: &GpuContext) {
        let device = gpu.device();
        self.destroy_sized_resources(gpu);
        for sync in self.sync.drain(..) {
            sync.destroy(device);
        }
        self.command_pool.destroy(device);
        self.ui_pass.destroy(device);
        self.world_pass.destroy(device);
        self.swapchain
            .destroy(device, &self.surface.swapchain_loader);
        self.surface.destroy();
    }

    fn command_buffer_mut(&mut self, image_index: u32) -> Result<&mut CommandBuffer> {
        self.command_buffers
            .get_mut(image_index as usize)
            .ok_or_else(|| {
                RendererError::FrameState(format!("no command buffer for image {image_index}"))
            })
    }

    fn frame_sync(&self, frame: usize) -> Result<&FrameSync> {
        self.sync
            .get(frame)
            .ok_or_else(|| RendererError::FrameState(format!("no sync objects for frame {frame}")))
    }
}

unsafe fn create_framebuffer(
    device: &ash::Device,
    renderpass: &Renderpass,
    attachments: &[vk::ImageView],
    extent: vk::Extent2D,
) -> Result<vk::Framebuffer> {
    let info = vk::FramebufferCreateInfo::default()
        .render_pass(renderpass.handle())
        .attachments(attachments)
        .width(extent.width)
        .height(extent.height)
        .layers(1);
    Ok(device.create_framebuffer(&info, None)?)
}

/// A presenter paired with the context it was built from, for one frame call.
pub struct PresenterFrame<'a> {
    pub gpu: &'a GpuContext,
    pub presenter: &'a mut SwapchainPresenter,
}

impl FrameDevice for PresenterFrame<'_> {
    fn image_count(&self) -> usize {
        self.presenter.image_count()
    }

    fn wait_idle(&mut self) -> Result<()> {
        Ok(self.gpu.wait_idle()?)
    }

    fn wait_for_frame(&mut self, frame: usize) -> Result<()> {
        let sync = self.presenter.frame_sync(frame)?;
        // SAFETY: the fence belongs to this device.
        unsafe { sync.wait(self.gpu.device())? };
        Ok(())
    }

    fn acquire_next_image(&mut self, frame: usize) -> Result<AcquireOutcome> {
        let semaphore = self.presenter.frame_sync(frame)?.image_available;
        // SAFETY: swapchain and semaphore are live until the next rebuild.
        let outcome = unsafe {
            self.presenter.swapchain.acquire_next_image(
                &self.presenter.surface.swapchain_loader,
                semaphore,
                u64::MAX,
            )?
        };
        Ok(outcome)
    }

    fn begin_recording(&mut self, image_index: u32) -> Result<vk::CommandBuffer> {
        let device = self.gpu.device();
        let extent = self.presenter.swapchain.extent;
        let cmd = self.presenter.command_buffer_mut(image_index)?;

        // SAFETY: begin_frame waited on the fence of whichever slot last submitted
        // this image's command buffer before calling in here.
        unsafe {
            cmd.begin(device, vk::CommandBufferUsageFlags::empty())?;

            // Flipped so that +Y is up in clip space.
            let viewport = vk::Viewport {
                x: 0.0,
                y: extent.height as f32,
                width: extent.width as f32,
                height: -(extent.height as f32),
                min_depth: 0.0,
                max_depth: 1.0,
            };
            let scissor = vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            };
            device.cmd_set_viewport(cmd.handle(), 0, &[viewport]);
            device.cmd_set_scissor(cmd.handle(), 0, &[scissor]);
        }
        Ok(cmd.handle())
    }

    fn end_recording(&mut self, image_index: u32) -> Result<()> {
        let device = self.gpu.device();
        let cmd = self.presenter.command_buffer_mut(image_index)?;
        // SAFETY: the buffer is recording.
        unsafe { cmd.end(device)? };
        Ok(())
    }

    fn submit(&mut self, frame: usize, image_index: u32) -> Result<()> {
        let device = self.gpu.device();
        let queue = self.gpu.graphics_queue();
        let (image_available, queue_complete, in_flight) = {
            let sync = self.presenter.frame_sync(frame)?;
            (sync.image_available, sync.queue_complete, sync.in_flight)
        };
        let cmd = self.presenter.command_buffer_mut(image_index)?;

        // SAFETY: all handles belong to this device and the fence was waited on.
        unsafe {
            device.reset_fences(&[in_flight])?;
            submit_command_buffers(
                device,
                queue,
                &[cmd.handle()],
                &[image_available],
                &[vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
                &[queue_complete],
                in_flight,
            )?;
        }
        cmd.mark_submitted()?;
        Ok(())
    }

    fn present(&mut self, frame: usize, image_index: u32) -> Result<PresentOutcome> {
        let queue_complete = self.presenter.frame_sync(frame)?.queue_complete;
        // SAFETY: the image was acquired and its submission signals `queue_complete`.
        let outcome = unsafe {
            self.presenter.swapchain.present(
                &self.presenter.surface.swapchain_loader,
                self.gpu.graphics_queue(),
                image_index,
                &[queue_complete],
            )?
        };
        Ok(outcome)
    }

    fn recreate_swapchain(&mut self, extent: Extent) -> Result<()> {
        // SAFETY: the frame loop waits for idle before recreating.
        unsafe { self.presenter.rebuild(self.gpu, extent) }
    }
}
