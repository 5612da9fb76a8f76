//! Renderer entry point used by applications.

use kohi_core::{Extent, FsResourceLoader, ResourceLoader};
use kohi_gpu::{GpuContext, GpuContextBuilder, SurfaceContext};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::config::RendererConfig;
use crate::error::{RendererError, Result};
use crate::frame::{FrameContext, FrameLoop, FramePhase, FrameStatus};
use crate::presenter::{BuiltinRenderpass, PresenterFrame, SwapchainPresenter};
use crate::shader::{Shader, ShaderConfig, ShaderInitContext};
use crate::texture::{DefaultTexture, TextureBinding};

/// Owns the GPU context, the presenter and the frame loop.
///
/// A frame is driven as `begin_frame`, then renderpasses and draws, then
/// `end_frame` and `present`.
pub struct RendererBackend {
    config: RendererConfig,
    loader: Box<dyn ResourceLoader>,
    frames: FrameLoop,
    current: Option<FrameContext>,
    default_texture: DefaultTexture,
    presenter: SwapchainPresenter,
    shut_down: bool,
    gpu: GpuContext,
}

impl RendererBackend {
    /// Create the renderer for `window`.
    ///
    /// # Safety
    /// The window must outlive the renderer.
    pub unsafe fn new<W>(window: &W, size: Extent, config: RendererConfig) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let gpu = GpuContextBuilder::new()
            .app_name(&config.app_name)
            .validation(config.validation)
            .build()?;

        let loader = Box::new(FsResourceLoader::new(config.asset_root.clone()));
        Self::with_loader(gpu, window, size, config, loader)
    }

    /// Create the renderer on an existing context with a custom resource loader.
    ///
    /// # Safety
    /// The window must outlive the renderer.
    pub unsafe fn with_loader<W>(
        gpu: GpuContext,
        window: &W,
        size: Extent,
        config: RendererConfig,
        loader: Box<dyn ResourceLoader>,
    ) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let frames_in_flight = config.max_frames_in_flight.max(1);
        let extent = Extent::new(size.width.max(1), size.height.max(1));

        let surface = SurfaceContext::from_window(&gpu, window)?;
        let mut presenter = SwapchainPresenter::new(
            &gpu,
            surface,
            extent,
            config.vsync,
            frames_in_flight,
            config.clear_colour,
        )?;

        let default_texture = match DefaultTexture::new(&gpu, presenter.command_pool()) {
            Ok(texture) => texture,
            Err(e) => {
                presenter.destroy(&gpu);
                return Err(e);
            }
        };

        let swapchain_extent = presenter.extent();
        let frames = FrameLoop::new(
            frames_in_flight,
            presenter.image_count(),
            Extent::new(swapchain_extent.width, swapchain_extent.height),
        );

        tracing::info!("Renderer backend initialized");
        Ok(Self {
            config,
            loader,
            frames,
            current: None,
            default_texture,
            presenter,
            shut_down: false,
            gpu,
        })
    }

    #[inline]
    pub fn gpu(&self) -> &GpuContext {
        &self.gpu
    }

    #[inline]
    pub fn device(&self) -> &ash::Device {
        self.gpu.device()
    }

    #[inline]
    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    /// Frames presented so far.
    #[inline]
    pub fn frame_number(&self) -> u64 {
        self.frames.frame_number()
    }

    /// Swapchain size.
    pub fn extent(&self) -> Extent {
        let extent = self.presenter.extent();
        Extent::new(extent.width, extent.height)
    }

    /// The frame being recorded, if any.
    #[inline]
    pub fn frame(&self) -> Option<&FrameContext> {
        self.current.as_ref()
    }

    /// Texture shown by sampler slots with nothing loaded.
    pub fn default_texture(&self) -> TextureBinding {
        self.default_texture.binding()
    }

    /// A shader config carrying the renderer's limits.
    pub fn shader_config(&self, name: impl Into<String>) -> ShaderConfig {
        ShaderConfig::new(name).with_limits(self.config.shader_limits)
    }

    /// Record a framebuffer resize; applied at the next `begin_frame`.
    pub fn on_resize(&mut self, width: u32, height: u32) {
        self.frames.on_resize(width, height);
    }

    /// Start a frame. `Skipped` means nothing should be drawn this frame.
    pub fn begin_frame(&mut self, delta_time: f32) -> Result<FrameStatus> {
        let mut device = PresenterFrame {
            gpu: &self.gpu,
            presenter: &mut self.presenter,
        };
        let status = self.frames.begin_frame(&mut device, delta_time)?;
        self.current = match status {
            FrameStatus::Ready(ctx) => Some(ctx),
            FrameStatus::Skipped => None,
        };
        Ok(status)
    }

    /// Finish recording and submit.
    pub fn end_frame(&mut self) -> Result<()> {
        let mut device = PresenterFrame {
            gpu: &self.gpu,
            presenter: &mut self.presenter,
        };
        self.frames.end_frame(&mut device)
    }

    /// Present the submitted frame.
    pub fn present(&mut self) -> Result<()> {
        let mut device = PresenterFrame {
            gpu: &self.gpu,
            presenter: &mut self.presenter,
        };
        let result = self.frames.present(&mut device);
        if self.frames.phase() == FramePhase::Idle {
            self.current = None;
        }
        result
    }

    fn recording_image(&self) -> Result<u32> {
        self.current
            .map(|ctx| ctx.image_index)
            .ok_or_else(|| RendererError::FrameState("no frame is being recorded".to_string()))
    }

    /// Begin one of the builtin renderpasses on the current frame.
    pub fn begin_renderpass(&mut self, pass: BuiltinRenderpass) -> Result<()> {
        let image = self.recording_image()?;
        // SAFETY: the current frame's command buffer is recording.
        unsafe {
            self.presenter
                .begin_renderpass(self.gpu.device(), pass, image)
        }
    }

    /// End one of the builtin renderpasses on the current frame.
    pub fn end_renderpass(&mut self, pass: BuiltinRenderpass) -> Result<()> {
        let image = self.recording_image()?;
        // SAFETY: the current frame's command buffer is recording.
        unsafe { self.presenter.end_renderpass(self.gpu.device(), pass, image) }
    }

    /// Build `shader`'s GPU resources against `pass`.
    pub fn initialize_shader(&self, shader: &mut Shader, pass: BuiltinRenderpass) -> Result<()> {
        let ctx = ShaderInitContext {
            gpu: &self.gpu,
            loader: self.loader.as_ref(),
            renderpass: self.presenter.renderpass(pass),
            extent: self.extent(),
            frames_in_flight: self.frames.frames_in_flight(),
            default_texture: self.default_texture.binding(),
        };
        // SAFETY: the context and renderpass outlive the shader while the
        // backend is alive; shaders are destroyed through `destroy_shader`.
        unsafe { shader.initialize(&ctx) }
    }

    /// Reclaim `shader`'s released instances that no frame can still use.
    pub fn collect_shader_garbage(&self, shader: &mut Shader) -> Result<usize> {
        // SAFETY: the shader was initialized on this device.
        unsafe { shader.collect_garbage(self.gpu.device(), self.frames.frame_number()) }
    }

    /// Destroy `shader`'s GPU resources.
    pub fn destroy_shader(&self, shader: &mut Shader) -> Result<()> {
        // SAFETY: the shader was initialized on this context.
        unsafe { shader.destroy(&self.gpu) }
    }

    /// Wait for the GPU and destroy everything the backend owns.
    ///
    /// Shaders must be destroyed first.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        if let Err(e) = self.gpu.wait_idle() {
            tracing::error!("Failed to wait for device idle: {e}");
        }
        // SAFETY: the device is idle.
        unsafe {
            self.default_texture.destroy(&self.gpu);
            self.presenter.destroy(&self.gpu);
        }
        tracing::info!("Renderer backend shut down");
    }
}

impl Drop for RendererBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}
