//! Application context.

use std::sync::Arc;
use std::time::Instant;

use kohi_core::Extent;
use kohi_renderer::{RendererBackend, RendererConfig};
use winit::window::Window;

/// Application context shared across all app methods.
pub struct AppContext {
    /// The window handle.
    pub window: Arc<Window>,
    /// Renderer driving the swapchain and frame loop.
    pub renderer: RendererBackend,
    /// Total frames rendered.
    pub frame_count: u64,
    /// Time of last frame (for delta time calculation).
    pub(crate) last_frame_time: Instant,
}

impl AppContext {
    /// Create the renderer for `window`.
    pub(crate) fn new(window: Arc<Window>, config: RendererConfig) -> anyhow::Result<Self> {
        let size = window.inner_size();
        let extent = Extent::new(size.width.max(1), size.height.max(1));

        // SAFETY: the context keeps the window alive for as long as the renderer.
        let renderer = unsafe { RendererBackend::new(window.as_ref(), extent, config)? };

        tracing::info!("GPU: {}", renderer.gpu().capabilities().summary());

        Ok(Self {
            window,
            renderer,
            frame_count: 0,
            last_frame_time: Instant::now(),
        })
    }

    /// Current swapchain size.
    pub fn extent(&self) -> Extent {
        self.renderer.extent()
    }

    /// Get the swapchain width.
    pub fn width(&self) -> u32 {
        self.extent().width
    }

    /// Get the swapchain height.
    pub fn height(&self) -> u32 {
        self.extent().height
    }

    /// Get the aspect ratio (width / height).
    pub fn aspect_ratio(&self) -> f32 {
        self.extent().aspect_ratio()
    }
}
