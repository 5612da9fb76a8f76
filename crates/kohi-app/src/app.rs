//! `KohiApp` trait definition.

use kohi_renderer::FrameContext;
use winit::event::WindowEvent;

use crate::context::AppContext;

/// Trait for Kohi applications.
///
/// The framework owns the window and renderer and drives each frame: it begins
/// the frame, runs the world pass, then the UI pass, then submits and presents.
/// Frames skipped by the renderer (e.g. while the swapchain is rebuilt) call
/// neither render method.
pub trait KohiApp: Sized {
    /// Initialize the application.
    ///
    /// Called once after the window and renderer have been created. Create and
    /// initialize shaders here.
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self>;

    /// Update application state.
    ///
    /// Called every frame before rendering, including skipped frames.
    fn update(&mut self, ctx: &mut AppContext, dt: f32);

    /// Record draws inside the world renderpass.
    fn render_world(&mut self, ctx: &mut AppContext, frame: &FrameContext) -> anyhow::Result<()>;

    /// Record draws inside the UI renderpass.
    ///
    /// Default implementation draws nothing.
    #[allow(unused_variables)]
    fn render_ui(&mut self, ctx: &mut AppContext, frame: &FrameContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handle window resize.
    ///
    /// The swapchain is rebuilt by the renderer at the start of the next frame.
    ///
    /// Default implementation does nothing.
    #[allow(unused_variables)]
    fn on_resize(&mut self, ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handle window events.
    ///
    /// Return `true` if the event was handled and should not be processed further.
    ///
    /// Default implementation does nothing and returns `false`.
    #[allow(unused_variables)]
    fn on_event(&mut self, event: &WindowEvent) -> bool {
        false
    }

    /// Cleanup resources before shutdown.
    ///
    /// Called while the renderer is still alive; destroy shaders and buffers here.
    ///
    /// Default implementation does nothing.
    #[allow(unused_variables)]
    fn cleanup(&mut self, ctx: &mut AppContext) {}
}
