//! Application framework for the Kohi engine.
//!
//! This crate provides a trait-based application framework that handles
//! common boilerplate like:
//! - Logging setup
//! - Window creation and management
//! - Renderer initialization and shutdown
//! - Resize handling and the per-frame begin/end/present sequence
//!
//! # Example
//!
//! ```no_run
//! use kohi_app::{run_app, AppConfig, AppContext, FrameContext, KohiApp};
//!
//! struct MyApp;
//!
//! impl KohiApp for MyApp {
//!     fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
//!         Ok(MyApp)
//!     }
//!
//!     fn update(&mut self, ctx: &mut AppContext, dt: f32) {}
//!
//!     fn render_world(&mut self, ctx: &mut AppContext, frame: &FrameContext) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app::<MyApp>(AppConfig::default())
//! }
//! ```

mod app;
mod context;
mod runner;

pub use app::KohiApp;
pub use context::AppContext;
pub use runner::{init_logging, run_app, AppConfig};

// Re-export commonly used types for convenience
pub use kohi_renderer::{FrameContext, RendererBackend, RendererConfig};
pub use winit::event::WindowEvent;
