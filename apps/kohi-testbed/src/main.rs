//! Kohi Engine Testbed
//!
//! Draws a spinning, colour-cycling triangle through the builtin object shader.
//! Exercises the shader system end to end: global uniforms, an instance with
//! its own uniform region, and a per-draw push constant.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p kohi-testbed -- [OPTIONS]
//! ```
//!
//! The build script compiles `assets/shaders/*.{vert,frag}` to SPIR-V, and the
//! renderer loads them from the workspace `assets` directory.
//!
//! ## Options
//!
//! - `--no-vsync`: Present without waiting for vertical blank
//! - `--validation`: Force Vulkan validation layers on
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod app;

use kohi_app::{run_app, AppConfig};

use crate::app::Testbed;

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;
const TARGET_FPS: u32 = 240;

/// Workspace asset directory, resolved by the build script.
const ASSET_ROOT: &str = env!("KOHI_ASSET_ROOT");

fn main() -> anyhow::Result<()> {
    // Check for help flag before starting the app
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    let mut config = AppConfig::new("Kohi Engine Testbed")
        .with_size(WIDTH, HEIGHT)
        .with_target_fps(TARGET_FPS);
    config.renderer = config.renderer.with_asset_root(ASSET_ROOT);

    if std::env::args().any(|arg| arg == "--no-vsync") {
        config = config.with_vsync(false);
    }
    if std::env::args().any(|arg| arg == "--validation") {
        config = config.with_validation(true);
    }

    run_app::<Testbed>(config)
}

fn print_help() {
    eprintln!(
        "Kohi Engine Testbed

USAGE:
    cargo run -p kohi-testbed -- [OPTIONS]

OPTIONS:
    --no-vsync              Present without waiting for vertical blank
    --validation            Force Vulkan validation layers on
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)"
    );
}
