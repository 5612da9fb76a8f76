//! Core types, math, and resource loading for the Kohi engine.
//!
//! This crate provides the foundational pieces shared by the GPU and renderer crates:
//! - Engine-wide error type
//! - Alignment and range math used for GPU buffer layout
//! - Geometry value types (extents, rectangles)
//! - Binary resource loading from the asset directory

pub mod error;
pub mod math;
pub mod resource;
pub mod types;

pub use error::{Error, Result};
pub use math::{align_up, aligned_range, AlignedRange};
pub use resource::{FsResourceLoader, Resource, ResourceKind, ResourceLoader};
pub use types::{Extent, Rect};

/// Engine-wide constants
pub mod constants {
    /// Default directory assets are loaded from.
    pub const DEFAULT_ASSET_ROOT: &str = "assets";
    /// Directory (relative to the asset root) holding compiled SPIR-V stages.
    pub const SHADER_DIR: &str = "shaders";
    /// Sentinel for "no id" in fixed id spaces.
    pub const INVALID_ID: u32 = u32::MAX;
}
