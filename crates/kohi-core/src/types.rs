//! Geometry value types shared by the renderer.

use glam::Vec4;
use serde::{Deserialize, Serialize};

/// Two-dimensional size in pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    /// Create a new extent.
    #[inline]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Returns true if either dimension is zero (e.g. a minimized window).
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Width divided by height, or 1.0 for an empty extent.
    #[inline]
    pub fn aspect_ratio(&self) -> f32 {
        if self.is_empty() {
            1.0
        } else {
            self.width as f32 / self.height as f32
        }
    }
}

/// Axis-aligned rectangle in pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    /// Create a new rectangle.
    #[inline]
    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Rectangle covering the whole extent, anchored at the origin.
    #[inline]
    pub fn from_extent(extent: Extent) -> Self {
        Self::new(0.0, 0.0, extent.width as f32, extent.height as f32)
    }

    /// Pack as `(x, y, width, height)`.
    #[inline]
    pub fn to_vec4(self) -> Vec4 {
        Vec4::new(self.x, self.y, self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn extent_empty() {
        assert!(Extent::new(0, 720).is_empty());
        assert!(Extent::new(1280, 0).is_empty());
        assert!(!Extent::new(1, 1).is_empty());
    }

    #[test]
    fn extent_aspect_ratio() {
        assert_relative_eq!(Extent::new(1280, 720).aspect_ratio(), 16.0 / 9.0);
        assert_relative_eq!(Extent::new(0, 0).aspect_ratio(), 1.0);
    }

    #[test]
    fn rect_from_extent() {
        let rect = Rect::from_extent(Extent::new(800, 600));
        assert_eq!(rect.to_vec4(), Vec4::new(0.0, 0.0, 800.0, 600.0));
    }
}
