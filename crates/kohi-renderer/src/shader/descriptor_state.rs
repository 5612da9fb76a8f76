//! Cache tags deciding when a descriptor must be rewritten.
//!
//! Each descriptor binding remembers, per frame in flight, which resource (and
//! which generation of it) was last written. A write is only issued when the
//! resource now bound differs from that record.

use ash::vk;

/// Identity of a resource at a point in time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResourceStamp {
    pub id: u64,
    pub generation: u32,
}

impl ResourceStamp {
    pub const fn new(id: u64, generation: u32) -> Self {
        Self { id, generation }
    }
}

/// Returns true if a descriptor last written with `cached` must be rewritten for `current`.
#[inline]
pub fn needs_write(cached: Option<ResourceStamp>, current: ResourceStamp) -> bool {
    cached != Some(current)
}

/// Written stamps for one descriptor set, per frame in flight.
#[derive(Clone, Debug)]
pub struct DescriptorState {
    ubo: Vec<Option<ResourceStamp>>,
    samplers: Vec<Vec<Option<ResourceStamp>>>,
}

impl DescriptorState {
    /// Fresh state: every binding needs writing.
    pub fn new(frames_in_flight: usize, sampler_count: usize) -> Self {
        Self {
            ubo: vec![None; frames_in_flight],
            samplers: vec![vec![None; sampler_count]; frames_in_flight],
        }
    }

    /// Returns true if the uniform buffer binding for `frame` must be written.
    pub fn ubo_needs_write(&self, frame: usize, current: ResourceStamp) -> bool {
        needs_write(self.ubo.get(frame).copied().flatten(), current)
    }

    pub fn mark_ubo_written(&mut self, frame: usize, stamp: ResourceStamp) {
        if let Some(slot) = self.ubo.get_mut(frame) {
            *slot = Some(stamp);
        }
    }

    /// Returns true if any sampler element for `frame` differs from `current`.
    pub fn samplers_need_write(&self, frame: usize, current: &[ResourceStamp]) -> bool {
        let Some(cached) = self.samplers.get(frame) else {
            return true;
        };
        cached.len() != current.len()
            || cached
                .iter()
                .zip(current)
                .any(|(cached, current)| needs_write(*cached, *current))
    }

    pub fn mark_samplers_written(&mut self, frame: usize, stamps: &[ResourceStamp]) {
        if let Some(cached) = self.samplers.get_mut(frame) {
            cached.clear();
            cached.extend(stamps.iter().copied().map(Some));
        }
    }

    /// Forget everything written; the next apply rewrites all bindings.
    pub fn invalidate(&mut self) {
        self.ubo.iter_mut().for_each(|slot| *slot = None);
        for frame in &mut self.samplers {
            frame.iter_mut().for_each(|slot| *slot = None);
        }
    }
}

/// Stamp for a uniform buffer binding.
pub fn buffer_stamp(buffer: vk::Buffer, generation: u32) -> ResourceStamp {
    use ash::vk::Handle;
    ResourceStamp::new(buffer.as_raw(), generation)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comparison_is_pure() {
        let a = ResourceStamp::new(1, 0);
        assert!(needs_write(None, a));
        assert!(!needs_write(Some(a), a));
        assert!(needs_write(Some(a), ResourceStamp::new(1, 1)));
        assert!(needs_write(Some(a), ResourceStamp::new(2, 0)));
    }

    #[test]
    fn ubo_written_once_per_frame() {
        let stamp = ResourceStamp::new(7, 0);
        let mut state = DescriptorState::new(2, 0);

        assert!(state.ubo_needs_write(0, stamp));
        state.mark_ubo_written(0, stamp);
        assert!(!state.ubo_needs_write(0, stamp));
        // Other frames keep their own record
        assert!(state.ubo_needs_write(1, stamp));

        // A resized buffer bumps its generation
        assert!(state.ubo_needs_write(0, ResourceStamp::new(7, 1)));
    }

    #[test]
    fn sampler_changes_detected() {
        let checker = ResourceStamp::new(0, 3);
        let brick = ResourceStamp::new(4, 1);
        let mut state = DescriptorState::new(2, 2);

        assert!(state.samplers_need_write(0, &[checker, checker]));
        state.mark_samplers_written(0, &[checker, checker]);
        assert!(!state.samplers_need_write(0, &[checker, checker]));
        assert!(state.samplers_need_write(0, &[checker, brick]));

        // Texture reloaded in place
        state.mark_samplers_written(0, &[checker, brick]);
        assert!(state.samplers_need_write(0, &[checker, ResourceStamp::new(4, 2)]));
    }

    #[test]
    fn invalidate_resets_everything() {
        let stamp = ResourceStamp::new(1, 1);
        let mut state = DescriptorState::new(1, 1);
        state.mark_ubo_written(0, stamp);
        state.mark_samplers_written(0, &[stamp]);

        state.invalidate();
        assert!(state.ubo_needs_write(0, stamp));
        assert!(state.samplers_need_write(0, &[stamp]));
    }
}
