//! Per-frame orchestration.
//!
//! [`FrameLoop`] owns the frame protocol (fence waits, image acquisition,
//! submission, presentation and swapchain recreation) and drives it through the
//! [`FrameDevice`] trait, so the ordering rules can be exercised without a GPU.

use ash::vk;
use kohi_core::Extent;
use kohi_gpu::{AcquireOutcome, PresentOutcome};

use crate::error::{RendererError, Result};

/// What shaders and renderpasses need to record into the current frame.
#[derive(Clone, Copy, Debug)]
pub struct FrameContext {
    pub command_buffer: vk::CommandBuffer,
    /// Frame-in-flight slot, `0..frames_in_flight`.
    pub frame_index: usize,
    pub image_index: u32,
    /// Count of frames presented so far.
    pub frame_number: u64,
    pub delta_time: f32,
}

/// Result of [`FrameLoop::begin_frame`].
#[derive(Clone, Copy, Debug)]
pub enum FrameStatus {
    /// Recording has begun; draw, then end and present the frame.
    Ready(FrameContext),
    /// Nothing was recorded. Skip drawing this frame.
    Skipped,
}

impl FrameStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

/// Where a frame is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FramePhase {
    Idle,
    Recording,
    Submitted,
}

/// Device operations the frame loop sequences.
///
/// Frame slots index per-frame-in-flight sync objects; image indices index
/// swapchain images and their command buffers.
pub trait FrameDevice {
    /// Number of swapchain images.
    fn image_count(&self) -> usize;

    /// Block until the GPU is idle.
    fn wait_idle(&mut self) -> Result<()>;

    /// Block until the fence of frame slot `frame` is signalled.
    fn wait_for_frame(&mut self, frame: usize) -> Result<()>;

    /// Acquire the next swapchain image, signalling `frame`'s image-available semaphore.
    fn acquire_next_image(&mut self, frame: usize) -> Result<AcquireOutcome>;

    /// Reset and begin the image's command buffer with a full-framebuffer
    /// viewport and scissor.
    fn begin_recording(&mut self, image_index: u32) -> Result<vk::CommandBuffer>;

    /// Finish recording the image's command buffer.
    fn end_recording(&mut self, image_index: u32) -> Result<()>;

    /// Reset `frame`'s fence and submit the image's command buffer.
    fn submit(&mut self, frame: usize, image_index: u32) -> Result<()>;

    /// Present the image once `frame`'s queue-complete semaphore is signalled.
    fn present(&mut self, frame: usize, image_index: u32) -> Result<PresentOutcome>;

    /// Rebuild the swapchain and everything sized by it.
    fn recreate_swapchain(&mut self, extent: Extent) -> Result<()>;
}

/// Frame protocol state machine.
#[derive(Debug)]
pub struct FrameLoop {
    frames_in_flight: usize,
    current_frame: usize,
    frame_number: u64,
    phase: FramePhase,
    image_index: u32,
    /// Frame slot whose fence guards each swapchain image.
    images_in_flight: Vec<Option<usize>>,
    recreating: bool,
    framebuffer_extent: Extent,
    framebuffer_generation: u64,
    last_generation: u64,
}

impl FrameLoop {
    pub fn new(frames_in_flight: usize, image_count: usize, extent: Extent) -> Self {
        Self {
            frames_in_flight: frames_in_flight.max(1),
            current_frame: 0,
            frame_number: 0,
            phase: FramePhase::Idle,
            image_index: 0,
            images_in_flight: vec![None; image_count],
            recreating: false,
            framebuffer_extent: extent,
            framebuffer_generation: 0,
            last_generation: 0,
        }
    }

    #[inline]
    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    #[inline]
    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    #[inline]
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    #[inline]
    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    #[inline]
    pub fn image_index(&self) -> u32 {
        self.image_index
    }

    #[inline]
    pub fn framebuffer_extent(&self) -> Extent {
        self.framebuffer_extent
    }

    #[inline]
    pub fn framebuffer_generation(&self) -> u64 {
        self.framebuffer_generation
    }

    /// Returns true if a resize has not been applied to the swapchain yet.
    #[inline]
    pub fn needs_recreation(&self) -> bool {
        self.framebuffer_generation != self.last_generation
    }

    /// Record a new framebuffer size. The swapchain is rebuilt on the next `begin_frame`.
    pub fn on_resize(&mut self, width: u32, height: u32) {
        self.framebuffer_extent = Extent::new(width, height);
        self.framebuffer_generation += 1;
        tracing::debug!(
            "Framebuffer resized to {}x{} (generation {})",
            width,
            height,
            self.framebuffer_generation
        );
    }

    /// Wait for the current frame slot, acquire an image and begin recording.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn begin_frame<D: FrameDevice>(&mut self, device: &mut D, delta_time: f32) -> Result<FrameStatus> {
        if self.phase != FramePhase::Idle {
            return Err(RendererError::FrameState(format!(
                "begin_frame called while frame is {:?}",
                self.phase
            )));
        }

        if self.recreating {
            device.wait_idle()?;
            tracing::debug!("Swapchain recreation in progress, skipping frame");
            return Ok(FrameStatus::Skipped);
        }

        if self.needs_recreation() {
            device.wait_idle()?;
            // Skip even on success so the new swapchain gets a frame to settle.
            if self.recreate_swapchain(device)? {
                tracing::debug!("Swapchain recreated, skipping frame");
            }
            return Ok(FrameStatus::Skipped);
        }

        device.wait_for_frame(self.current_frame)?;

        let image_index = match device.acquire_next_image(self.current_frame)? {
            AcquireOutcome::Acquired { index, .. } => index,
            AcquireOutcome::OutOfDate => {
                tracing::debug!("Swapchain out of date on acquire");
                self.recreate_swapchain(device)?;
                return Ok(FrameStatus::Skipped);
            }
        };

        // The image's command buffer is reset by begin_recording, so any other
        // slot still using it must finish first.
        self.claim_image(device, image_index)?;

        let command_buffer = device.begin_recording(image_index)?;
        self.image_index = image_index;
        self.phase = FramePhase::Recording;

        Ok(FrameStatus::Ready(FrameContext {
            command_buffer,
            frame_index: self.current_frame,
            image_index,
            frame_number: self.frame_number,
            delta_time,
        }))
    }

    /// Finish recording and submit the frame.
    ///
    /// The image was claimed for the current slot in `begin_frame`, after any
    /// other slot's submission targeting it completed.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn end_frame<D: FrameDevice>(&mut self, device: &mut D) -> Result<()> {
        if self.phase != FramePhase::Recording {
            return Err(RendererError::FrameState(format!(
                "end_frame called while frame is {:?}",
                self.phase
            )));
        }

        device.end_recording(self.image_index)?;

        device
            .submit(self.current_frame, self.image_index)
            .inspect_err(|e| tracing::error!("Queue submission failed: {e}"))?;

        self.phase = FramePhase::Submitted;
        Ok(())
    }

    /// Present the submitted frame and advance to the next frame slot.
    ///
    /// Out-of-date and suboptimal results rebuild the swapchain.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn present<D: FrameDevice>(&mut self, device: &mut D) -> Result<()> {
        if self.phase != FramePhase::Submitted {
            return Err(RendererError::FrameState(format!(
                "present called while frame is {:?}",
                self.phase
            )));
        }

        let outcome = device
            .present(self.current_frame, self.image_index)
            .inspect_err(|e| tracing::error!("Presentation failed: {e}"))?;

        self.phase = FramePhase::Idle;
        self.current_frame = (self.current_frame + 1) % self.frames_in_flight;
        self.frame_number += 1;

        if outcome.needs_rebuild() {
            tracing::debug!("Swapchain {:?} on present", outcome);
            self.recreate_swapchain(device)?;
        }
        Ok(())
    }

    /// Wait out another frame slot's use of `image_index`, then assign the
    /// image to the current slot.
    fn claim_image<D: FrameDevice>(&mut self, device: &mut D, image_index: u32) -> Result<()> {
        let image = image_index as usize;
        if image >= self.images_in_flight.len() {
            self.images_in_flight.resize(image + 1, None);
        }
        if let Some(owner) = self.images_in_flight[image] {
            if owner != self.current_frame {
                device.wait_for_frame(owner)?;
            }
        }
        self.images_in_flight[image] = Some(self.current_frame);
        Ok(())
    }

    /// Rebuild the swapchain at the current framebuffer size.
    ///
    /// Returns `Ok(false)` without side effects if a rebuild is already running
    /// or the framebuffer has no area.
    pub fn recreate_swapchain<D: FrameDevice>(&mut self, device: &mut D) -> Result<bool> {
        if self.recreating {
            tracing::debug!("Swapchain recreation already in progress");
            return Ok(false);
        }
        if self.framebuffer_extent.is_empty() {
            tracing::debug!("Framebuffer has no area, not recreating swapchain");
            return Ok(false);
        }

        self.recreating = true;
        let result = device
            .wait_idle()
            .and_then(|()| device.recreate_swapchain(self.framebuffer_extent));
        self.recreating = false;
        result?;

        self.images_in_flight = vec![None; device.image_count()];
        self.last_generation = self.framebuffer_generation;
        tracing::info!(
            "Swapchain recreated at {}x{}",
            self.framebuffer_extent.width,
            self.framebuffer_extent.height
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::collections::VecDeque;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Call {
        WaitIdle,
        WaitForFrame(usize),
        Acquire(usize),
        Begin(u32),
        End(u32),
        Submit(usize, u32),
        Present(usize, u32),
        Recreate(u32, u32),
    }

    struct RecordingDevice {
        calls: Vec<Call>,
        images: VecDeque<AcquireOutcome>,
        presents: VecDeque<PresentOutcome>,
        image_count: usize,
    }

    impl RecordingDevice {
        fn new(image_count: usize) -> Self {
            Self {
                calls: Vec::new(),
                images: VecDeque::new(),
                presents: VecDeque::new(),
                image_count,
            }
        }

        fn acquire(mut self, indices: &[u32]) -> Self {
            self.images.extend(indices.iter().map(|&index| AcquireOutcome::Acquired {
                index,
                suboptimal: false,
            }));
            self
        }

        fn count(&self, call: Call) -> usize {
            self.calls.iter().filter(|&&c| c == call).count()
        }

        fn position(&self, call: Call) -> Option<usize> {
            self.calls.iter().position(|&c| c == call)
        }
    }

    impl FrameDevice for RecordingDevice {
        fn image_count(&self) -> usize {
            self.image_count
        }

        fn wait_idle(&mut self) -> Result<()> {
            self.calls.push(Call::WaitIdle);
            Ok(())
        }

        fn wait_for_frame(&mut self, frame: usize) -> Result<()> {
            self.calls.push(Call::WaitForFrame(frame));
            Ok(())
        }

        fn acquire_next_image(&mut self, frame: usize) -> Result<AcquireOutcome> {
            self.calls.push(Call::Acquire(frame));
            Ok(self.images.pop_front().unwrap_or(AcquireOutcome::Acquired {
                index: 0,
                suboptimal: false,
            }))
        }

        fn begin_recording(&mut self, image_index: u32) -> Result<vk::CommandBuffer> {
            self.calls.push(Call::Begin(image_index));
            Ok(vk::CommandBuffer::from_raw(0x100 + u64::from(image_index)))
        }

        fn end_recording(&mut self, image_index: u32) -> Result<()> {
            self.calls.push(Call::End(image_index));
            Ok(())
        }

        fn submit(&mut self, frame: usize, image_index: u32) -> Result<()> {
            self.calls.push(Call::Submit(frame, image_index));
            Ok(())
        }

        fn present(&mut self, frame: usize, image_index: u32) -> Result<PresentOutcome> {
            self.calls.push(Call::Present(frame, image_index));
            Ok(self.presents.pop_front().unwrap_or(PresentOutcome::Presented))
        }

        fn recreate_swapchain(&mut self, extent: Extent) -> Result<()> {
            self.calls.push(Call::Recreate(extent.width, extent.height));
            Ok(())
        }
    }

    fn run_frame(frames: &mut FrameLoop, device: &mut RecordingDevice) -> FrameStatus {
        let status = frames.begin_frame(device, 0.016).unwrap();
        if status.is_ready() {
            frames.end_frame(device).unwrap();
            frames.present(device).unwrap();
        }
        status
    }

    #[test]
    fn resize_recreates_once_and_skips_frame() {
        let mut device = RecordingDevice::new(3);
        let mut frames = FrameLoop::new(2, 3, Extent::new(800, 600));
        frames.on_resize(1024, 768);

        let status = frames.begin_frame(&mut device, 0.016).unwrap();
        assert!(!status.is_ready());
        assert_eq!(device.count(Call::Recreate(1024, 768)), 1);
        assert!(device.calls.iter().all(|c| !matches!(c, Call::Begin(_))));
        assert!(!frames.needs_recreation());
        assert_eq!(frames.phase(), FramePhase::Idle);

        // The following frame renders normally.
        assert!(run_frame(&mut frames, &mut device).is_ready());
        assert_eq!(device.count(Call::Recreate(1024, 768)), 1);
    }

    #[test]
    fn zero_sized_framebuffer_defers_recreation() {
        let mut device = RecordingDevice::new(3);
        let mut frames = FrameLoop::new(2, 3, Extent::new(800, 600));
        frames.on_resize(0, 0);

        assert!(!frames.begin_frame(&mut device, 0.0).unwrap().is_ready());
        assert!(device.calls.iter().all(|c| !matches!(c, Call::Recreate(..))));
        assert!(frames.needs_recreation());

        frames.on_resize(640, 480);
        assert!(!frames.begin_frame(&mut device, 0.0).unwrap().is_ready());
        assert_eq!(device.count(Call::Recreate(640, 480)), 1);
        assert!(!frames.needs_recreation());
    }

    #[test]
    fn waits_on_previous_owner_before_reusing_image() {
        // Two frame slots both land on image 0.
        let mut device = RecordingDevice::new(3).acquire(&[0, 0]);
        let mut frames = FrameLoop::new(2, 3, Extent::new(800, 600));

        run_frame(&mut frames, &mut device);
        device.calls.clear();
        run_frame(&mut frames, &mut device);

        let acquire = device.position(Call::Acquire(1)).unwrap();
        let wait = device.position(Call::WaitForFrame(0)).unwrap();
        let begin = device.position(Call::Begin(0)).unwrap();
        assert!(acquire < wait && wait < begin);
        assert_eq!(device.count(Call::WaitForFrame(0)), 1);
    }

    #[test]
    fn image_command_buffer_not_reset_while_other_slot_uses_it() {
        // Slot 0 renders image 1, slot 1 renders image 0, then slot 0 comes
        // back around and lands on image 0.
        let mut device = RecordingDevice::new(3).acquire(&[1, 0, 0]);
        let mut frames = FrameLoop::new(2, 3, Extent::new(800, 600));

        run_frame(&mut frames, &mut device);
        run_frame(&mut frames, &mut device);
        device.calls.clear();
        run_frame(&mut frames, &mut device);

        let waits_for_owner = device.position(Call::WaitForFrame(1)).unwrap();
        let begin = device.position(Call::Begin(0)).unwrap();
        assert!(waits_for_owner < begin);
        assert_eq!(device.count(Call::WaitForFrame(1)), 1);
    }

    #[test]
    fn no_extra_wait_when_slot_already_owns_image() {
        let mut device = RecordingDevice::new(1).acquire(&[0, 0]);
        let mut frames = FrameLoop::new(1, 1, Extent::new(800, 600));

        run_frame(&mut frames, &mut device);
        run_frame(&mut frames, &mut device);

        // Only the begin_frame waits.
        assert_eq!(device.count(Call::WaitForFrame(0)), 2);
    }

    #[test]
    fn frame_slots_cycle() {
        let mut device = RecordingDevice::new(3).acquire(&[0, 1, 2, 0]);
        let mut frames = FrameLoop::new(2, 3, Extent::new(800, 600));

        let mut slots = Vec::new();
        for _ in 0..4 {
            if let FrameStatus::Ready(ctx) = run_frame(&mut frames, &mut device) {
                slots.push((ctx.frame_index, ctx.frame_number));
            }
        }
        assert_eq!(slots, vec![(0, 0), (1, 1), (0, 2), (1, 3)]);
        assert_eq!(frames.frame_number(), 4);
    }

    #[test]
    fn out_of_date_acquire_skips_and_recreates() {
        let mut device = RecordingDevice::new(3);
        device.images.push_back(AcquireOutcome::OutOfDate);
        let mut frames = FrameLoop::new(2, 3, Extent::new(800, 600));

        assert!(!frames.begin_frame(&mut device, 0.0).unwrap().is_ready());
        assert_eq!(device.count(Call::Recreate(800, 600)), 1);
        assert_eq!(frames.current_frame(), 0);
        assert_eq!(frames.phase(), FramePhase::Idle);
    }

    #[test]
    fn suboptimal_present_recreates_after_advancing() {
        let mut device = RecordingDevice::new(3);
        device.presents.push_back(PresentOutcome::Suboptimal);
        let mut frames = FrameLoop::new(2, 3, Extent::new(800, 600));

        assert!(run_frame(&mut frames, &mut device).is_ready());
        assert_eq!(device.count(Call::Recreate(800, 600)), 1);
        assert_eq!(frames.current_frame(), 1);
    }

    #[test]
    fn protocol_order_is_enforced() {
        let mut device = RecordingDevice::new(3);
        let mut frames = FrameLoop::new(2, 3, Extent::new(800, 600));

        assert!(matches!(
            frames.end_frame(&mut device),
            Err(RendererError::FrameState(_))
        ));
        assert!(matches!(
            frames.present(&mut device),
            Err(RendererError::FrameState(_))
        ));

        frames.begin_frame(&mut device, 0.0).unwrap();
        assert!(frames.begin_frame(&mut device, 0.0).is_err());
        assert!(frames.present(&mut device).is_err());
    }
}
