//! Command buffer management.
//!
//! Besides thin wrappers over pools and submission, each [`CommandBuffer`] tracks
//! a logical state so that renderpass begin/end and frame submission can refuse
//! out-of-order use instead of handing it to the driver.

use crate::error::{GpuError, Result};
use ash::vk;

/// Command pool for allocating command buffers.
pub struct CommandPool {
    pool: vk::CommandPool,
    queue_family: u32,
}

impl CommandPool {
    /// Create a new command pool.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn new(
        device: &ash::Device,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        let pool = device.create_command_pool(&create_info, None)?;

        Ok(Self { pool, queue_family })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Get the queue family index.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Allocate a single command buffer.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate_command_buffer(
        &self,
        device: &ash::Device,
        level: vk::CommandBufferLevel,
    ) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(level)
            .command_buffer_count(1);

        let buffers = device.allocate_command_buffers(&alloc_info)?;
        buffers
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::Other("driver returned no command buffer".to_string()))
    }

    /// Allocate `count` primary command buffers with state tracking.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate_tracked(
        &self,
        device: &ash::Device,
        count: u32,
    ) -> Result<Vec<CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        let buffers = device.allocate_command_buffers(&alloc_info)?;
        Ok(buffers.into_iter().map(CommandBuffer::new).collect())
    }

    /// Return tracked command buffers to the pool.
    ///
    /// # Safety
    /// The device must be valid and none of the buffers may be pending execution.
    pub unsafe fn free_tracked(&self, device: &ash::Device, buffers: &mut Vec<CommandBuffer>) {
        let handles: Vec<vk::CommandBuffer> = buffers.iter().map(|b| b.handle).collect();
        if !handles.is_empty() {
            device.free_command_buffers(self.pool, &handles);
        }
        buffers.clear();
    }

    /// Destroy the command pool.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_command_pool(self.pool, None);
    }
}

/// Logical state of a command buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandBufferState {
    /// Allocated and ready to begin recording.
    Ready,
    /// Between begin and end, outside a renderpass.
    Recording,
    /// Inside a renderpass.
    InRenderPass,
    /// Recording finished, not yet submitted.
    RecordingEnded,
    /// Submitted to a queue.
    Submitted,
}

/// A primary command buffer with logical state tracking.
#[derive(Debug)]
pub struct CommandBuffer {
    handle: vk::CommandBuffer,
    state: CommandBufferState,
}

impl CommandBuffer {
    /// Wrap a freshly allocated handle.
    pub fn new(handle: vk::CommandBuffer) -> Self {
        Self {
            handle,
            state: CommandBufferState::Ready,
        }
    }

    /// Raw handle.
    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    /// Current logical state.
    #[inline]
    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    fn transition(&mut self, from: &[CommandBufferState], to: CommandBufferState) -> Result<()> {
        if !from.contains(&self.state) {
            return Err(GpuError::InvalidState(format!(
                "command buffer cannot move from {:?} to {:?}",
                self.state, to
            )));
        }
        self.state = to;
        Ok(())
    }

    /// Record the begin-recording transition.
    pub fn mark_recording(&mut self) -> Result<()> {
        // A buffer whose submission has completed may be re-recorded.
        self.transition(
            &[CommandBufferState::Ready, CommandBufferState::Submitted],
            CommandBufferState::Recording,
        )
    }

    /// Record the renderpass-begin transition.
    pub fn mark_in_render_pass(&mut self) -> Result<()> {
        self.transition(
            &[CommandBufferState::Recording],
            CommandBufferState::InRenderPass,
        )
    }

    /// Record the renderpass-end transition.
    pub fn mark_render_pass_ended(&mut self) -> Result<()> {
        self.transition(
            &[CommandBufferState::InRenderPass],
            CommandBufferState::Recording,
        )
    }

    /// Record the end-recording transition.
    pub fn mark_recording_ended(&mut self) -> Result<()> {
        self.transition(
            &[CommandBufferState::Recording],
            CommandBufferState::RecordingEnded,
        )
    }

    /// Record the submission transition.
    pub fn mark_submitted(&mut self) -> Result<()> {
        self.transition(
            &[CommandBufferState::RecordingEnded],
            CommandBufferState::Submitted,
        )
    }

    /// Force the buffer back to `Ready` (after a pool or buffer reset).
    pub fn reset(&mut self) {
        self.state = CommandBufferState::Ready;
    }

    /// Reset and begin recording.
    ///
    /// # Safety
    /// The device must be valid and the buffer must not be pending execution.
    pub unsafe fn begin(
        &mut self,
        device: &ash::Device,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<()> {
        device.reset_command_buffer(self.handle, vk::CommandBufferResetFlags::empty())?;
        self.reset();
        begin_command_buffer(device, self.handle, flags)?;
        self.mark_recording()
    }

    /// End recording.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn end(&mut self, device: &ash::Device) -> Result<()> {
        if self.state != CommandBufferState::Recording {
            return Err(GpuError::InvalidState(format!(
                "cannot end command buffer in state {:?}",
                self.state
            )));
        }
        end_command_buffer(device, self.handle)?;
        self.mark_recording_ended()
    }
}

/// Begin recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn begin_command_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    flags: vk::CommandBufferUsageFlags,
) -> Result<()> {
    let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
    device.begin_command_buffer(cmd, &begin_info)?;
    Ok(())
}

/// End recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn end_command_buffer(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    device.end_command_buffer(cmd)?;
    Ok(())
}

/// Submit command buffers to a queue.
///
/// # Safety
/// All handles must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn submit_command_buffers(
    device: &ash::Device,
    queue: vk::Queue,
    command_buffers: &[vk::CommandBuffer],
    wait_semaphores: &[vk::Semaphore],
    wait_stages: &[vk::PipelineStageFlags],
    signal_semaphores: &[vk::Semaphore],
    fence: vk::Fence,
) -> Result<()> {
    let submit_info = vk::SubmitInfo::default()
        .command_buffers(command_buffers)
        .wait_semaphores(wait_semaphores)
        .wait_dst_stage_mask(wait_stages)
        .signal_semaphores(signal_semaphores);

    device.queue_submit(queue, &[submit_info], fence)?;
    Ok(())
}

/// Execute a single-time command buffer and block until the queue is idle.
///
/// # Safety
/// All handles must be valid.
pub unsafe fn execute_single_time_commands<F>(
    device: &ash::Device,
    pool: &CommandPool,
    queue: vk::Queue,
    f: F,
) -> Result<()>
where
    F: FnOnce(vk::CommandBuffer),
{
    let cmd = pool.allocate_command_buffer(device, vk::CommandBufferLevel::PRIMARY)?;

    begin_command_buffer(device, cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
    f(cmd);
    end_command_buffer(device, cmd)?;

    let cmd_buffers = [cmd];
    let submit_info = vk::SubmitInfo::default().command_buffers(&cmd_buffers);
    device.queue_submit(queue, &[submit_info], vk::Fence::null())?;
    device.queue_wait_idle(queue)?;

    device.free_command_buffers(pool.handle(), &[cmd]);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn buffer() -> CommandBuffer {
        CommandBuffer::new(vk::CommandBuffer::from_raw(0x10))
    }

    #[test]
    fn full_frame_lifecycle() {
        let mut cmd = buffer();
        cmd.mark_recording().unwrap();
        cmd.mark_in_render_pass().unwrap();
        cmd.mark_render_pass_ended().unwrap();
        cmd.mark_in_render_pass().unwrap();
        cmd.mark_render_pass_ended().unwrap();
        cmd.mark_recording_ended().unwrap();
        cmd.mark_submitted().unwrap();
        assert_eq!(cmd.state(), CommandBufferState::Submitted);

        // Re-recording after submission is allowed
        cmd.mark_recording().unwrap();
        assert_eq!(cmd.state(), CommandBufferState::Recording);
    }

    #[test]
    fn renderpass_requires_recording() {
        let mut cmd = buffer();
        assert!(cmd.mark_in_render_pass().is_err());
        assert_eq!(cmd.state(), CommandBufferState::Ready);
    }

    #[test]
    fn cannot_end_inside_renderpass() {
        let mut cmd = buffer();
        cmd.mark_recording().unwrap();
        cmd.mark_in_render_pass().unwrap();
        assert!(cmd.mark_recording_ended().is_err());
        assert!(cmd.mark_submitted().is_err());
        assert_eq!(cmd.state(), CommandBufferState::InRenderPass);
    }

    #[test]
    fn reset_returns_to_ready() {
        let mut cmd = buffer();
        cmd.mark_recording().unwrap();
        cmd.reset();
        assert_eq!(cmd.state(), CommandBufferState::Ready);
    }
}
