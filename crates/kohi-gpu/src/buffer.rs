//! GPU buffers with explicit memory-type selection and optional sub-allocation.
//!
//! A [`Buffer`] owns one `VkBuffer` and the `VkDeviceMemory` bound to it. Buffers
//! shared between many users (geometry pools, a shader's uniform buffer) are
//! created with a [`Freelist`] so callers can carve out byte ranges.

use std::ptr::NonNull;

use ash::vk;

use crate::capabilities::find_memory_type_index;
use crate::command::{execute_single_time_commands, CommandPool};
use crate::error::{GpuError, Result};
use crate::freelist::Freelist;

/// Parameters for creating a [`Buffer`].
#[derive(Clone, Copy, Debug)]
pub struct BufferDesc<'a> {
    /// Debug name used in log messages.
    pub name: &'a str,
    /// Size in bytes.
    pub size: u64,
    /// Usage flags.
    pub usage: vk::BufferUsageFlags,
    /// Properties the backing memory must have.
    pub memory_flags: vk::MemoryPropertyFlags,
    /// Bind the memory right after allocation.
    pub bind_on_create: bool,
    /// Track sub-allocations with a freelist.
    pub use_freelist: bool,
}

impl<'a> BufferDesc<'a> {
    /// Describe a buffer of `size` bytes.
    pub fn new(
        name: &'a str,
        size: u64,
        usage: vk::BufferUsageFlags,
        memory_flags: vk::MemoryPropertyFlags,
    ) -> Self {
        Self {
            name,
            size,
            usage,
            memory_flags,
            bind_on_create: true,
            use_freelist: false,
        }
    }

    /// Enable sub-allocation through a freelist.
    pub fn with_freelist(mut self) -> Self {
        self.use_freelist = true;
        self
    }

    /// Defer memory binding to an explicit [`Buffer::bind`] call.
    pub fn deferred_bind(mut self) -> Self {
        self.bind_on_create = false;
        self
    }
}

/// A device buffer and its memory.
pub struct Buffer {
    handle: vk::Buffer,
    memory: vk::DeviceMemory,
    size: u64,
    usage: vk::BufferUsageFlags,
    memory_flags: vk::MemoryPropertyFlags,
    memory_index: u32,
    freelist: Option<Freelist>,
    mapped: Option<NonNull<u8>>,
    bound: bool,
    generation: u32,
}

impl Buffer {
    /// Create a buffer and allocate memory satisfying `desc.memory_flags`.
    ///
    /// # Safety
    /// The device must be valid and `memory_properties` must describe its physical device.
    pub unsafe fn new(
        device: &ash::Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        desc: &BufferDesc<'_>,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = device.create_buffer(&buffer_info, None)?;
        let requirements = device.get_buffer_memory_requirements(handle);

        let Some(memory_index) = find_memory_type_index(
            memory_properties,
            requirements.memory_type_bits,
            desc.memory_flags,
        ) else {
            tracing::error!(
                "Unable to create buffer '{}': no memory type with {:?}",
                desc.name,
                desc.memory_flags
            );
            device.destroy_buffer(handle, None);
            return Err(GpuError::NoSuitableMemoryType(desc.memory_flags));
        };

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_index);

        let memory = match device.allocate_memory(&alloc_info, None) {
            Ok(memory) => memory,
            Err(e) => {
                tracing::error!(
                    "Unable to create buffer '{}': allocating {} bytes failed: {e}",
                    desc.name,
                    requirements.size
                );
                device.destroy_buffer(handle, None);
                return Err(GpuError::AllocationFailed(format!(
                    "buffer '{}' ({} bytes): {e}",
                    desc.name, requirements.size
                )));
            }
        };

        let mut buffer = Self {
            handle,
            memory,
            size: desc.size,
            usage: desc.usage,
            memory_flags: desc.memory_flags,
            memory_index,
            freelist: desc.use_freelist.then(|| Freelist::new(desc.size)),
            mapped: None,
            bound: false,
            generation: 0,
        };

        if desc.bind_on_create {
            if let Err(e) = buffer.bind(device, 0) {
                buffer.destroy(device);
                return Err(e);
            }
        }

        tracing::debug!(
            "Created buffer '{}' ({} bytes, memory type {}, freelist: {})",
            desc.name,
            desc.size,
            memory_index,
            desc.use_freelist
        );

        Ok(buffer)
    }

    /// Raw buffer handle.
    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    /// Size in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Usage flags the buffer was created with.
    #[inline]
    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// Memory property flags the buffer was created with.
    #[inline]
    pub fn memory_flags(&self) -> vk::MemoryPropertyFlags {
        self.memory_flags
    }

    /// Index of the memory type backing the buffer.
    #[inline]
    pub fn memory_index(&self) -> u32 {
        self.memory_index
    }

    /// Bumped every time the underlying `VkBuffer` is replaced.
    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Returns true if the buffer tracks sub-allocations.
    #[inline]
    pub fn has_freelist(&self) -> bool {
        self.freelist.is_some()
    }

    /// Free bytes left for sub-allocation.
    pub fn free_space(&self) -> Option<u64> {
        self.freelist.as_ref().map(Freelist::free_space)
    }

    /// Returns true if the memory is persistently mapped.
    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    /// Returns true once the memory has been bound to the buffer.
    #[inline]
    pub fn is_bound(&self) -> bool {
        self.bound
    }

    /// Bind the memory to the buffer at `offset`. A buffer can be bound once.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn bind(&mut self, device: &ash::Device, offset: u64) -> Result<()> {
        require_binding(self.bound, false)?;
        device.bind_buffer_memory(self.handle, self.memory, offset)?;
        self.bound = true;
        Ok(())
    }

    /// Sub-allocate `size` bytes, returning the offset of the range.
    pub fn allocate(&mut self, size: u64) -> Result<u64> {
        self.freelist
            .as_mut()
            .ok_or(GpuError::BufferHasNoFreelist)?
            .allocate(size)
    }

    /// Return a sub-allocated range.
    pub fn free(&mut self, size: u64, offset: u64) -> Result<()> {
        self.freelist
            .as_mut()
            .ok_or(GpuError::BufferHasNoFreelist)?
            .free(offset, size)
    }

    /// Map the whole buffer and keep it mapped until [`Buffer::unmap`] or destruction.
    ///
    /// # Safety
    /// The device must be valid and the memory must be host visible.
    pub unsafe fn map_persistent(&mut self, device: &ash::Device) -> Result<()> {
        if self.mapped.is_some() {
            return Ok(());
        }
        require_binding(self.bound, true)?;
        self.require_host_visible()?;

        let ptr = device.map_memory(self.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())?;
        self.mapped = NonNull::new(ptr.cast::<u8>());
        Ok(())
    }

    /// Undo [`Buffer::map_persistent`].
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn unmap(&mut self, device: &ash::Device) {
        if self.mapped.take().is_some() {
            device.unmap_memory(self.memory);
        }
    }

    /// The persistently mapped contents, if mapped.
    pub fn mapped_slice_mut(&mut self) -> Option<&mut [u8]> {
        let ptr = self.mapped?;
        // SAFETY: the mapping covers the whole buffer and lives until unmap/destroy,
        // both of which need `&mut self`.
        Some(unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.size as usize) })
    }

    /// Copy `data` into the buffer at `offset`.
    ///
    /// Persistently mapped buffers are written in place; otherwise the range is
    /// mapped, written, and unmapped again.
    ///
    /// # Safety
    /// The device must be valid and the memory must be host visible.
    pub unsafe fn load(&mut self, device: &ash::Device, offset: u64, data: &[u8]) -> Result<()> {
        check_range(offset, data.len() as u64, self.size)?;
        require_binding(self.bound, true)?;

        if let Some(slice) = self.mapped_slice_mut() {
            let start = offset as usize;
            slice[start..start + data.len()].copy_from_slice(data);
            return Ok(());
        }

        self.require_host_visible()?;
        let ptr = device.map_memory(
            self.memory,
            offset,
            data.len() as u64,
            vk::MemoryMapFlags::empty(),
        )?;
        std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.cast::<u8>(), data.len());
        device.unmap_memory(self.memory);
        Ok(())
    }

    /// Copy `size` bytes from this buffer into `dst`, blocking until the copy completes.
    ///
    /// # Safety
    /// All handles must be valid and neither buffer may be in use by the GPU.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn copy_to(
        &self,
        device: &ash::Device,
        pool: &CommandPool,
        queue: vk::Queue,
        src_offset: u64,
        dst: &Buffer,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        check_range(src_offset, size, self.size)?;
        check_range(dst_offset, size, dst.size)?;
        require_binding(self.bound, true)?;
        require_binding(dst.bound, true)?;
        copy_buffer(
            device,
            pool,
            queue,
            self.handle,
            src_offset,
            dst.handle,
            dst_offset,
            size,
        )
    }

    /// Grow the buffer to `new_size`, preserving contents and sub-allocation offsets.
    ///
    /// A new buffer is created, the old contents are copied over on `queue`, the
    /// device is idled, and the old buffer is released.
    ///
    /// # Safety
    /// All handles must be valid. The buffer must not be in use by in-flight work.
    pub unsafe fn resize(
        &mut self,
        device: &ash::Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        new_size: u64,
        pool: &CommandPool,
        queue: vk::Queue,
    ) -> Result<()> {
        if new_size < self.size {
            tracing::error!(
                "Buffer resize can only grow ({} -> {} bytes)",
                self.size,
                new_size
            );
            return Err(GpuError::InvalidState(format!(
                "buffer cannot shrink from {} to {} bytes",
                self.size, new_size
            )));
        }
        if new_size == self.size {
            return Ok(());
        }
        require_binding(self.bound, true)?;

        let desc = BufferDesc::new("resized", new_size, self.usage, self.memory_flags);
        let mut replacement = Buffer::new(device, memory_properties, &desc)?;

        if let Err(e) = copy_buffer(
            device,
            pool,
            queue,
            self.handle,
            0,
            replacement.handle,
            0,
            self.size,
        ) {
            replacement.destroy(device);
            return Err(e);
        }

        if let Err(e) = device.device_wait_idle() {
            replacement.destroy(device);
            return Err(e.into());
        }
        if let Some(freelist) = self.freelist.as_mut() {
            if let Err(e) = freelist.resize(new_size) {
                replacement.destroy(device);
                return Err(e);
            }
        }

        let was_mapped = self.is_mapped();
        self.unmap(device);
        device.free_memory(self.memory, None);
        device.destroy_buffer(self.handle, None);

        self.handle = replacement.handle;
        self.memory = replacement.memory;
        self.memory_index = replacement.memory_index;
        self.size = new_size;
        self.bound = true;
        self.generation = self.generation.wrapping_add(1);
        // Ownership of the handles moved into self
        replacement.handle = vk::Buffer::null();
        replacement.memory = vk::DeviceMemory::null();

        if was_mapped {
            self.map_persistent(device)?;
        }

        tracing::debug!("Buffer resized to {} bytes", new_size);
        Ok(())
    }

    /// Release the buffer and its memory.
    ///
    /// # Safety
    /// The device must be valid and the buffer must not be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        self.unmap(device);
        if self.memory != vk::DeviceMemory::null() {
            device.free_memory(self.memory, None);
            self.memory = vk::DeviceMemory::null();
        }
        if self.handle != vk::Buffer::null() {
            device.destroy_buffer(self.handle, None);
            self.handle = vk::Buffer::null();
        }
        self.freelist = None;
        self.bound = false;
    }

    fn require_host_visible(&self) -> Result<()> {
        if self
            .memory_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
        {
            Ok(())
        } else {
            Err(GpuError::InvalidState(
                "buffer memory is not host visible".to_string(),
            ))
        }
    }
}

/// Record and submit a one-shot buffer copy, waiting for it to finish.
///
/// # Safety
/// All handles must be valid.
#[allow(clippy::too_many_arguments)]
pub unsafe fn copy_buffer(
    device: &ash::Device,
    pool: &CommandPool,
    queue: vk::Queue,
    src: vk::Buffer,
    src_offset: u64,
    dst: vk::Buffer,
    dst_offset: u64,
    size: u64,
) -> Result<()> {
    device.queue_wait_idle(queue)?;
    execute_single_time_commands(device, pool, queue, |cmd| {
        let region = vk::BufferCopy::default()
            .src_offset(src_offset)
            .dst_offset(dst_offset)
            .size(size);
        device.cmd_copy_buffer(cmd, src, dst, &[region]);
    })
}

/// Check the buffer's bind state against what an operation needs.
fn require_binding(bound: bool, expected: bool) -> Result<()> {
    match (bound, expected) {
        (true, false) => Err(GpuError::InvalidState(
            "buffer memory is already bound".to_string(),
        )),
        (false, true) => Err(GpuError::InvalidState(
            "buffer memory is not bound".to_string(),
        )),
        _ => Ok(()),
    }
}

/// Validate that `offset..offset + len` lies inside a buffer of `size` bytes.
pub fn check_range(offset: u64, len: u64, size: u64) -> Result<u64> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(end),
        _ => Err(GpuError::OutOfBounds {
            offset,
            end: offset.saturating_add(len),
            size,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_inside_buffer() {
        assert_eq!(check_range(0, 64, 64).unwrap(), 64);
        assert_eq!(check_range(192, 64, 256).unwrap(), 256);
    }

    #[test]
    fn range_outside_buffer() {
        assert!(matches!(
            check_range(200, 64, 256),
            Err(GpuError::OutOfBounds { end: 264, .. })
        ));
        assert!(check_range(u64::MAX, 1, 256).is_err());
    }

    #[test]
    fn bind_state_is_checked() {
        // A fresh buffer can be bound but not used.
        assert!(require_binding(false, false).is_ok());
        assert!(matches!(
            require_binding(false, true),
            Err(GpuError::InvalidState(_))
        ));

        // A bound buffer can be used but not bound again.
        assert!(require_binding(true, true).is_ok());
        assert!(matches!(
            require_binding(true, false),
            Err(GpuError::InvalidState(msg)) if msg.contains("already bound")
        ));
    }

    #[test]
    fn desc_builder() {
        let desc = BufferDesc::new(
            "geometry",
            1 << 20,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .with_freelist()
        .deferred_bind();

        assert!(desc.use_freelist);
        assert!(!desc.bind_on_create);
        assert_eq!(desc.size, 1 << 20);
    }
}
