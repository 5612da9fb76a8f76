//! Texture references handed to shaders, and the fallback texture.

use ash::vk;
use gpu_allocator::MemoryLocation;
use kohi_gpu::command::execute_single_time_commands;
use kohi_gpu::{create_image_view, Buffer, BufferDesc, CommandPool, GpuContext, GpuImage};

use crate::error::Result;
use crate::shader::ResourceStamp;

/// Id reserved for the renderer's fallback texture.
pub const DEFAULT_TEXTURE_ID: u32 = u32::MAX - 1;

const DEFAULT_TEXTURE_SIZE: u32 = 64;
const DEFAULT_TEXTURE_CELL: u32 = 8;

/// A sampled texture as seen by descriptor writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureBinding {
    pub id: u32,
    /// `None` until the texture data has been uploaded.
    pub generation: Option<u32>,
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
}

impl TextureBinding {
    #[inline]
    pub fn is_loaded(&self) -> bool {
        self.generation.is_some()
    }

    /// Cache tag for descriptor writes, if loaded.
    pub fn stamp(&self) -> Option<ResourceStamp> {
        self.generation
            .map(|generation| ResourceStamp::new(u64::from(self.id), generation))
    }

    pub fn image_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo::default()
            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .image_view(self.view)
            .sampler(self.sampler)
    }
}

/// The texture to actually bind: `texture` if set and loaded, else `default`.
pub fn resolve<'a>(
    texture: Option<&'a TextureBinding>,
    default: &'a TextureBinding,
) -> &'a TextureBinding {
    match texture {
        Some(texture) if texture.is_loaded() => texture,
        _ => default,
    }
}

/// RGBA8 checkerboard of `size`×`size` pixels with `cell`-pixel squares.
pub fn checkerboard_pixels(size: u32, cell: u32) -> Vec<u8> {
    let cell = cell.max(1);
    let mut pixels = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let light = ((x / cell) + (y / cell)) % 2 == 0;
            if light {
                pixels.extend_from_slice(&[255, 255, 255, 255]);
            } else {
                pixels.extend_from_slice(&[255, 0, 255, 255]);
            }
        }
    }
    pixels
}

/// Checkerboard texture bound wherever a sampler has nothing loaded.
pub struct DefaultTexture {
    image: GpuImage,
    view: vk::ImageView,
    sampler: vk::Sampler,
}

impl DefaultTexture {
    /// Upload the checkerboard and create its view and sampler.
    ///
    /// # Safety
    /// The context and pool must be valid; blocks until the upload completes.
    pub unsafe fn new(gpu: &GpuContext, pool: &CommandPool) -> Result<Self> {
        let device = gpu.device();
        let pixels = checkerboard_pixels(DEFAULT_TEXTURE_SIZE, DEFAULT_TEXTURE_CELL);

        let mut staging = Buffer::new(
            device,
            gpu.memory_properties(),
            &BufferDesc::new(
                "default texture staging",
                pixels.len() as u64,
                vk::BufferUsageFlags::TRANSFER_SRC,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            ),
        )?;

        let result = Self::upload(gpu, pool, &mut staging, &pixels);
        staging.destroy(device);
        let mut image = result?;

        let view = match create_image_view(
            device,
            image.image,
            image.format,
            vk::ImageAspectFlags::COLOR,
        ) {
            Ok(view) => view,
            Err(e) => {
                if let Err(free_err) = gpu.allocator().lock().free_image(&mut image) {
                    tracing::warn!("Failed to free texture image after error: {free_err}");
                }
                return Err(e.into());
            }
        };

        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::NEAREST)
            .min_filter(vk::Filter::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .max_lod(1.0)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK);
        let sampler = match device.create_sampler(&sampler_info, None) {
            Ok(sampler) => sampler,
            Err(e) => {
                device.destroy_image_view(view, None);
                if let Err(free_err) = gpu.allocator().lock().free_image(&mut image) {
                    tracing::warn!("Failed to free texture image after error: {free_err}");
                }
                return Err(e.into());
            }
        };

        tracing::debug!(
            "Created default texture ({0}x{0})",
            DEFAULT_TEXTURE_SIZE
        );

        Ok(Self {
            image,
            view,
            sampler,
        })
    }

    unsafe fn upload(
        gpu: &GpuContext,
        pool: &CommandPool,
        staging: &mut Buffer,
        pixels: &[u8],
    ) -> Result<GpuImage> {
        let device = gpu.device();
        staging.load(device, 0, pixels)?;

        let extent = vk::Extent3D {
            width: DEFAULT_TEXTURE_SIZE,
            height: DEFAULT_TEXTURE_SIZE,
            depth: 1,
        };
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk::Format::R8G8B8A8_UNORM)
            .extent(extent)
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let mut image =
            gpu.allocator()
                .lock()
                .create_image(&image_info, MemoryLocation::GpuOnly, "default texture")?;

        let range = vk::ImageSubresourceRange::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .level_count(1)
            .layer_count(1);
        let target = image.image;
        let source = staging.handle();

        let copied = execute_single_time_commands(device, pool, gpu.graphics_queue(), |cmd| {
            let to_transfer = vk::ImageMemoryBarrier::default()
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(target)
                .subresource_range(range)
                .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE);
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_transfer],
            );

            let region = vk::BufferImageCopy::default()
                .image_subresource(
                    vk::ImageSubresourceLayers::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .layer_count(1),
                )
                .image_extent(extent);
            device.cmd_copy_buffer_to_image(
                cmd,
                source,
                target,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );

            let to_shader = vk::ImageMemoryBarrier::default()
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(target)
                .subresource_range(range)
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::SHADER_READ);
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_shader],
            );
        });

        if let Err(e) = copied {
            if let Err(free_err) = gpu.allocator().lock().free_image(&mut image) {
                tracing::warn!("Failed to free texture image after error: {free_err}");
            }
            return Err(e.into());
        }

        Ok(image)
    }

    pub fn binding(&self) -> TextureBinding {
        TextureBinding {
            id: DEFAULT_TEXTURE_ID,
            generation: Some(0),
            view: self.view,
            sampler: self.sampler,
        }
    }

    /// # Safety
    /// The texture must not be in use.
    pub unsafe fn destroy(&mut self, gpu: &GpuContext) {
        let device = gpu.device();
        device.destroy_sampler(self.sampler, None);
        device.destroy_image_view(self.view, None);
        if let Err(e) = gpu.allocator().lock().free_image(&mut self.image) {
            tracing::error!("Failed to free default texture: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn binding(id: u32, generation: Option<u32>) -> TextureBinding {
        TextureBinding {
            id,
            generation,
            view: vk::ImageView::from_raw(u64::from(id) + 1),
            sampler: vk::Sampler::from_raw(1),
        }
    }

    #[test]
    fn unloaded_textures_fall_back() {
        let default = binding(DEFAULT_TEXTURE_ID, Some(0));
        let loading = binding(3, None);
        let ready = binding(4, Some(2));

        assert_eq!(resolve(None, &default).id, DEFAULT_TEXTURE_ID);
        assert_eq!(resolve(Some(&loading), &default).id, DEFAULT_TEXTURE_ID);
        assert_eq!(resolve(Some(&ready), &default).id, 4);
    }

    #[test]
    fn stamp_tracks_generation() {
        assert_eq!(binding(3, None).stamp(), None);
        assert_eq!(
            binding(4, Some(2)).stamp(),
            Some(ResourceStamp::new(4, 2))
        );
    }

    #[test]
    fn checkerboard_alternates() {
        let pixels = checkerboard_pixels(4, 2);
        assert_eq!(pixels.len(), 4 * 4 * 4);
        // (0,0) light, (2,0) dark, (2,2) light
        assert_eq!(&pixels[0..4], &[255, 255, 255, 255]);
        assert_eq!(&pixels[8..12], &[255, 0, 255, 255]);
        let idx = ((2 * 4 + 2) * 4) as usize;
        assert_eq!(&pixels[idx..idx + 4], &[255, 255, 255, 255]);
    }
}
