//! Testbed application drawing through the builtin object shader.

use std::f32::consts::TAU;

use ash::vk;
use glam::{Mat4, Vec3, Vec4};
use tracing::{info, warn};

use kohi_app::{AppContext, FrameContext, KohiApp};
use kohi_gpu::{Buffer, BufferDesc, CullMode};
use kohi_renderer::{AttributeType, BuiltinRenderpass, Scope, Shader, ShaderStage, UniformType};

/// Name of the shader; stage binaries are `shaders/<name>.<stage>.spv`.
const OBJECT_SHADER: &str = "Builtin.ObjectShader";

const OBJECT_SHADER_STAGES: [ShaderStage; 2] = [ShaderStage::Vertex, ShaderStage::Fragment];

/// Triangle rotation speed in radians per second.
const SPIN_SPEED: f32 = 1.2;

/// Colour cycle speed in radians per second.
const COLOUR_SPEED: f32 = 0.7;

const TRIANGLE: [[f32; 3]; 3] = [[0.0, -0.5, 0.0], [0.5, 0.5, 0.0], [-0.5, 0.5, 0.0]];

/// Testbed application state.
pub struct Testbed {
    shader: Shader,
    /// Instance id holding the triangle's material.
    instance: u32,
    vertex_buffer: Buffer,
    /// Accumulated time in seconds.
    time: f32,
    projection: Mat4,
    view: Mat4,
}

impl KohiApp for Testbed {
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
        let config = ctx
            .renderer
            .shader_config(OBJECT_SHADER)
            .with_instances(true)
            .with_locals(true)
            .with_cull_mode(CullMode::None);

        let mut shader = Shader::new(config);
        for stage in OBJECT_SHADER_STAGES {
            shader.add_stage(stage)?;
        }
        shader.add_attribute("in_position", AttributeType::Float32x3)?;
        shader.add_uniform("projection", UniformType::Matrix4, Scope::Global)?;
        shader.add_uniform("view", UniformType::Matrix4, Scope::Global)?;
        shader.add_uniform("diffuse_colour", UniformType::Float32x4, Scope::Instance)?;
        shader.add_sampler("diffuse_texture", Scope::Instance)?;
        shader.add_uniform("model", UniformType::Matrix4, Scope::Local)?;

        ctx.renderer
            .initialize_shader(&mut shader, BuiltinRenderpass::World)?;

        let device = ctx.renderer.device();

        // SAFETY: the shader was initialized on this device.
        let instance = match unsafe { shader.acquire_instance_resources(device) } {
            Ok(id) => id,
            Err(e) => {
                ctx.renderer.destroy_shader(&mut shader)?;
                return Err(e.into());
            }
        };

        let vertices: &[u8] = bytemuck::cast_slice(&TRIANGLE);
        let desc = BufferDesc::new(
            "testbed_vertices",
            vertices.len() as u64,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        );

        // SAFETY: the buffer is host visible and not yet used by the GPU.
        let vertex_buffer = unsafe {
            let mut buffer = Buffer::new(device, ctx.renderer.gpu().memory_properties(), &desc)?;
            if let Err(e) = buffer.load(device, 0, vertices) {
                buffer.destroy(device);
                return Err(e.into());
            }
            buffer
        };

        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 2.0), Vec3::ZERO, Vec3::Y);
        let projection = perspective(ctx.aspect_ratio());

        info!("Testbed initialized (instance {instance})");

        Ok(Self {
            shader,
            instance,
            vertex_buffer,
            time: 0.0,
            projection,
            view,
        })
    }

    fn update(&mut self, _ctx: &mut AppContext, dt: f32) {
        self.time += dt;
    }

    fn render_world(&mut self, ctx: &mut AppContext, frame: &FrameContext) -> anyhow::Result<()> {
        let device = ctx.renderer.device();
        let shader = &mut self.shader;

        let phase = self.time * COLOUR_SPEED;
        let colour = Vec4::new(
            0.5 + 0.5 * phase.sin(),
            0.5 + 0.5 * (phase + TAU / 3.0).sin(),
            0.5 + 0.5 * (phase + 2.0 * TAU / 3.0).sin(),
            1.0,
        );
        let model = Mat4::from_rotation_z(self.time * SPIN_SPEED);

        // SAFETY: the frame's command buffer is recording inside the world pass
        // and the shader was initialized against that pass.
        unsafe {
            shader.use_shader(device, frame)?;

            shader.bind_globals()?;
            shader.set_uniform_value(device, frame, "projection", &self.projection)?;
            shader.set_uniform_value(device, frame, "view", &self.view)?;
            shader.apply_globals(device, frame)?;

            shader.bind_instance(self.instance)?;
            shader.set_uniform_value(device, frame, "diffuse_colour", &colour)?;
            shader.apply_instance(device, frame)?;

            shader.set_uniform_value(device, frame, "model", &model)?;

            device.cmd_bind_vertex_buffers(
                frame.command_buffer,
                0,
                &[self.vertex_buffer.handle()],
                &[0],
            );
            device.cmd_draw(frame.command_buffer, TRIANGLE.len() as u32, 1, 0, 0);
        }

        let reclaimed = ctx.renderer.collect_shader_garbage(&mut self.shader)?;
        if reclaimed > 0 {
            info!("Reclaimed {reclaimed} shader instance(s)");
        }
        Ok(())
    }

    fn on_resize(&mut self, _ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        if height > 0 {
            self.projection = perspective(width as f32 / height as f32);
        }
        Ok(())
    }

    fn cleanup(&mut self, ctx: &mut AppContext) {
        let frame_number = ctx.renderer.frame_number();
        if let Err(e) = self
            .shader
            .release_instance_resources(self.instance, frame_number)
        {
            warn!("Failed to release instance {}: {e}", self.instance);
        }
        if let Err(e) = ctx.renderer.destroy_shader(&mut self.shader) {
            warn!("Failed to destroy shader: {e}");
        }
        // SAFETY: the runner waited for the device to go idle.
        unsafe { self.vertex_buffer.destroy(ctx.renderer.device()) };
        info!("Testbed resources destroyed");
    }
}

fn perspective(aspect: f32) -> Mat4 {
    Mat4::perspective_rh(60.0_f32.to_radians(), aspect, 0.1, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    #[test]
    fn object_shader_stages_are_compiled() {
        let root = Path::new(crate::ASSET_ROOT);
        for stage in OBJECT_SHADER_STAGES {
            let path = root.join(stage.binary_path(OBJECT_SHADER));
            let bytes = std::fs::read(&path)
                .unwrap_or_else(|e| panic!("missing {}: {e}", path.display()));

            assert_eq!(bytes.len() % 4, 0, "{} is not word aligned", path.display());
            let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            assert_eq!(magic, SPIRV_MAGIC, "Invalid SPIR-V magic number");
        }
    }
}
