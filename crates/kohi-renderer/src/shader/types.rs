//! Value types describing shader stages, attributes and uniforms.

use std::fmt;

use ash::vk;

/// Where a uniform's data lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Shared by everything drawn with the shader; descriptor set 0.
    Global,
    /// Per material/instance; descriptor set 1.
    Instance,
    /// Per draw, through push constants.
    Local,
}

impl Scope {
    /// Descriptor set index, or `None` for push constants.
    pub const fn set_index(self) -> Option<u32> {
        match self {
            Self::Global => Some(0),
            Self::Instance => Some(1),
            Self::Local => None,
        }
    }

    /// Lower-case name for log and error messages.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Instance => "instance",
            Self::Local => "local",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bindings inside a descriptor set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorBinding {
    UniformBuffer,
    Samplers,
}

impl DescriptorBinding {
    /// Binding number in the set layout.
    pub const fn index(self) -> u32 {
        match self {
            Self::UniformBuffer => 0,
            Self::Samplers => 1,
        }
    }
}

/// A programmable pipeline stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Geometry,
    Fragment,
    Compute,
}

impl ShaderStage {
    /// Suffix used in compiled stage file names (`<shader>.<suffix>.spv`).
    pub const fn file_suffix(self) -> &'static str {
        match self {
            Self::Vertex => "vert",
            Self::Geometry => "geom",
            Self::Fragment => "frag",
            Self::Compute => "comp",
        }
    }

    pub const fn to_vk(self) -> vk::ShaderStageFlags {
        match self {
            Self::Vertex => vk::ShaderStageFlags::VERTEX,
            Self::Geometry => vk::ShaderStageFlags::GEOMETRY,
            Self::Fragment => vk::ShaderStageFlags::FRAGMENT,
            Self::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }

    /// Asset-relative path of the compiled stage for `shader_name`.
    pub fn binary_path(self, shader_name: &str) -> String {
        format!(
            "{}/{}.{}.spv",
            kohi_core::constants::SHADER_DIR,
            shader_name,
            self.file_suffix()
        )
    }
}

/// Type of a uniform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UniformType {
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Matrix4,
    Sampler,
    /// Opaque block of the given size.
    Custom(u32),
}

impl UniformType {
    /// Size in bytes. Samplers occupy no uniform buffer space.
    pub const fn size(self) -> u32 {
        match self {
            Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Float32 | Self::Int32 | Self::UInt32 => 4,
            Self::Float32x2 => 8,
            Self::Float32x3 => 12,
            Self::Float32x4 => 16,
            Self::Matrix4 => 64,
            Self::Sampler => 0,
            Self::Custom(size) => size,
        }
    }

    #[inline]
    pub const fn is_sampler(self) -> bool {
        matches!(self, Self::Sampler)
    }
}

/// Type of a vertex attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AttributeType {
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
}

impl AttributeType {
    pub const fn size(self) -> u32 {
        match self {
            Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Float32 | Self::Int32 | Self::UInt32 => 4,
            Self::Float32x2 => 8,
            Self::Float32x3 => 12,
            Self::Float32x4 => 16,
        }
    }

    pub const fn format(self) -> vk::Format {
        match self {
            Self::Float32 => vk::Format::R32_SFLOAT,
            Self::Float32x2 => vk::Format::R32G32_SFLOAT,
            Self::Float32x3 => vk::Format::R32G32B32_SFLOAT,
            Self::Float32x4 => vk::Format::R32G32B32A32_SFLOAT,
            Self::Int8 => vk::Format::R8_SINT,
            Self::UInt8 => vk::Format::R8_UINT,
            Self::Int16 => vk::Format::R16_SINT,
            Self::UInt16 => vk::Format::R16_UINT,
            Self::Int32 => vk::Format::R32_SINT,
            Self::UInt32 => vk::Format::R32_UINT,
        }
    }
}

/// A declared vertex attribute.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub ty: AttributeType,
}

/// Index of a uniform in its shader's uniform table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UniformHandle(pub(crate) u16);

impl UniformHandle {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// A declared uniform.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Uniform {
    pub name: String,
    pub scope: Scope,
    pub ty: UniformType,
    /// Byte offset within its scope's region (or push constant block).
    pub offset: u64,
    pub size: u32,
    /// Declaration index for values; texture slot within the scope for samplers.
    pub location: u16,
    pub handle: UniformHandle,
}

impl Uniform {
    #[inline]
    pub const fn is_sampler(&self) -> bool {
        self.ty.is_sampler()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_set_indices() {
        assert_eq!(Scope::Global.set_index(), Some(0));
        assert_eq!(Scope::Instance.set_index(), Some(1));
        assert_eq!(Scope::Local.set_index(), None);
    }

    #[test]
    fn stage_binary_path() {
        assert_eq!(
            ShaderStage::Vertex.binary_path("Builtin.WorldShader"),
            "shaders/Builtin.WorldShader.vert.spv"
        );
        assert_eq!(
            ShaderStage::Fragment.binary_path("ui"),
            "shaders/ui.frag.spv"
        );
    }

    #[test]
    fn uniform_sizes() {
        assert_eq!(UniformType::Matrix4.size(), 64);
        assert_eq!(UniformType::Float32x4.size(), 16);
        assert_eq!(UniformType::Sampler.size(), 0);
        assert_eq!(UniformType::Custom(48).size(), 48);
    }
}
