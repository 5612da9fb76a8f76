//! Binary resource loading.
//!
//! The renderer only ever needs opaque byte blobs (compiled SPIR-V stages), so
//! the loader contract is intentionally small: resolve a name relative to an
//! asset root and hand back the bytes.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Kind of resource being requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Raw bytes, returned untouched.
    Binary,
    /// UTF-8 text; loading fails if the file is not valid UTF-8.
    Text,
}

/// A loaded resource.
#[derive(Clone, Debug)]
pub struct Resource {
    /// Name the resource was requested by.
    pub name: String,
    /// Path the data was read from.
    pub full_path: PathBuf,
    /// Raw contents.
    pub data: Vec<u8>,
}

impl Resource {
    /// Size of the loaded data in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Source of named resources.
pub trait ResourceLoader: Send + Sync {
    /// Load a resource by name.
    fn load(&self, name: &str, kind: ResourceKind) -> Result<Resource>;
}

/// Loads resources from a directory on disk.
#[derive(Clone, Debug)]
pub struct FsResourceLoader {
    base_path: PathBuf,
}

impl FsResourceLoader {
    /// Create a loader rooted at `base_path`.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Root directory resources are resolved against.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

impl ResourceLoader for FsResourceLoader {
    fn load(&self, name: &str, kind: ResourceKind) -> Result<Resource> {
        let full_path = self.base_path.join(name);
        if !full_path.is_file() {
            tracing::error!("Unable to find resource '{}' at {}", name, full_path.display());
            return Err(Error::NotFound(full_path.display().to_string()));
        }

        let data = std::fs::read(&full_path)?;
        if kind == ResourceKind::Text && std::str::from_utf8(&data).is_err() {
            return Err(Error::InvalidData(format!(
                "resource '{name}' is not valid UTF-8"
            )));
        }

        tracing::trace!("Loaded resource '{}' ({} bytes)", name, data.len());

        Ok(Resource {
            name: name.to_string(),
            full_path,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("kohi-core-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn loads_binary_relative_to_base() {
        let dir = scratch_dir("binary");
        std::fs::create_dir_all(dir.join("shaders")).unwrap();
        std::fs::write(dir.join("shaders/test.vert.spv"), [0x03, 0x02, 0x23, 0x07]).unwrap();

        let loader = FsResourceLoader::new(&dir);
        let resource = loader
            .load("shaders/test.vert.spv", ResourceKind::Binary)
            .unwrap();
        assert_eq!(resource.size(), 4);
        assert_eq!(resource.data, vec![0x03, 0x02, 0x23, 0x07]);

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn missing_resource_is_not_found() {
        let loader = FsResourceLoader::new(scratch_dir("missing"));
        let err = loader.load("nope.spv", ResourceKind::Binary).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn text_rejects_invalid_utf8() {
        let dir = scratch_dir("text");
        std::fs::write(dir.join("bad.txt"), [0xff, 0xfe, 0xfd]).unwrap();

        let loader = FsResourceLoader::new(&dir);
        assert!(matches!(
            loader.load("bad.txt", ResourceKind::Text),
            Err(Error::InvalidData(_))
        ));
        assert!(loader.load("bad.txt", ResourceKind::Binary).is_ok());

        std::fs::remove_dir_all(dir).unwrap();
    }
}
