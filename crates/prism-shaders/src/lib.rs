//! Device programs for the Prism ray tracer.
//!
//! This crate contains the names the pipeline binds programs by, the
//! host/device ABI structs, the GLSL sources of the radiance programs and
//! [`ProgramBlob`] loading.

pub mod abi;
pub mod glsl;

use std::fmt;
use std::path::{Path, PathBuf};

pub use abi::{HitgroupData, LaunchParams};

/// Global symbol the launch parameter block is bound to.
pub const LAUNCH_PARAMS_SYMBOL: &str = "optixLaunchParams";

/// Ray generation entry point.
pub const RAYGEN_ENTRY: &str = "__raygen__renderFrame";
/// Miss entry point for radiance rays.
pub const MISS_ENTRY: &str = "__miss__radiance";
/// Closest-hit entry point for radiance rays.
pub const CLOSEST_HIT_ENTRY: &str = "__closesthit__radiance";
/// Any-hit entry point for radiance rays.
pub const ANY_HIT_ENTRY: &str = "__anyhit__radiance";

/// First line of a host program manifest.
pub const HOST_MANIFEST_HEADER: &str = "PRISM-HOST-PROGRAMS 1";

/// Program stage, derived from the entry point name prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProgramStage {
    Raygen,
    Miss,
    ClosestHit,
    AnyHit,
}

impl ProgramStage {
    pub const ALL: [Self; 4] = [Self::Raygen, Self::Miss, Self::ClosestHit, Self::AnyHit];

    /// Name prefix every entry point of this stage carries.
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Raygen => "__raygen__",
            Self::Miss => "__miss__",
            Self::ClosestHit => "__closesthit__",
            Self::AnyHit => "__anyhit__",
        }
    }

    /// Stage of an entry point, `None` without a known prefix or with an
    /// empty name after it.
    #[must_use]
    pub fn from_entry_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|stage| {
            name.strip_prefix(stage.prefix())
                .is_some_and(|rest| !rest.is_empty())
        })
    }
}

/// Errors loading a program blob.
#[derive(Debug, thiserror::Error)]
pub enum ShaderError {
    #[error("Failed to read program blob {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Program blob {0} is empty")]
    Empty(PathBuf),
}

/// Where a blob came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlobSource {
    /// Manifest for the host reference device.
    HostReference,
    File(PathBuf),
    Memory,
}

impl fmt::Display for BlobSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HostReference => write!(f, "<host reference programs>"),
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Memory => write!(f, "<memory>"),
        }
    }
}

/// Opaque device program blob handed to module creation.
#[derive(Clone, Debug)]
pub struct ProgramBlob {
    bytes: Vec<u8>,
    source: BlobSource,
}

impl ProgramBlob {
    /// Read a compiled blob from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ShaderError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| ShaderError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if bytes.is_empty() {
            return Err(ShaderError::Empty(path.to_path_buf()));
        }
        tracing::debug!("Loaded program blob {} ({} bytes)", path.display(), bytes.len());
        Ok(Self {
            bytes,
            source: BlobSource::File(path.to_path_buf()),
        })
    }

    /// Wrap bytes already in memory.
    #[must_use]
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            source: BlobSource::Memory,
        }
    }

    /// Manifest binding the radiance programs of the host reference device.
    #[must_use]
    pub fn host_reference() -> Self {
        let manifest = host_manifest(
            LAUNCH_PARAMS_SYMBOL,
            &[RAYGEN_ENTRY, MISS_ENTRY, CLOSEST_HIT_ENTRY, ANY_HIT_ENTRY],
        );
        Self {
            bytes: manifest.into_bytes(),
            source: BlobSource::HostReference,
        }
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn source(&self) -> &BlobSource {
        &self.source
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Whether the blob starts with the SPIR-V magic number in either byte
    /// order.
    #[must_use]
    pub fn is_spirv(&self) -> bool {
        self.bytes
            .get(..4)
            .and_then(|b| <[u8; 4]>::try_from(b).ok())
            .is_some_and(|b| {
                u32::from_le_bytes(b) == SPIRV_MAGIC || u32::from_be_bytes(b) == SPIRV_MAGIC
            })
    }
}

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Render a host program manifest.
///
/// ```text
/// PRISM-HOST-PROGRAMS 1
/// params optixLaunchParams
/// entry __raygen__renderFrame
/// ```
#[must_use]
pub fn host_manifest(params_symbol: &str, entries: &[&str]) -> String {
    let mut manifest = format!("{HOST_MANIFEST_HEADER}\nparams {params_symbol}\n");
    for entry in entries {
        manifest.push_str("entry ");
        manifest.push_str(entry);
        manifest.push('\n');
    }
    manifest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_from_entry_name() {
        assert_eq!(ProgramStage::from_entry_name(RAYGEN_ENTRY), Some(ProgramStage::Raygen));
        assert_eq!(ProgramStage::from_entry_name(MISS_ENTRY), Some(ProgramStage::Miss));
        assert_eq!(
            ProgramStage::from_entry_name(CLOSEST_HIT_ENTRY),
            Some(ProgramStage::ClosestHit)
        );
        assert_eq!(ProgramStage::from_entry_name(ANY_HIT_ENTRY), Some(ProgramStage::AnyHit));
        assert_eq!(ProgramStage::from_entry_name("renderFrame"), None);
        assert_eq!(ProgramStage::from_entry_name("__raygen__"), None);
    }

    #[test]
    fn host_reference_manifest() {
        let blob = ProgramBlob::host_reference();
        let text = std::str::from_utf8(blob.bytes()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], HOST_MANIFEST_HEADER);
        assert_eq!(lines[1], "params optixLaunchParams");
        assert_eq!(lines[2], "entry __raygen__renderFrame");
        assert_eq!(lines.len(), 6);
        assert_eq!(blob.source(), &BlobSource::HostReference);
        assert!(!blob.is_spirv());
    }

    #[test]
    fn spirv_detection() {
        assert!(ProgramBlob::from_bytes(0x0723_0203u32.to_le_bytes()).is_spirv());
        assert!(ProgramBlob::from_bytes(0x0723_0203u32.to_be_bytes()).is_spirv());
        assert!(!ProgramBlob::from_bytes(vec![0x03, 0x02]).is_spirv());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = ProgramBlob::load("/nonexistent/prism/radiance.spv").unwrap_err();
        assert!(matches!(err, ShaderError::Io { .. }));
        assert!(err.to_string().contains("radiance.spv"));
    }

    #[test]
    fn load_reads_file() {
        let path = std::env::temp_dir().join(format!("prism-blob-{}.bin", std::process::id()));
        std::fs::write(&path, b"blob").unwrap();
        let blob = ProgramBlob::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(blob.bytes(), b"blob");
        assert_eq!(blob.source(), &BlobSource::File(path));
    }
}
