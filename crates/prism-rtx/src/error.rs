//! Error types for renderer setup and per-frame calls.

use prism_gpu::GpuError;
use thiserror::Error;

/// Renderer error type.
#[derive(Error, Debug)]
pub enum RenderError {
    /// Device call failed
    #[error(transparent)]
    Gpu(#[from] GpuError),

    /// Scene or camera rejected
    #[error(transparent)]
    Scene(#[from] prism_core::Error),

    /// Host buffer passed to a download does not match the frame
    #[error("Host buffer holds {actual} elements, frame has {expected}")]
    HostBufferSize { expected: usize, actual: usize },
}

impl RenderError {
    /// Device log text carried by the error, if any.
    #[must_use]
    pub fn device_log(&self) -> Option<&str> {
        match self {
            Self::Gpu(err) => err.log(),
            _ => None,
        }
    }
}

/// Result type alias using [`RenderError`].
pub type Result<T> = std::result::Result<T, RenderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_log_passes_through() {
        let err = RenderError::from(GpuError::ModuleCompilation {
            message: "rejected".to_string(),
            log: "unknown symbol".to_string(),
        });
        assert_eq!(err.device_log(), Some("unknown symbol"));

        let err = RenderError::HostBufferSize {
            expected: 4,
            actual: 3,
        };
        assert!(err.device_log().is_none());
        assert_eq!(err.to_string(), "Host buffer holds 3 elements, frame has 4");
    }
}
