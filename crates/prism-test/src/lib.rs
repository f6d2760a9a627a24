//! Test harness for the Prism ray tracer.
//!
//! Frames are rendered on the host reference device, so every scenario runs
//! without ray tracing hardware. Rendered images can be checked against
//! stored baselines.

pub mod harness;

pub use harness::{compare_images, pixels_to_image, HeadlessRenderer, VisualRegressionTest};

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("Render error: {0}")]
    Render(#[from] prism_rtx::RenderError),
    #[error("Image comparison failed: {0}")]
    ImageComparison(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, TestError>;

/// Where baselines live and how far a frame may drift from them.
#[derive(Debug, Clone)]
pub struct VisualTestConfig {
    /// Largest accepted mean channel difference, as a fraction of 255.
    pub threshold: f64,
    pub baseline_dir: PathBuf,
    /// Latest renders and diff images.
    pub output_dir: PathBuf,
}

impl Default for VisualTestConfig {
    fn default() -> Self {
        Self::in_dir("target/prism-visual")
    }
}

impl VisualTestConfig {
    /// Keep baselines and outputs under `root`.
    #[must_use]
    pub fn in_dir(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            threshold: 0.001,
            baseline_dir: root.join("baselines"),
            output_dir: root.join("output"),
        }
    }
}
