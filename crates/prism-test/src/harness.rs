//! Headless rendering and visual regression testing.
//!
//! Frames are rendered through the full renderer on the host reference
//! device and turned into RGBA images with row 0 at the top.

use std::path::Path;

use glam::Vec3;
use image::{Rgba, RgbaImage};
use prism_core::{Camera, TriangleMesh};
use prism_host::HostDevice;
use prism_rtx::{Renderer, RendererConfig};
use prism_shaders::abi::unpack_rgba;
use prism_shaders::ProgramBlob;

use crate::{Result, TestError, VisualTestConfig};

/// Convert a downloaded color buffer into an image.
///
/// The color buffer stores the bottom row first, so rows are flipped.
/// Returns `None` when `pixels` does not hold `width * height` values.
#[must_use]
pub fn pixels_to_image(width: u32, height: u32, pixels: &[u32]) -> Option<RgbaImage> {
    if pixels.len() != width as usize * height as usize {
        return None;
    }
    Some(RgbaImage::from_fn(width, height, |x, y| {
        let row = (height - 1 - y) as usize;
        Rgba(unpack_rgba(pixels[row * width as usize + x as usize]))
    }))
}

/// Renderer for tests, running on the host reference device.
pub struct HeadlessRenderer {
    renderer: Renderer<HostDevice>,
}

impl HeadlessRenderer {
    /// Create a renderer for `scene` with a `width` x `height` frame.
    pub fn new(scene: &TriangleMesh, width: u32, height: u32) -> Result<Self> {
        Self::with_config(scene, width, height, RendererConfig::default())
    }

    /// Create with a custom renderer configuration.
    pub fn with_config(
        scene: &TriangleMesh,
        width: u32,
        height: u32,
        config: RendererConfig,
    ) -> Result<Self> {
        let mut renderer = Renderer::new(
            HostDevice::new(),
            scene,
            &ProgramBlob::host_reference(),
            config,
        )?;
        renderer.resize(width, height)?;
        Ok(Self { renderer })
    }

    /// Render one frame from `camera` and return it as an image.
    pub fn render(&mut self, camera: &Camera) -> Result<RgbaImage> {
        self.renderer.set_camera(*camera)?;
        self.renderer.render()?;

        let (width, height) = self.dimensions();
        let mut pixels = vec![0u32; width as usize * height as usize];
        self.renderer.download_pixels(&mut pixels)?;
        pixels_to_image(width, height, &pixels)
            .ok_or_else(|| TestError::ImageComparison("color buffer size mismatch".to_string()))
    }

    /// Hit positions of the last frame, bottom row first.
    pub fn hit_positions(&self) -> Result<Vec<Vec3>> {
        let (width, height) = self.dimensions();
        let mut positions = vec![Vec3::ZERO; width as usize * height as usize];
        self.renderer.download_hit_positions(&mut positions)?;
        Ok(positions)
    }

    /// Get the output dimensions.
    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        let size = self.renderer.frame_size();
        (size.x, size.y)
    }

    #[must_use]
    pub const fn renderer(&self) -> &Renderer<HostDevice> {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut Renderer<HostDevice> {
        &mut self.renderer
    }
}

/// Visual regression test runner.
///
/// The first run of a case stores its render as the baseline; later runs
/// must stay within the configured threshold of it.
pub struct VisualRegressionTest {
    config: VisualTestConfig,
    renderer: HeadlessRenderer,
}

impl VisualRegressionTest {
    /// Create a runner rendering `scene` at 256 x 256.
    pub fn new(config: VisualTestConfig, scene: &TriangleMesh) -> Result<Self> {
        Self::with_dimensions(config, scene, 256, 256)
    }

    /// Create with custom dimensions.
    pub fn with_dimensions(
        config: VisualTestConfig,
        scene: &TriangleMesh,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let renderer = HeadlessRenderer::new(scene, width, height)?;
        Ok(Self { config, renderer })
    }

    /// Render from `camera` and check the frame against the baseline `name`.
    pub fn run_test(&mut self, name: &str, camera: &Camera) -> Result<()> {
        let image = self.renderer.render(camera)?;
        self.compare_and_save(name, &image)
    }

    fn compare_and_save(&self, name: &str, image: &RgbaImage) -> Result<()> {
        std::fs::create_dir_all(&self.config.baseline_dir)?;
        std::fs::create_dir_all(&self.config.output_dir)?;

        let file_name = format!("{name}.png");
        let baseline_path = self.config.baseline_dir.join(&file_name);
        let output_path = self.config.output_dir.join(&file_name);
        image.save(&output_path)?;

        if !baseline_path.exists() {
            image.save(&baseline_path)?;
            tracing::info!("Created new baseline: {}", baseline_path.display());
            return Ok(());
        }

        let baseline = load_rgba(&baseline_path)?;
        let diff = compare_images(&baseline, image)?;
        if diff > self.config.threshold {
            let diff_path = self.config.output_dir.join(format!("{name}_diff.png"));
            diff_image(&baseline, image).save(&diff_path)?;
            return Err(TestError::ImageComparison(format!(
                "Image difference {:.4} exceeds threshold {:.4} (see {})",
                diff,
                self.config.threshold,
                diff_path.display()
            )));
        }
        Ok(())
    }
}

fn load_rgba(path: &Path) -> Result<RgbaImage> {
    Ok(image::open(path)?.to_rgba8())
}

/// Mean absolute RGB difference of two images, normalized to `[0, 1]`.
pub fn compare_images(a: &RgbaImage, b: &RgbaImage) -> Result<f64> {
    if a.dimensions() != b.dimensions() {
        return Err(TestError::ImageComparison(format!(
            "Image dimensions don't match: {:?} vs {:?}",
            a.dimensions(),
            b.dimensions()
        )));
    }

    let total: u64 = a
        .pixels()
        .zip(b.pixels())
        .map(|(pa, pb)| {
            (0..3)
                .map(|c| u64::from(pa[c].abs_diff(pb[c])))
                .sum::<u64>()
        })
        .sum();

    let max = u64::from(a.width()) * u64::from(a.height()) * 3 * 255;
    if max == 0 {
        return Ok(0.0);
    }
    Ok(total as f64 / max as f64)
}

/// Differing pixels in red over the dimmed baseline.
fn diff_image(baseline: &RgbaImage, current: &RgbaImage) -> RgbaImage {
    RgbaImage::from_fn(baseline.width(), baseline.height(), |x, y| {
        let pa = baseline.get_pixel(x, y);
        let pb = current.get_pixel(x, y);
        let max_diff = (0..3).map(|c| pa[c].abs_diff(pb[c])).max().unwrap_or(0);
        if max_diff > 10 {
            Rgba([255, 0, 0, 255])
        } else {
            Rgba([pa[0] / 2, pa[1] / 2, pa[2] / 2, 255])
        }
    })
}
