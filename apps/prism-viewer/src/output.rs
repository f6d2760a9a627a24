//! Writing rendered frames to disk.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::{ensure, Context};
use glam::Vec3;
use image::{Rgba, RgbaImage};
use prism_shaders::abi::unpack_rgba;

/// Build a top-row-first image from a bottom-row-first color buffer.
pub fn frame_image(width: u32, height: u32, pixels: &[u32]) -> anyhow::Result<RgbaImage> {
    ensure!(
        pixels.len() == width as usize * height as usize,
        "color buffer holds {} pixels, expected {width}x{height}",
        pixels.len()
    );
    Ok(RgbaImage::from_fn(width, height, |x, y| {
        let row = (height - 1 - y) as usize;
        Rgba(unpack_rgba(pixels[row * width as usize + x as usize]))
    }))
}

/// Save the color buffer as a PNG.
pub fn save_png(path: &Path, width: u32, height: u32, pixels: &[u32]) -> anyhow::Result<()> {
    let image = frame_image(width, height, pixels)?;
    image
        .save(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    tracing::info!("Frame saved to {}", path.display());
    Ok(())
}

/// Format hit positions as `x y px py pz` lines, skipping misses.
///
/// `y` counts from the bottom row, matching the device buffer.
#[must_use]
pub fn format_hits(width: u32, positions: &[Vec3]) -> String {
    let mut out = String::new();
    for (i, hit) in positions.iter().enumerate() {
        if *hit == Vec3::ZERO {
            continue;
        }
        let x = i % width as usize;
        let y = i / width as usize;
        let _ = writeln!(out, "{x} {y} {} {} {}", hit.x, hit.y, hit.z);
    }
    out
}

/// Write the hit positions of a frame as text.
pub fn save_hits(path: &Path, width: u32, positions: &[Vec3]) -> anyhow::Result<()> {
    std::fs::write(path, format_hits(width, positions))
        .with_context(|| format!("failed to write {}", path.display()))?;
    tracing::info!("Hit positions saved to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_is_flipped_and_sized() {
        let bottom = 0xff00_00ff;
        let top = 0xff00_ff00;
        let image = frame_image(1, 2, &[bottom, top]).unwrap();
        assert_eq!(*image.get_pixel(0, 0), Rgba([0, 255, 0, 255]));
        assert_eq!(*image.get_pixel(0, 1), Rgba([255, 0, 0, 255]));
        assert!(frame_image(2, 2, &[0; 3]).is_err());
    }

    #[test]
    fn misses_are_left_out_of_the_dump() {
        let positions = [Vec3::ZERO, Vec3::new(1.0, -1.0, 0.5), Vec3::ZERO, Vec3::ONE];
        assert_eq!(format_hits(2, &positions), "1 0 1 -1 0.5\n1 1 1 1 1\n");
    }
}
