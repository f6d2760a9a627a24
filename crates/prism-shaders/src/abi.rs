//! Host/device ABI.
//!
//! Every struct here is read by device programs straight out of device
//! memory, so layouts are `#[repr(C)]` with explicit padding and must match
//! `glsl/common.glsl` and the host reference programs field for field.

use bytemuck::{Pod, Zeroable};

/// Output image: packed RGBA8 pixels, row `y` starting at `y * size[0]`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct FrameParams {
    /// Device address of `size[0] * size[1]` `u32` pixels.
    pub color_buffer: u64,
    pub size: [i32; 2],
}

/// Per-pixel world-space hit positions, `[0, 0, 0]` on a miss.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct HitParams {
    /// Device address of `size[0] * size[1]` `[f32; 3]` entries.
    pub hit_buffer: u64,
    pub size: [i32; 2],
}

/// Pinhole camera basis.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct CameraParams {
    pub position: [f32; 3],
    pub direction: [f32; 3],
    pub horizontal: [f32; 3],
    pub vertical: [f32; 3],
}

/// Launch parameter block, bound under the launch-parameter symbol.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct LaunchParams {
    pub frame: FrameParams,
    pub hits: HitParams,
    pub camera: CameraParams,
    /// Traversable the ray generation program traces against.
    pub traversable: u64,
}

/// Payload of ray generation and miss records.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct EmptyRecordData {
    pub _reserved: u64,
}

/// Payload of hit group records: the mesh the closest-hit program shades.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct HitgroupData {
    /// Device address of packed `[f32; 3]` vertices.
    pub vertex: u64,
    /// Device address of packed `[i32; 3]` index triples.
    pub index: u64,
    pub color: [f32; 3],
    pub _pad: f32,
}

impl HitgroupData {
    #[must_use]
    pub fn new(vertex: u64, index: u64, color: [f32; 3]) -> Self {
        Self {
            vertex,
            index,
            color,
            _pad: 0.0,
        }
    }
}

/// Pack a linear color into `0xAABBGGRR` with opaque alpha.
///
/// Channels are clamped to `[0, 1]` and scaled by 255.99 so that 1.0 maps
/// to 255.
#[must_use]
pub fn pack_color(color: [f32; 3]) -> u32 {
    let channel = |c: f32| (c.clamp(0.0, 1.0) * 255.99) as u32;
    0xff00_0000 | channel(color[0]) | (channel(color[1]) << 8) | (channel(color[2]) << 16)
}

/// Inverse of [`pack_color`] into 8-bit RGBA.
#[must_use]
pub fn unpack_rgba(pixel: u32) -> [u8; 4] {
    pixel.to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, offset_of, size_of};

    #[test]
    fn launch_params_layout() {
        assert_eq!(size_of::<FrameParams>(), 16);
        assert_eq!(size_of::<HitParams>(), 16);
        assert_eq!(size_of::<CameraParams>(), 48);
        assert_eq!(size_of::<LaunchParams>(), 88);
        assert_eq!(align_of::<LaunchParams>(), 8);

        assert_eq!(offset_of!(LaunchParams, hits), 16);
        assert_eq!(offset_of!(LaunchParams, camera), 32);
        assert_eq!(offset_of!(LaunchParams, traversable), 80);
        assert_eq!(offset_of!(CameraParams, vertical), 36);
    }

    #[test]
    fn record_payload_layout() {
        assert_eq!(size_of::<EmptyRecordData>(), 8);
        assert_eq!(size_of::<HitgroupData>(), 32);
        assert_eq!(offset_of!(HitgroupData, color), 16);
    }

    #[test]
    fn pack_color_channels() {
        assert_eq!(pack_color([1.0, 1.0, 1.0]), 0xffff_ffff);
        assert_eq!(pack_color([0.0, 0.0, 0.0]), 0xff00_0000);
        assert_eq!(pack_color([1.0, 0.0, 0.0]), 0xff00_00ff);
        assert_eq!(pack_color([0.0, 0.0, 1.0]), 0xffff_0000);
        // 0.2 * 255.99 = 51.198
        assert_eq!(pack_color([0.2, 0.8, 0.2]) & 0xff, 51);
    }

    #[test]
    fn pack_color_clamps() {
        assert_eq!(pack_color([2.0, -1.0, f32::NAN]), 0xff00_00ff);
    }

    #[test]
    fn unpack_is_rgba_order() {
        assert_eq!(unpack_rgba(pack_color([1.0, 0.0, 0.0])), [255, 0, 0, 255]);
        assert_eq!(unpack_rgba(0xff33_2211), [0x11, 0x22, 0x33, 0xff]);
    }

    #[test]
    fn hitgroup_data_zero_pads() {
        let data = HitgroupData::new(0x1000, 0x2000, [0.2, 0.8, 0.2]);
        let bytes = bytemuck::bytes_of(&data);
        assert_eq!(&bytes[28..32], &[0, 0, 0, 0]);
    }
}
