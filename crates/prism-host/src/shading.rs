//! Execution of built-in programs over a launch grid.

use glam::Vec3;
use prism_core::{Ray, TriangleHit};
use prism_gpu::{DevicePtr, GpuError, Result};
use prism_shaders::abi::{pack_color, HitgroupData, LaunchParams};

use crate::bvh::BvhView;
use crate::memory::HostMemory;
use crate::programs::BuiltinProgram;

/// Far end of every radiance ray.
const RAY_T_MAX: f32 = 1e20;

/// One deferred device write. Programs read a consistent snapshot of memory
/// and their writes land after the whole grid has run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Store {
    pub address: u64,
    len: u8,
    bytes: [u8; 16],
}

impl Store {
    fn new(address: DevicePtr, data: &[u8]) -> Self {
        let mut bytes = [0u8; 16];
        bytes[..data.len()].copy_from_slice(data);
        Self {
            address: address.as_u64(),
            len: data.len() as u8,
            bytes,
        }
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.bytes[..usize::from(self.len)]
    }
}

/// Hit group record resolved for execution.
#[derive(Clone, Copy, Debug)]
pub struct HitRecord {
    pub closest_hit: Option<BuiltinProgram>,
    pub any_hit: Option<BuiltinProgram>,
    /// Address of the record payload, past the header.
    pub data: DevicePtr,
}

/// Program record resolved for execution.
#[derive(Clone, Copy, Debug)]
pub struct ProgramRecord {
    pub program: BuiltinProgram,
    pub data: DevicePtr,
}

/// Shader binding table with every header resolved to its programs.
#[derive(Clone, Debug)]
pub struct ResolvedSbt {
    pub raygen: ProgramRecord,
    pub miss: Vec<ProgramRecord>,
    pub hitgroups: Vec<HitRecord>,
}

/// Per-ray flags.
#[derive(Clone, Copy, Debug, Default)]
pub struct RayFlags {
    pub disable_anyhit: bool,
}

/// Radiance payload.
#[derive(Clone, Copy, Debug, Default)]
struct Payload {
    color: Vec3,
}

/// Everything a program can see during a launch.
pub struct LaunchContext<'a> {
    pub memory: &'a HostMemory,
    pub params: LaunchParams,
    pub sbt: &'a ResolvedSbt,
    pub scene: Option<BvhView<'a>>,
    pub max_trace_depth: u32,
}

/// Output of one grid row.
#[derive(Debug, Default)]
pub struct RowOutput {
    pub stores: Vec<Store>,
    pub rays: u64,
}

impl LaunchContext<'_> {
    /// Run the ray generation program for every item of row `y` in layer `z`.
    pub fn run_row(&self, width: u32, y: u32, z: u32) -> Result<RowOutput> {
        let mut out = RowOutput {
            stores: Vec::with_capacity(width as usize * 2),
            rays: 0,
        };
        for x in 0..width {
            self.raygen([x, y, z], &mut out)?;
        }
        Ok(out)
    }

    fn raygen(&self, index: [u32; 3], out: &mut RowOutput) -> Result<()> {
        match self.sbt.raygen.program {
            BuiltinProgram::RenderFrame => self.render_frame(index, out),
            other => Err(stage_mismatch(other, "ray generation")),
        }
    }

    fn render_frame(&self, index: [u32; 3], out: &mut RowOutput) -> Result<()> {
        let frame = self.params.frame;
        let camera = self.params.camera;
        let size = Vec3::new(frame.size[0] as f32, frame.size[1] as f32, 1.0);

        let screen = (Vec3::new(index[0] as f32, index[1] as f32, 0.0) + 0.5) / size;
        let direction = Vec3::from(camera.direction)
            + (screen.x - 0.5) * Vec3::from(camera.horizontal)
            + (screen.y - 0.5) * Vec3::from(camera.vertical);
        let ray = Ray::new(Vec3::from(camera.position), direction);

        let mut payload = Payload::default();
        self.trace(
            &ray,
            RayFlags {
                disable_anyhit: true,
            },
            &mut payload,
            index,
            1,
            out,
        )?;

        let pixel = pixel_index(&self.params, index);
        let packed = pack_color(payload.color.to_array());
        out.stores.push(Store::new(
            DevicePtr(frame.color_buffer).offset(pixel * 4),
            &packed.to_le_bytes(),
        ));
        Ok(())
    }

    /// Trace `ray` against the launch traversable with SBT offset 0, stride 1
    /// and miss index 0.
    fn trace(
        &self,
        ray: &Ray,
        flags: RayFlags,
        payload: &mut Payload,
        index: [u32; 3],
        depth: u32,
        out: &mut RowOutput,
    ) -> Result<()> {
        if depth > self.max_trace_depth {
            return Err(GpuError::Launch(format!(
                "trace depth {depth} exceeds pipeline limit {}",
                self.max_trace_depth
            )));
        }
        out.rays += 1;

        let record = self.sbt.hitgroups.first();
        let hit = match &self.scene {
            Some(scene) => {
                let any_hit = record.and_then(|r| r.any_hit).filter(|_| !flags.disable_anyhit);
                scene.intersect(ray, 0.0, RAY_T_MAX, |primitive, hit| match any_hit {
                    Some(program) => self.any_hit(program, primitive, hit),
                    None => true,
                })?
            }
            None => None,
        };

        match hit {
            Some(hit) => {
                let record = record.ok_or_else(|| {
                    GpuError::Launch("hit with no hit group record".to_string())
                })?;
                if let Some(program) = record.closest_hit {
                    self.closest_hit(program, record.data, ray, hit.primitive, &hit.hit, payload, index, out)?;
                }
            }
            None => {
                let record = self.sbt.miss.first().ok_or_else(|| {
                    GpuError::Launch("miss with no miss record".to_string())
                })?;
                self.miss(record.program, payload, index, out)?;
            }
        }
        Ok(())
    }

    fn miss(
        &self,
        program: BuiltinProgram,
        payload: &mut Payload,
        index: [u32; 3],
        out: &mut RowOutput,
    ) -> Result<()> {
        if program != BuiltinProgram::RadianceMiss {
            return Err(stage_mismatch(program, "miss"));
        }
        payload.color = Vec3::ONE;
        self.store_hit_position(index, Vec3::ZERO, out);
        Ok(())
    }

    fn any_hit(&self, program: BuiltinProgram, _primitive: u32, _hit: &TriangleHit) -> bool {
        // Only the radiance any-hit binds to this slot and it accepts everything
        matches!(program, BuiltinProgram::RadianceAnyHit)
    }

    #[allow(clippy::too_many_arguments)]
    fn closest_hit(
        &self,
        program: BuiltinProgram,
        data: DevicePtr,
        ray: &Ray,
        primitive: u32,
        hit: &TriangleHit,
        payload: &mut Payload,
        index: [u32; 3],
        out: &mut RowOutput,
    ) -> Result<()> {
        if program != BuiltinProgram::RadianceClosestHit {
            return Err(stage_mismatch(program, "closest-hit"));
        }

        let mesh: HitgroupData = self.memory.read_pod(data)?;
        let triangle: [i32; 3] =
            self.memory
                .read_element(DevicePtr(mesh.index), u64::from(primitive))?;
        let mut corners = [Vec3::ZERO; 3];
        for (corner, &vertex) in corners.iter_mut().zip(&triangle) {
            let vertex = u64::try_from(vertex).map_err(|_| {
                GpuError::Launch(format!("negative vertex index {vertex} in primitive {primitive}"))
            })?;
            let position: [f32; 3] = self.memory.read_element(DevicePtr(mesh.vertex), vertex)?;
            *corner = Vec3::from(position);
        }
        let [a, b, c] = corners;
        let normal = (b - a).cross(c - a).normalize_or_zero();

        let facing = 0.2 + 0.8 * ray.direction.dot(normal).abs();
        payload.color = facing * Vec3::from(mesh.color);

        self.store_hit_position(index, ray.at(hit.t), out);
        Ok(())
    }

    fn store_hit_position(&self, index: [u32; 3], position: Vec3, out: &mut RowOutput) {
        let pixel = pixel_index(&self.params, index);
        let address = DevicePtr(self.params.hits.hit_buffer).offset(pixel * 12);
        out.stores
            .push(Store::new(address, bytemuck::bytes_of(&position.to_array())));
    }
}

/// Row-major pixel index; layers follow each other.
fn pixel_index(params: &LaunchParams, index: [u32; 3]) -> u64 {
    let width = u64::from(params.frame.size[0].max(0) as u32);
    let height = u64::from(params.frame.size[1].max(0) as u32);
    u64::from(index[0]) + u64::from(index[1]) * width + u64::from(index[2]) * width * height
}

fn stage_mismatch(program: BuiltinProgram, slot: &str) -> GpuError {
    GpuError::Launch(format!("{program:?} bound to a {slot} record"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_shaders::abi::{CameraParams, FrameParams, HitParams};

    #[test]
    fn store_keeps_only_written_bytes() {
        let store = Store::new(DevicePtr(0x1000), &[1, 2, 3]);
        assert_eq!(store.data(), &[1, 2, 3]);
        assert_eq!(store.address, 0x1000);
    }

    #[test]
    fn pixel_index_is_row_major() {
        let params = LaunchParams {
            frame: FrameParams {
                color_buffer: 0,
                size: [4, 3],
            },
            hits: HitParams::default(),
            camera: CameraParams::default(),
            traversable: 0,
        };
        assert_eq!(pixel_index(&params, [0, 0, 0]), 0);
        assert_eq!(pixel_index(&params, [3, 0, 0]), 3);
        assert_eq!(pixel_index(&params, [1, 2, 0]), 9);
        assert_eq!(pixel_index(&params, [0, 0, 1]), 12);
    }

    fn empty_scene_context<'a>(memory: &'a HostMemory, sbt: &'a ResolvedSbt, params: LaunchParams) -> LaunchContext<'a> {
        LaunchContext {
            memory,
            params,
            sbt,
            scene: None,
            max_trace_depth: 2,
        }
    }

    fn miss_only_sbt() -> ResolvedSbt {
        ResolvedSbt {
            raygen: ProgramRecord {
                program: BuiltinProgram::RenderFrame,
                data: DevicePtr::NULL,
            },
            miss: vec![ProgramRecord {
                program: BuiltinProgram::RadianceMiss,
                data: DevicePtr::NULL,
            }],
            hitgroups: vec![],
        }
    }

    fn params_2x1() -> LaunchParams {
        LaunchParams {
            frame: FrameParams {
                color_buffer: 0x1000,
                size: [2, 1],
            },
            hits: HitParams {
                hit_buffer: 0x2000,
                size: [2, 1],
            },
            camera: CameraParams {
                position: [0.0; 3],
                direction: [0.0, 0.0, 1.0],
                horizontal: [1.0, 0.0, 0.0],
                vertical: [0.0, 1.0, 0.0],
            },
            traversable: 0,
        }
    }

    #[test]
    fn empty_scene_misses_white() {
        let memory = HostMemory::new();
        let sbt = miss_only_sbt();
        let context = empty_scene_context(&memory, &sbt, params_2x1());

        let row = context.run_row(2, 0, 0).unwrap();
        assert_eq!(row.rays, 2);
        let colors: Vec<&Store> = row.stores.iter().filter(|s| s.data().len() == 4).collect();
        assert_eq!(colors.len(), 2);
        assert_eq!(colors[1].address, 0x1004);
        assert_eq!(colors[1].data(), &0xffff_ffffu32.to_le_bytes());

        let hits: Vec<&Store> = row.stores.iter().filter(|s| s.data().len() == 12).collect();
        assert_eq!(hits[1].address, 0x200c);
        assert!(hits.iter().all(|s| s.data().iter().all(|&b| b == 0)));
    }

    #[test]
    fn trace_depth_is_enforced() {
        let memory = HostMemory::new();
        let sbt = miss_only_sbt();
        let mut context = empty_scene_context(&memory, &sbt, params_2x1());
        context.max_trace_depth = 0;
        assert!(matches!(context.run_row(1, 0, 0), Err(GpuError::Launch(_))));
    }

    #[test]
    fn wrong_program_in_slot_is_rejected() {
        let memory = HostMemory::new();
        let mut sbt = miss_only_sbt();
        sbt.raygen.program = BuiltinProgram::RadianceMiss;
        let context = empty_scene_context(&memory, &sbt, params_2x1());
        assert!(context.run_row(1, 0, 0).is_err());
    }
}
