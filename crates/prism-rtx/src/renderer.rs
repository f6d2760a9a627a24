//! Launch orchestration.
//!
//! [`Renderer`] owns everything the device holds for one scene: the
//! acceleration structure, the pipeline, the dispatch table and the per-frame
//! buffers. Frames follow `resize`, `set_camera`, `render`, then the
//! downloads, and every call blocks until the device is done.

use glam::{UVec2, Vec3};
use prism_core::{Aabb, Camera, TriangleMesh};
use prism_gpu::{
    DeviceBuffer, GpuError, LaunchDims, RayTracingDevice, ShaderBindingTable, TraversableHandle,
};
use prism_shaders::abi::CameraParams;
use prism_shaders::{LaunchParams, ProgramBlob};

use crate::acceleration::AccelerationStructure;
use crate::config::RendererConfig;
use crate::error::{RenderError, Result};
use crate::pipeline::RayTracingPipeline;
use crate::sbt::DispatchTable;

/// Bytes per color buffer element.
const PIXEL_SIZE: u64 = std::mem::size_of::<u32>() as u64;
/// Bytes per hit buffer element.
const HIT_SIZE: u64 = std::mem::size_of::<Vec3>() as u64;

/// Report a failed release on an error path that already has an error to return.
fn log_cleanup<E: std::fmt::Display>(what: &str, result: std::result::Result<(), E>) {
    if let Err(err) = result {
        tracing::warn!("Failed to release {what} during cleanup: {err}");
    }
}

/// Where the renderer is in its frame lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RendererState {
    /// No frame size yet.
    Uninitialized,
    /// Frame buffers exist but no camera was set.
    Sized,
    /// Frames can be launched.
    Ready,
}

/// Ray tracing renderer over a single static scene.
pub struct Renderer<D: RayTracingDevice> {
    accel: AccelerationStructure,
    pipeline: RayTracingPipeline,
    dispatch: DispatchTable,
    color_buffer: DeviceBuffer,
    hit_buffer: DeviceBuffer,
    params_buffer: DeviceBuffer,
    params: LaunchParams,
    camera: Option<Camera>,
    frame_size: UVec2,
    launch_count: u64,
    config: RendererConfig,
    // Declared last so it outlives every field above
    device: D,
}

impl<D: RayTracingDevice> Renderer<D> {
    /// Build the complete pipeline for `scene` on `device`.
    ///
    /// Geometry is uploaded and compacted, the program blob is compiled and
    /// linked, and the dispatch table is packed before this returns.
    pub fn new(
        device: D,
        scene: &TriangleMesh,
        blob: &ProgramBlob,
        config: RendererConfig,
    ) -> Result<Self> {
        tracing::info!(
            "Creating renderer on {}: {} vertices, {} triangles",
            device.name(),
            scene.vertex_count(),
            scene.triangle_count()
        );

        let mut accel = AccelerationStructure::build(&device, scene)?;
        let mut pipeline = match RayTracingPipeline::assemble(&device, &config, blob) {
            Ok(pipeline) => pipeline,
            Err(err) => {
                log_cleanup("acceleration structure", accel.destroy(&device));
                return Err(err);
            }
        };
        let mut dispatch =
            match DispatchTable::build(&device, pipeline.groups(), &accel, scene.color) {
                Ok(dispatch) => dispatch,
                Err(err) => {
                    log_cleanup("pipeline", pipeline.destroy(&device));
                    log_cleanup("acceleration structure", accel.destroy(&device));
                    return Err(err);
                }
            };

        let mut params_buffer = DeviceBuffer::new("launch_params");
        let params_size = std::mem::size_of::<LaunchParams>() as u64;
        if let Err(err) = params_buffer.alloc(&device, params_size) {
            log_cleanup("dispatch table", dispatch.destroy(&device));
            log_cleanup("pipeline", pipeline.destroy(&device));
            log_cleanup("acceleration structure", accel.destroy(&device));
            return Err(err.into());
        }

        let params = LaunchParams {
            traversable: accel.handle().0,
            ..LaunchParams::default()
        };

        tracing::info!("Renderer ready");
        Ok(Self {
            accel,
            pipeline,
            dispatch,
            color_buffer: DeviceBuffer::new("color_buffer"),
            hit_buffer: DeviceBuffer::new("hit_buffer"),
            params_buffer,
            params,
            camera: None,
            frame_size: UVec2::ZERO,
            launch_count: 0,
            config,
            device,
        })
    }

    /// Resize the frame buffers to `width` x `height` pixels.
    ///
    /// A zero dimension is ignored. Resizing to the current size keeps the
    /// existing buffers and their contents. If either buffer cannot be
    /// allocated, both are released and the renderer has no frame size again.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            tracing::debug!("Ignoring resize to {width}x{height}");
            return Ok(());
        }

        if let Err(err) = self.resize_frame_buffers(width, height) {
            self.clear_frame();
            return Err(err);
        }

        self.frame_size = UVec2::new(width, height);
        let size = [width as i32, height as i32];
        self.params.frame.color_buffer = self.color_buffer.device_ptr().as_u64();
        self.params.frame.size = size;
        self.params.hits.hit_buffer = self.hit_buffer.device_ptr().as_u64();
        self.params.hits.size = size;

        if let Some(camera) = self.camera {
            self.update_camera_basis(&camera)?;
        }
        Ok(())
    }

    fn resize_frame_buffers(&mut self, width: u32, height: u32) -> Result<()> {
        let pixels = u64::from(width) * u64::from(height);
        let bytes = |element: u64| {
            pixels.checked_mul(element).ok_or_else(|| {
                GpuError::AllocationFailed(format!("{width}x{height} frame does not fit in memory"))
            })
        };
        let color_bytes = bytes(PIXEL_SIZE)?;
        let hit_bytes = bytes(HIT_SIZE)?;

        let color_realloc = self.color_buffer.resize(&self.device, color_bytes)?;
        let hit_realloc = self.hit_buffer.resize(&self.device, hit_bytes)?;
        if color_realloc || hit_realloc {
            tracing::debug!("Frame buffers reallocated for {width}x{height}");
        }
        Ok(())
    }

    /// Drop both frame buffers after a failed resize, back to no frame size.
    fn clear_frame(&mut self) {
        log_cleanup("color buffer", self.color_buffer.free(&self.device));
        log_cleanup("hit buffer", self.hit_buffer.free(&self.device));
        self.frame_size = UVec2::ZERO;
        self.params.frame.color_buffer = 0;
        self.params.frame.size = [0, 0];
        self.params.hits.hit_buffer = 0;
        self.params.hits.size = [0, 0];
    }

    /// Set the camera and recompute the launch basis.
    ///
    /// A camera without a usable view direction is rejected and the previous
    /// camera stays in effect.
    pub fn set_camera(&mut self, camera: Camera) -> Result<()> {
        camera.validate()?;
        if self.frame_size.x > 0 && self.frame_size.y > 0 {
            self.update_camera_basis(&camera)?;
        }
        self.camera = Some(camera);
        Ok(())
    }

    fn update_camera_basis(&mut self, camera: &Camera) -> Result<()> {
        let aspect = self.frame_size.x as f32 / self.frame_size.y as f32;
        let basis = camera.basis(aspect, self.config.cos_fovy)?;
        self.params.camera = CameraParams {
            position: basis.position.to_array(),
            direction: basis.direction.to_array(),
            horizontal: basis.horizontal.to_array(),
            vertical: basis.vertical.to_array(),
        };
        Ok(())
    }

    /// Launch one frame and wait for it.
    ///
    /// Does nothing until both a frame size and a camera have been set.
    pub fn render(&mut self) -> Result<()> {
        match self.state() {
            RendererState::Uninitialized => {
                tracing::debug!("Render skipped: no frame size");
                return Ok(());
            }
            RendererState::Sized => {
                tracing::debug!("Render skipped: no camera");
                return Ok(());
            }
            RendererState::Ready => {}
        }

        self.params_buffer
            .upload(&self.device, std::slice::from_ref(&self.params))?;
        self.device.launch(
            self.pipeline.handle(),
            self.params_buffer.device_ptr(),
            std::mem::size_of::<LaunchParams>(),
            self.dispatch.table(),
            LaunchDims::new_2d(self.frame_size.x, self.frame_size.y),
        )?;
        self.device.synchronize()?;

        self.launch_count += 1;
        tracing::trace!(
            "Frame {} launched at {}x{}",
            self.launch_count,
            self.frame_size.x,
            self.frame_size.y
        );
        Ok(())
    }

    fn pixel_count(&self) -> usize {
        self.frame_size.x as usize * self.frame_size.y as usize
    }

    fn check_host_len(&self, actual: usize) -> Result<()> {
        let expected = self.pixel_count();
        if actual != expected {
            return Err(RenderError::HostBufferSize { expected, actual });
        }
        Ok(())
    }

    /// Copy the color buffer into `pixels`, one packed RGBA value per pixel.
    ///
    /// `pixels` must hold exactly `width * height` elements.
    pub fn download_pixels(&self, pixels: &mut [u32]) -> Result<()> {
        self.check_host_len(pixels.len())?;
        if pixels.is_empty() {
            return Ok(());
        }
        self.color_buffer.download(&self.device, pixels)?;
        Ok(())
    }

    /// Copy the hit position buffer into `positions`.
    ///
    /// Pixels whose primary ray missed hold the origin.
    pub fn download_hit_positions(&self, positions: &mut [Vec3]) -> Result<()> {
        self.check_host_len(positions.len())?;
        if positions.is_empty() {
            return Ok(());
        }
        self.hit_buffer.download(&self.device, positions)?;
        Ok(())
    }

    #[must_use]
    pub fn state(&self) -> RendererState {
        if self.frame_size.x == 0 || self.frame_size.y == 0 {
            RendererState::Uninitialized
        } else if self.camera.is_none() {
            RendererState::Sized
        } else {
            RendererState::Ready
        }
    }

    /// Current frame size in pixels.
    #[must_use]
    pub const fn frame_size(&self) -> UVec2 {
        self.frame_size
    }

    /// Number of completed launches.
    #[must_use]
    pub const fn launch_count(&self) -> u64 {
        self.launch_count
    }

    /// Handle of the compacted scene structure.
    #[must_use]
    pub const fn traversable(&self) -> TraversableHandle {
        self.accel.handle()
    }

    #[must_use]
    pub const fn dispatch_table(&self) -> &ShaderBindingTable {
        self.dispatch.table()
    }

    #[must_use]
    pub const fn device(&self) -> &D {
        &self.device
    }

    /// Launch parameters as they will be uploaded by the next [`render`](Self::render).
    #[must_use]
    pub const fn launch_params(&self) -> &LaunchParams {
        &self.params
    }

    /// Bounds of the scene geometry.
    #[must_use]
    pub const fn scene_bounds(&self) -> Aabb {
        self.accel.bounds()
    }

    #[must_use]
    pub const fn camera(&self) -> Option<&Camera> {
        self.camera.as_ref()
    }

    #[must_use]
    pub const fn config(&self) -> &RendererConfig {
        &self.config
    }

    /// Run every release step, even after one fails, and keep the first error.
    fn release(&mut self) -> Result<()> {
        let device = &self.device;
        let steps = [
            device.synchronize().map_err(RenderError::from),
            self.color_buffer.free(device).map_err(RenderError::from),
            self.hit_buffer.free(device).map_err(RenderError::from),
            self.params_buffer.free(device).map_err(RenderError::from),
            self.dispatch.destroy(device),
            self.pipeline.destroy(device),
            self.accel.destroy(device),
        ];
        steps.into_iter().find(Result::is_err).unwrap_or(Ok(()))
    }
}

impl<D: RayTracingDevice> Drop for Renderer<D> {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            tracing::warn!("Failed to release renderer resources: {err}");
        }
    }
}

impl<D: RayTracingDevice> std::fmt::Debug for Renderer<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("device", &self.device.name())
            .field("state", &self.state())
            .field("frame_size", &self.frame_size)
            .field("launch_count", &self.launch_count)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use prism_core::constants::COS_FOVY;
    use crate::config::EntryPoints;
    use prism_core::scene::{standard_camera, two_boxes};
    use prism_host::HostDevice;
    use std::sync::Arc;

    fn renderer() -> Renderer<HostDevice> {
        Renderer::new(
            HostDevice::new(),
            &two_boxes(),
            &ProgramBlob::host_reference(),
            RendererConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn starts_uninitialized_with_traversable_bound() {
        let renderer = renderer();
        assert_eq!(renderer.state(), RendererState::Uninitialized);
        assert_eq!(renderer.frame_size(), UVec2::ZERO);
        assert_eq!(renderer.launch_params().traversable, renderer.traversable().0);
        assert!(!renderer.dispatch_table().raygen_record.is_null());
        assert!(renderer.scene_bounds().contains_point(Vec3::ZERO));
    }

    #[test]
    fn render_before_resize_is_a_no_op() {
        let mut renderer = renderer();
        renderer.render().unwrap();
        renderer.resize(0, 0).unwrap();
        renderer.render().unwrap();
        assert_eq!(renderer.launch_count(), 0);
        assert_eq!(renderer.device().stats().launches, 0);
    }

    #[test]
    fn zero_dimension_resize_is_ignored() {
        let mut renderer = renderer();
        renderer.resize(64, 32).unwrap();
        renderer.resize(0, 32).unwrap();
        assert_eq!(renderer.frame_size(), UVec2::new(64, 32));
    }

    #[test]
    fn render_without_camera_is_a_no_op() {
        let mut renderer = renderer();
        renderer.resize(8, 8).unwrap();
        assert_eq!(renderer.state(), RendererState::Sized);
        renderer.render().unwrap();
        assert_eq!(renderer.launch_count(), 0);
    }

    #[test]
    fn resize_sets_frame_and_basis() {
        let mut renderer = renderer();
        renderer.set_camera(Camera::default()).unwrap();
        renderer.resize(200, 100).unwrap();

        let params = renderer.launch_params();
        assert_eq!(params.frame.size, [200, 100]);
        assert_eq!(params.hits.size, [200, 100]);
        assert_ne!(params.frame.color_buffer, 0);
        assert_ne!(params.hits.hit_buffer, 0);

        let horizontal = Vec3::from(params.camera.horizontal);
        let vertical = Vec3::from(params.camera.vertical);
        assert_relative_eq!(horizontal.length(), COS_FOVY * 2.0, epsilon = 1e-5);
        assert_relative_eq!(vertical.length(), COS_FOVY, epsilon = 1e-5);
        assert_eq!(renderer.state(), RendererState::Ready);
    }

    #[test]
    fn same_size_resize_keeps_frame_contents() {
        let mut renderer = renderer();
        renderer.set_camera(standard_camera()).unwrap();
        renderer.resize(33, 17).unwrap();
        renderer.render().unwrap();

        let mut pixels = vec![0u32; 33 * 17];
        let mut hits = vec![Vec3::ZERO; 33 * 17];
        renderer.download_pixels(&mut pixels).unwrap();
        renderer.download_hit_positions(&mut hits).unwrap();
        let color = renderer.launch_params().frame.color_buffer;
        let allocations = renderer.device().allocation_count();

        renderer.resize(33, 17).unwrap();
        assert_eq!(renderer.launch_params().frame.color_buffer, color);
        assert_eq!(renderer.device().allocation_count(), allocations);

        let mut pixels_again = vec![0u32; 33 * 17];
        let mut hits_again = vec![Vec3::ZERO; 33 * 17];
        renderer.download_pixels(&mut pixels_again).unwrap();
        renderer.download_hit_positions(&mut hits_again).unwrap();
        assert_eq!(pixels_again, pixels);
        assert_eq!(hits_again, hits);

        let horizontal = Vec3::from(renderer.launch_params().camera.horizontal);
        assert_relative_eq!(horizontal.length(), COS_FOVY * 33.0 / 17.0, epsilon = 1e-5);
    }

    #[test]
    fn failed_resize_releases_frame_buffers() {
        let mut renderer = renderer();
        let baseline = renderer.device().allocation_count();
        renderer.resize(8, 8).unwrap();
        renderer.set_camera(Camera::default()).unwrap();
        assert_eq!(renderer.device().allocation_count(), baseline + 2);

        // Far more memory than any host can reserve
        assert!(matches!(
            renderer.resize(u32::MAX, u32::MAX / 16),
            Err(RenderError::Gpu(GpuError::AllocationFailed(_)))
        ));
        assert_eq!(renderer.state(), RendererState::Uninitialized);
        assert_eq!(renderer.device().allocation_count(), baseline);
        let params = renderer.launch_params();
        assert_eq!(params.frame.color_buffer, 0);
        assert_eq!(params.hits.hit_buffer, 0);
        assert_eq!(params.frame.size, [0, 0]);

        renderer.resize(8, 8).unwrap();
        renderer.render().unwrap();
        assert_eq!(renderer.launch_count(), 1);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut renderer = renderer();
        assert!(renderer.resize(u32::MAX, u32::MAX).is_err());
        assert_eq!(renderer.frame_size(), UVec2::ZERO);
    }

    #[test]
    fn failed_setup_releases_built_stages() {
        let device = Arc::new(HostDevice::new());
        let config = RendererConfig::default().with_entry_points(EntryPoints {
            closest_hit: "__closesthit__shadow".to_string(),
            ..EntryPoints::default()
        });
        let err = Renderer::new(
            Arc::clone(&device),
            &two_boxes(),
            &ProgramBlob::host_reference(),
            config,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            RenderError::Gpu(GpuError::ProgramGroupCreation { .. })
        ));

        assert_eq!(device.allocation_count(), 0);
        assert_eq!(device.traversable_count(), 0);
        assert_eq!(device.program_object_count(), 0);
    }

    #[test]
    fn drop_releases_everything() {
        let device = Arc::new(HostDevice::new());
        let mut renderer = Renderer::new(
            Arc::clone(&device),
            &two_boxes(),
            &ProgramBlob::host_reference(),
            RendererConfig::default(),
        )
        .unwrap();
        renderer.resize(4, 4).unwrap();
        assert!(device.allocation_count() > 0);

        drop(renderer);
        assert_eq!(device.allocation_count(), 0);
        assert_eq!(device.traversable_count(), 0);
        assert_eq!(device.program_object_count(), 0);
    }

    #[test]
    fn release_continues_past_a_failed_step() {
        let device = Arc::new(HostDevice::new());
        let mut renderer = Renderer::new(
            Arc::clone(&device),
            &two_boxes(),
            &ProgramBlob::host_reference(),
            RendererConfig::default(),
        )
        .unwrap();
        renderer.resize(4, 4).unwrap();

        // Free the color buffer behind the renderer's back so its release fails
        let color = *renderer.color_buffer.raw().unwrap();
        device.free(color).unwrap();

        assert!(matches!(
            renderer.release(),
            Err(RenderError::Gpu(GpuError::InvalidHandle(_)))
        ));
        assert_eq!(device.allocation_count(), 0);
        assert_eq!(device.traversable_count(), 0);
        assert_eq!(device.program_object_count(), 0);

        // A second release has nothing left to do
        renderer.release().unwrap();
    }

    #[test]
    fn degenerate_camera_is_rejected() {
        let mut renderer = renderer();
        let looking_up = Camera::new(Vec3::ZERO, Vec3::Y, Vec3::Y);
        assert!(matches!(
            renderer.set_camera(looking_up),
            Err(RenderError::Scene(prism_core::Error::DegenerateCamera(_)))
        ));
        assert!(renderer.camera().is_none());
    }

    #[test]
    fn renders_background_and_geometry() {
        let mut renderer = renderer();
        renderer.resize(32, 32).unwrap();
        renderer.set_camera(Camera::default()).unwrap();
        renderer.render().unwrap();
        assert_eq!(renderer.launch_count(), 1);

        let mut pixels = vec![0u32; 32 * 32];
        renderer.download_pixels(&mut pixels).unwrap();
        assert!(pixels.iter().all(|p| p >> 24 == 0xff));
        assert!(pixels.contains(&0xffff_ffff));
        assert!(pixels.iter().any(|&p| p != 0xffff_ffff));

        let mut hits = vec![Vec3::ZERO; 32 * 32];
        renderer.download_hit_positions(&mut hits).unwrap();
        for (pixel, hit) in pixels.iter().zip(&hits) {
            if *pixel == 0xffff_ffff {
                assert_eq!(*hit, Vec3::ZERO);
            }
        }
        // The center ray lands on the cube at the origin
        let center = hits[16 * 32 + 16];
        assert!(center.abs().max_element() <= 1.0 + 1e-4);
    }

    #[test]
    fn downloads_check_host_length() {
        let mut renderer = renderer();
        renderer.resize(4, 4).unwrap();
        let mut short = vec![0u32; 15];
        assert!(matches!(
            renderer.download_pixels(&mut short),
            Err(RenderError::HostBufferSize {
                expected: 16,
                actual: 15
            })
        ));
    }

    #[test]
    fn traversable_survives_repeated_launches() {
        let mut renderer = renderer();
        renderer.resize(8, 8).unwrap();
        renderer.set_camera(Camera::default()).unwrap();
        renderer.render().unwrap();
        renderer.resize(16, 8).unwrap();
        renderer.render().unwrap();
        assert_eq!(renderer.launch_count(), 2);
        assert_eq!(renderer.device().traversable_count(), 1);
    }
}
