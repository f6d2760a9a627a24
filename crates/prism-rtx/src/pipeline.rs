//! Program module, program groups and the linked pipeline.

use prism_gpu::{
    GpuError, ModuleHandle, PipelineHandle, ProgramGroupDesc, ProgramGroupHandle,
    RayTracingDevice,
};
use prism_shaders::ProgramBlob;

use crate::config::RendererConfig;
use crate::error::Result;

/// Forward a device compile log and unwrap the handle.
fn with_log<T>(step: &str, result: prism_gpu::Result<(T, String)>) -> Result<T> {
    match result {
        Ok((handle, log)) => {
            if !log.is_empty() {
                tracing::debug!("{step}: {log}");
            }
            Ok(handle)
        }
        Err(err) => {
            if let Some(log) = err.log().filter(|log| !log.is_empty()) {
                tracing::warn!("{step} failed: {log}");
            }
            Err(err.into())
        }
    }
}

/// Report a failed release on an error path that already has an error to return.
fn log_cleanup(what: &str, result: prism_gpu::Result<()>) {
    if let Err(err) = result {
        tracing::warn!("Failed to destroy {what} during cleanup: {err}");
    }
}

/// One program group per stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProgramGroups {
    pub raygen: ProgramGroupHandle,
    pub miss: ProgramGroupHandle,
    pub hitgroup: ProgramGroupHandle,
}

impl ProgramGroups {
    /// Groups in link order.
    #[must_use]
    pub const fn as_array(&self) -> [ProgramGroupHandle; 3] {
        [self.raygen, self.miss, self.hitgroup]
    }
}

/// A linked ray tracing pipeline and the objects it was built from.
#[derive(Debug)]
pub struct RayTracingPipeline {
    module: ModuleHandle,
    groups: ProgramGroups,
    pipeline: PipelineHandle,
    destroyed: bool,
}

impl RayTracingPipeline {
    /// Compile `blob`, create the program groups, link them and set the
    /// stack sizes, in that order.
    ///
    /// Any failure is returned with the device log attached. Objects created
    /// before the failing step are destroyed again.
    pub fn assemble<D: RayTracingDevice + ?Sized>(
        device: &D,
        config: &RendererConfig,
        blob: &ProgramBlob,
    ) -> Result<Self> {
        tracing::info!("Assembling pipeline from {} ({} bytes)", blob.source(), blob.len());

        // 1. Module
        let module = with_log(
            "Module compilation",
            device.module_create(&config.module, &config.pipeline, blob.bytes()),
        )?;

        let mut created = Vec::with_capacity(3);
        let linked = Self::link(device, config, module, &mut created);
        let (groups, pipeline) = match linked {
            Ok(linked) => linked,
            Err(err) => {
                for group in created.into_iter().rev() {
                    log_cleanup("program group", device.program_group_destroy(group));
                }
                log_cleanup("module", device.module_destroy(module));
                return Err(err);
            }
        };

        tracing::info!(
            "Pipeline ready: max trace depth {}, continuation stack {}",
            config.link.max_trace_depth,
            config.stack_sizes.continuation
        );

        Ok(Self {
            module,
            groups,
            pipeline,
            destroyed: false,
        })
    }

    /// Steps 2 to 4. Every group is pushed to `created` as soon as it exists.
    fn link<D: RayTracingDevice + ?Sized>(
        device: &D,
        config: &RendererConfig,
        module: ModuleHandle,
        created: &mut Vec<ProgramGroupHandle>,
    ) -> Result<(ProgramGroups, PipelineHandle)> {
        // 2. Program groups
        let entries = &config.entry_points;
        let mut create_group = |step: &str, desc: ProgramGroupDesc| -> Result<ProgramGroupHandle> {
            let group = with_log(step, device.program_group_create(&desc))?;
            created.push(group);
            Ok(group)
        };
        let raygen = create_group(
            "Ray generation group",
            ProgramGroupDesc::Raygen {
                module,
                entry: entries.raygen.clone(),
            },
        )?;
        let miss = create_group(
            "Miss group",
            ProgramGroupDesc::Miss {
                module,
                entry: entries.miss.clone(),
            },
        )?;
        let hitgroup = create_group(
            "Hit group",
            ProgramGroupDesc::Hitgroup {
                module,
                closest_hit: Some(entries.closest_hit.clone()),
                any_hit: Some(entries.any_hit.clone()),
            },
        )?;
        let groups = ProgramGroups {
            raygen,
            miss,
            hitgroup,
        };

        // 3. Link
        let pipeline = with_log(
            "Pipeline link",
            device.pipeline_create(&config.pipeline, &config.link, &groups.as_array()),
        )?;

        // 4. Stack sizes
        if let Err(err) = device.pipeline_set_stack_size(pipeline, &config.stack_sizes) {
            log_cleanup("pipeline", device.pipeline_destroy(pipeline));
            return Err(err.into());
        }
        Ok((groups, pipeline))
    }

    #[must_use]
    pub const fn handle(&self) -> PipelineHandle {
        self.pipeline
    }

    #[must_use]
    pub const fn groups(&self) -> &ProgramGroups {
        &self.groups
    }

    #[must_use]
    pub const fn module(&self) -> ModuleHandle {
        self.module
    }

    /// Destroy the pipeline, its groups and the module.
    ///
    /// Calling this twice is harmless.
    pub fn destroy<D: RayTracingDevice + ?Sized>(&mut self, device: &D) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;

        let mut first_error: Option<GpuError> = None;
        let results = std::iter::once(device.pipeline_destroy(self.pipeline))
            .chain(
                self.groups
                    .as_array()
                    .into_iter()
                    .map(|group| device.program_group_destroy(group)),
            )
            .chain(std::iter::once(device.module_destroy(self.module)));
        for result in results {
            if let Err(err) = result {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), |err| Err(err.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EntryPoints;
    use crate::RenderError;
    use prism_gpu::StackSizes;
    use prism_host::HostDevice;

    #[test]
    fn assembles_reference_programs() {
        let device = HostDevice::new();
        let config = RendererConfig::default();
        let pipeline =
            RayTracingPipeline::assemble(&device, &config, &ProgramBlob::host_reference()).unwrap();

        let groups = pipeline.groups().as_array();
        assert_ne!(groups[0], groups[1]);
        assert_ne!(groups[1], groups[2]);
        assert_eq!(
            device.pipeline_stack_sizes(pipeline.handle()),
            Some(StackSizes::default())
        );
    }

    #[test]
    fn wrong_symbol_fails_with_log() {
        let device = HostDevice::new();
        let config = RendererConfig::default().with_launch_params_name("params");
        let err = RayTracingPipeline::assemble(&device, &config, &ProgramBlob::host_reference())
            .unwrap_err();
        assert!(matches!(
            err,
            RenderError::Gpu(GpuError::ModuleCompilation { .. })
        ));
        assert!(err.device_log().is_some_and(|log| log.contains("params")));
        assert_eq!(device.program_object_count(), 0);
    }

    #[test]
    fn missing_entry_fails_group_creation() {
        let device = HostDevice::new();
        let config = RendererConfig::default().with_entry_points(EntryPoints {
            miss: "__miss__shadow".to_string(),
            ..EntryPoints::default()
        });
        let err = RayTracingPipeline::assemble(&device, &config, &ProgramBlob::host_reference())
            .unwrap_err();
        assert!(matches!(
            err,
            RenderError::Gpu(GpuError::ProgramGroupCreation { .. })
        ));
        // The module and the ray generation group were released again
        assert_eq!(device.program_object_count(), 0);
    }

    #[test]
    fn zero_graph_depth_is_rejected() {
        let device = HostDevice::new();
        let config = RendererConfig::default().with_stack_sizes(StackSizes {
            max_traversable_graph_depth: 0,
            ..StackSizes::default()
        });
        assert!(
            RayTracingPipeline::assemble(&device, &config, &ProgramBlob::host_reference()).is_err()
        );
        assert_eq!(device.program_object_count(), 0);
    }

    #[test]
    fn destroy_is_idempotent() {
        let device = HostDevice::new();
        let mut pipeline = RayTracingPipeline::assemble(
            &device,
            &RendererConfig::default(),
            &ProgramBlob::host_reference(),
        )
        .unwrap();
        assert_eq!(device.program_object_count(), 5);
        pipeline.destroy(&device).unwrap();
        pipeline.destroy(&device).unwrap();
        assert!(device.pipeline_stack_sizes(pipeline.handle()).is_none());
        assert_eq!(device.program_object_count(), 0);
    }
}
