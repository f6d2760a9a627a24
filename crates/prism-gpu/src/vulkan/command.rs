//! The single command stream every device operation is recorded on.

use ash::vk;

use crate::error::Result;

/// One queue plus the pool its command buffers come from.
///
/// Work is recorded into a throwaway primary buffer, submitted and waited
/// on before the call returns, so the host always observes finished results.
pub struct CommandStream {
    pool: vk::CommandPool,
    queue: vk::Queue,
    queue_family: u32,
}

impl CommandStream {
    /// # Safety
    /// `queue_family` must be a family `device` was created with.
    pub unsafe fn new(device: &ash::Device, queue_family: u32) -> Result<Self> {
        let pool = device.create_command_pool(
            &vk::CommandPoolCreateInfo::default()
                .queue_family_index(queue_family)
                .flags(vk::CommandPoolCreateFlags::TRANSIENT),
            None,
        )?;
        Ok(Self {
            pool,
            queue: device.get_device_queue(queue_family, 0),
            queue_family,
        })
    }

    #[must_use]
    pub const fn queue(&self) -> vk::Queue {
        self.queue
    }

    #[must_use]
    pub const fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Record with `record`, submit, and block until the queue drains.
    ///
    /// # Safety
    /// Every handle `record` touches must belong to `device`.
    pub unsafe fn run<F>(&self, device: &ash::Device, record: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        let cmd = device
            .allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::default()
                    .command_pool(self.pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1),
            )?
            .into_iter()
            .next()
            .ok_or(vk::Result::ERROR_OUT_OF_HOST_MEMORY)?;

        let outcome = (|| -> std::result::Result<(), vk::Result> {
            device.begin_command_buffer(
                cmd,
                &vk::CommandBufferBeginInfo::default()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )?;
            record(cmd);
            device.end_command_buffer(cmd)?;
            let submit = vk::SubmitInfo::default().command_buffers(std::slice::from_ref(&cmd));
            device.queue_submit(self.queue, &[submit], vk::Fence::null())?;
            device.queue_wait_idle(self.queue)
        })();

        device.free_command_buffers(self.pool, &[cmd]);
        outcome.map_err(Into::into)
    }

    /// # Safety
    /// No command buffer from this stream may still be executing.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_command_pool(self.pool, None);
    }
}

/// Make one acceleration structure command's writes visible to the next.
///
/// # Safety
/// `cmd` must be recording.
pub unsafe fn accel_write_barrier(device: &ash::Device, cmd: vk::CommandBuffer) {
    let barrier = vk::MemoryBarrier2::default()
        .src_stage_mask(vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR)
        .src_access_mask(vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR)
        .dst_stage_mask(
            vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR
                | vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_COPY_KHR,
        )
        .dst_access_mask(vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR);
    device.cmd_pipeline_barrier2(
        cmd,
        &vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&barrier)),
    );
}
