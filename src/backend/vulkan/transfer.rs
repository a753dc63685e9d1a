//! One-shot transfer submissions and image layout transitions.
//!
//! Images live in [`RESTING_LAYOUT`] for their whole life. Frames still in
//! flight may sample an image while a transfer writes another region of it
//! (atlas uploads) or reads it (growth copies), so its layout never changes
//! after creation:
//!
//! ```text
//!  UNDEFINED ──► GENERAL ──► copy / sample / copy ... ──► destroy
//! ```
//!
//! Every submission waits on its own fence before returning, so callers may
//! reuse or destroy the source right after.

use ash::vk;

use super::conversion::map_vk_error;
use crate::backend::{BackendError, BackendResult};

/// Layout of every image between and during operations.
pub const RESTING_LAYOUT: vk::ImageLayout = vk::ImageLayout::GENERAL;

/// Single-use command buffer on the transfer queue.
pub struct OneShot<'a> {
    device: &'a ash::Device,
    pool: vk::CommandPool,
    queue: vk::Queue,
    pub cmd: vk::CommandBuffer,
}

impl<'a> OneShot<'a> {
    pub fn begin(
        device: &'a ash::Device,
        pool: vk::CommandPool,
        queue: vk::Queue,
    ) -> BackendResult<Self> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let cmd = unsafe { device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| map_vk_error(e, BackendError::RecordingFailed))?
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::RecordingFailed("no command buffer allocated".into()))?;

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        if let Err(e) = unsafe { device.begin_command_buffer(cmd, &begin_info) } {
            unsafe { device.free_command_buffers(pool, &[cmd]) };
            return Err(map_vk_error(e, BackendError::RecordingFailed));
        }

        Ok(Self {
            device,
            pool,
            queue,
            cmd,
        })
    }

    /// End, submit and block until the GPU has executed the commands.
    pub fn submit_and_wait(self) -> BackendResult<()> {
        let result = unsafe { self.submit_inner() };
        unsafe { self.device.free_command_buffers(self.pool, &[self.cmd]) };
        result
    }

    unsafe fn submit_inner(&self) -> BackendResult<()> {
        self.device
            .end_command_buffer(self.cmd)
            .map_err(|e| map_vk_error(e, BackendError::RecordingFailed))?;

        let fence = self
            .device
            .create_fence(&vk::FenceCreateInfo::default(), None)
            .map_err(|e| map_vk_error(e, BackendError::SyncCreationFailed))?;

        let command_buffers = [self.cmd];
        let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
        let result = self
            .device
            .queue_submit(self.queue, &[submit_info], fence)
            .map_err(|e| map_vk_error(e, BackendError::SubmitFailed))
            .and_then(|()| {
                self.device
                    .wait_for_fences(&[fence], true, u64::MAX)
                    .map_err(|e| map_vk_error(e, BackendError::SubmitFailed))
            });

        self.device.destroy_fence(fence, None);
        result
    }
}

/// Move a freshly created image into `GENERAL`.
pub fn initialize_layout(device: &ash::Device, cmd: vk::CommandBuffer, image: vk::Image) {
    image_barrier(
        device,
        cmd,
        image,
        vk::ImageLayout::UNDEFINED,
        (vk::AccessFlags::empty(), vk::PipelineStageFlags::TOP_OF_PIPE),
        (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
        ),
    );
}

/// Make transfer writes into `image` available before the submission ends.
pub fn release_writes(device: &ash::Device, cmd: vk::CommandBuffer, image: vk::Image) {
    image_barrier(
        device,
        cmd,
        image,
        RESTING_LAYOUT,
        (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
        ),
        (vk::AccessFlags::empty(), vk::PipelineStageFlags::BOTTOM_OF_PIPE),
    );
}

fn image_barrier(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    (src_access, src_stage): (vk::AccessFlags, vk::PipelineStageFlags),
    (dst_access, dst_stage): (vk::AccessFlags, vk::PipelineStageFlags),
) {
    let barrier = vk::ImageMemoryBarrier::default()
        .old_layout(old_layout)
        .new_layout(RESTING_LAYOUT)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(color_range())
        .src_access_mask(src_access)
        .dst_access_mask(dst_access);

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

pub fn color_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

pub fn color_layers() -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    }
}
