//! Vulkan backend implementation
//!
//! [`VulkanDevice`] implements [`GpuDevice`] on top of a device, queues,
//! swapchain and render pass created by the embedding application and handed
//! over in a [`VulkanContext`]. The device owns everything it creates itself
//! (memory, buffers, images, binding sets, sync objects, command pools) and
//! destroys it on drop; the context objects stay with the application.
//!
//! Memory goes through `gpu-allocator`. Host-visible buffers are allocated
//! `CpuToGpu` and stay persistently mapped.

mod conversion;
mod transfer;

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::traits::*;
use crate::backend::types::*;
use conversion::{
    convert_address_mode, convert_binding_kind, convert_buffer_usage, convert_filter_mode,
    convert_image_usage, convert_index_format, convert_texture_format, map_vk_error,
};
use transfer::{color_layers, color_range, OneShot, RESTING_LAYOUT};

/// Descriptor sets available to binding tables, per descriptor type.
const DESCRIPTOR_POOL_SIZE: u32 = 1024;

/// Objects created by the application that the device renders with.
pub struct VulkanContext {
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,
    /// May equal the graphics queue.
    pub transfer_queue: vk::Queue,
    pub transfer_queue_family: u32,
    pub swapchain_loader: ash::khr::swapchain::Device,
    pub swapchain: vk::SwapchainKHR,
    /// Render pass with one color attachment cleared on load.
    pub render_pass: vk::RenderPass,
    /// One framebuffer per swapchain image.
    pub framebuffers: Vec<vk::Framebuffer>,
    pub extent: vk::Extent2D,
}

struct VkBuffer {
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: u64,
}

struct VkImage {
    image: vk::Image,
    view: vk::ImageView,
    allocation: Option<Allocation>,
}

struct VkBindingSet {
    layout: vk::DescriptorSetLayout,
    sets: Vec<vk::DescriptorSet>,
    entries: Vec<BindingEntry>,
}

struct VkPipeline {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
}

/// Vulkan device
pub struct VulkanDevice {
    ctx: VulkanContext,
    allocator: Option<Arc<Mutex<Allocator>>>,
    limits: DeviceLimits,
    /// Queue families sharing every buffer and image.
    queue_families: Vec<u32>,
    graphics_pool: vk::CommandPool,
    transfer_pool: vk::CommandPool,
    descriptor_pool: vk::DescriptorPool,

    buffers: HashMap<u64, VkBuffer>,
    images: HashMap<u64, VkImage>,
    samplers: HashMap<u64, vk::Sampler>,
    binding_sets: HashMap<u64, VkBindingSet>,
    fences: HashMap<u64, vk::Fence>,
    semaphores: HashMap<u64, vk::Semaphore>,
    command_lists: HashMap<u64, vk::CommandBuffer>,
    pipelines: HashMap<u64, VkPipeline>,

    next_buffer_id: u64,
    next_image_id: u64,
    next_sampler_id: u64,
    next_binding_set_id: u64,
    next_fence_id: u64,
    next_semaphore_id: u64,
    next_command_list_id: u64,
    next_pipeline_id: u64,
}

impl VulkanDevice {
    pub fn new(ctx: VulkanContext) -> BackendResult<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: ctx.instance.clone(),
            device: ctx.device.clone(),
            physical_device: ctx.physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: gpu_allocator::AllocationSizes::default(),
        })
        .map_err(|e| {
            BackendError::InitializationFailed(format!("Failed to create memory allocator: {}", e))
        })?;

        let properties = unsafe { ctx.instance.get_physical_device_properties(ctx.physical_device) };
        let limits = DeviceLimits {
            min_uniform_offset_alignment: properties.limits.min_uniform_buffer_offset_alignment,
            min_storage_offset_alignment: properties.limits.min_storage_buffer_offset_alignment,
            max_image_dimension: properties.limits.max_image_dimension2_d,
        };

        let mut queue_families = vec![ctx.graphics_queue_family];
        if ctx.transfer_queue_family != ctx.graphics_queue_family {
            queue_families.push(ctx.transfer_queue_family);
        }

        let graphics_pool = create_command_pool(
            &ctx.device,
            ctx.graphics_queue_family,
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )?;
        let transfer_pool = create_command_pool(
            &ctx.device,
            ctx.transfer_queue_family,
            vk::CommandPoolCreateFlags::TRANSIENT,
        )?;
        let descriptor_pool = create_descriptor_pool(&ctx.device)?;

        log::info!(
            "Vulkan device ready: {} swapchain images, {}x{}, uniform alignment {}",
            ctx.framebuffers.len(),
            ctx.extent.width,
            ctx.extent.height,
            limits.min_uniform_offset_alignment
        );

        Ok(Self {
            ctx,
            allocator: Some(Arc::new(Mutex::new(allocator))),
            limits,
            queue_families,
            graphics_pool,
            transfer_pool,
            descriptor_pool,
            buffers: HashMap::new(),
            images: HashMap::new(),
            samplers: HashMap::new(),
            binding_sets: HashMap::new(),
            fences: HashMap::new(),
            semaphores: HashMap::new(),
            command_lists: HashMap::new(),
            pipelines: HashMap::new(),
            next_buffer_id: 1,
            next_image_id: 1,
            next_sampler_id: 1,
            next_binding_set_id: 1,
            next_fence_id: 1,
            next_semaphore_id: 1,
            next_command_list_id: 1,
            next_pipeline_id: 1,
        })
    }

    pub fn context(&self) -> &VulkanContext {
        &self.ctx
    }

    /// Make a pipeline created by the application usable in draws. The device
    /// does not take ownership of either object.
    pub fn register_pipeline(
        &mut self,
        pipeline: vk::Pipeline,
        layout: vk::PipelineLayout,
    ) -> PipelineHandle {
        let id = self.next_pipeline_id;
        self.next_pipeline_id += 1;
        self.pipelines.insert(id, VkPipeline { pipeline, layout });
        PipelineHandle(id)
    }

    /// Create a descriptor set layout matching `layout`, for building pipeline
    /// layouts. The caller owns the result.
    pub fn create_set_layout(&self, layout: &BindingLayout) -> BackendResult<vk::DescriptorSetLayout> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = layout
            .entries()
            .iter()
            .map(|entry| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(entry.binding)
                    .descriptor_type(convert_binding_kind(entry.kind))
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::ALL_GRAPHICS)
            })
            .collect();
        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);

        unsafe { self.ctx.device.create_descriptor_set_layout(&info, None) }
            .map_err(|e| map_vk_error(e, BackendError::BindingSetCreationFailed))
    }

    /// Layout the copies of `set` were allocated with.
    pub fn binding_set_layout(&self, set: BindingSetHandle) -> Option<vk::DescriptorSetLayout> {
        self.binding_sets.get(&set.0).map(|s| s.layout)
    }

    fn allocator(&self) -> BackendResult<&Arc<Mutex<Allocator>>> {
        self.allocator
            .as_ref()
            .ok_or_else(|| BackendError::InitializationFailed("Allocator not available".into()))
    }

    fn sharing_mode(&self) -> vk::SharingMode {
        if self.queue_families.len() > 1 {
            vk::SharingMode::CONCURRENT
        } else {
            vk::SharingMode::EXCLUSIVE
        }
    }

    fn buffer(&self, handle: BufferHandle) -> BackendResult<&VkBuffer> {
        self.buffers
            .get(&handle.0)
            .ok_or(BackendError::InvalidHandle("buffer", handle.0))
    }

    fn image(&self, handle: ImageHandle) -> BackendResult<&VkImage> {
        self.images
            .get(&handle.0)
            .ok_or(BackendError::InvalidHandle("image", handle.0))
    }

    fn fence(&self, handle: FenceHandle) -> BackendResult<vk::Fence> {
        self.fences
            .get(&handle.0)
            .copied()
            .ok_or(BackendError::InvalidHandle("fence", handle.0))
    }

    fn semaphore(&self, handle: SemaphoreHandle) -> BackendResult<vk::Semaphore> {
        self.semaphores
            .get(&handle.0)
            .copied()
            .ok_or(BackendError::InvalidHandle("semaphore", handle.0))
    }

    fn command_buffer(&self, handle: CommandListHandle) -> Option<vk::CommandBuffer> {
        let cmd = self.command_lists.get(&handle.0).copied();
        if cmd.is_none() {
            log::error!("Recording into unknown command list {}", handle.0);
        }
        cmd
    }

    fn one_shot(&self) -> BackendResult<OneShot<'_>> {
        OneShot::begin(&self.ctx.device, self.transfer_pool, self.ctx.transfer_queue)
    }

    fn free_allocation(&self, allocation: Option<Allocation>) {
        let (Some(allocation), Some(allocator)) = (allocation, self.allocator.as_ref()) else {
            return;
        };
        if let Err(e) = allocator.lock().free(allocation) {
            log::error!("Failed to free GPU memory: {}", e);
        }
    }
}

impl GpuDevice for VulkanDevice {
    fn name(&self) -> &'static str {
        "Vulkan"
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn swapchain_image_count(&self) -> u32 {
        self.ctx.framebuffers.len() as u32
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size.max(1))
            .usage(convert_buffer_usage(desc.usage))
            .sharing_mode(self.sharing_mode())
            .queue_family_indices(&self.queue_families);

        let buffer = unsafe { self.ctx.device.create_buffer(&buffer_info, None) }
            .map_err(|e| map_vk_error(e, BackendError::BufferCreationFailed))?;
        let requirements = unsafe { self.ctx.device.get_buffer_memory_requirements(buffer) };

        let location = if desc.is_host_visible() {
            MemoryLocation::CpuToGpu
        } else {
            MemoryLocation::GpuOnly
        };

        let allocation = self
            .allocator()?
            .lock()
            .allocate(&AllocationCreateDesc {
                name: desc.label.as_deref().unwrap_or("buffer"),
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| BackendError::BufferCreationFailed(e.to_string()));
        let mut allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.ctx.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        if let Err(e) = unsafe {
            self.ctx
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            unsafe { self.ctx.device.destroy_buffer(buffer, None) };
            self.free_allocation(Some(allocation));
            return Err(map_vk_error(e, BackendError::BufferCreationFailed));
        }

        if let Some(mapped) = allocation.mapped_slice_mut() {
            mapped.fill(0);
        }

        let id = self.next_buffer_id;
        self.next_buffer_id += 1;
        self.buffers.insert(
            id,
            VkBuffer {
                buffer,
                allocation: Some(allocation),
                size: desc.size,
            },
        );
        Ok(BufferHandle(id))
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(vk_buffer) = self.buffers.remove(&buffer.0) {
            unsafe { self.ctx.device.destroy_buffer(vk_buffer.buffer, None) };
            self.free_allocation(vk_buffer.allocation);
        }
    }

    fn buffer_memory(&self, buffer: BufferHandle) -> BackendResult<&[u8]> {
        let vk_buffer = self.buffer(buffer)?;
        let mapped = vk_buffer
            .allocation
            .as_ref()
            .and_then(|a| a.mapped_slice())
            .ok_or(BackendError::NotHostVisible)?;
        Ok(&mapped[..vk_buffer.size as usize])
    }

    fn buffer_memory_mut(&mut self, buffer: BufferHandle) -> BackendResult<&mut [u8]> {
        let vk_buffer = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or(BackendError::InvalidHandle("buffer", buffer.0))?;
        let size = vk_buffer.size as usize;
        let mapped = vk_buffer
            .allocation
            .as_mut()
            .and_then(|a| a.mapped_slice_mut())
            .ok_or(BackendError::NotHostVisible)?;
        Ok(&mut mapped[..size])
    }

    fn copy_buffer(
        &mut self,
        src: BufferHandle,
        dst: BufferHandle,
        regions: &[BufferCopy],
    ) -> BackendResult<()> {
        let src = self.buffer(src)?.buffer;
        let dst = self.buffer(dst)?.buffer;
        let regions: Vec<vk::BufferCopy> = regions
            .iter()
            .filter(|r| r.size > 0)
            .map(|r| vk::BufferCopy {
                src_offset: r.src_offset,
                dst_offset: r.dst_offset,
                size: r.size,
            })
            .collect();
        if regions.is_empty() {
            return Ok(());
        }

        let one_shot = self.one_shot()?;
        unsafe {
            self.ctx
                .device
                .cmd_copy_buffer(one_shot.cmd, src, dst, &regions)
        };
        one_shot.submit_and_wait()
    }

    fn create_image(&mut self, desc: &ImageDescriptor) -> BackendResult<ImageHandle> {
        if desc.width > self.limits.max_image_dimension || desc.height > self.limits.max_image_dimension
        {
            return Err(BackendError::TextureCreationFailed(format!(
                "{}x{} exceeds the device limit of {}",
                desc.width, desc.height, self.limits.max_image_dimension
            )));
        }
        let format = convert_texture_format(desc.format);

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.width.max(1),
                height: desc.height.max(1),
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(convert_image_usage(desc.usage))
            .sharing_mode(self.sharing_mode())
            .queue_family_indices(&self.queue_families)
            .samples(vk::SampleCountFlags::TYPE_1);

        let image = unsafe { self.ctx.device.create_image(&image_info, None) }
            .map_err(|e| map_vk_error(e, BackendError::TextureCreationFailed))?;
        let requirements = unsafe { self.ctx.device.get_image_memory_requirements(image) };

        let allocation = self
            .allocator()?
            .lock()
            .allocate(&AllocationCreateDesc {
                name: desc.label.as_deref().unwrap_or("texture"),
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| BackendError::TextureCreationFailed(e.to_string()));
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.ctx.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let bound = unsafe {
            self.ctx
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        let view = bound.and_then(|()| {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format)
                .subresource_range(color_range());
            unsafe { self.ctx.device.create_image_view(&view_info, None) }
        });
        let view = match view {
            Ok(view) => view,
            Err(e) => {
                unsafe { self.ctx.device.destroy_image(image, None) };
                self.free_allocation(Some(allocation));
                return Err(map_vk_error(e, BackendError::TextureCreationFailed));
            }
        };

        let id = self.next_image_id;
        self.next_image_id += 1;
        self.images.insert(
            id,
            VkImage {
                image,
                view,
                allocation: Some(allocation),
            },
        );

        let one_shot = self.one_shot()?;
        transfer::initialize_layout(&self.ctx.device, one_shot.cmd, image);
        one_shot.submit_and_wait()?;

        Ok(ImageHandle(id))
    }

    fn destroy_image(&mut self, image: ImageHandle) {
        if let Some(vk_image) = self.images.remove(&image.0) {
            unsafe {
                self.ctx.device.destroy_image_view(vk_image.view, None);
                self.ctx.device.destroy_image(vk_image.image, None);
            }
            self.free_allocation(vk_image.allocation);
        }
    }

    fn copy_image(
        &mut self,
        src: ImageHandle,
        dst: ImageHandle,
        extent: Extent2d,
    ) -> BackendResult<()> {
        let src = self.image(src)?.image;
        let dst = self.image(dst)?.image;
        if extent.width == 0 || extent.height == 0 {
            return Ok(());
        }

        let region = vk::ImageCopy {
            src_subresource: color_layers(),
            src_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
            dst_subresource: color_layers(),
            dst_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
        };

        let one_shot = self.one_shot()?;
        unsafe {
            self.ctx.device.cmd_copy_image(
                one_shot.cmd,
                src,
                RESTING_LAYOUT,
                dst,
                RESTING_LAYOUT,
                &[region],
            );
        }
        transfer::release_writes(&self.ctx.device, one_shot.cmd, dst);
        one_shot.submit_and_wait()
    }

    fn copy_buffer_to_image(
        &mut self,
        src: BufferHandle,
        dst: ImageHandle,
        regions: &[BufferImageCopy],
    ) -> BackendResult<()> {
        let src = self.buffer(src)?.buffer;
        let dst = self.image(dst)?.image;
        let regions: Vec<vk::BufferImageCopy> = regions
            .iter()
            .filter(|r| r.width > 0 && r.height > 0)
            .map(|r| vk::BufferImageCopy {
                buffer_offset: r.buffer_offset,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: color_layers(),
                image_offset: vk::Offset3D {
                    x: r.x as i32,
                    y: r.y as i32,
                    z: 0,
                },
                image_extent: vk::Extent3D {
                    width: r.width,
                    height: r.height,
                    depth: 1,
                },
            })
            .collect();
        if regions.is_empty() {
            return Ok(());
        }

        let one_shot = self.one_shot()?;
        unsafe {
            self.ctx.device.cmd_copy_buffer_to_image(
                one_shot.cmd,
                src,
                dst,
                RESTING_LAYOUT,
                &regions,
            );
        }
        transfer::release_writes(&self.ctx.device, one_shot.cmd, dst);
        one_shot.submit_and_wait()
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        let address_mode = convert_address_mode(desc.address_mode);
        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(convert_filter_mode(desc.mag_filter))
            .min_filter(convert_filter_mode(desc.min_filter))
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(address_mode)
            .address_mode_v(address_mode)
            .address_mode_w(address_mode)
            .max_lod(0.0);

        let sampler = unsafe { self.ctx.device.create_sampler(&sampler_info, None) }
            .map_err(|e| map_vk_error(e, BackendError::TextureCreationFailed))?;

        let id = self.next_sampler_id;
        self.next_sampler_id += 1;
        self.samplers.insert(id, sampler);
        Ok(SamplerHandle(id))
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        if let Some(sampler) = self.samplers.remove(&sampler.0) {
            unsafe { self.ctx.device.destroy_sampler(sampler, None) };
        }
    }

    fn create_binding_set(
        &mut self,
        layout: &BindingLayout,
        copies: u32,
    ) -> BackendResult<BindingSetHandle> {
        let set_layout = self.create_set_layout(layout)?;
        let layouts = vec![set_layout; copies as usize];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&layouts);

        let sets = match unsafe { self.ctx.device.allocate_descriptor_sets(&alloc_info) } {
            Ok(sets) => sets,
            Err(e) => {
                unsafe {
                    self.ctx
                        .device
                        .destroy_descriptor_set_layout(set_layout, None)
                };
                return Err(map_vk_error(e, BackendError::BindingSetCreationFailed));
            }
        };

        let id = self.next_binding_set_id;
        self.next_binding_set_id += 1;
        self.binding_sets.insert(
            id,
            VkBindingSet {
                layout: set_layout,
                sets,
                entries: layout.entries().to_vec(),
            },
        );
        Ok(BindingSetHandle(id))
    }

    fn write_binding(
        &mut self,
        set: BindingSetHandle,
        copy: u32,
        binding: u32,
        descriptor: &Descriptor,
    ) -> BackendResult<()> {
        let binding_set = self
            .binding_sets
            .get(&set.0)
            .ok_or(BackendError::InvalidHandle("binding set", set.0))?;
        let dst_set = *binding_set
            .sets
            .get(copy as usize)
            .ok_or(BackendError::InvalidHandle("binding set copy", copy as u64))?;
        let entry = binding_set
            .entries
            .iter()
            .find(|e| e.binding == binding)
            .ok_or(BackendError::InvalidHandle("binding", binding as u64))?;
        let descriptor_type = convert_binding_kind(entry.kind);

        match *descriptor {
            Descriptor::Buffer {
                buffer,
                offset,
                range,
            } => {
                let buffer_info = [vk::DescriptorBufferInfo {
                    buffer: self.buffer(buffer)?.buffer,
                    offset,
                    range,
                }];
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(dst_set)
                    .dst_binding(binding)
                    .descriptor_type(descriptor_type)
                    .buffer_info(&buffer_info);
                unsafe { self.ctx.device.update_descriptor_sets(&[write], &[]) };
            }
            Descriptor::ImageSampler { image, sampler } => {
                let sampler = self
                    .samplers
                    .get(&sampler.0)
                    .copied()
                    .ok_or(BackendError::InvalidHandle("sampler", sampler.0))?;
                let image_info = [vk::DescriptorImageInfo {
                    sampler,
                    image_view: self.image(image)?.view,
                    image_layout: RESTING_LAYOUT,
                }];
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(dst_set)
                    .dst_binding(binding)
                    .descriptor_type(descriptor_type)
                    .image_info(&image_info);
                unsafe { self.ctx.device.update_descriptor_sets(&[write], &[]) };
            }
        }
        Ok(())
    }

    fn destroy_binding_set(&mut self, set: BindingSetHandle) {
        if let Some(binding_set) = self.binding_sets.remove(&set.0) {
            unsafe {
                if let Err(e) = self
                    .ctx
                    .device
                    .free_descriptor_sets(self.descriptor_pool, &binding_set.sets)
                {
                    log::error!("Failed to free descriptor sets: {:?}", e);
                }
                self.ctx
                    .device
                    .destroy_descriptor_set_layout(binding_set.layout, None);
            }
        }
    }

    fn create_fence(&mut self, signaled: bool) -> BackendResult<FenceHandle> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence = unsafe {
            self.ctx
                .device
                .create_fence(&vk::FenceCreateInfo::default().flags(flags), None)
        }
        .map_err(|e| map_vk_error(e, BackendError::SyncCreationFailed))?;

        let id = self.next_fence_id;
        self.next_fence_id += 1;
        self.fences.insert(id, fence);
        Ok(FenceHandle(id))
    }

    fn wait_fence(&mut self, fence: FenceHandle) -> BackendResult<()> {
        let fence = self.fence(fence)?;
        unsafe { self.ctx.device.wait_for_fences(&[fence], true, u64::MAX) }
            .map_err(|e| map_vk_error(e, BackendError::SubmitFailed))
    }

    fn reset_fence(&mut self, fence: FenceHandle) -> BackendResult<()> {
        let fence = self.fence(fence)?;
        unsafe { self.ctx.device.reset_fences(&[fence]) }
            .map_err(|e| map_vk_error(e, BackendError::SubmitFailed))
    }

    fn destroy_fence(&mut self, fence: FenceHandle) {
        if let Some(fence) = self.fences.remove(&fence.0) {
            unsafe { self.ctx.device.destroy_fence(fence, None) };
        }
    }

    fn create_semaphore(&mut self) -> BackendResult<SemaphoreHandle> {
        let semaphore = unsafe {
            self.ctx
                .device
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
        }
        .map_err(|e| map_vk_error(e, BackendError::SyncCreationFailed))?;

        let id = self.next_semaphore_id;
        self.next_semaphore_id += 1;
        self.semaphores.insert(id, semaphore);
        Ok(SemaphoreHandle(id))
    }

    fn destroy_semaphore(&mut self, semaphore: SemaphoreHandle) {
        if let Some(semaphore) = self.semaphores.remove(&semaphore.0) {
            unsafe { self.ctx.device.destroy_semaphore(semaphore, None) };
        }
    }

    fn create_command_list(&mut self) -> BackendResult<CommandListHandle> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.graphics_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let cmd = unsafe { self.ctx.device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| map_vk_error(e, BackendError::RecordingFailed))?
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::RecordingFailed("no command buffer allocated".into()))?;

        let id = self.next_command_list_id;
        self.next_command_list_id += 1;
        self.command_lists.insert(id, cmd);
        Ok(CommandListHandle(id))
    }

    fn begin_commands(
        &mut self,
        list: CommandListHandle,
        image_index: u32,
        clear_color: [f32; 4],
    ) -> BackendResult<()> {
        let cmd = self
            .command_lists
            .get(&list.0)
            .copied()
            .ok_or(BackendError::InvalidHandle("command list", list.0))?;
        let framebuffer = *self
            .ctx
            .framebuffers
            .get(image_index as usize)
            .ok_or(BackendError::InvalidHandle("swapchain image", image_index as u64))?;

        let device = &self.ctx.device;
        unsafe {
            device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .map_err(|e| map_vk_error(e, BackendError::RecordingFailed))?;
            device
                .begin_command_buffer(cmd, &vk::CommandBufferBeginInfo::default())
                .map_err(|e| map_vk_error(e, BackendError::RecordingFailed))?;

            let clear_values = [vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: clear_color,
                },
            }];
            let render_area = vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: self.ctx.extent,
            };
            let render_pass_info = vk::RenderPassBeginInfo::default()
                .render_pass(self.ctx.render_pass)
                .framebuffer(framebuffer)
                .render_area(render_area)
                .clear_values(&clear_values);
            device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);

            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: self.ctx.extent.width as f32,
                height: self.ctx.extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[render_area]);
        }
        Ok(())
    }

    fn cmd_bind_pipeline(&mut self, list: CommandListHandle, pipeline: PipelineHandle) {
        let Some(cmd) = self.command_buffer(list) else {
            return;
        };
        match self.pipelines.get(&pipeline.0) {
            Some(p) => unsafe {
                self.ctx
                    .device
                    .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, p.pipeline)
            },
            None => log::error!("Binding unregistered pipeline {}", pipeline.0),
        }
    }

    fn cmd_bind_vertex_buffer(
        &mut self,
        list: CommandListHandle,
        slot: u32,
        buffer: BufferHandle,
        offset: u64,
    ) {
        let Some(cmd) = self.command_buffer(list) else {
            return;
        };
        match self.buffers.get(&buffer.0) {
            Some(b) => unsafe {
                self.ctx
                    .device
                    .cmd_bind_vertex_buffers(cmd, slot, &[b.buffer], &[offset])
            },
            None => log::error!("Binding unknown vertex buffer {}", buffer.0),
        }
    }

    fn cmd_bind_index_buffer(
        &mut self,
        list: CommandListHandle,
        buffer: BufferHandle,
        format: IndexFormat,
    ) {
        let Some(cmd) = self.command_buffer(list) else {
            return;
        };
        match self.buffers.get(&buffer.0) {
            Some(b) => unsafe {
                self.ctx.device.cmd_bind_index_buffer(
                    cmd,
                    b.buffer,
                    0,
                    convert_index_format(format),
                )
            },
            None => log::error!("Binding unknown index buffer {}", buffer.0),
        }
    }

    fn cmd_bind_binding_set(
        &mut self,
        list: CommandListHandle,
        pipeline: PipelineHandle,
        set_index: u32,
        set: BindingSetHandle,
        copy: u32,
        dynamic_offsets: &[u32],
    ) {
        let Some(cmd) = self.command_buffer(list) else {
            return;
        };
        let Some(layout) = self.pipelines.get(&pipeline.0).map(|p| p.layout) else {
            log::error!("Binding set for unregistered pipeline {}", pipeline.0);
            return;
        };
        let Some(descriptor_set) = self
            .binding_sets
            .get(&set.0)
            .and_then(|s| s.sets.get(copy as usize))
            .copied()
        else {
            log::error!("Binding unknown binding set {} copy {}", set.0, copy);
            return;
        };

        unsafe {
            self.ctx.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                set_index,
                &[descriptor_set],
                dynamic_offsets,
            );
        }
    }

    fn cmd_draw(&mut self, list: CommandListHandle, vertex_count: u32, instance_count: u32) {
        if let Some(cmd) = self.command_buffer(list) {
            unsafe {
                self.ctx
                    .device
                    .cmd_draw(cmd, vertex_count, instance_count, 0, 0)
            };
        }
    }

    fn cmd_draw_indexed(&mut self, list: CommandListHandle, index_count: u32, instance_count: u32) {
        if let Some(cmd) = self.command_buffer(list) {
            unsafe {
                self.ctx
                    .device
                    .cmd_draw_indexed(cmd, index_count, instance_count, 0, 0, 0)
            };
        }
    }

    fn end_commands(&mut self, list: CommandListHandle) -> BackendResult<()> {
        let cmd = self
            .command_lists
            .get(&list.0)
            .copied()
            .ok_or(BackendError::InvalidHandle("command list", list.0))?;
        unsafe {
            self.ctx.device.cmd_end_render_pass(cmd);
            self.ctx
                .device
                .end_command_buffer(cmd)
                .map_err(|e| map_vk_error(e, BackendError::RecordingFailed))
        }
    }

    fn submit(
        &mut self,
        list: CommandListHandle,
        wait: SemaphoreHandle,
        signal: SemaphoreHandle,
        fence: FenceHandle,
    ) -> BackendResult<()> {
        let command_buffers = [self
            .command_lists
            .get(&list.0)
            .copied()
            .ok_or(BackendError::InvalidHandle("command list", list.0))?];
        let wait_semaphores = [self.semaphore(wait)?];
        let signal_semaphores = [self.semaphore(signal)?];
        let fence = self.fence(fence)?;
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.ctx
                .device
                .queue_submit(self.ctx.graphics_queue, &[submit_info], fence)
        }
        .map_err(|e| map_vk_error(e, BackendError::SubmitFailed))
    }

    fn acquire_next_image(&mut self, signal: SemaphoreHandle) -> BackendResult<u32> {
        let semaphore = self.semaphore(signal)?;
        let (image_index, suboptimal) = unsafe {
            self.ctx.swapchain_loader.acquire_next_image(
                self.ctx.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        }
        .map_err(|e| map_vk_error(e, BackendError::AcquireImageFailed))?;

        if suboptimal {
            log::warn!("Swapchain is suboptimal");
        }
        Ok(image_index)
    }

    fn present(&mut self, image_index: u32, wait: SemaphoreHandle) -> BackendResult<()> {
        let wait_semaphores = [self.semaphore(wait)?];
        let swapchains = [self.ctx.swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let suboptimal = unsafe {
            self.ctx
                .swapchain_loader
                .queue_present(self.ctx.graphics_queue, &present_info)
        }
        .map_err(|e| map_vk_error(e, BackendError::PresentFailed))?;

        if suboptimal {
            log::warn!("Swapchain is suboptimal");
        }
        Ok(())
    }

    fn wait_idle(&mut self) -> BackendResult<()> {
        unsafe { self.ctx.device.device_wait_idle() }
            .map_err(|e| map_vk_error(e, BackendError::SubmitFailed))
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.ctx.device.device_wait_idle();

            let buffers: Vec<VkBuffer> = self.buffers.drain().map(|(_, b)| b).collect();
            for buffer in buffers {
                self.ctx.device.destroy_buffer(buffer.buffer, None);
                self.free_allocation(buffer.allocation);
            }
            let images: Vec<VkImage> = self.images.drain().map(|(_, i)| i).collect();
            for image in images {
                self.ctx.device.destroy_image_view(image.view, None);
                self.ctx.device.destroy_image(image.image, None);
                self.free_allocation(image.allocation);
            }
            for (_, sampler) in self.samplers.drain() {
                self.ctx.device.destroy_sampler(sampler, None);
            }
            for (_, set) in self.binding_sets.drain() {
                self.ctx.device.destroy_descriptor_set_layout(set.layout, None);
            }
            for (_, fence) in self.fences.drain() {
                self.ctx.device.destroy_fence(fence, None);
            }
            for (_, semaphore) in self.semaphores.drain() {
                self.ctx.device.destroy_semaphore(semaphore, None);
            }

            // Destroying a pool frees its command buffers and descriptor sets
            self.command_lists.clear();
            self.ctx
                .device
                .destroy_descriptor_pool(self.descriptor_pool, None);
            self.ctx.device.destroy_command_pool(self.graphics_pool, None);
            self.ctx.device.destroy_command_pool(self.transfer_pool, None);

            // Drop allocator before the application destroys the device
            self.allocator = None;
        }
    }
}

fn create_command_pool(
    device: &ash::Device,
    queue_family_index: u32,
    flags: vk::CommandPoolCreateFlags,
) -> BackendResult<vk::CommandPool> {
    let pool_info = vk::CommandPoolCreateInfo::default()
        .queue_family_index(queue_family_index)
        .flags(flags);

    unsafe { device.create_command_pool(&pool_info, None) }.map_err(|e| {
        BackendError::InitializationFailed(format!("Failed to create command pool: {:?}", e))
    })
}

fn create_descriptor_pool(device: &ash::Device) -> BackendResult<vk::DescriptorPool> {
    let pool_sizes = [
        vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
        vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
        vk::DescriptorType::UNIFORM_BUFFER,
        vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
    ]
    .map(|ty| vk::DescriptorPoolSize {
        ty,
        descriptor_count: DESCRIPTOR_POOL_SIZE,
    });

    let pool_info = vk::DescriptorPoolCreateInfo::default()
        .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
        .max_sets(DESCRIPTOR_POOL_SIZE)
        .pool_sizes(&pool_sizes);

    unsafe { device.create_descriptor_pool(&pool_info, None) }.map_err(|e| {
        BackendError::InitializationFailed(format!("Failed to create descriptor pool: {:?}", e))
    })
}
