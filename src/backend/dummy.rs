//! Dummy GPU backend for testing and development.
//!
//! This backend doesn't talk to a GPU. Buffers and images live in host memory,
//! transfers are plain memory copies, and submission signals the fence
//! immediately. Every device-visible operation is appended to an event log so
//! tests can check ordering (for example that every binding copy was refreshed
//! before an old buffer was destroyed).

use std::collections::{BTreeMap, HashMap};

use crate::backend::traits::*;
use crate::backend::types::*;

/// Something the dummy device observed, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    BufferCreated { buffer: BufferHandle, size: u64 },
    BufferDestroyed(BufferHandle),
    BufferCopied { src: BufferHandle, dst: BufferHandle, bytes: u64 },
    ImageCreated { image: ImageHandle, width: u32, height: u32 },
    ImageDestroyed(ImageHandle),
    ImageCopied { src: ImageHandle, dst: ImageHandle, extent: Extent2d },
    ImageUploaded { image: ImageHandle, regions: usize },
    BindingWritten {
        set: BindingSetHandle,
        copy: u32,
        binding: u32,
        descriptor: Descriptor,
    },
    FenceWaited { fence: FenceHandle, signaled: bool },
    FenceReset(FenceHandle),
    Recorded { list: CommandListHandle, image_index: u32 },
    Submitted { list: CommandListHandle, fence: FenceHandle },
    Acquired { image_index: u32 },
    Presented { image_index: u32 },
}

/// A command captured while a list was recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCommand {
    BindPipeline(PipelineHandle),
    BindVertexBuffer {
        slot: u32,
        buffer: BufferHandle,
        offset: u64,
    },
    BindIndexBuffer {
        buffer: BufferHandle,
        format: IndexFormat,
    },
    BindBindingSet {
        set_index: u32,
        set: BindingSetHandle,
        copy: u32,
        dynamic_offsets: Vec<u32>,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
    },
}

struct DummyBuffer {
    desc: BufferDescriptor,
    data: Vec<u8>,
}

struct DummyImage {
    desc: ImageDescriptor,
    pixels: Vec<u8>,
}

struct DummyBindingSet {
    layout: BindingLayout,
    copies: Vec<BTreeMap<u32, Descriptor>>,
}

#[derive(Default)]
struct DummyCommandList {
    image_index: u32,
    clear_color: [f32; 4],
    recording: bool,
    commands: Vec<RecordedCommand>,
}

/// In-memory device.
pub struct DummyDevice {
    limits: DeviceLimits,
    swapchain_images: u32,
    next_image: u32,
    memory_budget: Option<u64>,
    memory_used: u64,
    lost: bool,

    buffers: HashMap<u64, DummyBuffer>,
    images: HashMap<u64, DummyImage>,
    samplers: HashMap<u64, SamplerDescriptor>,
    binding_sets: HashMap<u64, DummyBindingSet>,
    fences: HashMap<u64, bool>,
    semaphores: HashMap<u64, ()>,
    command_lists: HashMap<u64, DummyCommandList>,
    pipelines: HashMap<u64, String>,

    events: Vec<DeviceEvent>,
    next_handle_id: u64,
}

impl Default for DummyDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyDevice {
    /// Create a new dummy device with three swapchain images.
    pub fn new() -> Self {
        Self {
            limits: DeviceLimits::default(),
            swapchain_images: 3,
            next_image: 0,
            memory_budget: None,
            memory_used: 0,
            lost: false,
            buffers: HashMap::new(),
            images: HashMap::new(),
            samplers: HashMap::new(),
            binding_sets: HashMap::new(),
            fences: HashMap::new(),
            semaphores: HashMap::new(),
            command_lists: HashMap::new(),
            pipelines: HashMap::new(),
            events: Vec::new(),
            next_handle_id: 1,
        }
    }

    pub fn with_limits(mut self, limits: DeviceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_swapchain_images(mut self, count: u32) -> Self {
        self.swapchain_images = count.max(1);
        self
    }

    /// Fail buffer and image creation with `OutOfMemory` once `bytes` are in use.
    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = Some(bytes);
        self
    }

    /// Make every later fallible call fail with `DeviceLost`.
    pub fn lose_device(&mut self) {
        log::warn!("DummyDevice: simulating device loss");
        self.lost = true;
    }

    /// Register a pipeline; the dummy only remembers its label.
    pub fn register_pipeline(&mut self, label: impl Into<String>) -> PipelineHandle {
        let id = self.alloc_id();
        self.pipelines.insert(id, label.into());
        PipelineHandle(id)
    }

    pub fn events(&self) -> &[DeviceEvent] {
        &self.events
    }

    pub fn take_events(&mut self) -> Vec<DeviceEvent> {
        std::mem::take(&mut self.events)
    }

    /// Commands captured by the last recording of `list`.
    pub fn commands(&self, list: CommandListHandle) -> &[RecordedCommand] {
        self.command_lists
            .get(&list.0)
            .map(|l| l.commands.as_slice())
            .unwrap_or(&[])
    }

    /// Clear color the list was last begun with.
    pub fn clear_color(&self, list: CommandListHandle) -> Option<[f32; 4]> {
        self.command_lists.get(&list.0).map(|l| l.clear_color)
    }

    /// Descriptor currently written at `binding` of copy `copy`.
    pub fn binding(&self, set: BindingSetHandle, copy: u32, binding: u32) -> Option<Descriptor> {
        self.binding_sets
            .get(&set.0)
            .and_then(|s| s.copies.get(copy as usize))
            .and_then(|c| c.get(&binding))
            .copied()
    }

    /// Layout a binding set was created with.
    pub fn binding_layout(&self, set: BindingSetHandle) -> Option<&BindingLayout> {
        self.binding_sets.get(&set.0).map(|s| &s.layout)
    }

    pub fn image_pixels(&self, image: ImageHandle) -> Option<&[u8]> {
        self.images.get(&image.0).map(|i| i.pixels.as_slice())
    }

    pub fn image_descriptor(&self, image: ImageHandle) -> Option<&ImageDescriptor> {
        self.images.get(&image.0).map(|i| &i.desc)
    }

    pub fn is_buffer_alive(&self, buffer: BufferHandle) -> bool {
        self.buffers.contains_key(&buffer.0)
    }

    pub fn is_image_alive(&self, image: ImageHandle) -> bool {
        self.images.contains_key(&image.0)
    }

    pub fn live_buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_image_count(&self) -> usize {
        self.images.len()
    }

    pub fn is_fence_signaled(&self, fence: FenceHandle) -> bool {
        self.fences.get(&fence.0).copied().unwrap_or(false)
    }

    /// Number of transfers that reached an image (uploads and image copies).
    pub fn image_transfer_count(&self) -> usize {
        self.events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    DeviceEvent::ImageUploaded { .. } | DeviceEvent::ImageCopied { .. }
                )
            })
            .count()
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_handle_id;
        self.next_handle_id += 1;
        id
    }

    fn check_alive(&self) -> BackendResult<()> {
        if self.lost {
            Err(BackendError::DeviceLost)
        } else {
            Ok(())
        }
    }

    fn reserve_memory(&mut self, bytes: u64) -> BackendResult<()> {
        if let Some(budget) = self.memory_budget {
            if self.memory_used + bytes > budget {
                return Err(BackendError::OutOfMemory);
            }
        }
        self.memory_used += bytes;
        Ok(())
    }

    fn recording_list(&mut self, list: CommandListHandle) -> Option<&mut DummyCommandList> {
        match self.command_lists.get_mut(&list.0) {
            Some(l) if l.recording => Some(l),
            _ => {
                log::error!("DummyDevice: command list {} is not recording", list.0);
                None
            }
        }
    }

    fn record(&mut self, list: CommandListHandle, command: RecordedCommand) {
        if let Some(l) = self.recording_list(list) {
            l.commands.push(command);
        }
    }
}

impl GpuDevice for DummyDevice {
    fn name(&self) -> &'static str {
        "Dummy Backend"
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn swapchain_image_count(&self) -> u32 {
        self.swapchain_images
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        self.check_alive()?;
        log::trace!(
            "DummyDevice: creating buffer {:?} (size: {})",
            desc.label,
            desc.size
        );
        self.reserve_memory(desc.size)?;
        let id = self.alloc_id();
        self.buffers.insert(
            id,
            DummyBuffer {
                desc: desc.clone(),
                data: vec![0; desc.size as usize],
            },
        );
        let buffer = BufferHandle(id);
        self.events.push(DeviceEvent::BufferCreated {
            buffer,
            size: desc.size,
        });
        Ok(buffer)
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(b) = self.buffers.remove(&buffer.0) {
            self.memory_used -= b.desc.size;
            self.events.push(DeviceEvent::BufferDestroyed(buffer));
        }
    }

    fn buffer_memory(&self, buffer: BufferHandle) -> BackendResult<&[u8]> {
        let b = self
            .buffers
            .get(&buffer.0)
            .ok_or(BackendError::InvalidHandle("buffer", buffer.0))?;
        if !b.desc.is_host_visible() {
            return Err(BackendError::NotHostVisible);
        }
        Ok(&b.data)
    }

    fn buffer_memory_mut(&mut self, buffer: BufferHandle) -> BackendResult<&mut [u8]> {
        let b = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or(BackendError::InvalidHandle("buffer", buffer.0))?;
        if !b.desc.is_host_visible() {
            return Err(BackendError::NotHostVisible);
        }
        Ok(&mut b.data)
    }

    fn copy_buffer(
        &mut self,
        src: BufferHandle,
        dst: BufferHandle,
        regions: &[BufferCopy],
    ) -> BackendResult<()> {
        self.check_alive()?;
        let src_data = self
            .buffers
            .get(&src.0)
            .ok_or(BackendError::InvalidHandle("buffer", src.0))?
            .data
            .clone();
        let dst_buffer = self
            .buffers
            .get_mut(&dst.0)
            .ok_or(BackendError::InvalidHandle("buffer", dst.0))?;

        let mut bytes = 0;
        for region in regions {
            let s = region.src_offset as usize..(region.src_offset + region.size) as usize;
            let d = region.dst_offset as usize..(region.dst_offset + region.size) as usize;
            if s.end > src_data.len() || d.end > dst_buffer.data.len() {
                return Err(BackendError::SubmitFailed(format!(
                    "copy region {region:?} out of bounds"
                )));
            }
            dst_buffer.data[d].copy_from_slice(&src_data[s]);
            bytes += region.size;
        }
        self.events
            .push(DeviceEvent::BufferCopied { src, dst, bytes });
        Ok(())
    }

    fn create_image(&mut self, desc: &ImageDescriptor) -> BackendResult<ImageHandle> {
        self.check_alive()?;
        log::trace!(
            "DummyDevice: creating image {:?} ({}x{})",
            desc.label,
            desc.width,
            desc.height
        );
        if desc.width > self.limits.max_image_dimension
            || desc.height > self.limits.max_image_dimension
        {
            return Err(BackendError::TextureCreationFailed(format!(
                "{}x{} exceeds max dimension {}",
                desc.width, desc.height, self.limits.max_image_dimension
            )));
        }
        self.reserve_memory(desc.byte_size())?;
        let id = self.alloc_id();
        self.images.insert(
            id,
            DummyImage {
                desc: desc.clone(),
                pixels: vec![0; desc.byte_size() as usize],
            },
        );
        let image = ImageHandle(id);
        self.events.push(DeviceEvent::ImageCreated {
            image,
            width: desc.width,
            height: desc.height,
        });
        Ok(image)
    }

    fn destroy_image(&mut self, image: ImageHandle) {
        if let Some(i) = self.images.remove(&image.0) {
            self.memory_used -= i.desc.byte_size();
            self.events.push(DeviceEvent::ImageDestroyed(image));
        }
    }

    fn copy_image(
        &mut self,
        src: ImageHandle,
        dst: ImageHandle,
        extent: Extent2d,
    ) -> BackendResult<()> {
        self.check_alive()?;
        let (src_pixels, src_width, bpp) = {
            let s = self
                .images
                .get(&src.0)
                .ok_or(BackendError::InvalidHandle("image", src.0))?;
            (
                s.pixels.clone(),
                s.desc.width as usize,
                s.desc.format.bytes_per_pixel() as usize,
            )
        };
        let d = self
            .images
            .get_mut(&dst.0)
            .ok_or(BackendError::InvalidHandle("image", dst.0))?;
        let dst_width = d.desc.width as usize;
        let row_bytes = extent.width as usize * bpp;
        for y in 0..extent.height as usize {
            let s = y * src_width * bpp;
            let t = y * dst_width * bpp;
            d.pixels[t..t + row_bytes].copy_from_slice(&src_pixels[s..s + row_bytes]);
        }
        self.events
            .push(DeviceEvent::ImageCopied { src, dst, extent });
        Ok(())
    }

    fn copy_buffer_to_image(
        &mut self,
        src: BufferHandle,
        dst: ImageHandle,
        regions: &[BufferImageCopy],
    ) -> BackendResult<()> {
        self.check_alive()?;
        let staging = self
            .buffers
            .get(&src.0)
            .ok_or(BackendError::InvalidHandle("buffer", src.0))?;
        let image = self
            .images
            .get_mut(&dst.0)
            .ok_or(BackendError::InvalidHandle("image", dst.0))?;
        let bpp = image.desc.format.bytes_per_pixel() as usize;
        let image_width = image.desc.width as usize;

        for region in regions {
            let row_bytes = region.width as usize * bpp;
            for row in 0..region.height as usize {
                let s = region.buffer_offset as usize + row * row_bytes;
                let t = ((region.y as usize + row) * image_width + region.x as usize) * bpp;
                image.pixels[t..t + row_bytes].copy_from_slice(&staging.data[s..s + row_bytes]);
            }
        }
        self.events.push(DeviceEvent::ImageUploaded {
            image: dst,
            regions: regions.len(),
        });
        Ok(())
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        self.check_alive()?;
        log::trace!("DummyDevice: creating sampler {:?}", desc.label);
        let id = self.alloc_id();
        self.samplers.insert(id, desc.clone());
        Ok(SamplerHandle(id))
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        self.samplers.remove(&sampler.0);
    }

    fn create_binding_set(
        &mut self,
        layout: &BindingLayout,
        copies: u32,
    ) -> BackendResult<BindingSetHandle> {
        self.check_alive()?;
        log::trace!(
            "DummyDevice: creating binding set {:?} ({} copies)",
            layout.label,
            copies
        );
        let id = self.alloc_id();
        self.binding_sets.insert(
            id,
            DummyBindingSet {
                layout: layout.clone(),
                copies: vec![BTreeMap::new(); copies as usize],
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
        self.check_alive()?;
        let s = self
            .binding_sets
            .get_mut(&set.0)
            .ok_or(BackendError::InvalidHandle("binding set", set.0))?;
        let slot = s
            .copies
            .get_mut(copy as usize)
            .ok_or(BackendError::InvalidHandle("binding set copy", copy as u64))?;
        slot.insert(binding, *descriptor);
        self.events.push(DeviceEvent::BindingWritten {
            set,
            copy,
            binding,
            descriptor: *descriptor,
        });
        Ok(())
    }

    fn destroy_binding_set(&mut self, set: BindingSetHandle) {
        self.binding_sets.remove(&set.0);
    }

    fn create_fence(&mut self, signaled: bool) -> BackendResult<FenceHandle> {
        self.check_alive()?;
        let id = self.alloc_id();
        self.fences.insert(id, signaled);
        Ok(FenceHandle(id))
    }

    fn wait_fence(&mut self, fence: FenceHandle) -> BackendResult<()> {
        self.check_alive()?;
        let signaled = *self
            .fences
            .get(&fence.0)
            .ok_or(BackendError::InvalidHandle("fence", fence.0))?;
        self.events
            .push(DeviceEvent::FenceWaited { fence, signaled });
        if signaled {
            Ok(())
        } else {
            // Nothing is pending in the dummy, so this wait could never return.
            log::error!("DummyDevice: waiting on fence {} that can never signal", fence.0);
            Err(BackendError::DeviceLost)
        }
    }

    fn reset_fence(&mut self, fence: FenceHandle) -> BackendResult<()> {
        self.check_alive()?;
        let state = self
            .fences
            .get_mut(&fence.0)
            .ok_or(BackendError::InvalidHandle("fence", fence.0))?;
        *state = false;
        self.events.push(DeviceEvent::FenceReset(fence));
        Ok(())
    }

    fn destroy_fence(&mut self, fence: FenceHandle) {
        self.fences.remove(&fence.0);
    }

    fn create_semaphore(&mut self) -> BackendResult<SemaphoreHandle> {
        self.check_alive()?;
        let id = self.alloc_id();
        self.semaphores.insert(id, ());
        Ok(SemaphoreHandle(id))
    }

    fn destroy_semaphore(&mut self, semaphore: SemaphoreHandle) {
        self.semaphores.remove(&semaphore.0);
    }

    fn create_command_list(&mut self) -> BackendResult<CommandListHandle> {
        self.check_alive()?;
        let id = self.alloc_id();
        self.command_lists.insert(id, DummyCommandList::default());
        Ok(CommandListHandle(id))
    }

    fn begin_commands(
        &mut self,
        list: CommandListHandle,
        image_index: u32,
        clear_color: [f32; 4],
    ) -> BackendResult<()> {
        self.check_alive()?;
        let l = self
            .command_lists
            .get_mut(&list.0)
            .ok_or(BackendError::InvalidHandle("command list", list.0))?;
        if l.recording {
            return Err(BackendError::RecordingFailed(format!(
                "command list {} is already recording",
                list.0
            )));
        }
        l.recording = true;
        l.image_index = image_index;
        l.clear_color = clear_color;
        l.commands.clear();
        Ok(())
    }

    fn cmd_bind_pipeline(&mut self, list: CommandListHandle, pipeline: PipelineHandle) {
        self.record(list, RecordedCommand::BindPipeline(pipeline));
    }

    fn cmd_bind_vertex_buffer(
        &mut self,
        list: CommandListHandle,
        slot: u32,
        buffer: BufferHandle,
        offset: u64,
    ) {
        self.record(
            list,
            RecordedCommand::BindVertexBuffer {
                slot,
                buffer,
                offset,
            },
        );
    }

    fn cmd_bind_index_buffer(
        &mut self,
        list: CommandListHandle,
        buffer: BufferHandle,
        format: IndexFormat,
    ) {
        self.record(list, RecordedCommand::BindIndexBuffer { buffer, format });
    }

    fn cmd_bind_binding_set(
        &mut self,
        list: CommandListHandle,
        _pipeline: PipelineHandle,
        set_index: u32,
        set: BindingSetHandle,
        copy: u32,
        dynamic_offsets: &[u32],
    ) {
        self.record(
            list,
            RecordedCommand::BindBindingSet {
                set_index,
                set,
                copy,
                dynamic_offsets: dynamic_offsets.to_vec(),
            },
        );
    }

    fn cmd_draw(&mut self, list: CommandListHandle, vertex_count: u32, instance_count: u32) {
        self.record(
            list,
            RecordedCommand::Draw {
                vertex_count,
                instance_count,
            },
        );
    }

    fn cmd_draw_indexed(
        &mut self,
        list: CommandListHandle,
        index_count: u32,
        instance_count: u32,
    ) {
        self.record(
            list,
            RecordedCommand::DrawIndexed {
                index_count,
                instance_count,
            },
        );
    }

    fn end_commands(&mut self, list: CommandListHandle) -> BackendResult<()> {
        self.check_alive()?;
        let l = self
            .command_lists
            .get_mut(&list.0)
            .ok_or(BackendError::InvalidHandle("command list", list.0))?;
        if !l.recording {
            return Err(BackendError::RecordingFailed(format!(
                "command list {} is not recording",
                list.0
            )));
        }
        l.recording = false;
        let image_index = l.image_index;
        self.events
            .push(DeviceEvent::Recorded { list, image_index });
        Ok(())
    }

    fn submit(
        &mut self,
        list: CommandListHandle,
        _wait: SemaphoreHandle,
        _signal: SemaphoreHandle,
        fence: FenceHandle,
    ) -> BackendResult<()> {
        self.check_alive()?;
        if !self.command_lists.contains_key(&list.0) {
            return Err(BackendError::InvalidHandle("command list", list.0));
        }
        // Signal the fence immediately since we don't do real GPU work
        let state = self
            .fences
            .get_mut(&fence.0)
            .ok_or(BackendError::InvalidHandle("fence", fence.0))?;
        *state = true;
        self.events.push(DeviceEvent::Submitted { list, fence });
        Ok(())
    }

    fn acquire_next_image(&mut self, _signal: SemaphoreHandle) -> BackendResult<u32> {
        self.check_alive()?;
        let image_index = self.next_image;
        self.next_image = (self.next_image + 1) % self.swapchain_images;
        self.events.push(DeviceEvent::Acquired { image_index });
        Ok(image_index)
    }

    fn present(&mut self, image_index: u32, _wait: SemaphoreHandle) -> BackendResult<()> {
        self.check_alive()?;
        self.events.push(DeviceEvent::Presented { image_index });
        Ok(())
    }

    fn wait_idle(&mut self) -> BackendResult<()> {
        self.check_alive()
    }
}
