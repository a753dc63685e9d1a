//! Owner of every long-lived GPU resource.
//!
//! The context is the arena that arrays, textures, atlases and binding tables
//! live in. Callers hold typed ids; the back-reference relation between
//! relocatable resources and binding tables is kept next to them, so a
//! deferred refresh reaches every table without either side owning the other.
//!
//! Retired stores are handed to the [`DeferredReclamationQueue`], whose
//! callbacks receive the context itself:
//!
//! ```text
//!   allocate() ── growth ──► reclaim.add(
//!                               |ctx, f| ctx.refresh(array, f),
//!                               |ctx| ctx.device.destroy_buffer(old))
//!
//!   drain_reclamation(f) ──► take_due(f) ──► run(&mut ctx) ──► restore
//! ```

use std::collections::HashMap;
use std::fmt;

use bytemuck::Pod;

use crate::atlas::{AtlasDescriptor, AtlasSpace, TextureAtlas};
use crate::backend::{
    BindingKind, BindingLayout, BufferHandle, CommandListHandle, Descriptor, Extent2d, GpuDevice,
    ImageDescriptor, ImageHandle, SamplerDescriptor, SamplerHandle, TextureFormat,
};
use crate::binding::{BindingRef, BindingRegistry, BindingTable, BoundResource};
use crate::config::RendererConfig;
use crate::drawable::Drawable;
use crate::error::{GraphicsError, GraphicsResult};
use crate::ids::{AtlasId, BindingTableId, ResourceArrayId, ResourceKey, TextureId};
use crate::reclaim::{complete_all, DeferredReclamationQueue, Generation};
use crate::resources::{
    ArrayKind, IndexBuffer, IndexData, ResourceArray, ResourceArrayDescriptor, StagingStack,
    Texture, VertexBuffer,
};

/// Resource accepted by [`RenderContext::bind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindResource {
    Array(ResourceArrayId),
    Texture(TextureId),
    Atlas(AtlasId),
    /// A fixed buffer range owned by the caller. Not tracked for relocation.
    Buffer {
        buffer: BufferHandle,
        offset: u64,
        range: u64,
    },
}

enum BindSource {
    Array(ResourceArrayId),
    Texture(TextureId),
    Buffer(Descriptor),
}

pub struct RenderContext<D: GpuDevice + 'static> {
    device: D,
    config: RendererConfig,

    arrays: HashMap<ResourceArrayId, ResourceArray>,
    textures: HashMap<TextureId, Texture>,
    atlases: HashMap<AtlasId, TextureAtlas>,
    tables: HashMap<BindingTableId, BindingTable>,
    registry: BindingRegistry,
    staging: StagingStack,

    reclaim: DeferredReclamationQueue<RenderContext<D>>,
    /// First error raised inside a deferred callback, reported by the next drain.
    deferred_error: Option<GraphicsError>,

    next_array_id: u64,
    next_texture_id: u64,
    next_atlas_id: u64,
    next_table_id: u64,
}

impl<D: GpuDevice + 'static> RenderContext<D> {
    pub fn new(mut device: D, config: &RendererConfig) -> GraphicsResult<Self> {
        config.validate()?;
        let staging = StagingStack::new(&mut device, config.staging_size)?;
        log::info!(
            "Render context on {} with {} frames in flight",
            device.name(),
            config.frames_in_flight
        );
        Ok(Self {
            device,
            config: config.clone(),
            arrays: HashMap::new(),
            textures: HashMap::new(),
            atlases: HashMap::new(),
            tables: HashMap::new(),
            registry: BindingRegistry::new(),
            staging,
            reclaim: DeferredReclamationQueue::new(config.frames_in_flight),
            deferred_error: None,
            next_array_id: 1,
            next_texture_id: 1,
            next_atlas_id: 1,
            next_table_id: 1,
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn frames_in_flight(&self) -> u32 {
        self.config.frames_in_flight
    }

    // Resource arrays

    /// Create an array. A zero `initial_capacity` takes the configured default.
    pub fn create_array(&mut self, desc: &ResourceArrayDescriptor) -> GraphicsResult<ResourceArrayId> {
        let mut desc = desc.clone();
        if desc.initial_capacity == 0 {
            desc.initial_capacity = self.config.initial_array_capacity;
        }
        let array = ResourceArray::new(&mut self.device, &desc, self.config.frames_in_flight)?;
        let id = ResourceArrayId(self.next_array_id);
        self.next_array_id += 1;
        self.arrays.insert(id, array);
        Ok(id)
    }

    pub fn array(&self, id: ResourceArrayId) -> GraphicsResult<&ResourceArray> {
        self.arrays.get(&id).ok_or_else(|| id.unknown())
    }

    /// Take a slot. When the array grows, the old store is retired through the
    /// reclamation queue and every binding of the array is refreshed per frame.
    pub fn allocate(&mut self, id: ResourceArrayId) -> GraphicsResult<u32> {
        let array = self.arrays.get_mut(&id).ok_or_else(|| id.unknown())?;
        let allocation = array.allocate(&mut self.device)?;
        if let Some(old) = allocation.retired {
            self.retire_buffer(id.into(), old);
        }
        Ok(allocation.slot)
    }

    pub fn free(&mut self, id: ResourceArrayId, slot: u32) -> GraphicsResult<()> {
        self.arrays
            .get_mut(&id)
            .ok_or_else(|| id.unknown())?
            .free(slot)
    }

    pub fn data(&self, id: ResourceArrayId, frame: u32, slot: u32) -> GraphicsResult<&[u8]> {
        let array = self.arrays.get(&id).ok_or_else(|| id.unknown())?;
        array.data(&self.device, frame, slot)
    }

    pub fn data_mut(
        &mut self,
        id: ResourceArrayId,
        frame: u32,
        slot: u32,
    ) -> GraphicsResult<&mut [u8]> {
        let array = self.arrays.get(&id).ok_or_else(|| id.unknown())?;
        array.data_mut(&mut self.device, frame, slot)
    }

    pub fn write(
        &mut self,
        id: ResourceArrayId,
        frame: u32,
        slot: u32,
        bytes: &[u8],
    ) -> GraphicsResult<()> {
        let array = self.arrays.get(&id).ok_or_else(|| id.unknown())?;
        array.write(&mut self.device, frame, slot, bytes)
    }

    pub fn write_pod<T: Pod>(
        &mut self,
        id: ResourceArrayId,
        frame: u32,
        slot: u32,
        value: &T,
    ) -> GraphicsResult<()> {
        self.write(id, frame, slot, bytemuck::bytes_of(value))
    }

    /// Remove the array. Its store is destroyed once no frame can read it.
    pub fn destroy_array(&mut self, id: ResourceArrayId) -> GraphicsResult<()> {
        let array = self.arrays.remove(&id).ok_or_else(|| id.unknown())?;
        self.unbind_everywhere(id.into());
        let store = array.store();
        self.reclaim.add_task(
            None,
            Some(Box::new(move |ctx: &mut Self| ctx.device.destroy_buffer(store))),
        );
        Ok(())
    }

    // Textures

    /// Create a sampled texture, optionally filled with tightly packed `pixels`.
    pub fn create_texture(
        &mut self,
        desc: &ImageDescriptor,
        sampler: &SamplerDescriptor,
        pixels: Option<&[u8]>,
    ) -> GraphicsResult<TextureId> {
        let texture = Texture::new(&mut self.device, desc, sampler)?;
        if let Some(pixels) = pixels {
            if let Err(e) = texture.upload(&mut self.device, &mut self.staging, pixels) {
                texture.destroy(&mut self.device);
                return Err(e);
            }
        }
        Ok(self.insert_texture(texture))
    }

    pub fn texture(&self, id: TextureId) -> GraphicsResult<&Texture> {
        self.textures.get(&id).ok_or_else(|| id.unknown())
    }

    /// Move the texture to a `width x height` image, keeping the overlap.
    pub fn resize_texture(&mut self, id: TextureId, width: u32, height: u32) -> GraphicsResult<()> {
        if self.atlases.values().any(|a| a.texture() == id) {
            return Err(GraphicsError::misuse(format!(
                "texture {} belongs to an atlas and grows with it",
                id.raw()
            )));
        }
        let texture = self.textures.get_mut(&id).ok_or_else(|| id.unknown())?;
        let old = texture.relocate(&mut self.device, Extent2d::new(width, height))?;
        self.retire_image(id.into(), old);
        Ok(())
    }

    pub fn destroy_texture(&mut self, id: TextureId) -> GraphicsResult<()> {
        if self.atlases.values().any(|a| a.texture() == id) {
            return Err(GraphicsError::misuse(format!(
                "texture {} belongs to an atlas; destroy the atlas instead",
                id.raw()
            )));
        }
        self.remove_texture(id)
    }

    // Atlases

    /// Descriptor for a new atlas with the configured packing tolerances.
    pub fn atlas_descriptor(&self, width: u32, height: u32, format: TextureFormat) -> AtlasDescriptor {
        AtlasDescriptor::new(width, height, format).with_params(self.config.atlas_packing)
    }

    pub fn create_atlas(&mut self, desc: &AtlasDescriptor) -> GraphicsResult<AtlasId> {
        let image = ImageDescriptor {
            label: desc.label.clone(),
            width: desc.width,
            height: desc.height,
            format: desc.format,
            ..Default::default()
        };
        let texture = Texture::new(&mut self.device, &image, &SamplerDescriptor::default())?;
        let texture_id = self.insert_texture(texture);
        let atlas = match TextureAtlas::new(&mut self.device, texture_id, desc) {
            Ok(atlas) => atlas,
            Err(e) => {
                if let Some(texture) = self.textures.remove(&texture_id) {
                    texture.destroy(&mut self.device);
                }
                return Err(e);
            }
        };
        let id = AtlasId(self.next_atlas_id);
        self.next_atlas_id += 1;
        self.atlases.insert(id, atlas);
        Ok(id)
    }

    pub fn atlas(&self, id: AtlasId) -> GraphicsResult<&TextureAtlas> {
        self.atlases.get(&id).ok_or_else(|| id.unknown())
    }

    /// Reserve space for a `width x height` sub-image and return its staging
    /// pixels. The pixels reach the atlas on the next [`atlas_commit`](Self::atlas_commit).
    pub fn atlas_allocate(
        &mut self,
        id: AtlasId,
        width: u32,
        height: u32,
    ) -> GraphicsResult<AtlasSpace<'_>> {
        let atlas = self.atlases.get_mut(&id).ok_or_else(|| id.unknown())?;
        let texture_id = atlas.texture();
        let texture = self
            .textures
            .get_mut(&texture_id)
            .ok_or_else(|| texture_id.unknown())?;
        let result = atlas.allocate(&mut self.device, texture, width, height);
        for old in atlas.take_retired() {
            self.retire_image(texture_id.into(), old);
        }
        let allocation = result?;

        let atlas = self.atlases.get(&id).ok_or_else(|| id.unknown())?;
        let pixels = atlas.pixels_mut(&mut self.device, allocation.span)?;
        Ok(AtlasSpace {
            rect: allocation.rect,
            pixels,
        })
    }

    /// Upload every staged sub-image. Returns `false` if nothing was pending.
    pub fn atlas_commit(&mut self, id: AtlasId) -> GraphicsResult<bool> {
        let atlas = self.atlases.get_mut(&id).ok_or_else(|| id.unknown())?;
        let texture_id = atlas.texture();
        let image = self
            .textures
            .get(&texture_id)
            .ok_or_else(|| texture_id.unknown())?
            .image();
        atlas.commit(&mut self.device, image)
    }

    pub fn destroy_atlas(&mut self, id: AtlasId) -> GraphicsResult<()> {
        let atlas = self.atlases.remove(&id).ok_or_else(|| id.unknown())?;
        let texture_id = atlas.texture();
        atlas.destroy(&mut self.device);
        self.remove_texture(texture_id)
    }

    // Binding tables

    /// Create a table with one copy per frame in flight.
    pub fn create_binding_table(&mut self, layout: &BindingLayout) -> GraphicsResult<BindingTableId> {
        let table = BindingTable::new(&mut self.device, layout, self.config.frames_in_flight)?;
        let id = BindingTableId(self.next_table_id);
        self.next_table_id += 1;
        self.tables.insert(id, table);
        Ok(id)
    }

    pub fn binding_table(&self, id: BindingTableId) -> GraphicsResult<&BindingTable> {
        self.tables.get(&id).ok_or_else(|| id.unknown())
    }

    /// Publish `resource` at `binding` in every copy of `table`, and record the
    /// back-reference used to refresh it after relocation.
    ///
    /// The first binding of a table no command list has used yet is written
    /// at once. Otherwise each copy is rewritten when its frame slot is next
    /// idle, and that slot re-records its commands.
    pub fn bind(
        &mut self,
        table_id: BindingTableId,
        binding: u32,
        resource: BindResource,
    ) -> GraphicsResult<()> {
        let source = match resource {
            BindResource::Array(id) => BindSource::Array(id),
            BindResource::Texture(id) => BindSource::Texture(id),
            BindResource::Atlas(id) => {
                BindSource::Texture(self.atlases.get(&id).ok_or_else(|| id.unknown())?.texture())
            }
            BindResource::Buffer {
                buffer,
                offset,
                range,
            } => BindSource::Buffer(Descriptor::Buffer {
                buffer,
                offset,
                range,
            }),
        };
        let table = self.tables.get_mut(&table_id).ok_or_else(|| table_id.unknown())?;

        let bound = match source {
            BindSource::Array(id) => {
                let array = self.arrays.get(&id).ok_or_else(|| id.unknown())?;
                check_array_kind(table, binding, array)?;
                BoundResource::Array {
                    id,
                    element_aligned_size: array.element_aligned_size(),
                }
            }
            BindSource::Texture(id) => {
                if !self.textures.contains_key(&id) {
                    return Err(id.unknown());
                }
                BoundResource::Texture(id)
            }
            BindSource::Buffer(descriptor) => BoundResource::Buffer(descriptor),
        };
        let key = bound_key(&bound);

        let deferred = table.is_recorded() || table.bound(binding).is_some();
        let previous = if deferred {
            table.rebind(binding, bound)?
        } else {
            let descriptors = (0..table.copies())
                .map(|frame| {
                    bound_descriptor(&self.arrays, &self.textures, &bound, frame).ok_or_else(|| {
                        GraphicsError::misuse(format!("{bound:?} has no descriptor"))
                    })
                })
                .collect::<GraphicsResult<Vec<_>>>()?;
            table.bind(&mut self.device, binding, bound, |frame| {
                descriptors[frame as usize]
            })?
        };

        if let Some(old_key) = previous.and_then(|p| bound_key(&p)) {
            if Some(old_key) != key {
                self.registry.remove(old_key, table_id, binding);
            }
        }
        if let Some(key) = key {
            self.registry.add(key, table_id, binding);
        }
        if deferred {
            self.reclaim.add_task(
                Some(Box::new(move |ctx: &mut Self, frame: u32| {
                    ctx.rewrite_binding_deferred(table_id, binding, frame)
                })),
                None,
            );
        }
        log::trace!("Bound {bound:?} at binding {binding} of table {}", table_id.raw());
        Ok(())
    }

    /// Write frame `frame`'s copy of `binding` from what the table refers to now.
    pub fn rewrite_binding(
        &mut self,
        table_id: BindingTableId,
        binding: u32,
        frame: u32,
    ) -> GraphicsResult<()> {
        let Some(table) = self.tables.get(&table_id) else {
            return Ok(());
        };
        let Some(bound) = table.bound(binding) else {
            return Ok(());
        };
        match bound_descriptor(&self.arrays, &self.textures, bound, frame) {
            Some(descriptor) => table.refresh(&mut self.device, frame, binding, &descriptor),
            None => Ok(()),
        }
    }

    /// Re-publish frame `frame`'s copy of every binding that refers to `key`.
    pub fn refresh(&mut self, key: ResourceKey, frame: u32) -> GraphicsResult<()> {
        let descriptor = match key {
            ResourceKey::Array(id) => match self.arrays.get(&id) {
                Some(array) => array.descriptor(frame),
                None => return Ok(()),
            },
            ResourceKey::Texture(id) => match self.textures.get(&id) {
                Some(texture) => texture.descriptor(),
                None => return Ok(()),
            },
        };
        for r in self.registry.refs(key) {
            if let Some(table) = self.tables.get(&r.table) {
                table.refresh(&mut self.device, frame, r.binding, &descriptor)?;
            }
        }
        Ok(())
    }

    /// Remove the table. Its binding set is destroyed once no frame can use it.
    pub fn destroy_binding_table(&mut self, id: BindingTableId) -> GraphicsResult<()> {
        let table = self.tables.remove(&id).ok_or_else(|| id.unknown())?;
        self.registry.remove_table(id);
        self.reclaim.add_task(
            None,
            Some(Box::new(move |ctx: &mut Self| table.destroy(&mut ctx.device))),
        );
        Ok(())
    }

    pub fn binding_refs(&self, key: ResourceKey) -> &[BindingRef] {
        self.registry.refs(key)
    }

    // Geometry

    pub fn create_vertex_buffer<T: Pod>(
        &mut self,
        label: &str,
        vertices: &[T],
    ) -> GraphicsResult<VertexBuffer> {
        VertexBuffer::new(&mut self.device, &mut self.staging, label, vertices)
    }

    pub fn create_index_buffer(
        &mut self,
        label: &str,
        indices: &IndexData,
    ) -> GraphicsResult<IndexBuffer> {
        IndexBuffer::new(&mut self.device, &mut self.staging, label, indices)
    }

    /// Destroy geometry once no frame can draw it.
    pub fn destroy_vertex_buffer(&mut self, buffer: VertexBuffer) {
        self.reclaim.add_task(
            None,
            Some(Box::new(move |ctx: &mut Self| buffer.destroy(&mut ctx.device))),
        );
    }

    pub fn destroy_index_buffer(&mut self, buffer: IndexBuffer) {
        self.reclaim.add_task(
            None,
            Some(Box::new(move |ctx: &mut Self| buffer.destroy(&mut ctx.device))),
        );
    }

    /// Free the array slots a [`DrawableBuilder`](crate::DrawableBuilder) allocated.
    pub fn release_drawable(&mut self, drawable: Drawable) -> GraphicsResult<()> {
        for &(array, slot) in drawable.owned_slots() {
            self.free(array, slot)?;
        }
        Ok(())
    }

    /// Record one drawable into `list` using frame `frame`'s binding copies.
    /// Binding tables are checked first, so a drawable with bad dynamic
    /// indices records nothing.
    pub(crate) fn record_draw(
        &mut self,
        list: CommandListHandle,
        frame: u32,
        drawable: &Drawable,
    ) -> GraphicsResult<()> {
        for binding in &drawable.bindings {
            let table = self
                .tables
                .get(&binding.table)
                .ok_or_else(|| binding.table.unknown())?;
            table.check_complete()?;
            table.dynamic_offsets(&binding.dynamic_indices)?;
        }

        self.device.cmd_bind_pipeline(list, drawable.pipeline);
        for (slot, vertices) in drawable.vertex_buffers.iter().enumerate() {
            self.device
                .cmd_bind_vertex_buffer(list, slot as u32, vertices.buffer, 0);
        }
        if let Some(indices) = &drawable.index_buffer {
            self.device
                .cmd_bind_index_buffer(list, indices.buffer, indices.format);
        }
        for (set_index, binding) in drawable.bindings.iter().enumerate() {
            let table = self
                .tables
                .get_mut(&binding.table)
                .ok_or_else(|| binding.table.unknown())?;
            table.record_bind(
                &mut self.device,
                list,
                drawable.pipeline,
                set_index as u32,
                frame,
                &binding.dynamic_indices,
            )?;
        }
        match &drawable.index_buffer {
            Some(indices) => self
                .device
                .cmd_draw_indexed(list, indices.count, drawable.instances()),
            None => self
                .device
                .cmd_draw(list, drawable.vertex_count, drawable.instances()),
        }
        Ok(())
    }

    // Reclamation

    /// Make every frame slot re-record its commands once.
    pub fn request_rerecord(&mut self) -> Generation {
        self.reclaim.request_rerecord()
    }

    pub fn reclaim_queue(&self) -> &DeferredReclamationQueue<Self> {
        &self.reclaim
    }

    /// Run the deferred tasks due for `frame`. Only call once the slot's fence
    /// has been waited on. Returns how many tasks fired.
    pub fn drain_reclamation(&mut self, frame: u32) -> GraphicsResult<usize> {
        let batch = self.reclaim.take_due(frame);
        let fired = batch.len();
        let survivors = batch.run(self);
        self.reclaim.restore(survivors);
        if fired > 0 {
            log::debug!("Frame {frame}: {fired} deferred tasks fired");
        }
        match self.deferred_error.take() {
            Some(e) => Err(e),
            None => Ok(fired),
        }
    }

    /// Complete every deferred task. Only valid once the device is idle.
    pub fn flush_reclamation(&mut self) -> GraphicsResult<usize> {
        let tasks = self.reclaim.take_all();
        let count = tasks.len();
        complete_all(tasks, self);
        match self.deferred_error.take() {
            Some(e) => Err(e),
            None => Ok(count),
        }
    }

    pub fn wait_idle(&mut self) -> GraphicsResult<()> {
        Ok(self.device.wait_idle()?)
    }

    /// Wait for the device, retire everything and return the device.
    pub fn shutdown(mut self) -> GraphicsResult<D> {
        self.wait_idle()?;
        self.flush_reclamation()?;

        for (_, table) in self.tables.drain() {
            table.destroy(&mut self.device);
        }
        for (_, atlas) in self.atlases.drain() {
            atlas.destroy(&mut self.device);
        }
        for (_, texture) in self.textures.drain() {
            texture.destroy(&mut self.device);
        }
        for (_, array) in self.arrays.drain() {
            array.destroy(&mut self.device);
        }
        self.staging.destroy(&mut self.device);
        log::info!("Render context shut down");
        Ok(self.device)
    }

    fn insert_texture(&mut self, texture: Texture) -> TextureId {
        let id = TextureId(self.next_texture_id);
        self.next_texture_id += 1;
        self.textures.insert(id, texture);
        id
    }

    fn remove_texture(&mut self, id: TextureId) -> GraphicsResult<()> {
        let texture = self.textures.remove(&id).ok_or_else(|| id.unknown())?;
        self.unbind_everywhere(id.into());
        let (image, sampler) = (texture.image(), texture.sampler());
        self.reclaim.add_task(
            None,
            Some(Box::new(move |ctx: &mut Self| destroy_image_pair(&mut ctx.device, image, sampler))),
        );
        Ok(())
    }

    /// Drop `key` from the relation and from every table binding it, so those
    /// tables fail to record instead of using a dead descriptor.
    fn unbind_everywhere(&mut self, key: ResourceKey) {
        for r in self.registry.remove_resource(key) {
            if let Some(table) = self.tables.get_mut(&r.table) {
                table.unbind(r.binding);
                log::debug!(
                    "Unbound {key:?} from binding {} of table {}",
                    r.binding,
                    r.table.raw()
                );
            }
        }
    }

    fn retire_buffer(&mut self, key: ResourceKey, old: BufferHandle) {
        self.reclaim.add(
            move |ctx: &mut Self, frame| ctx.refresh_deferred(key, frame),
            move |ctx: &mut Self| ctx.device.destroy_buffer(old),
        );
    }

    fn retire_image(&mut self, key: ResourceKey, old: ImageHandle) {
        self.reclaim.add(
            move |ctx: &mut Self, frame| ctx.refresh_deferred(key, frame),
            move |ctx: &mut Self| ctx.device.destroy_image(old),
        );
    }

    fn refresh_deferred(&mut self, key: ResourceKey, frame: u32) {
        if let Err(e) = self.refresh(key, frame) {
            log::error!("Deferred refresh of {key:?} for frame {frame} failed: {e}");
            self.deferred_error.get_or_insert(e);
        }
    }

    fn rewrite_binding_deferred(&mut self, table: BindingTableId, binding: u32, frame: u32) {
        if let Err(e) = self.rewrite_binding(table, binding, frame) {
            log::error!(
                "Deferred write of binding {binding} of table {} for frame {frame} failed: {e}",
                table.raw()
            );
            self.deferred_error.get_or_insert(e);
        }
    }
}

impl<D: GpuDevice + 'static> fmt::Debug for RenderContext<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderContext")
            .field("device", &self.device.name())
            .field("frames_in_flight", &self.config.frames_in_flight)
            .field("arrays", &self.arrays.len())
            .field("textures", &self.textures.len())
            .field("atlases", &self.atlases.len())
            .field("tables", &self.tables.len())
            .field("reclaim", &self.reclaim)
            .finish()
    }
}

fn destroy_image_pair(device: &mut dyn GpuDevice, image: ImageHandle, sampler: SamplerHandle) {
    device.destroy_image(image);
    device.destroy_sampler(sampler);
}

fn bound_descriptor(
    arrays: &HashMap<ResourceArrayId, ResourceArray>,
    textures: &HashMap<TextureId, Texture>,
    bound: &BoundResource,
    frame: u32,
) -> Option<Descriptor> {
    match *bound {
        BoundResource::Array { id, .. } => arrays.get(&id).map(|a| a.descriptor(frame)),
        BoundResource::Texture(id) => textures.get(&id).map(Texture::descriptor),
        BoundResource::Buffer(descriptor) => Some(descriptor),
    }
}

fn bound_key(bound: &BoundResource) -> Option<ResourceKey> {
    match *bound {
        BoundResource::Array { id, .. } => Some(id.into()),
        BoundResource::Texture(id) => Some(id.into()),
        BoundResource::Buffer(_) => None,
    }
}

fn check_array_kind(table: &BindingTable, binding: u32, array: &ResourceArray) -> GraphicsResult<()> {
    let expected = match table.layout().entry(binding).map(|e| e.kind) {
        Some(BindingKind::UniformArray) => ArrayKind::Uniform,
        Some(BindingKind::StorageArray) => ArrayKind::Storage,
        // Left to the table's own validation.
        _ => return Ok(()),
    };
    if array.kind() != expected {
        return Err(GraphicsError::misuse(format!(
            "{}: {:?} array cannot back binding {binding} of table {:?}",
            array.label(),
            array.kind(),
            table.label()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DeviceEvent, DummyDevice};

    fn context(frames: u32) -> RenderContext<DummyDevice> {
        let config = RendererConfig::default().with_frames_in_flight(frames);
        RenderContext::new(DummyDevice::new(), &config).unwrap()
    }

    fn object_layout() -> BindingLayout {
        BindingLayout::new()
            .with_label("object")
            .with_entry(0, BindingKind::UniformArray)
            .with_entry(1, BindingKind::CombinedImageSampler)
    }

    #[test]
    fn test_growth_refreshes_each_frame_before_destroy() {
        let mut ctx = context(2);
        let array = ctx
            .create_array(&ResourceArrayDescriptor::uniform(64).with_capacity(1))
            .unwrap();
        let table = ctx.create_binding_table(&object_layout()).unwrap();
        ctx.bind(table, 0, BindResource::Array(array)).unwrap();
        ctx.allocate(array).unwrap();
        let old = ctx.array(array).unwrap().store();

        ctx.allocate(array).unwrap();
        assert_eq!(ctx.reclaim_queue().pending(), 1);
        let set = ctx.binding_table(table).unwrap().set();
        let new_descriptor = ctx.array(array).unwrap().descriptor(1);
        assert_ne!(ctx.device().binding(set, 1, 0), Some(new_descriptor));

        assert_eq!(ctx.drain_reclamation(1).unwrap(), 1);
        assert_eq!(ctx.device().binding(set, 1, 0), Some(new_descriptor));
        assert!(ctx.device().is_buffer_alive(old));

        assert_eq!(ctx.drain_reclamation(0).unwrap(), 1);
        assert!(!ctx.device().is_buffer_alive(old));
        assert!(ctx.reclaim_queue().is_empty());
    }

    #[test]
    fn test_rebind_moves_back_reference() {
        let mut ctx = context(2);
        let a = ctx.create_array(&ResourceArrayDescriptor::uniform(16)).unwrap();
        let b = ctx.create_array(&ResourceArrayDescriptor::uniform(16)).unwrap();
        let table = ctx.create_binding_table(&object_layout()).unwrap();

        ctx.bind(table, 0, BindResource::Array(a)).unwrap();
        ctx.bind(table, 0, BindResource::Array(b)).unwrap();

        assert!(ctx.binding_refs(a.into()).is_empty());
        assert_eq!(ctx.binding_refs(b.into()).len(), 1);
    }

    #[test]
    fn test_storage_array_on_uniform_binding_is_misuse() {
        let mut ctx = context(2);
        let array = ctx.create_array(&ResourceArrayDescriptor::storage(16)).unwrap();
        let table = ctx.create_binding_table(&object_layout()).unwrap();
        let err = ctx.bind(table, 0, BindResource::Array(array)).unwrap_err();
        assert!(err.is_misuse());
    }

    #[test]
    fn test_texture_resize_defers_old_image() {
        let mut ctx = context(2);
        let desc = ImageDescriptor {
            width: 2,
            height: 2,
            format: TextureFormat::R8Unorm,
            ..Default::default()
        };
        let texture = ctx
            .create_texture(&desc, &SamplerDescriptor::default(), Some(&[1, 2, 3, 4]))
            .unwrap();
        let table = ctx.create_binding_table(&object_layout()).unwrap();
        ctx.bind(table, 1, BindResource::Texture(texture)).unwrap();
        let old = ctx.texture(texture).unwrap().image();

        ctx.resize_texture(texture, 4, 4).unwrap();
        ctx.drain_reclamation(0).unwrap();
        assert!(ctx.device().is_image_alive(old));
        ctx.drain_reclamation(1).unwrap();
        assert!(!ctx.device().is_image_alive(old));

        let set = ctx.binding_table(table).unwrap().set();
        let current = ctx.texture(texture).unwrap().descriptor();
        assert_eq!(ctx.device().binding(set, 0, 1), Some(current));
        assert_eq!(ctx.device().binding(set, 1, 1), Some(current));
    }

    #[test]
    fn test_destroying_texture_unbinds_it() {
        let mut ctx = context(2);
        let desc = ImageDescriptor {
            width: 2,
            height: 2,
            format: TextureFormat::R8Unorm,
            ..Default::default()
        };
        let texture = ctx
            .create_texture(&desc, &SamplerDescriptor::default(), None)
            .unwrap();
        let table = ctx.create_binding_table(&object_layout()).unwrap();
        ctx.bind(table, 1, BindResource::Texture(texture)).unwrap();

        ctx.destroy_texture(texture).unwrap();

        let table = ctx.binding_table(table).unwrap();
        assert!(table.bound(1).is_none());
        assert!(table.check_complete().unwrap_err().is_misuse());
        assert!(ctx.binding_refs(texture.into()).is_empty());
    }

    #[test]
    fn test_rebind_is_deferred_to_each_frame() {
        let mut ctx = context(2);
        let a = ctx.create_array(&ResourceArrayDescriptor::uniform(16)).unwrap();
        let b = ctx.create_array(&ResourceArrayDescriptor::uniform(16)).unwrap();
        let table = ctx.create_binding_table(&object_layout()).unwrap();
        ctx.bind(table, 0, BindResource::Array(a)).unwrap();
        let set = ctx.binding_table(table).unwrap().set();

        ctx.bind(table, 0, BindResource::Array(b)).unwrap();
        assert_eq!(ctx.reclaim_queue().pending(), 1);
        assert_eq!(ctx.device().binding(set, 1, 0), Some(ctx.array(a).unwrap().descriptor(1)));

        ctx.drain_reclamation(1).unwrap();
        assert_eq!(ctx.device().binding(set, 1, 0), Some(ctx.array(b).unwrap().descriptor(1)));
        assert_eq!(ctx.device().binding(set, 0, 0), Some(ctx.array(a).unwrap().descriptor(0)));
        ctx.drain_reclamation(0).unwrap();
        assert_eq!(ctx.device().binding(set, 0, 0), Some(ctx.array(b).unwrap().descriptor(0)));
        assert!(ctx.reclaim_queue().is_empty());
    }

    #[test]
    fn test_unknown_id() {
        let mut ctx = context(2);
        let err = ctx.allocate(ResourceArrayId(42)).unwrap_err();
        assert!(matches!(
            err,
            GraphicsError::UnknownResource {
                kind: "resource array",
                id: 42
            }
        ));
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let mut ctx = context(3);
        let array = ctx
            .create_array(&ResourceArrayDescriptor::uniform(16).with_capacity(1))
            .unwrap();
        ctx.allocate(array).unwrap();
        ctx.allocate(array).unwrap();
        let atlas = ctx
            .create_atlas(&AtlasDescriptor::new(64, 64, TextureFormat::R8Unorm))
            .unwrap();
        ctx.atlas_allocate(atlas, 8, 8).unwrap();
        ctx.create_binding_table(&object_layout()).unwrap();

        let device = ctx.shutdown().unwrap();

        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(device.live_image_count(), 0);
        assert!(device
            .events()
            .iter()
            .any(|e| matches!(e, DeviceEvent::BufferDestroyed(_))));
    }
}
