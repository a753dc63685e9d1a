//! Drawable objects and the scene-provider seam.

use crate::backend::{GpuDevice, PipelineHandle};
use crate::context::RenderContext;
use crate::error::{GraphicsError, GraphicsResult};
use crate::ids::{BindingTableId, ResourceArrayId};
use crate::resources::{IndexBuffer, VertexBuffer};

/// Which slot of a resource array a drawable uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRequest {
    /// Allocate a fresh slot, owned by the drawable.
    Allocate,
    /// Use a slot the caller already owns.
    Existing(u32),
}

/// A binding table bound for one drawable, with one element index per
/// dynamic binding in ascending binding order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawBinding {
    pub table: BindingTableId,
    pub dynamic_indices: Vec<u32>,
}

/// Everything needed to record one draw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Drawable {
    pub label: Option<String>,
    pub pipeline: PipelineHandle,
    pub vertex_buffers: Vec<VertexBuffer>,
    pub index_buffer: Option<IndexBuffer>,
    /// Bound at set indices 0, 1, ..
    pub bindings: Vec<DrawBinding>,
    pub vertex_count: u32,
    pub instance_count: Option<u32>,
    owned_slots: Vec<(ResourceArrayId, u32)>,
}

impl Drawable {
    pub fn new(pipeline: PipelineHandle) -> Self {
        Self {
            label: None,
            pipeline,
            vertex_buffers: Vec::new(),
            index_buffer: None,
            bindings: Vec::new(),
            vertex_count: 0,
            instance_count: None,
            owned_slots: Vec::new(),
        }
    }

    /// Array slots allocated on behalf of this drawable.
    pub fn owned_slots(&self) -> &[(ResourceArrayId, u32)] {
        &self.owned_slots
    }

    /// Slot this drawable allocated in `array` through [`SlotRequest::Allocate`].
    /// Slots passed in as [`SlotRequest::Existing`] are not tracked.
    pub fn slot(&self, array: ResourceArrayId) -> Option<u32> {
        self.owned_slots
            .iter()
            .find(|(a, _)| *a == array)
            .map(|&(_, slot)| slot)
    }

    pub fn instances(&self) -> u32 {
        self.instance_count.unwrap_or(1).max(1)
    }
}

/// Builds a [`Drawable`], resolving its array slots against a context.
#[derive(Debug, Clone)]
pub struct DrawableBuilder {
    drawable: Drawable,
    requests: Vec<(BindingTableId, Vec<(ResourceArrayId, SlotRequest)>)>,
}

impl DrawableBuilder {
    pub fn new(pipeline: PipelineHandle) -> Self {
        Self {
            drawable: Drawable::new(pipeline),
            requests: Vec::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.drawable.label = Some(label.into());
        self
    }

    pub fn with_vertex_buffer(mut self, buffer: VertexBuffer) -> Self {
        self.drawable.vertex_buffers.push(buffer);
        self
    }

    pub fn with_index_buffer(mut self, buffer: IndexBuffer) -> Self {
        self.drawable.index_buffer = Some(buffer);
        self
    }

    pub fn with_vertex_count(mut self, count: u32) -> Self {
        self.drawable.vertex_count = count;
        self
    }

    pub fn with_instance_count(mut self, count: u32) -> Self {
        self.drawable.instance_count = Some(count);
        self
    }

    /// Bind `table` at the next set index. `slots` gives the array backing each
    /// dynamic binding, in ascending binding order.
    pub fn with_binding(
        mut self,
        table: BindingTableId,
        slots: &[(ResourceArrayId, SlotRequest)],
    ) -> Self {
        self.requests.push((table, slots.to_vec()));
        self
    }

    /// Resolve slot requests. On failure every slot allocated so far is freed.
    pub fn build<D: GpuDevice + 'static>(
        self,
        ctx: &mut RenderContext<D>,
    ) -> GraphicsResult<Drawable> {
        let mut drawable = self.drawable;
        for (table, slots) in self.requests {
            match resolve_slots(ctx, &mut drawable, table, &slots) {
                Ok(binding) => drawable.bindings.push(binding),
                Err(e) => {
                    for &(array, slot) in &drawable.owned_slots {
                        if let Err(free_error) = ctx.free(array, slot) {
                            log::error!("Failed to release slot {slot}: {free_error}");
                        }
                    }
                    return Err(e);
                }
            }
        }
        if drawable.vertex_count == 0 && drawable.index_buffer.is_none() {
            log::debug!("Drawable {:?} has nothing to draw", drawable.label);
        }
        Ok(drawable)
    }
}

fn resolve_slots<D: GpuDevice + 'static>(
    ctx: &mut RenderContext<D>,
    drawable: &mut Drawable,
    table: BindingTableId,
    slots: &[(ResourceArrayId, SlotRequest)],
) -> GraphicsResult<DrawBinding> {
    let expected = ctx.binding_table(table)?.layout().dynamic_count();
    if slots.len() != expected {
        return Err(GraphicsError::misuse(format!(
            "binding table {} has {expected} dynamic bindings, got {} slots",
            table.raw(),
            slots.len()
        )));
    }
    let mut dynamic_indices = Vec::with_capacity(slots.len());
    for &(array, request) in slots {
        let slot = match request {
            SlotRequest::Existing(slot) => slot,
            SlotRequest::Allocate => {
                let slot = ctx.allocate(array)?;
                drawable.owned_slots.push((array, slot));
                slot
            }
        };
        dynamic_indices.push(slot);
    }
    Ok(DrawBinding {
        table,
        dynamic_indices,
    })
}

/// Provides the drawables of a frame.
pub trait DrawableSource {
    fn for_each_drawable(&self, f: &mut dyn FnMut(&Drawable));
}

impl DrawableSource for [Drawable] {
    fn for_each_drawable(&self, f: &mut dyn FnMut(&Drawable)) {
        self.iter().for_each(f);
    }
}

impl DrawableSource for Vec<Drawable> {
    fn for_each_drawable(&self, f: &mut dyn FnMut(&Drawable)) {
        self.as_slice().for_each_drawable(f);
    }
}
