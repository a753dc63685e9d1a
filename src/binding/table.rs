//! Shader-visible binding set with one copy per frame slot.

use std::collections::BTreeMap;

use crate::backend::{
    BindingKind, BindingLayout, BindingSetHandle, CommandListHandle, Descriptor, GpuDevice,
    PipelineHandle,
};
use crate::error::{GraphicsError, GraphicsResult};
use crate::ids::{ResourceArrayId, TextureId};

/// What a binding point refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundResource {
    /// Growable array; one element is selected per draw with a dynamic offset.
    Array {
        id: ResourceArrayId,
        element_aligned_size: u64,
    },
    /// Fixed buffer range owned by the caller.
    Buffer(Descriptor),
    Texture(TextureId),
}

#[derive(Debug)]
pub struct BindingTable {
    label: Option<String>,
    layout: BindingLayout,
    set: BindingSetHandle,
    copies: u32,
    bound: BTreeMap<u32, BoundResource>,
    /// Set once a command list has bound this table.
    recorded: bool,
}

impl BindingTable {
    pub fn new(
        device: &mut dyn GpuDevice,
        layout: &BindingLayout,
        copies: u32,
    ) -> GraphicsResult<Self> {
        let set = device.create_binding_set(layout, copies)?;
        Ok(Self {
            label: layout.label.clone(),
            layout: layout.clone(),
            set,
            copies,
            bound: BTreeMap::new(),
            recorded: false,
        })
    }

    /// Check that `resource` may be bound at `binding`.
    pub fn validate(&self, binding: u32, resource: &BoundResource) -> GraphicsResult<()> {
        let entry = self.layout.entry(binding).ok_or_else(|| {
            GraphicsError::misuse(format!(
                "binding table {:?} has no binding {binding}",
                self.label
            ))
        })?;
        let compatible = match (entry.kind, resource) {
            (BindingKind::UniformArray | BindingKind::StorageArray, BoundResource::Array { .. }) => {
                true
            }
            (BindingKind::Uniform, BoundResource::Buffer(Descriptor::Buffer { .. })) => true,
            (BindingKind::CombinedImageSampler, BoundResource::Texture(_)) => true,
            _ => false,
        };
        if !compatible {
            return Err(GraphicsError::misuse(format!(
                "binding table {:?}: {resource:?} cannot be bound at {:?} binding {binding}",
                self.label, entry.kind
            )));
        }
        Ok(())
    }

    /// Publish `resource` into every copy. `descriptor(frame)` yields the
    /// descriptor for each copy.
    pub fn bind(
        &mut self,
        device: &mut dyn GpuDevice,
        binding: u32,
        resource: BoundResource,
        descriptor: impl Fn(u32) -> Descriptor,
    ) -> GraphicsResult<Option<BoundResource>> {
        self.validate(binding, &resource)?;
        for copy in 0..self.copies {
            device.write_binding(self.set, copy, binding, &descriptor(copy))?;
        }
        Ok(self.bound.insert(binding, resource))
    }

    /// Point `binding` at `resource` without writing any copy. Each copy must
    /// then be rewritten with [`refresh`](Self::refresh) once its frame is idle.
    pub fn rebind(
        &mut self,
        binding: u32,
        resource: BoundResource,
    ) -> GraphicsResult<Option<BoundResource>> {
        self.validate(binding, &resource)?;
        Ok(self.bound.insert(binding, resource))
    }

    /// Forget what `binding` refers to. The copies keep their last descriptor
    /// but the table can no longer be recorded.
    pub fn unbind(&mut self, binding: u32) -> Option<BoundResource> {
        self.bound.remove(&binding)
    }

    /// Fails unless every binding of the layout refers to a resource.
    pub fn check_complete(&self) -> GraphicsResult<()> {
        match self
            .layout
            .entries()
            .iter()
            .find(|e| !self.bound.contains_key(&e.binding))
        {
            Some(entry) => Err(GraphicsError::misuse(format!(
                "binding table {:?}: binding {} is not bound",
                self.label, entry.binding
            ))),
            None => Ok(()),
        }
    }

    /// Re-publish one copy after the bound resource moved.
    pub fn refresh(
        &self,
        device: &mut dyn GpuDevice,
        frame: u32,
        binding: u32,
        descriptor: &Descriptor,
    ) -> GraphicsResult<()> {
        if frame >= self.copies {
            return Err(GraphicsError::misuse(format!(
                "binding table {:?}: frame {frame} out of range ({} copies)",
                self.label, self.copies
            )));
        }
        Ok(device.write_binding(self.set, frame, binding, descriptor)?)
    }

    /// Dynamic offsets for `dynamic_indices`, one index per dynamic binding in
    /// ascending binding order.
    pub fn dynamic_offsets(&self, dynamic_indices: &[u32]) -> GraphicsResult<Vec<u32>> {
        let expected = self.layout.dynamic_count();
        if dynamic_indices.len() != expected {
            return Err(GraphicsError::misuse(format!(
                "binding table {:?} has {expected} dynamic bindings, got {} indices",
                self.label,
                dynamic_indices.len()
            )));
        }

        let dynamic = self.layout.entries().iter().filter(|e| e.kind.is_dynamic());
        dynamic
            .zip(dynamic_indices)
            .map(|(entry, &index)| {
                let stride = match self.bound.get(&entry.binding) {
                    Some(BoundResource::Array {
                        element_aligned_size,
                        ..
                    }) => *element_aligned_size,
                    _ => {
                        return Err(GraphicsError::misuse(format!(
                            "binding table {:?}: dynamic binding {} is not bound",
                            self.label, entry.binding
                        )))
                    }
                };
                u32::try_from(index as u64 * stride).map_err(|_| {
                    GraphicsError::misuse(format!(
                        "binding table {:?}: offset for index {index} overflows",
                        self.label
                    ))
                })
            })
            .collect()
    }

    /// Bind copy `frame` into `list` with per-draw element indices.
    pub fn record_bind(
        &mut self,
        device: &mut dyn GpuDevice,
        list: CommandListHandle,
        pipeline: PipelineHandle,
        set_index: u32,
        frame: u32,
        dynamic_indices: &[u32],
    ) -> GraphicsResult<()> {
        let offsets = self.dynamic_offsets(dynamic_indices)?;
        if frame >= self.copies {
            return Err(GraphicsError::misuse(format!(
                "binding table {:?}: frame {frame} out of range ({} copies)",
                self.label, self.copies
            )));
        }
        device.cmd_bind_binding_set(list, pipeline, set_index, self.set, frame, &offsets);
        self.recorded = true;
        Ok(())
    }

    pub fn bound(&self, binding: u32) -> Option<&BoundResource> {
        self.bound.get(&binding)
    }

    /// Whether a command list may still refer to the copies.
    pub fn is_recorded(&self) -> bool {
        self.recorded
    }

    pub fn layout(&self) -> &BindingLayout {
        &self.layout
    }

    pub fn set(&self) -> BindingSetHandle {
        self.set
    }

    pub fn copies(&self) -> u32 {
        self.copies
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn destroy(self, device: &mut dyn GpuDevice) {
        device.destroy_binding_set(self.set);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BufferHandle, DummyDevice, RecordedCommand};

    fn layout() -> BindingLayout {
        BindingLayout::new()
            .with_label("object")
            .with_entry(0, BindingKind::UniformArray)
            .with_entry(1, BindingKind::CombinedImageSampler)
            .with_entry(2, BindingKind::StorageArray)
    }

    fn array(id: u64, stride: u64) -> BoundResource {
        BoundResource::Array {
            id: ResourceArrayId(id),
            element_aligned_size: stride,
        }
    }

    fn buffer_descriptor(frame: u32) -> Descriptor {
        Descriptor::Buffer {
            buffer: BufferHandle(99),
            offset: frame as u64 * 1024,
            range: 256,
        }
    }

    #[test]
    fn test_bind_writes_every_copy() {
        let mut device = DummyDevice::new();
        let mut table = BindingTable::new(&mut device, &layout(), 3).unwrap();

        table
            .bind(&mut device, 0, array(1, 256), buffer_descriptor)
            .unwrap();

        for frame in 0..3 {
            assert_eq!(
                device.binding(table.set(), frame, 0),
                Some(buffer_descriptor(frame))
            );
        }
    }

    #[test]
    fn test_dynamic_offsets_in_binding_order() {
        let mut device = DummyDevice::new();
        let mut table = BindingTable::new(&mut device, &layout(), 2).unwrap();
        table
            .bind(&mut device, 2, array(2, 64), buffer_descriptor)
            .unwrap();
        table
            .bind(&mut device, 0, array(1, 256), buffer_descriptor)
            .unwrap();

        assert_eq!(table.dynamic_offsets(&[3, 5]).unwrap(), vec![768, 320]);
    }

    #[test]
    fn test_dynamic_index_count_mismatch() {
        let mut device = DummyDevice::new();
        let mut table = BindingTable::new(&mut device, &layout(), 2).unwrap();
        table
            .bind(&mut device, 0, array(1, 256), buffer_descriptor)
            .unwrap();
        table
            .bind(&mut device, 2, array(2, 64), buffer_descriptor)
            .unwrap();
        let list = device.create_command_list().unwrap();
        device.begin_commands(list, 0, [0.0; 4]).unwrap();

        let err = table
            .record_bind(&mut device, list, PipelineHandle(1), 0, 0, &[1])
            .unwrap_err();

        assert!(err.is_misuse());
        device.end_commands(list).unwrap();
        assert!(device.commands(list).is_empty());
    }

    #[test]
    fn test_record_bind_uses_frame_copy() {
        let mut device = DummyDevice::new();
        let mut table = BindingTable::new(&mut device, &layout(), 2).unwrap();
        table
            .bind(&mut device, 0, array(1, 256), buffer_descriptor)
            .unwrap();
        table
            .bind(&mut device, 2, array(2, 64), buffer_descriptor)
            .unwrap();
        let list = device.create_command_list().unwrap();
        device.begin_commands(list, 0, [0.0; 4]).unwrap();

        table
            .record_bind(&mut device, list, PipelineHandle(1), 1, 1, &[2, 0])
            .unwrap();
        device.end_commands(list).unwrap();

        assert_eq!(
            device.commands(list),
            &[RecordedCommand::BindBindingSet {
                set_index: 1,
                set: table.set(),
                copy: 1,
                dynamic_offsets: vec![512, 0],
            }]
        );
    }

    #[test]
    fn test_unbind_leaves_table_incomplete() {
        let mut device = DummyDevice::new();
        let mut table = BindingTable::new(&mut device, &layout(), 2).unwrap();
        let texture = BoundResource::Texture(TextureId(4));
        table.bind(&mut device, 0, array(1, 256), buffer_descriptor).unwrap();
        table.rebind(1, texture).unwrap();
        table.bind(&mut device, 2, array(2, 64), buffer_descriptor).unwrap();
        table.check_complete().unwrap();

        assert_eq!(table.unbind(2), Some(array(2, 64)));

        assert!(table.check_complete().unwrap_err().is_misuse());
        assert!(table.dynamic_offsets(&[0, 0]).unwrap_err().is_misuse());
    }

    #[test]
    fn test_kind_mismatch_is_misuse() {
        let mut device = DummyDevice::new();
        let mut table = BindingTable::new(&mut device, &layout(), 2).unwrap();
        let err = table
            .bind(&mut device, 1, array(1, 256), buffer_descriptor)
            .unwrap_err();
        assert!(err.is_misuse());
        let err = table
            .bind(&mut device, 7, array(1, 256), buffer_descriptor)
            .unwrap_err();
        assert!(err.is_misuse());
    }
}
