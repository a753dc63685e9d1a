//! Static vertex and index buffers.

use bytemuck::Pod;

use crate::backend::{
    BufferCopy, BufferDescriptor, BufferHandle, BufferUsage, GpuDevice, IndexFormat,
};
use crate::error::{GraphicsError, GraphicsResult};
use crate::resources::StagingStack;

/// Index data in either width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexData {
    U16(Vec<u16>),
    U32(Vec<u32>),
}

impl IndexData {
    pub fn format(&self) -> IndexFormat {
        match self {
            IndexData::U16(_) => IndexFormat::Uint16,
            IndexData::U32(_) => IndexFormat::Uint32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            IndexData::U16(v) => v.len(),
            IndexData::U32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            IndexData::U16(v) => bytemuck::cast_slice(v),
            IndexData::U32(v) => bytemuck::cast_slice(v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexBuffer {
    pub buffer: BufferHandle,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexBuffer {
    pub buffer: BufferHandle,
    pub format: IndexFormat,
    pub count: u32,
}

impl VertexBuffer {
    /// Upload `vertices` into a new device-local vertex buffer.
    pub fn new<T: Pod>(
        device: &mut dyn GpuDevice,
        staging: &mut StagingStack,
        label: &str,
        vertices: &[T],
    ) -> GraphicsResult<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(vertices);
        let buffer = upload(device, staging, label, BufferUsage::VERTEX, bytes)?;
        Ok(Self {
            buffer,
            size: bytes.len() as u64,
        })
    }

    pub fn destroy(self, device: &mut dyn GpuDevice) {
        device.destroy_buffer(self.buffer);
    }
}

impl IndexBuffer {
    /// Upload `indices` into a new device-local index buffer.
    pub fn new(
        device: &mut dyn GpuDevice,
        staging: &mut StagingStack,
        label: &str,
        indices: &IndexData,
    ) -> GraphicsResult<Self> {
        let buffer = upload(device, staging, label, BufferUsage::INDEX, indices.as_bytes())?;
        Ok(Self {
            buffer,
            format: indices.format(),
            count: indices.len() as u32,
        })
    }

    pub fn destroy(self, device: &mut dyn GpuDevice) {
        device.destroy_buffer(self.buffer);
    }
}

/// Create a device-local buffer and fill it through the staging stack with a
/// blocking one-shot copy.
fn upload(
    device: &mut dyn GpuDevice,
    staging: &mut StagingStack,
    label: &str,
    usage: BufferUsage,
    bytes: &[u8],
) -> GraphicsResult<BufferHandle> {
    if bytes.is_empty() {
        return Err(GraphicsError::misuse(format!("{label}: empty geometry upload")));
    }
    let buffer = device.create_buffer(&BufferDescriptor::new(
        label,
        bytes.len() as u64,
        usage | BufferUsage::COPY_DST,
    ))?;

    let marker = staging.marker();
    let copied = staging.push(device, bytes, 4).and_then(|span| {
        let region = BufferCopy {
            src_offset: span.offset,
            dst_offset: 0,
            size: span.size,
        };
        Ok(device.copy_buffer(staging.buffer(), buffer, &[region])?)
    });
    staging.release(marker)?;

    if let Err(e) = copied {
        device.destroy_buffer(buffer);
        return Err(e);
    }
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DeviceEvent, DummyDevice};

    #[test]
    fn test_index_upload() {
        let mut device = DummyDevice::new();
        let mut staging = StagingStack::new(&mut device, 64).unwrap();
        let indices = IndexData::U16(vec![0, 1, 2, 2, 3, 0]);

        let ib = IndexBuffer::new(&mut device, &mut staging, "quad", &indices).unwrap();

        assert_eq!(ib.count, 6);
        assert_eq!(ib.format, IndexFormat::Uint16);
        assert_eq!(staging.used(), 0);
        assert!(device.events().iter().any(|e| matches!(
            e,
            DeviceEvent::BufferCopied { dst, bytes: 12, .. } if *dst == ib.buffer
        )));
    }

    #[test]
    fn test_vertex_upload_from_glam() {
        let mut device = DummyDevice::new();
        let mut staging = StagingStack::new(&mut device, 16).unwrap();
        let vertices = [glam::Vec3::ZERO, glam::Vec3::X, glam::Vec3::Y];

        let vb = VertexBuffer::new(&mut device, &mut staging, "tri", &vertices).unwrap();
        assert_eq!(vb.size, 36);
    }

    #[test]
    fn test_empty_upload_is_misuse() {
        let mut device = DummyDevice::new();
        let mut staging = StagingStack::new(&mut device, 16).unwrap();
        let err = IndexBuffer::new(&mut device, &mut staging, "empty", &IndexData::U32(vec![]))
            .unwrap_err();
        assert!(err.is_misuse());
    }
}
