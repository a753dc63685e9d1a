//! Linear upload allocator.
//!
//! A host-visible buffer used as a stack: callers take a [`StagingMarker`],
//! allocate spans on top of it, fill them, issue a blocking transfer, and
//! release back to the marker. Staging memory is only read by one-shot
//! transfers that complete before they return, so the buffer can be replaced
//! in place when it runs out of room.

use crate::backend::{BufferCopy, BufferDescriptor, BufferHandle, BufferUsage, GpuDevice};
use crate::error::{GraphicsError, GraphicsResult};
use crate::resources::align_up;

/// Saved stack top.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct StagingMarker(u64);

/// Allocated range within the staging buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingSpan {
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug)]
pub struct StagingStack {
    buffer: BufferHandle,
    capacity: u64,
    top: u64,
}

impl StagingStack {
    pub fn new(device: &mut dyn GpuDevice, capacity: u64) -> GraphicsResult<Self> {
        let capacity = capacity.max(1);
        let buffer = Self::create_buffer(device, capacity)?;
        Ok(Self {
            buffer,
            capacity,
            top: 0,
        })
    }

    pub fn marker(&self) -> StagingMarker {
        StagingMarker(self.top)
    }

    /// Allocate `size` bytes aligned to `align`, growing the buffer if needed.
    pub fn alloc(
        &mut self,
        device: &mut dyn GpuDevice,
        size: u64,
        align: u64,
    ) -> GraphicsResult<StagingSpan> {
        let offset = align_up(self.top, align);
        let end = offset + size;
        if end > self.capacity {
            self.grow(device, end)?;
        }
        self.top = end;
        Ok(StagingSpan { offset, size })
    }

    /// Rewind to `marker`. Fails if the marker lies above the current top.
    pub fn release(&mut self, marker: StagingMarker) -> GraphicsResult<()> {
        if marker.0 > self.top {
            return Err(GraphicsError::misuse(format!(
                "staging marker {} is above the stack top {}",
                marker.0, self.top
            )));
        }
        self.top = marker.0;
        Ok(())
    }

    pub fn bytes<'d>(
        &self,
        device: &'d dyn GpuDevice,
        span: StagingSpan,
    ) -> GraphicsResult<&'d [u8]> {
        let range = self.checked_range(span)?;
        Ok(&device.buffer_memory(self.buffer)?[range])
    }

    pub fn bytes_mut<'d>(
        &self,
        device: &'d mut dyn GpuDevice,
        span: StagingSpan,
    ) -> GraphicsResult<&'d mut [u8]> {
        let range = self.checked_range(span)?;
        Ok(&mut device.buffer_memory_mut(self.buffer)?[range])
    }

    /// Allocate a span and fill it with `data`.
    pub fn push(
        &mut self,
        device: &mut dyn GpuDevice,
        data: &[u8],
        align: u64,
    ) -> GraphicsResult<StagingSpan> {
        let span = self.alloc(device, data.len() as u64, align)?;
        self.bytes_mut(device, span)?.copy_from_slice(data);
        Ok(span)
    }

    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used(&self) -> u64 {
        self.top
    }

    pub fn destroy(self, device: &mut dyn GpuDevice) {
        device.destroy_buffer(self.buffer);
    }

    fn checked_range(&self, span: StagingSpan) -> GraphicsResult<std::ops::Range<usize>> {
        if span.offset + span.size > self.top {
            return Err(GraphicsError::misuse(format!(
                "staging span {}..{} was released (top {})",
                span.offset,
                span.offset + span.size,
                self.top
            )));
        }
        Ok(span.offset as usize..(span.offset + span.size) as usize)
    }

    fn create_buffer(device: &mut dyn GpuDevice, size: u64) -> GraphicsResult<BufferHandle> {
        Ok(device.create_buffer(&BufferDescriptor::new(
            "staging",
            size,
            BufferUsage::COPY_SRC | BufferUsage::COPY_DST | BufferUsage::HOST_VISIBLE,
        ))?)
    }

    fn grow(&mut self, device: &mut dyn GpuDevice, required: u64) -> GraphicsResult<()> {
        let mut capacity = self.capacity;
        while capacity < required {
            capacity *= 2;
        }
        let buffer = Self::create_buffer(device, capacity)?;
        if self.top > 0 {
            let copy = BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: self.top,
            };
            if let Err(e) = device.copy_buffer(self.buffer, buffer, &[copy]) {
                device.destroy_buffer(buffer);
                return Err(e.into());
            }
        }
        device.destroy_buffer(self.buffer);
        log::debug!("Staging stack grew {} -> {} bytes", self.capacity, capacity);
        self.buffer = buffer;
        self.capacity = capacity;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyDevice;

    #[test]
    fn test_marker_release_rewinds() {
        let mut device = DummyDevice::new();
        let mut stack = StagingStack::new(&mut device, 64).unwrap();

        let marker = stack.marker();
        let a = stack.alloc(&mut device, 10, 1).unwrap();
        let b = stack.alloc(&mut device, 8, 4).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 12);
        assert_eq!(stack.used(), 20);

        stack.release(marker).unwrap();
        assert_eq!(stack.used(), 0);
    }

    #[test]
    fn test_marker_above_top_is_misuse() {
        let mut device = DummyDevice::new();
        let mut stack = StagingStack::new(&mut device, 64).unwrap();
        stack.alloc(&mut device, 16, 1).unwrap();
        let marker = stack.marker();
        stack.release(StagingMarker(0)).unwrap();

        assert!(stack.release(marker).unwrap_err().is_misuse());
        assert_eq!(stack.used(), 0);
    }

    #[test]
    fn test_growth_keeps_pending_bytes() {
        let mut device = DummyDevice::new();
        let mut stack = StagingStack::new(&mut device, 8).unwrap();
        let first = stack.push(&mut device, &[1, 2, 3, 4, 5, 6], 1).unwrap();
        let old_buffer = stack.buffer();

        let second = stack.push(&mut device, &[9; 20], 4).unwrap();

        assert_eq!(stack.capacity(), 32);
        assert!(!device.is_buffer_alive(old_buffer));
        assert_eq!(stack.bytes(&device, first).unwrap(), &[1, 2, 3, 4, 5, 6]);
        assert_eq!(stack.bytes(&device, second).unwrap(), &[9; 20]);
    }

    #[test]
    fn test_released_span_is_not_accessible() {
        let mut device = DummyDevice::new();
        let mut stack = StagingStack::new(&mut device, 32).unwrap();
        let marker = stack.marker();
        let span = stack.alloc(&mut device, 4, 1).unwrap();
        stack.release(marker).unwrap();
        assert!(stack.bytes(&device, span).unwrap_err().is_misuse());
    }
}
