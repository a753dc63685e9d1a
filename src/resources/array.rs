//! Growable array of fixed-size GPU elements addressed by stable slot indices.
//!
//! The backing store is one host-visible buffer. Per-frame arrays keep one
//! region per frame in flight so the CPU can write frame `N` while the GPU
//! still reads frame `N - 1`:
//!
//! ```text
//! ┌──────────── frame 0 ────────────┬──────────── frame 1 ────────────┐
//! │ slot 0 │ slot 1 │ ... │ slot C-1 │ slot 0 │ slot 1 │ ... │ slot C-1 │
//! └─────────────────────────────────┴─────────────────────────────────┘
//!   each slot is `element_aligned_size` bytes
//! ```
//!
//! Free slots are chained through `next_free`. `allocate` pops the head and
//! `free` pushes onto it, so the last freed slot is reused first. When the
//! chain is empty the array doubles: a new store is created, every frame
//! region is copied to its new offset, and the old store is handed back to
//! the caller for deferred destruction.

use crate::backend::{
    BackendResult, BufferCopy, BufferDescriptor, BufferHandle, BufferUsage, Descriptor, GpuDevice,
};
use crate::error::{GraphicsError, GraphicsResult};
use crate::resources::align_up;

/// Which shader binding kind the array serves. Determines offset alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArrayKind {
    Uniform,
    Storage,
}

/// Parameters for a new [`ResourceArray`].
#[derive(Debug, Clone)]
pub struct ResourceArrayDescriptor {
    pub label: Option<String>,
    pub kind: ArrayKind,
    pub element_size: u64,
    pub initial_capacity: u32,
    /// Keep one copy of every element per frame in flight.
    pub per_frame: bool,
}

impl ResourceArrayDescriptor {
    pub fn uniform(element_size: u64) -> Self {
        Self {
            label: None,
            kind: ArrayKind::Uniform,
            element_size,
            initial_capacity: 16,
            per_frame: true,
        }
    }

    pub fn storage(element_size: u64) -> Self {
        Self {
            kind: ArrayKind::Storage,
            ..Self::uniform(element_size)
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.initial_capacity = capacity;
        self
    }

    pub fn with_per_frame(mut self, per_frame: bool) -> Self {
        self.per_frame = per_frame;
        self
    }
}

/// Result of [`ResourceArray::allocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotAllocation {
    pub slot: u32,
    /// Store replaced by growth. Must outlive every frame that may still read it.
    pub retired: Option<BufferHandle>,
}

/// Slot allocator over a growable GPU buffer.
#[derive(Debug)]
pub struct ResourceArray {
    label: String,
    kind: ArrayKind,
    element_size: u64,
    element_aligned_size: u64,
    per_frame: bool,
    frames_in_flight: u32,
    capacity: u32,
    len: u32,
    head: Option<u32>,
    next_free: Vec<Option<u32>>,
    occupied: Vec<bool>,
    store: BufferHandle,
    generation: u64,
}

impl ResourceArray {
    /// Create the array and its first backing store.
    pub fn new(
        device: &mut dyn GpuDevice,
        desc: &ResourceArrayDescriptor,
        frames_in_flight: u32,
    ) -> GraphicsResult<Self> {
        if desc.element_size == 0 {
            return Err(GraphicsError::misuse("resource array element size is zero"));
        }
        let limits = device.limits();
        let alignment = match desc.kind {
            ArrayKind::Uniform => limits.min_uniform_offset_alignment,
            ArrayKind::Storage => limits.min_storage_offset_alignment,
        };
        let label = desc
            .label
            .clone()
            .unwrap_or_else(|| "resource array".to_string());
        let capacity = desc.initial_capacity.max(1);

        let mut array = Self {
            label,
            kind: desc.kind,
            element_size: desc.element_size,
            element_aligned_size: align_up(desc.element_size, alignment),
            per_frame: desc.per_frame,
            frames_in_flight: frames_in_flight.max(1),
            capacity: 0,
            len: 0,
            head: None,
            next_free: Vec::with_capacity(capacity as usize),
            occupied: Vec::with_capacity(capacity as usize),
            store: BufferHandle(0),
            generation: 0,
        };
        array.store = array.create_store(device, capacity)?;
        array.link_free_range(0, capacity);
        array.capacity = capacity;
        Ok(array)
    }

    /// Take a free slot, growing the store if none is left.
    pub fn allocate(&mut self, device: &mut dyn GpuDevice) -> GraphicsResult<SlotAllocation> {
        let retired = match self.head {
            Some(_) => None,
            None => Some(self.grow(device)?),
        };
        let slot = self
            .head
            .ok_or_else(|| GraphicsError::misuse("free list empty after growth"))?;
        self.head = self.next_free[slot as usize].take();
        self.occupied[slot as usize] = true;
        self.len += 1;
        Ok(SlotAllocation { slot, retired })
    }

    /// Return a slot to the free list. The slot must currently be allocated.
    pub fn free(&mut self, slot: u32) -> GraphicsResult<()> {
        if !self.is_allocated(slot) {
            return Err(GraphicsError::misuse(format!(
                "{}: slot {slot} is not allocated (capacity {})",
                self.label, self.capacity
            )));
        }
        self.occupied[slot as usize] = false;
        self.next_free[slot as usize] = self.head;
        self.head = Some(slot);
        self.len -= 1;
        Ok(())
    }

    /// The element bytes of `slot` in frame `frame`'s region.
    pub fn data<'d>(
        &self,
        device: &'d dyn GpuDevice,
        frame: u32,
        slot: u32,
    ) -> GraphicsResult<&'d [u8]> {
        let range = self.element_range(frame, slot)?;
        Ok(&device.buffer_memory(self.store)?[range])
    }

    /// Mutable element bytes of `slot` in frame `frame`'s region.
    pub fn data_mut<'d>(
        &self,
        device: &'d mut dyn GpuDevice,
        frame: u32,
        slot: u32,
    ) -> GraphicsResult<&'d mut [u8]> {
        let range = self.element_range(frame, slot)?;
        Ok(&mut device.buffer_memory_mut(self.store)?[range])
    }

    /// Copy `bytes` into the start of `slot` for frame `frame`.
    pub fn write(
        &self,
        device: &mut dyn GpuDevice,
        frame: u32,
        slot: u32,
        bytes: &[u8],
    ) -> GraphicsResult<()> {
        if bytes.len() as u64 > self.element_size {
            return Err(GraphicsError::misuse(format!(
                "{}: {} bytes do not fit an element of {} bytes",
                self.label,
                bytes.len(),
                self.element_size
            )));
        }
        self.data_mut(device, frame, slot)?[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Write `bytes` into every frame region of `slot`. Meant for slots that
    /// no submitted frame can reference yet.
    pub fn write_all_frames(
        &self,
        device: &mut dyn GpuDevice,
        slot: u32,
        bytes: &[u8],
    ) -> GraphicsResult<()> {
        for frame in 0..self.replicas() {
            self.write(device, frame, slot, bytes)?;
        }
        Ok(())
    }

    /// Descriptor for frame `frame`: that frame's region, one element wide.
    /// The per-draw element is selected with a dynamic offset.
    pub fn descriptor(&self, frame: u32) -> Descriptor {
        Descriptor::Buffer {
            buffer: self.store,
            offset: self.region_offset(frame),
            range: self.element_aligned_size,
        }
    }

    /// Byte offset passed as the dynamic offset for `slot`.
    pub fn dynamic_offset(&self, slot: u32) -> u64 {
        slot as u64 * self.element_aligned_size
    }

    /// Destroy the current store. The caller guarantees the device is idle.
    pub fn destroy(self, device: &mut dyn GpuDevice) {
        device.destroy_buffer(self.store);
    }

    pub fn is_allocated(&self, slot: u32) -> bool {
        self.occupied.get(slot as usize).copied().unwrap_or(false)
    }

    /// Number of slots on the free list.
    pub fn free_list_len(&self) -> u32 {
        let mut count = 0;
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            count += 1;
            cursor = self.next_free[slot as usize];
        }
        count
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn kind(&self) -> ArrayKind {
        self.kind
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn element_size(&self) -> u64 {
        self.element_size
    }

    pub fn element_aligned_size(&self) -> u64 {
        self.element_aligned_size
    }

    pub fn is_per_frame(&self) -> bool {
        self.per_frame
    }

    /// Current backing store.
    pub fn store(&self) -> BufferHandle {
        self.store
    }

    /// Incremented every time the store is replaced.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn replicas(&self) -> u32 {
        if self.per_frame {
            self.frames_in_flight
        } else {
            1
        }
    }

    fn region_size(&self, capacity: u32) -> u64 {
        capacity as u64 * self.element_aligned_size
    }

    fn region_offset(&self, frame: u32) -> u64 {
        if self.per_frame {
            frame as u64 * self.region_size(self.capacity)
        } else {
            0
        }
    }

    fn element_range(&self, frame: u32, slot: u32) -> GraphicsResult<std::ops::Range<usize>> {
        if slot >= self.capacity {
            return Err(GraphicsError::misuse(format!(
                "{}: slot {slot} out of range (capacity {})",
                self.label, self.capacity
            )));
        }
        if self.per_frame && frame >= self.frames_in_flight {
            return Err(GraphicsError::misuse(format!(
                "{}: frame {frame} out of range ({} frames in flight)",
                self.label, self.frames_in_flight
            )));
        }
        let start = self.region_offset(frame) + self.dynamic_offset(slot);
        Ok(start as usize..(start + self.element_size) as usize)
    }

    fn create_store(&self, device: &mut dyn GpuDevice, capacity: u32) -> BackendResult<BufferHandle> {
        let usage = match self.kind {
            ArrayKind::Uniform => BufferUsage::UNIFORM,
            ArrayKind::Storage => BufferUsage::STORAGE,
        };
        device.create_buffer(&BufferDescriptor::new(
            self.label.clone(),
            self.region_size(capacity) * self.replicas() as u64,
            usage | BufferUsage::HOST_VISIBLE | BufferUsage::COPY_SRC | BufferUsage::COPY_DST,
        ))
    }

    /// Append slots `[from, to)` to the bookkeeping and chain them in ascending
    /// order in front of the current head.
    fn link_free_range(&mut self, from: u32, to: u32) {
        for slot in from..to {
            let next = if slot + 1 < to { Some(slot + 1) } else { self.head };
            self.next_free.push(next);
            self.occupied.push(false);
        }
        if from < to {
            self.head = Some(from);
        }
    }

    /// Double the capacity. Returns the replaced store.
    fn grow(&mut self, device: &mut dyn GpuDevice) -> GraphicsResult<BufferHandle> {
        let old_capacity = self.capacity;
        let new_capacity = old_capacity
            .checked_mul(2)
            .ok_or_else(|| GraphicsError::misuse(format!("{}: capacity overflow", self.label)))?;
        let new_store = self.create_store(device, new_capacity)?;

        let old_region = self.region_size(old_capacity);
        let new_region = self.region_size(new_capacity);
        let regions: Vec<BufferCopy> = (0..self.replicas() as u64)
            .map(|replica| BufferCopy {
                src_offset: replica * old_region,
                dst_offset: replica * new_region,
                size: old_region,
            })
            .collect();
        if let Err(e) = device.copy_buffer(self.store, new_store, &regions) {
            device.destroy_buffer(new_store);
            return Err(e.into());
        }

        let old_store = std::mem::replace(&mut self.store, new_store);
        self.link_free_range(old_capacity, new_capacity);
        self.capacity = new_capacity;
        self.generation += 1;
        log::debug!(
            "{}: grew {} -> {} slots (generation {})",
            self.label,
            old_capacity,
            new_capacity,
            self.generation
        );
        Ok(old_store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DeviceLimits, DummyDevice};

    fn device() -> DummyDevice {
        DummyDevice::new().with_limits(DeviceLimits {
            min_uniform_offset_alignment: 64,
            min_storage_offset_alignment: 16,
            max_image_dimension: 4096,
        })
    }

    fn array(device: &mut DummyDevice, capacity: u32, frames: u32) -> ResourceArray {
        ResourceArray::new(
            device,
            &ResourceArrayDescriptor::uniform(16)
                .with_label("test")
                .with_capacity(capacity),
            frames,
        )
        .unwrap()
    }

    #[test]
    fn test_lifo_reuse() {
        let mut device = device();
        let mut array = array(&mut device, 4, 2);

        let a = array.allocate(&mut device).unwrap().slot;
        let b = array.allocate(&mut device).unwrap().slot;
        array.free(0).unwrap();
        let c = array.allocate(&mut device).unwrap().slot;

        assert_eq!((a, b, c), (0, 1, 0));
        assert_eq!(array.len(), 2);
    }

    #[test]
    fn test_occupancy_matches_free_list() {
        let mut device = device();
        let mut array = array(&mut device, 8, 1);
        for _ in 0..5 {
            array.allocate(&mut device).unwrap();
        }
        array.free(3).unwrap();
        array.free(1).unwrap();

        assert_eq!(array.len(), array.capacity() - array.free_list_len());
        assert_eq!(array.allocate(&mut device).unwrap().slot, 1);
        assert_eq!(array.allocate(&mut device).unwrap().slot, 3);
        assert_eq!(array.allocate(&mut device).unwrap().slot, 5);
    }

    #[test]
    fn test_growth_preserves_indices_and_data() {
        let mut device = device();
        let mut array = array(&mut device, 2, 3);
        let old_store = array.store();

        for slot in 0..2 {
            assert_eq!(array.allocate(&mut device).unwrap().slot, slot);
            for frame in 0..3 {
                array
                    .write(&mut device, frame, slot, &[frame as u8 * 10 + slot as u8; 16])
                    .unwrap();
            }
        }

        let grown = array.allocate(&mut device).unwrap();
        assert_eq!(grown.slot, 2);
        assert_eq!(grown.retired, Some(old_store));
        assert_eq!(array.capacity(), 4);
        assert_eq!(array.generation(), 1);
        assert_ne!(array.store(), old_store);

        for slot in 0..2 {
            for frame in 0..3 {
                let data = array.data(&device, frame, slot).unwrap();
                assert_eq!(data, &[frame as u8 * 10 + slot as u8; 16]);
            }
        }
        // The old store is not destroyed by the array itself.
        assert!(device.is_buffer_alive(old_store));
    }

    #[test]
    fn test_growth_links_upper_half_ascending() {
        let mut device = device();
        let mut array = array(&mut device, 2, 1);
        let slots: Vec<u32> = (0..6)
            .map(|_| array.allocate(&mut device).unwrap().slot)
            .collect();
        assert_eq!(slots, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(array.capacity(), 8);
        assert_eq!(array.free_list_len(), 2);
    }

    #[test]
    fn test_outstanding_never_exceeds_capacity() {
        let mut device = device();
        let mut array = array(&mut device, 1, 2);
        let mut live: Vec<u32> = Vec::new();
        let mut seed = 0x2545_f491_u32;

        for _ in 0..500 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            if seed % 3 == 0 && !live.is_empty() {
                let victim = live.swap_remove(seed as usize % live.len());
                array.free(victim).unwrap();
            } else {
                let capacity = array.capacity();
                let full = array.len() == capacity;
                let allocation = array.allocate(&mut device).unwrap();
                assert_eq!(allocation.retired.is_some(), full);
                if full {
                    assert_eq!(array.capacity(), capacity * 2);
                }
                live.push(allocation.slot);
            }
            assert!(array.len() <= array.capacity());
            assert_eq!(array.len() as usize, live.len());
        }
    }

    #[test]
    fn test_double_free_is_misuse() {
        let mut device = device();
        let mut array = array(&mut device, 4, 1);
        let slot = array.allocate(&mut device).unwrap().slot;
        array.free(slot).unwrap();

        assert!(array.free(slot).unwrap_err().is_misuse());
        assert!(array.free(42).unwrap_err().is_misuse());
        assert_eq!(array.free_list_len(), 4);
    }

    #[test]
    fn test_aligned_size_and_descriptor() {
        let mut device = device();
        let array = array(&mut device, 4, 2);
        assert_eq!(array.element_aligned_size(), 64);
        assert_eq!(array.dynamic_offset(3), 192);
        assert_eq!(
            array.descriptor(1),
            Descriptor::Buffer {
                buffer: array.store(),
                offset: 256,
                range: 64,
            }
        );
    }

    #[test]
    fn test_shared_array_ignores_frame() {
        let mut device = device();
        let mut array = ResourceArray::new(
            &mut device,
            &ResourceArrayDescriptor::storage(4).with_per_frame(false),
            3,
        )
        .unwrap();
        let slot = array.allocate(&mut device).unwrap().slot;
        array.write(&mut device, 2, slot, &[7, 7, 7, 7]).unwrap();
        assert_eq!(array.data(&device, 0, slot).unwrap(), &[7, 7, 7, 7]);
        assert_eq!(array.element_aligned_size(), 16);
    }

    #[test]
    fn test_frame_out_of_range_is_misuse() {
        let mut device = device();
        let mut array = array(&mut device, 4, 2);
        let slot = array.allocate(&mut device).unwrap().slot;
        assert!(array.data(&device, 2, slot).unwrap_err().is_misuse());
        assert!(array.write(&mut device, 0, slot, &[0; 17]).unwrap_err().is_misuse());
    }
}
