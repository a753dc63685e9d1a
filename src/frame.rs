//! Per-slot synchronization for frames in flight.
//!
//! [`FrameSynchronizer`] owns one [`FrameSlot`] per frame in flight. Each slot
//! has a completion fence and the two semaphores that order acquire, render
//! and present on the GPU:
//!
//! ```text
//!            acquire ──► image_acquired ──► submit ──► render_finished ──► present
//!                                             │
//!                                             └──► fence (waited on next use of the slot)
//! ```
//!
//! # Slot States
//!
//! ```text
//! Idle ──► Acquired ──► Recorded ──► Submitted ──► Presented ──► Idle
//!  ▲                                                               │
//!  └────────────────────────────────── wait ───────────────────────┘
//! ```
//!
//! A slot is `Acquired` as soon as an image has been acquired into its
//! semaphore, which happens at the end of the *previous* tick. Waiting on
//! the slot's fence returns it to `Idle` only if no image is pending.
//!
//! # Frame Overlap
//!
//! With 2 frames in flight:
//!
//! ```text
//! Slot 0: [wait F0][drain][record][submit] ─────── [wait F0][drain] ...
//!                                 [GPU frame 0] ──►
//! Slot 1:              [wait F1][drain][record][submit] ──────────► ...
//!                                                [GPU frame 1] ──►
//! ```
//!
//! The fence wait is the only point where the CPU blocks on the GPU.

use crate::backend::{FenceHandle, GpuDevice, SemaphoreHandle};
use crate::error::{GraphicsError, GraphicsResult};

/// Lifecycle of one frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Acquired,
    Recorded,
    Submitted,
    Presented,
}

/// Synchronization objects of one frame slot.
#[derive(Debug)]
pub struct FrameSlot {
    pub fence: FenceHandle,
    pub image_acquired: SemaphoreHandle,
    pub render_finished: SemaphoreHandle,
    state: FrameState,
    /// Image acquired into `image_acquired`, waiting to be rendered.
    image_index: Option<u32>,
}

impl FrameSlot {
    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn image_index(&self) -> Option<u32> {
        self.image_index
    }
}

/// Ring of frame slots.
#[derive(Debug)]
pub struct FrameSynchronizer {
    slots: Vec<FrameSlot>,
    current: u32,
}

impl FrameSynchronizer {
    /// Create `frames_in_flight` slots. Fences start signaled so the first
    /// wait on every slot returns immediately.
    pub fn new(device: &mut dyn GpuDevice, frames_in_flight: u32) -> GraphicsResult<Self> {
        if frames_in_flight == 0 {
            return Err(GraphicsError::InvalidConfig(
                "frames_in_flight must be at least 1".into(),
            ));
        }
        let mut slots = Vec::with_capacity(frames_in_flight as usize);
        for _ in 0..frames_in_flight {
            slots.push(FrameSlot {
                fence: device.create_fence(true)?,
                image_acquired: device.create_semaphore()?,
                render_finished: device.create_semaphore()?,
                state: FrameState::Idle,
                image_index: None,
            });
        }
        Ok(Self { slots, current: 0 })
    }

    pub fn frames_in_flight(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Index of the slot the next tick works on.
    pub fn current_index(&self) -> u32 {
        self.current
    }

    pub fn current(&self) -> &FrameSlot {
        &self.slots[self.current as usize]
    }

    pub fn slot(&self, index: u32) -> Option<&FrameSlot> {
        self.slots.get(index as usize)
    }

    pub fn state(&self, index: u32) -> Option<FrameState> {
        self.slot(index).map(FrameSlot::state)
    }

    /// Block until the GPU has finished the previous use of the current slot.
    /// There is no timeout.
    pub fn wait(&mut self, device: &mut dyn GpuDevice) -> GraphicsResult<()> {
        let slot = &mut self.slots[self.current as usize];
        device.wait_fence(slot.fence)?;
        if slot.image_index.is_none() {
            slot.state = FrameState::Idle;
        }
        log::trace!("Frame slot {} is free", self.current);
        Ok(())
    }

    /// Unsignal the current slot's fence. Call only once the slot is certain to
    /// be submitted, or the next wait on it never returns.
    pub fn reset(&mut self, device: &mut dyn GpuDevice) -> GraphicsResult<()> {
        Ok(device.reset_fence(self.current().fence)?)
    }

    /// Acquire the next swapchain image into `index`'s semaphore.
    pub fn acquire(&mut self, device: &mut dyn GpuDevice, index: u32) -> GraphicsResult<u32> {
        let slot = self.slots.get_mut(index as usize).ok_or_else(|| {
            GraphicsError::misuse(format!("frame slot {index} out of range"))
        })?;
        let image_index = device.acquire_next_image(slot.image_acquired)?;
        slot.image_index = Some(image_index);
        slot.state = FrameState::Acquired;
        Ok(image_index)
    }

    /// Image acquired for the current slot.
    pub fn current_image(&self) -> GraphicsResult<u32> {
        self.current().image_index.ok_or_else(|| {
            GraphicsError::misuse(format!("frame slot {} has no acquired image", self.current))
        })
    }

    pub fn mark_recorded(&mut self) {
        self.slots[self.current as usize].state = FrameState::Recorded;
    }

    pub fn mark_submitted(&mut self) {
        self.slots[self.current as usize].state = FrameState::Submitted;
    }

    /// The current slot's image went to the presentation engine.
    pub fn mark_presented(&mut self) {
        let slot = &mut self.slots[self.current as usize];
        slot.state = FrameState::Presented;
        slot.image_index = None;
    }

    /// Move to the next slot and return its index.
    pub fn advance(&mut self) -> u32 {
        self.current = (self.current + 1) % self.frames_in_flight();
        self.current
    }

    /// Destroy every fence and semaphore. The device must be idle.
    pub fn destroy(self, device: &mut dyn GpuDevice) {
        for slot in self.slots {
            device.destroy_fence(slot.fence);
            device.destroy_semaphore(slot.image_acquired);
            device.destroy_semaphore(slot.render_finished);
        }
    }
}
