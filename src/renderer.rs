//! Frame loop.
//!
//! [`Renderer::tick`] drives one frame slot through its whole cycle:
//!
//! ```text
//!   wait fence(slot) ──► drain reclamation(slot) ──► re-record? ──► reset fence
//!        ──► submit(wait image_acquired, signal render_finished + fence)
//!        ──► present(image acquired last tick) ──► advance ──► acquire(next slot)
//! ```
//!
//! A slot's command list is re-recorded when it has never been recorded, when
//! deferred tasks fired for it (bindings may have moved), when it is about to
//! render into a different swapchain image than last time, or when the scene
//! was marked as changed. Otherwise the previous recording is resubmitted.

use crate::backend::{CommandListHandle, GpuDevice};
use crate::config::RendererConfig;
use crate::context::RenderContext;
use crate::drawable::{Drawable, DrawableSource};
use crate::error::GraphicsResult;
use crate::frame::{FrameState, FrameSynchronizer};

/// Counters accumulated by [`Renderer::tick`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameStats {
    pub frames: u64,
    pub elapsed_seconds: f64,
    pub rerecords: u64,
}

#[derive(Debug)]
pub struct Renderer<D: GpuDevice + 'static> {
    context: RenderContext<D>,
    sync: FrameSynchronizer,
    command_lists: Vec<CommandListHandle>,
    /// Swapchain image each slot's list was last recorded against.
    recorded_image: Vec<Option<u32>>,
    scene_dirty: Vec<bool>,
    stats: FrameStats,
}

impl<D: GpuDevice + 'static> Renderer<D> {
    pub fn new(device: D, config: &RendererConfig) -> GraphicsResult<Self> {
        Self::from_context(RenderContext::new(device, config)?)
    }

    /// Build the frame ring around an existing context and acquire the first
    /// image into slot 0.
    pub fn from_context(mut context: RenderContext<D>) -> GraphicsResult<Self> {
        let frames = context.frames_in_flight();
        let mut sync = FrameSynchronizer::new(context.device_mut(), frames)?;
        let mut command_lists = Vec::with_capacity(frames as usize);
        for _ in 0..frames {
            command_lists.push(context.device_mut().create_command_list()?);
        }
        sync.acquire(context.device_mut(), 0)?;
        log::info!(
            "Renderer ready on {} ({frames} frames in flight)",
            context.device().name()
        );
        Ok(Self {
            context,
            sync,
            command_lists,
            recorded_image: vec![None; frames as usize],
            scene_dirty: vec![false; frames as usize],
            stats: FrameStats::default(),
        })
    }

    /// Render one frame from `scene`. Returns the index of the frame slot the
    /// next call works on.
    pub fn tick(&mut self, delta_seconds: f64, scene: &dyn DrawableSource) -> GraphicsResult<u32> {
        let frame = self.sync.current_index();
        let slot_index = frame as usize;
        self.sync.wait(self.context.device_mut())?;

        let fired = self.context.drain_reclamation(frame)?;

        let image_index = self.sync.current_image()?;
        let stale = fired > 0
            || self.scene_dirty[slot_index]
            || self.recorded_image[slot_index] != Some(image_index);
        if stale {
            log::debug!(
                "Frame {frame}: re-recording for image {image_index} ({fired} tasks fired)"
            );
            self.recorded_image[slot_index] = None;
            self.record(frame, image_index, scene)?;
            self.recorded_image[slot_index] = Some(image_index);
            self.scene_dirty[slot_index] = false;
            self.stats.rerecords += 1;
        }
        self.sync.mark_recorded();

        self.sync.reset(self.context.device_mut())?;
        let slot = self.sync.current();
        let (fence, wait, signal) = (slot.fence, slot.image_acquired, slot.render_finished);
        self.context
            .device_mut()
            .submit(self.command_lists[slot_index], wait, signal, fence)?;
        self.sync.mark_submitted();

        self.context.device_mut().present(image_index, signal)?;
        self.sync.mark_presented();

        let next = self.sync.advance();
        self.sync.acquire(self.context.device_mut(), next)?;

        self.stats.frames += 1;
        self.stats.elapsed_seconds += delta_seconds;
        Ok(next)
    }

    /// Re-record every slot on its next use.
    pub fn mark_scene_changed(&mut self) {
        self.scene_dirty.iter_mut().for_each(|dirty| *dirty = true);
    }

    pub fn context(&self) -> &RenderContext<D> {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut RenderContext<D> {
        &mut self.context
    }

    /// Slot the next tick works on.
    pub fn current_frame(&self) -> u32 {
        self.sync.current_index()
    }

    pub fn frame_state(&self, frame: u32) -> Option<FrameState> {
        self.sync.state(frame)
    }

    pub fn command_list(&self, frame: u32) -> Option<CommandListHandle> {
        self.command_lists.get(frame as usize).copied()
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    /// Wait for the device, retire every deferred task, destroy the frame ring
    /// and every resource, and return the device.
    pub fn shutdown(mut self) -> GraphicsResult<D> {
        self.context.wait_idle()?;
        self.context.flush_reclamation()?;
        self.sync.destroy(self.context.device_mut());
        log::info!("Renderer shut down after {} frames", self.stats.frames);
        self.context.shutdown()
    }

    fn record(&mut self, frame: u32, image_index: u32, scene: &dyn DrawableSource) -> GraphicsResult<()> {
        let list = self.command_lists[frame as usize];
        let clear_color = self.context.config().clear_color.to_array();
        self.context
            .device_mut()
            .begin_commands(list, image_index, clear_color)?;

        let mut result = Ok(());
        let context = &mut self.context;
        scene.for_each_drawable(&mut |drawable: &Drawable| {
            if result.is_ok() {
                result = context.record_draw(list, frame, drawable);
            }
        });

        let ended = context.device_mut().end_commands(list);
        result?;
        Ok(ended?)
    }
}
