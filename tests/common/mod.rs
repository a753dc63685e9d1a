//! Shared setup for the integration tests.
//!
//! Everything runs on [`DummyDevice`], whose event log records the order in
//! which bindings were rewritten and stores were destroyed.

#![allow(dead_code)]

use talus::backend::{
    BindingKind, BindingLayout, BindingSetHandle, BufferHandle, Descriptor, DeviceEvent,
    ImageHandle,
};
use talus::{DummyDevice, Renderer, RendererConfig};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Renderer with `frames` frames in flight and as many swapchain images, so
/// slot `i` always renders into image `i`.
pub fn renderer(frames: u32) -> Renderer<DummyDevice> {
    init_logger();
    let config = RendererConfig::default().with_frames_in_flight(frames);
    let device = DummyDevice::new().with_swapchain_images(frames);
    Renderer::new(device, &config).expect("renderer")
}

pub fn uniform_layout() -> BindingLayout {
    BindingLayout::new()
        .with_label("per-object")
        .with_entry(0, BindingKind::UniformArray)
}

pub fn sampler_layout() -> BindingLayout {
    BindingLayout::new()
        .with_label("glyphs")
        .with_entry(0, BindingKind::CombinedImageSampler)
}

pub fn position(events: &[DeviceEvent], wanted: &DeviceEvent) -> Option<usize> {
    events.iter().position(|e| e == wanted)
}

pub fn buffer_destroyed_at(events: &[DeviceEvent], buffer: BufferHandle) -> Option<usize> {
    position(events, &DeviceEvent::BufferDestroyed(buffer))
}

pub fn image_destroyed_at(events: &[DeviceEvent], image: ImageHandle) -> Option<usize> {
    position(events, &DeviceEvent::ImageDestroyed(image))
}

/// Position of the last write of `descriptor` into `binding` of `set`'s copy.
pub fn written_at(
    events: &[DeviceEvent],
    set: BindingSetHandle,
    copy: u32,
    binding: u32,
    descriptor: Descriptor,
) -> Option<usize> {
    events.iter().rposition(|e| {
        *e == DeviceEvent::BindingWritten {
            set,
            copy,
            binding,
            descriptor,
        }
    })
}
