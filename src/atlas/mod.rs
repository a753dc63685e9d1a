//! Texture atlas: many small images packed into one sampled texture.
//!
//! Sub-images are staged in the atlas' own [`StagingStack`] and uploaded
//! together by [`TextureAtlas::commit`]:
//!
//! ```text
//!   allocate(w, h) ──► packer.pack ──► rect
//!        │                   │ full
//!        │                   └──► double height, relocate texture, retry
//!        │                        (old image kept until take_retired)
//!        └──► staging span (CPU writes pixels)
//!
//!   commit() ──► one copy_buffer_to_image with every pending region
//!            └─► release staging back to the first marker
//! ```
//!
//! The atlas does not own its texture. The [`RenderContext`](crate::RenderContext)
//! keeps the texture under a [`TextureId`], so the atlas can be bound like any
//! other texture and its relocations refresh the same binding references.

pub mod packer;

pub use packer::{AtlasPacker, AtlasRect, AtlasRow, PackingParams, Ratio};

use crate::backend::{
    BackendError, BufferImageCopy, Extent2d, GpuDevice, ImageHandle, TextureFormat,
};
use crate::error::{GraphicsError, GraphicsResult};
use crate::ids::TextureId;
use crate::resources::{StagingMarker, StagingSpan, StagingStack, Texture};

/// Parameters for a new [`TextureAtlas`].
#[derive(Debug, Clone)]
pub struct AtlasDescriptor {
    pub label: Option<String>,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub params: PackingParams,
    /// Initial size of the atlas' staging stack.
    pub staging_size: u64,
}

impl AtlasDescriptor {
    pub fn new(width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            label: None,
            width,
            height,
            format,
            params: PackingParams::default(),
            staging_size: 1024 * 1024,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_params(mut self, params: PackingParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_staging_size(mut self, bytes: u64) -> Self {
        self.staging_size = bytes;
        self
    }
}

/// Result of [`TextureAtlas::allocate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtlasAllocation {
    pub rect: AtlasRect,
    /// Staging bytes for the sub-image, `rect.width * rect.height` pixels.
    pub span: StagingSpan,
}

/// Staged sub-image returned by
/// [`RenderContext::atlas_allocate`](crate::RenderContext::atlas_allocate).
#[derive(Debug)]
pub struct AtlasSpace<'a> {
    pub rect: AtlasRect,
    pub pixels: &'a mut [u8],
}

#[derive(Debug)]
pub struct TextureAtlas {
    label: Option<String>,
    texture: TextureId,
    format: TextureFormat,
    packer: AtlasPacker,
    staging: StagingStack,
    marker: Option<StagingMarker>,
    pending: Vec<(StagingSpan, AtlasRect)>,
    /// Images replaced while growing. Frames in flight may still sample them.
    retired: Vec<ImageHandle>,
}

impl TextureAtlas {
    pub fn new(
        device: &mut dyn GpuDevice,
        texture: TextureId,
        desc: &AtlasDescriptor,
    ) -> GraphicsResult<Self> {
        if desc.width == 0 || desc.height == 0 {
            return Err(GraphicsError::misuse(format!(
                "atlas {:?} has an empty {}x{} surface",
                desc.label, desc.width, desc.height
            )));
        }
        Ok(Self {
            label: desc.label.clone(),
            texture,
            format: desc.format,
            packer: AtlasPacker::new(desc.width, desc.height, desc.params),
            staging: StagingStack::new(device, desc.staging_size)?,
            marker: None,
            pending: Vec::new(),
            retired: Vec::new(),
        })
    }

    /// Reserve a `width x height` region and staging bytes for its pixels.
    /// `texture` must be the texture named by [`texture()`](Self::texture);
    /// it is relocated when the surface has to grow.
    ///
    /// Images replaced by growth are collected even when the call fails, and
    /// must be drained with [`take_retired`](Self::take_retired) afterwards.
    pub fn allocate(
        &mut self,
        device: &mut dyn GpuDevice,
        texture: &mut Texture,
        width: u32,
        height: u32,
    ) -> GraphicsResult<AtlasAllocation> {
        let max = device.limits().max_image_dimension;
        if height > max {
            return Err(GraphicsError::misuse(format!(
                "atlas {:?}: image height {height} exceeds the device limit {max}",
                self.label
            )));
        }
        let rect = loop {
            if let Some(rect) = self.packer.pack(width, height)? {
                break rect;
            }
            let old = self.grow(device, texture)?;
            self.retired.push(old);
        };

        if self.marker.is_none() {
            self.marker = Some(self.staging.marker());
        }
        let bpp = self.format.bytes_per_pixel() as u64;
        let span = self
            .staging
            .alloc(device, width as u64 * height as u64 * bpp, bpp)?;
        self.pending.push((span, rect));
        Ok(AtlasAllocation { rect, span })
    }

    /// Images replaced by growth since the last call.
    pub fn take_retired(&mut self) -> Vec<ImageHandle> {
        std::mem::take(&mut self.retired)
    }

    /// Staging bytes of a pending allocation.
    pub fn pixels_mut<'d>(
        &self,
        device: &'d mut dyn GpuDevice,
        span: StagingSpan,
    ) -> GraphicsResult<&'d mut [u8]> {
        self.staging.bytes_mut(device, span)
    }

    /// Upload every pending sub-image into `image` with one transfer.
    /// Returns `false` when nothing was pending.
    pub fn commit(&mut self, device: &mut dyn GpuDevice, image: ImageHandle) -> GraphicsResult<bool> {
        let Some(marker) = self.marker.take() else {
            return Ok(false);
        };
        let regions: Vec<BufferImageCopy> = self
            .pending
            .drain(..)
            .map(|(span, rect)| BufferImageCopy {
                buffer_offset: span.offset,
                x: rect.x,
                y: rect.y,
                width: rect.width,
                height: rect.height,
            })
            .collect();
        let result = device.copy_buffer_to_image(self.staging.buffer(), image, &regions);
        self.staging.release(marker)?;
        result?;
        log::debug!(
            "Atlas {:?}: committed {} sub-images",
            self.label,
            regions.len()
        );
        Ok(true)
    }

    fn grow(&mut self, device: &mut dyn GpuDevice, texture: &mut Texture) -> GraphicsResult<ImageHandle> {
        let max = device.limits().max_image_dimension;
        let height = self.packer.height().saturating_mul(2);
        if height > max {
            return Err(BackendError::TextureCreationFailed(format!(
                "atlas {:?} cannot grow past {max} pixels",
                self.label
            ))
            .into());
        }
        if height > max / 2 {
            log::warn!(
                "Atlas {:?} is {height} pixels tall, more than half of the device limit {max}",
                self.label
            );
        }
        let old = texture.relocate(device, Extent2d::new(self.packer.width(), height))?;
        self.packer.grow_height(height);
        log::debug!("Atlas {:?}: grew to {}x{height}", self.label, self.packer.width());
        Ok(old)
    }

    pub fn texture(&self) -> TextureId {
        self.texture
    }

    pub fn extent(&self) -> Extent2d {
        Extent2d::new(self.packer.width(), self.packer.height())
    }

    pub fn rows(&self) -> &[AtlasRow] {
        self.packer.rows()
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Destroy the staging buffer. The texture belongs to the context.
    pub fn destroy(self, device: &mut dyn GpuDevice) {
        self.staging.destroy(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DeviceLimits, DummyDevice, ImageDescriptor, SamplerDescriptor};

    fn setup(device: &mut DummyDevice, width: u32, height: u32) -> (TextureAtlas, Texture) {
        let desc = AtlasDescriptor::new(width, height, TextureFormat::R8Unorm).with_label("glyphs");
        let image = ImageDescriptor {
            label: desc.label.clone(),
            width,
            height,
            format: desc.format,
            ..Default::default()
        };
        let texture = Texture::new(device, &image, &SamplerDescriptor::default()).unwrap();
        let atlas = TextureAtlas::new(device, TextureId(1), &desc).unwrap();
        (atlas, texture)
    }

    #[test]
    fn test_commit_uploads_all_pending_regions_once() {
        let mut device = DummyDevice::new();
        let (mut atlas, mut texture) = setup(&mut device, 8, 8);

        let a = atlas.allocate(&mut device, &mut texture, 2, 2).unwrap();
        atlas.pixels_mut(&mut device, a.span).unwrap().fill(7);
        let b = atlas.allocate(&mut device, &mut texture, 2, 2).unwrap();
        atlas.pixels_mut(&mut device, b.span).unwrap().fill(9);
        assert_eq!(atlas.pending_count(), 2);

        assert!(atlas.commit(&mut device, texture.image()).unwrap());

        assert_eq!(device.image_transfer_count(), 1);
        let pixels = device.image_pixels(texture.image()).unwrap();
        assert_eq!(&pixels[0..4], &[7, 7, 9, 9]);
        assert_eq!(&pixels[8..12], &[7, 7, 9, 9]);
        assert_eq!(atlas.pending_count(), 0);
    }

    #[test]
    fn test_empty_commit_is_noop() {
        let mut device = DummyDevice::new();
        let (mut atlas, texture) = setup(&mut device, 8, 8);
        device.take_events();

        assert!(!atlas.commit(&mut device, texture.image()).unwrap());
        assert!(device.events().is_empty());
    }

    #[test]
    fn test_growth_relocates_and_keeps_rows() {
        let mut device = DummyDevice::new();
        let (mut atlas, mut texture) = setup(&mut device, 16, 16);
        let first = atlas.allocate(&mut device, &mut texture, 16, 16).unwrap();
        atlas.pixels_mut(&mut device, first.span).unwrap().fill(3);
        atlas.commit(&mut device, texture.image()).unwrap();
        let old_image = texture.image();

        let second = atlas.allocate(&mut device, &mut texture, 16, 16).unwrap();

        assert_eq!(atlas.take_retired(), vec![old_image]);
        assert!(atlas.take_retired().is_empty());
        assert_eq!(second.rect.y, 16);
        assert_eq!(atlas.extent(), Extent2d::new(16, 32));
        assert_eq!(atlas.rows()[0].y, 0);
        assert!(device.is_image_alive(old_image));
        let pixels = device.image_pixels(texture.image()).unwrap();
        assert!(pixels[..256].iter().all(|&p| p == 3));
    }

    #[test]
    fn test_growth_past_device_limit_is_fatal() {
        let limits = DeviceLimits {
            max_image_dimension: 32,
            ..Default::default()
        };
        let mut device = DummyDevice::new().with_limits(limits);
        let (mut atlas, mut texture) = setup(&mut device, 32, 32);
        atlas.allocate(&mut device, &mut texture, 32, 32).unwrap();

        let err = atlas.allocate(&mut device, &mut texture, 32, 1).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_taller_than_device_limit_is_misuse_without_growth() {
        let limits = DeviceLimits {
            max_image_dimension: 64,
            ..Default::default()
        };
        let mut device = DummyDevice::new().with_limits(limits);
        let (mut atlas, mut texture) = setup(&mut device, 16, 16);
        let image = texture.image();

        let err = atlas.allocate(&mut device, &mut texture, 8, 65).unwrap_err();

        assert!(err.is_misuse());
        assert_eq!(texture.image(), image);
        assert_eq!(atlas.extent(), Extent2d::new(16, 16));
        assert!(atlas.take_retired().is_empty());
    }

    #[test]
    fn test_failed_growth_keeps_replaced_images() {
        let limits = DeviceLimits {
            max_image_dimension: 64,
            ..Default::default()
        };
        let mut device = DummyDevice::new().with_limits(limits);
        let (mut atlas, mut texture) = setup(&mut device, 16, 16);
        atlas.allocate(&mut device, &mut texture, 16, 16).unwrap();
        let first = texture.image();

        // Needs 64 more rows below the first: grows to 32 and 64, then gives up
        let err = atlas.allocate(&mut device, &mut texture, 16, 64).unwrap_err();

        assert!(err.is_fatal());
        let retired = atlas.take_retired();
        assert_eq!(retired.len(), 2);
        assert_eq!(retired[0], first);
        assert!(retired.iter().all(|&image| device.is_image_alive(image)));
    }

    #[test]
    fn test_too_wide_is_misuse() {
        let mut device = DummyDevice::new();
        let (mut atlas, mut texture) = setup(&mut device, 8, 8);
        let err = atlas.allocate(&mut device, &mut texture, 9, 1).unwrap_err();
        assert!(err.is_misuse());
        assert_eq!(atlas.pending_count(), 0);
    }
}
