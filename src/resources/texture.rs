//! Sampled 2D textures

use crate::backend::{
    BufferImageCopy, Descriptor, Extent2d, GpuDevice, ImageDescriptor, ImageHandle,
    SamplerDescriptor, SamplerHandle, TextureFormat,
};
use crate::error::{GraphicsError, GraphicsResult};
use crate::resources::StagingStack;

/// An image plus the sampler it is bound with.
#[derive(Debug)]
pub struct Texture {
    /// Descriptor of the current image; relocation only changes its size.
    desc: ImageDescriptor,
    image: ImageHandle,
    sampler: SamplerHandle,
    generation: u64,
}

impl Texture {
    pub fn new(
        device: &mut dyn GpuDevice,
        desc: &ImageDescriptor,
        sampler: &SamplerDescriptor,
    ) -> GraphicsResult<Self> {
        let image = device.create_image(desc)?;
        let sampler = match device.create_sampler(sampler) {
            Ok(sampler) => sampler,
            Err(e) => {
                device.destroy_image(image);
                return Err(e.into());
            }
        };
        Ok(Self {
            desc: desc.clone(),
            image,
            sampler,
            generation: 0,
        })
    }

    /// Upload tightly packed `pixels` covering the whole image.
    pub fn upload(
        &self,
        device: &mut dyn GpuDevice,
        staging: &mut StagingStack,
        pixels: &[u8],
    ) -> GraphicsResult<()> {
        let expected = self.byte_size();
        if pixels.len() as u64 != expected {
            return Err(GraphicsError::misuse(format!(
                "texture {:?} expects {expected} bytes of pixels, got {}",
                self.desc.label,
                pixels.len()
            )));
        }
        let marker = staging.marker();
        let span = staging.push(device, pixels, self.desc.format.bytes_per_pixel() as u64)?;
        let region = BufferImageCopy {
            buffer_offset: span.offset,
            x: 0,
            y: 0,
            width: self.desc.width,
            height: self.desc.height,
        };
        let result = device.copy_buffer_to_image(staging.buffer(), self.image, &[region]);
        staging.release(marker)?;
        Ok(result?)
    }

    /// Move to a new image of `extent`, keeping the overlapping pixels.
    /// Returns the previous image, which frames in flight may still sample.
    pub fn relocate(
        &mut self,
        device: &mut dyn GpuDevice,
        extent: Extent2d,
    ) -> GraphicsResult<ImageHandle> {
        let desc = ImageDescriptor {
            width: extent.width,
            height: extent.height,
            ..self.desc.clone()
        };
        let image = device.create_image(&desc)?;
        if let Err(e) = device.copy_image(self.image, image, self.extent().min(extent)) {
            device.destroy_image(image);
            return Err(e.into());
        }
        log::debug!(
            "Texture {:?}: relocated {}x{} -> {}x{}",
            self.desc.label,
            self.desc.width,
            self.desc.height,
            extent.width,
            extent.height
        );
        self.desc = desc;
        self.generation += 1;
        Ok(std::mem::replace(&mut self.image, image))
    }

    pub fn descriptor(&self) -> Descriptor {
        Descriptor::ImageSampler {
            image: self.image,
            sampler: self.sampler,
        }
    }

    pub fn image(&self) -> ImageHandle {
        self.image
    }

    pub fn sampler(&self) -> SamplerHandle {
        self.sampler
    }

    pub fn extent(&self) -> Extent2d {
        Extent2d::new(self.desc.width, self.desc.height)
    }

    pub fn format(&self) -> TextureFormat {
        self.desc.format
    }

    pub fn image_descriptor(&self) -> &ImageDescriptor {
        &self.desc
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn byte_size(&self) -> u64 {
        self.desc.byte_size()
    }

    pub fn destroy(self, device: &mut dyn GpuDevice) {
        device.destroy_image(self.image);
        device.destroy_sampler(self.sampler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DummyDevice, ImageUsage};

    fn r8(width: u32, height: u32) -> ImageDescriptor {
        ImageDescriptor {
            label: Some("r8".into()),
            width,
            height,
            format: TextureFormat::R8Unorm,
            ..Default::default()
        }
    }

    #[test]
    fn test_upload_and_relocate_keeps_overlap() {
        let mut device = DummyDevice::new();
        let mut staging = StagingStack::new(&mut device, 64).unwrap();
        let mut texture = Texture::new(&mut device, &r8(2, 2), &SamplerDescriptor::default()).unwrap();
        texture.upload(&mut device, &mut staging, &[1, 2, 3, 4]).unwrap();
        assert_eq!(staging.used(), 0);

        let old = texture.relocate(&mut device, Extent2d::new(3, 1)).unwrap();

        assert!(device.is_image_alive(old));
        assert_eq!(texture.extent(), Extent2d::new(3, 1));
        assert_eq!(device.image_pixels(texture.image()).unwrap(), &[1, 2, 0]);
        assert_eq!(texture.generation(), 1);
    }

    #[test]
    fn test_relocate_keeps_usage_and_label() {
        let mut device = DummyDevice::new();
        let desc = ImageDescriptor {
            usage: ImageUsage::SAMPLED | ImageUsage::COPY_DST,
            ..r8(4, 4)
        };
        let mut texture = Texture::new(&mut device, &desc, &SamplerDescriptor::default()).unwrap();

        texture.relocate(&mut device, Extent2d::new(4, 8)).unwrap();

        let created = device.image_descriptor(texture.image()).unwrap();
        assert_eq!(created.usage, ImageUsage::SAMPLED | ImageUsage::COPY_DST);
        assert_eq!(created.label.as_deref(), Some("r8"));
        assert_eq!((created.width, created.height), (4, 8));
        assert_eq!(texture.image_descriptor().height, 8);
    }

    #[test]
    fn test_upload_size_mismatch_is_misuse() {
        let mut device = DummyDevice::new();
        let mut staging = StagingStack::new(&mut device, 64).unwrap();
        let texture = Texture::new(&mut device, &r8(2, 2), &SamplerDescriptor::default()).unwrap();
        let err = texture.upload(&mut device, &mut staging, &[1, 2, 3]).unwrap_err();
        assert!(err.is_misuse());
    }
}
