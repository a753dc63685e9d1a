//! Common types shared between backends

use bitflags::bitflags;

use crate::backend::traits::{BufferHandle, ImageHandle, SamplerHandle};

bitflags! {
    /// Buffer usage flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const COPY_SRC = 1 << 4;
        const COPY_DST = 1 << 5;
        /// Memory is mapped and writable from the CPU.
        const HOST_VISIBLE = 1 << 6;
    }
}

bitflags! {
    /// Image usage flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        const SAMPLED = 1 << 0;
        const COPY_SRC = 1 << 1;
        const COPY_DST = 1 << 2;
    }
}

/// Buffer descriptor
#[derive(Debug, Clone)]
pub struct BufferDescriptor {
    pub label: Option<String>,
    pub size: u64,
    pub usage: BufferUsage,
}

impl BufferDescriptor {
    pub fn new(label: impl Into<String>, size: u64, usage: BufferUsage) -> Self {
        Self {
            label: Some(label.into()),
            size,
            usage,
        }
    }

    pub fn is_host_visible(&self) -> bool {
        self.usage.contains(BufferUsage::HOST_VISIBLE)
    }
}

/// Texture format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    R8Unorm,
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
}

impl TextureFormat {
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            TextureFormat::R8Unorm => 1,
            TextureFormat::Rgba8Unorm
            | TextureFormat::Rgba8UnormSrgb
            | TextureFormat::Bgra8Unorm => 4,
        }
    }
}

/// Image descriptor. Images are always 2D with a single mip level.
#[derive(Debug, Clone)]
pub struct ImageDescriptor {
    pub label: Option<String>,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub usage: ImageUsage,
}

impl Default for ImageDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            width: 1,
            height: 1,
            format: TextureFormat::Rgba8Unorm,
            usage: ImageUsage::SAMPLED | ImageUsage::COPY_DST | ImageUsage::COPY_SRC,
        }
    }
}

impl ImageDescriptor {
    pub fn byte_size(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.format.bytes_per_pixel() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    ClampToEdge,
    Repeat,
    MirrorRepeat,
}

/// Sampler descriptor
#[derive(Debug, Clone)]
pub struct SamplerDescriptor {
    pub label: Option<String>,
    pub mag_filter: FilterMode,
    pub min_filter: FilterMode,
    pub address_mode: AddressMode,
}

impl Default for SamplerDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::Linear,
            address_mode: AddressMode::ClampToEdge,
        }
    }
}

/// Region of a buffer-to-buffer copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCopy {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

/// Tightly packed pixels at `buffer_offset` copied into an image rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferImageCopy {
    pub buffer_offset: u64,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent2d {
    pub width: u32,
    pub height: u32,
}

impl Extent2d {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Component-wise minimum, the region shared by two images.
    pub fn min(self, other: Self) -> Self {
        Self {
            width: self.width.min(other.width),
            height: self.height.min(other.height),
        }
    }
}

/// Limits the resource layer needs from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    pub min_uniform_offset_alignment: u64,
    pub min_storage_offset_alignment: u64,
    pub max_image_dimension: u32,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            min_uniform_offset_alignment: 256,
            min_storage_offset_alignment: 64,
            max_image_dimension: 16384,
        }
    }
}

/// Index format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

impl IndexFormat {
    pub fn size(&self) -> u64 {
        match self {
            IndexFormat::Uint16 => 2,
            IndexFormat::Uint32 => 4,
        }
    }
}

/// What a binding point in a binding set holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    /// Uniform buffer addressed with a dynamic offset per draw.
    UniformArray,
    /// Storage buffer addressed with a dynamic offset per draw.
    StorageArray,
    /// Plain uniform buffer.
    Uniform,
    /// Sampled image with its sampler.
    CombinedImageSampler,
}

impl BindingKind {
    /// Whether binding this kind consumes one dynamic index at draw time.
    pub fn is_dynamic(&self) -> bool {
        matches!(self, BindingKind::UniformArray | BindingKind::StorageArray)
    }

    pub fn is_buffer(&self) -> bool {
        !matches!(self, BindingKind::CombinedImageSampler)
    }
}

/// Binding point entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingEntry {
    pub binding: u32,
    pub kind: BindingKind,
}

/// Shape of a binding set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingLayout {
    pub label: Option<String>,
    entries: Vec<BindingEntry>,
}

impl BindingLayout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Add a binding point. Entries are kept sorted by binding index.
    pub fn with_entry(mut self, binding: u32, kind: BindingKind) -> Self {
        self.entries.retain(|e| e.binding != binding);
        self.entries.push(BindingEntry { binding, kind });
        self.entries.sort_by_key(|e| e.binding);
        self
    }

    pub fn entries(&self) -> &[BindingEntry] {
        &self.entries
    }

    pub fn entry(&self, binding: u32) -> Option<&BindingEntry> {
        self.entries.iter().find(|e| e.binding == binding)
    }

    /// Number of bindings that take a dynamic index at draw time.
    pub fn dynamic_count(&self) -> usize {
        self.entries.iter().filter(|e| e.kind.is_dynamic()).count()
    }
}

/// A resource as written into one copy of a binding set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Descriptor {
    Buffer {
        buffer: BufferHandle,
        offset: u64,
        range: u64,
    },
    ImageSampler {
        image: ImageHandle,
        sampler: SamplerHandle,
    },
}
