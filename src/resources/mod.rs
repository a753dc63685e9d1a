//! Resource management
//!
//! GPU-visible storage that lives longer than a frame: growable slot arrays,
//! the staging stack used for uploads, sampled textures and static geometry.

pub mod array;
pub mod geometry;
pub mod staging;
pub mod texture;

pub use array::{ArrayKind, ResourceArray, ResourceArrayDescriptor, SlotAllocation};
pub use geometry::{IndexBuffer, IndexData, VertexBuffer};
pub use staging::{StagingMarker, StagingSpan, StagingStack};
pub use texture::Texture;

/// Round `value` up to the next multiple of `alignment` (a power of two or zero).
#[inline]
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
        assert_eq!(align_up(13, 0), 13);
        assert_eq!(align_up(13, 1), 13);
    }
}
