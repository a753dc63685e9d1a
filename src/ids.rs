//! Typed ids for resources owned by a [`RenderContext`](crate::RenderContext).

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u64);

        impl $name {
            pub(crate) const KIND: &'static str = $kind;

            pub fn raw(&self) -> u64 {
                self.0
            }

            pub(crate) fn unknown(self) -> $crate::error::GraphicsError {
                $crate::error::GraphicsError::UnknownResource {
                    kind: Self::KIND,
                    id: self.0,
                }
            }
        }
    };
}

define_id!(
    /// Id of a [`ResourceArray`](crate::resources::ResourceArray)
    ResourceArrayId,
    "resource array"
);
define_id!(
    /// Id of a [`Texture`](crate::resources::Texture)
    TextureId,
    "texture"
);
define_id!(
    /// Id of a [`TextureAtlas`](crate::atlas::TextureAtlas)
    AtlasId,
    "atlas"
);
define_id!(
    /// Id of a [`BindingTable`](crate::binding::BindingTable)
    BindingTableId,
    "binding table"
);

/// A resource whose backing store can move and must be rebound when it does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKey {
    Array(ResourceArrayId),
    Texture(TextureId),
}

impl From<ResourceArrayId> for ResourceKey {
    fn from(id: ResourceArrayId) -> Self {
        ResourceKey::Array(id)
    }
}

impl From<TextureId> for ResourceKey {
    fn from(id: TextureId) -> Self {
        ResourceKey::Texture(id)
    }
}
