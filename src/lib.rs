//! # Talus
//!
//! GPU resource lifetime and frame pipelining for a small real-time renderer.
//!
//! ## Overview
//!
//! This crate provides:
//! - [`ResourceArray`] - Growable slot arrays of uniform/storage elements
//! - [`DeferredReclamationQueue`] - Retires old GPU stores once every frame in flight moved on
//! - [`BindingTable`] - Per-frame binding sets, refreshed when a bound resource relocates
//! - [`TextureAtlas`] - Row-packed texture atlas that grows like an array
//! - [`Renderer`] - The wait / drain / record / submit / present loop
//! - Two backends: Vulkan (ash + gpu-allocator) and Dummy (for testing)
//!
//! Resources live in a [`RenderContext`] and are addressed by typed ids. Growth
//! never mutates a store the GPU may still read: a new store is created, the
//! contents are copied, the handle is swapped, and the old store is destroyed
//! through the reclamation queue.
//!
//! ## Example
//!
//! ```ignore
//! use talus::{BindResource, DrawableBuilder, Renderer, RendererConfig, SlotRequest};
//!
//! let mut renderer = Renderer::new(device, &RendererConfig::default())?;
//! let ctx = renderer.context_mut();
//! let objects = ctx.create_array(&ResourceArrayDescriptor::uniform(128))?;
//! let table = ctx.create_binding_table(&layout)?;
//! ctx.bind(table, 0, BindResource::Array(objects))?;
//!
//! let drawable = DrawableBuilder::new(pipeline)
//!     .with_vertex_count(3)
//!     .with_binding(table, &[(objects, SlotRequest::Allocate)])
//!     .build(ctx)?;
//! let scene = vec![drawable];
//!
//! loop {
//!     let frame = renderer.current_frame();
//!     renderer.context_mut().write_pod(objects, frame, scene[0].slot(objects).unwrap(), &uniforms)?;
//!     renderer.tick(dt, &scene)?;
//! }
//! ```

pub mod atlas;
pub mod backend;
pub mod binding;
pub mod config;
pub mod context;
pub mod drawable;
pub mod error;
pub mod frame;
pub mod ids;
pub mod reclaim;
pub mod renderer;
pub mod resources;

// Re-export main types for convenience
pub use atlas::{AtlasDescriptor, AtlasRect, AtlasSpace, PackingParams, TextureAtlas};
pub use backend::{BackendError, BackendResult, DummyDevice, GpuDevice};
#[cfg(all(feature = "vulkan-backend", not(target_arch = "wasm32")))]
pub use backend::vulkan::{VulkanContext, VulkanDevice};
pub use binding::{BindingRef, BindingTable};
pub use config::RendererConfig;
pub use context::{BindResource, RenderContext};
pub use drawable::{DrawBinding, Drawable, DrawableBuilder, DrawableSource, SlotRequest};
pub use error::{GraphicsError, GraphicsResult};
pub use frame::{FrameState, FrameSynchronizer};
pub use ids::{AtlasId, BindingTableId, ResourceArrayId, ResourceKey, TextureId};
pub use reclaim::{DeferredReclamationQueue, DeferredTask, Generation, RetirementState};
pub use renderer::{FrameStats, Renderer};
pub use resources::{ResourceArray, ResourceArrayDescriptor, StagingStack, Texture};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

static_assertions::assert_impl_all!(RenderContext<DummyDevice>: Send);
static_assertions::assert_impl_all!(Renderer<DummyDevice>: Send);
static_assertions::assert_impl_all!(DeferredReclamationQueue<RenderContext<DummyDevice>>: Send);
static_assertions::assert_impl_all!(GraphicsError: Send, Sync);
