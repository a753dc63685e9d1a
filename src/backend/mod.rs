//! Backend abstraction layer
//!
//! Provides the device trait and the types both backends share.

pub mod dummy;
pub mod traits;
pub mod types;

// Vulkan backend is only available on native platforms
#[cfg(all(feature = "vulkan-backend", not(target_arch = "wasm32")))]
pub mod vulkan;

pub use dummy::{DeviceEvent, DummyDevice, RecordedCommand};
pub use traits::*;
pub use types::*;
