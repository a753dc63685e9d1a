//! Core backend abstraction traits
//!
//! [`GpuDevice`] is the interface both the dummy and the Vulkan backend
//! implement. Everything above it (arrays, atlases, binding tables, the
//! renderer) talks to the GPU only through this trait.

use crate::backend::types::*;
use thiserror::Error;

/// Backend error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Failed to initialize backend: {0}")]
    InitializationFailed(String),
    #[error("Failed to create buffer: {0}")]
    BufferCreationFailed(String),
    #[error("Failed to create texture: {0}")]
    TextureCreationFailed(String),
    #[error("Failed to create binding set: {0}")]
    BindingSetCreationFailed(String),
    #[error("Failed to create sync object: {0}")]
    SyncCreationFailed(String),
    #[error("Failed to record commands: {0}")]
    RecordingFailed(String),
    #[error("Failed to submit: {0}")]
    SubmitFailed(String),
    #[error("Failed to acquire next image: {0}")]
    AcquireImageFailed(String),
    #[error("Failed to present: {0}")]
    PresentFailed(String),
    #[error("Buffer is not host visible")]
    NotHostVisible,
    #[error("Invalid {0} handle {1}")]
    InvalidHandle(&'static str, u64),
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
}

pub type BackendResult<T> = Result<T, BackendError>;

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u64);

        impl $name {
            /// Backend-specific raw id.
            pub fn raw(&self) -> u64 {
                self.0
            }
        }
    };
}

define_handle!(
    /// Handle to a GPU buffer
    BufferHandle
);
define_handle!(
    /// Handle to a 2D image
    ImageHandle
);
define_handle!(
    /// Handle to a sampler
    SamplerHandle
);
define_handle!(
    /// Handle to a binding set with one copy per frame slot
    BindingSetHandle
);
define_handle!(
    /// Handle to a CPU-GPU fence
    FenceHandle
);
define_handle!(
    /// Handle to a GPU-GPU semaphore
    SemaphoreHandle
);
define_handle!(
    /// Handle to a reusable command list
    CommandListHandle
);
define_handle!(
    /// Handle to a graphics pipeline registered by the embedding application
    PipelineHandle
);

/// Device abstraction consumed by the resource layer.
///
/// Transfer operations (`copy_*`) are one-shot: they record, submit and block
/// until the copy has completed. Fence waits never time out.
pub trait GpuDevice {
    /// Backend name for logging.
    fn name(&self) -> &'static str;

    /// Alignment and size limits.
    fn limits(&self) -> DeviceLimits;

    /// Number of presentable swapchain images.
    fn swapchain_image_count(&self) -> u32;

    // Buffers

    /// Create a buffer. Host-visible buffers start zero-filled.
    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle>;

    /// Destroy a buffer
    fn destroy_buffer(&mut self, buffer: BufferHandle);

    /// Mapped memory of a host-visible buffer.
    fn buffer_memory(&self, buffer: BufferHandle) -> BackendResult<&[u8]>;

    /// Mutable mapped memory of a host-visible buffer.
    fn buffer_memory_mut(&mut self, buffer: BufferHandle) -> BackendResult<&mut [u8]>;

    /// Copy regions between two buffers and wait for completion.
    fn copy_buffer(
        &mut self,
        src: BufferHandle,
        dst: BufferHandle,
        regions: &[BufferCopy],
    ) -> BackendResult<()>;

    // Images

    /// Create an image, ready to be sampled.
    fn create_image(&mut self, desc: &ImageDescriptor) -> BackendResult<ImageHandle>;

    /// Destroy an image
    fn destroy_image(&mut self, image: ImageHandle);

    /// Copy the top-left `extent` of `src` into `dst` and wait for completion.
    fn copy_image(
        &mut self,
        src: ImageHandle,
        dst: ImageHandle,
        extent: Extent2d,
    ) -> BackendResult<()>;

    /// Upload all regions in one batched transfer and wait for completion.
    fn copy_buffer_to_image(
        &mut self,
        src: BufferHandle,
        dst: ImageHandle,
        regions: &[BufferImageCopy],
    ) -> BackendResult<()>;

    /// Create a sampler
    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle>;

    /// Destroy a sampler
    fn destroy_sampler(&mut self, sampler: SamplerHandle);

    // Binding sets

    /// Create a binding set with `copies` independent copies, one per frame slot.
    fn create_binding_set(
        &mut self,
        layout: &BindingLayout,
        copies: u32,
    ) -> BackendResult<BindingSetHandle>;

    /// Write one binding point of one copy.
    fn write_binding(
        &mut self,
        set: BindingSetHandle,
        copy: u32,
        binding: u32,
        descriptor: &Descriptor,
    ) -> BackendResult<()>;

    /// Destroy a binding set and all its copies
    fn destroy_binding_set(&mut self, set: BindingSetHandle);

    // Synchronization

    /// Create a fence, optionally already signaled.
    fn create_fence(&mut self, signaled: bool) -> BackendResult<FenceHandle>;

    /// Block until the fence is signaled.
    fn wait_fence(&mut self, fence: FenceHandle) -> BackendResult<()>;

    /// Return the fence to the unsignaled state.
    fn reset_fence(&mut self, fence: FenceHandle) -> BackendResult<()>;

    /// Destroy a fence
    fn destroy_fence(&mut self, fence: FenceHandle);

    /// Create a binary semaphore
    fn create_semaphore(&mut self) -> BackendResult<SemaphoreHandle>;

    /// Destroy a semaphore
    fn destroy_semaphore(&mut self, semaphore: SemaphoreHandle);

    // Command recording

    /// Allocate a reusable command list.
    fn create_command_list(&mut self) -> BackendResult<CommandListHandle>;

    /// Reset the list and begin rendering into swapchain image `image_index`,
    /// cleared to `clear_color` (linear RGBA).
    fn begin_commands(
        &mut self,
        list: CommandListHandle,
        image_index: u32,
        clear_color: [f32; 4],
    ) -> BackendResult<()>;

    /// Bind a graphics pipeline
    fn cmd_bind_pipeline(&mut self, list: CommandListHandle, pipeline: PipelineHandle);

    /// Bind a vertex buffer to a slot
    fn cmd_bind_vertex_buffer(
        &mut self,
        list: CommandListHandle,
        slot: u32,
        buffer: BufferHandle,
        offset: u64,
    );

    /// Bind an index buffer
    fn cmd_bind_index_buffer(
        &mut self,
        list: CommandListHandle,
        buffer: BufferHandle,
        format: IndexFormat,
    );

    /// Bind copy `copy` of a binding set at `set_index` with dynamic offsets in
    /// ascending binding order.
    fn cmd_bind_binding_set(
        &mut self,
        list: CommandListHandle,
        pipeline: PipelineHandle,
        set_index: u32,
        set: BindingSetHandle,
        copy: u32,
        dynamic_offsets: &[u32],
    );

    /// Draw primitives
    fn cmd_draw(&mut self, list: CommandListHandle, vertex_count: u32, instance_count: u32);

    /// Draw indexed primitives
    fn cmd_draw_indexed(&mut self, list: CommandListHandle, index_count: u32, instance_count: u32);

    /// Finish rendering and close the list.
    fn end_commands(&mut self, list: CommandListHandle) -> BackendResult<()>;

    // Submission

    /// Submit on the graphics queue. Waits on `wait`, signals `signal` and `fence`.
    fn submit(
        &mut self,
        list: CommandListHandle,
        wait: SemaphoreHandle,
        signal: SemaphoreHandle,
        fence: FenceHandle,
    ) -> BackendResult<()>;

    /// Acquire the next swapchain image, signaling `signal` when it is ready.
    fn acquire_next_image(&mut self, signal: SemaphoreHandle) -> BackendResult<u32>;

    /// Present a swapchain image once `wait` is signaled.
    fn present(&mut self, image_index: u32, wait: SemaphoreHandle) -> BackendResult<()>;

    /// Block until the device has no outstanding work.
    fn wait_idle(&mut self) -> BackendResult<()>;
}
