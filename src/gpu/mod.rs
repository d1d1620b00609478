pub mod context;
pub mod dispatch;
pub mod error;
pub mod null;
pub mod state;
pub mod structs;
#[cfg(feature = "dashi-vulkan")]
pub mod vulkan;

pub use context::Context;
pub use dispatch::{group_count, DispatchGrid};
pub use error::*;
pub use null::{Invocation, KernelLibrary, NullBackend, NullInfo};
pub use state::EncoderState;
pub use structs::*;
#[cfg(feature = "dashi-vulkan")]
pub use vulkan::{DeviceSelection, VulkanBackend, VulkanInfo};

/// Backend compiled in as the default for [`Context`].
#[cfg(all(feature = "dashi-vulkan", not(feature = "dashi-null")))]
pub type ActiveBackend = vulkan::VulkanBackend;

/// Backend compiled in as the default for [`Context`].
#[cfg(any(not(feature = "dashi-vulkan"), feature = "dashi-null"))]
pub type ActiveBackend = null::NullBackend;

/// A buffer argument resolved for one dispatch.
pub struct BoundBuffer<'a, B: Backend> {
    pub slot: u32,
    pub binding: BufferBinding,
    pub buffer: &'a B::Buffer,
}

/// Defines the interface that compute backends must implement.
///
/// A backend wraps one native API. [`Context`] drives it and owns all the
/// bookkeeping (handles, dirty flags, encoder state), so implementations
/// only translate each call into native commands.
///
/// Stream calls arrive in the order enforced by [`EncoderState`]:
/// `begin_stream`, then any number of compute passes (`begin_compute_pass`,
/// `bind_kernel`/`dispatch`..., `end_compute_pass`) interleaved with
/// `make_gpu_writes_visible_to_host`, then `submit_and_wait`.
pub trait Backend: Sized {
    const KIND: BackendKind;

    /// Creation parameters.
    type Info: Default;
    type Buffer;
    type Kernel;
    /// One recorded-but-not-submitted command stream.
    type Stream;

    fn create(info: &Self::Info) -> Result<Self>;

    /// Release the device. Every buffer and kernel has been destroyed and
    /// no stream is open when this is called.
    fn destroy(&mut self);

    fn limits(&self) -> ContextLimits;

    fn create_buffer(&mut self, info: &BufferInfo) -> Result<Self::Buffer>;
    fn destroy_buffer(&mut self, buffer: Self::Buffer);

    /// Copy out of device memory. Callers have already made GPU writes
    /// visible; the range is in bounds.
    fn read_buffer(&mut self, buffer: &mut Self::Buffer, offset: usize, dst: &mut [u8])
        -> Result<()>;

    /// Copy into device memory and publish the written range to the device.
    fn write_buffer(&mut self, buffer: &mut Self::Buffer, offset: usize, src: &[u8]) -> Result<()>;

    fn create_kernel(&mut self, info: &KernelInfo) -> Result<Self::Kernel>;
    fn destroy_kernel(&mut self, kernel: Self::Kernel);

    /// Check that `kernel` has an argument at `slot` that accepts `binding`.
    fn check_binding(&self, kernel: &Self::Kernel, slot: u32, binding: BufferBinding)
        -> Result<()>;

    fn begin_stream(&mut self) -> Result<Self::Stream>;
    fn begin_compute_pass(&mut self, stream: &mut Self::Stream) -> Result<()>;
    fn end_compute_pass(&mut self, stream: &mut Self::Stream);

    fn bind_kernel(&mut self, stream: &mut Self::Stream, kernel: &Self::Kernel);

    /// Record one dispatch of `kernel` with exactly `bindings` as arguments.
    fn dispatch(
        &mut self,
        stream: &mut Self::Stream,
        kernel: &Self::Kernel,
        bindings: &[BoundBuffer<'_, Self>],
        grid: &DispatchGrid,
    ) -> Result<()>;

    /// Record whatever blit/barrier makes prior GPU writes to `buffer`
    /// readable by the host once the stream completes. Only called outside
    /// a compute pass.
    fn make_gpu_writes_visible_to_host(&mut self, stream: &mut Self::Stream, buffer: &Self::Buffer);

    /// Submit the stream and block until the device has finished it.
    fn submit_and_wait(&mut self, stream: Self::Stream) -> Result<()>;
}
