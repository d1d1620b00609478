//! A small compute abstraction: buffers, kernels and dispatches over one
//! GPU queue, with host/device synchronization handled by the [`Context`].
//!
//! The backend is chosen at build time. `dashi-vulkan` (default) drives a
//! Vulkan device; `dashi-null` swaps in a host backend that runs kernels
//! registered as Rust closures.

pub mod gpu;
pub mod logging;
pub mod utils;

pub use gpu::*;
pub use utils::Handle;
