use std::fmt;

#[cfg(feature = "dashi-vulkan")]
#[derive(Debug)]
pub struct VulkanError {
    res: ash::vk::Result,
}

#[cfg(feature = "dashi-vulkan")]
impl VulkanError {
    pub fn code(&self) -> ash::vk::Result {
        self.res
    }
}

#[cfg(feature = "dashi-vulkan")]
impl fmt::Display for VulkanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Vulkan Error: {}", self.res)
    }
}

#[derive(Debug)]
pub enum ComputeError {
    /// A precondition was violated: out-of-range transfer, stale handle,
    /// operation issued in the wrong encoder state, bad dispatch shape.
    InvalidArgument(String),
    /// No device with compute support could be opened.
    NoDevice,
    /// The device rejected an allocation.
    OutOfMemory,
    /// The kernel source could not be turned into a backend module.
    Compile { message: String },
    /// The module compiled but does not export the requested entry point.
    EntryPointNotFound(String),
    /// A host kernel reported a failure while the stream was executing.
    Kernel(String),
    #[cfg(feature = "dashi-vulkan")]
    VulkanError(VulkanError),
    #[cfg(feature = "dashi-vulkan")]
    LoadingError(ash::LoadingError),
}

/// Convenient crate-wide result type.
pub type Result<T, E = ComputeError> = std::result::Result<T, E>;

impl ComputeError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        ComputeError::InvalidArgument(msg.into())
    }

    pub(crate) fn compile(msg: impl Into<String>) -> Self {
        ComputeError::Compile {
            message: msg.into(),
        }
    }
}

impl fmt::Display for ComputeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            ComputeError::NoDevice => write!(f, "no compatible compute device available"),
            ComputeError::OutOfMemory => write!(f, "device out of memory"),
            ComputeError::Compile { message } => write!(f, "kernel compilation failed: {}", message),
            ComputeError::EntryPointNotFound(name) => {
                write!(f, "entry point `{}` not found in kernel module", name)
            }
            ComputeError::Kernel(msg) => write!(f, "kernel execution failed: {}", msg),
            #[cfg(feature = "dashi-vulkan")]
            ComputeError::VulkanError(err) => err.fmt(f),
            #[cfg(feature = "dashi-vulkan")]
            ComputeError::LoadingError(err) => write!(f, "failed to load Vulkan: {}", err),
        }
    }
}

impl std::error::Error for ComputeError {}

#[cfg(feature = "dashi-vulkan")]
impl From<ash::vk::Result> for ComputeError {
    fn from(res: ash::vk::Result) -> Self {
        match res {
            ash::vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            | ash::vk::Result::ERROR_OUT_OF_HOST_MEMORY => ComputeError::OutOfMemory,
            _ => ComputeError::VulkanError(VulkanError { res }),
        }
    }
}

#[cfg(feature = "dashi-vulkan")]
impl From<ash::LoadingError> for ComputeError {
    fn from(res: ash::LoadingError) -> Self {
        ComputeError::LoadingError(res)
    }
}
