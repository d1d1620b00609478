/// Native API the crate was built against.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Metal,
    D3D11,
    Vulkan,
    /// Host replay backend; records commands and executes them on the CPU.
    Null,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BackendKind::Metal => "Metal",
            BackendKind::D3D11 => "D3D11",
            BackendKind::Vulkan => "Vulkan",
            BackendKind::Null => "Null",
        };
        f.write_str(name)
    }
}

/// How a buffer is laid out for the backend. Fixed at creation.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    /// Small read-only parameter block (uniform / constant buffer).
    Constant,
    /// General read/write storage.
    #[default]
    Structured,
}

/// How a kernel argument slot uses the buffer bound to it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BufferBinding {
    Constant,
    Input,
    Output,
}

impl BufferBinding {
    /// Whether a buffer of `usage` may be bound with this binding kind.
    pub fn accepts(self, usage: BufferUsage) -> bool {
        match self {
            BufferBinding::Constant => usage == BufferUsage::Constant,
            BufferBinding::Input | BufferBinding::Output => usage == BufferUsage::Structured,
        }
    }
}

/// Tag type for buffer handles.
#[derive(Debug)]
pub enum Buffer {}

/// Tag type for kernel handles.
#[derive(Debug)]
pub enum Kernel {}

#[derive(Hash, Clone, Copy, Debug)]
pub struct BufferInfo<'a> {
    pub debug_name: &'a str,
    pub byte_size: usize,
    pub usage: BufferUsage,
    /// Logical element stride. Must evenly divide `byte_size` when set.
    pub element_size: Option<usize>,
    pub initial_data: Option<&'a [u8]>,
}

impl<'a> Default for BufferInfo<'a> {
    fn default() -> Self {
        Self {
            debug_name: "",
            byte_size: 1024,
            usage: BufferUsage::Structured,
            element_size: None,
            initial_data: None,
        }
    }
}

#[derive(Hash, Clone, Copy, Debug)]
pub struct KernelInfo<'a> {
    pub debug_name: &'a str,
    /// Module in the backend's native format (SPIR-V for Vulkan).
    pub source: &'a [u8],
    pub entry_point: &'a str,
}

impl<'a> Default for KernelInfo<'a> {
    fn default() -> Self {
        Self {
            debug_name: "",
            source: &[],
            entry_point: "main",
        }
    }
}

/// What a buffer handle currently refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub byte_size: usize,
    pub usage: BufferUsage,
    pub element_size: Option<usize>,
    /// GPU may have written the buffer since the last host read.
    pub dirty: bool,
}

/// Dispatch limits in API-agnostic terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextLimits {
    pub max_workgroup_size: [u32; 3],
    pub max_workgroup_invocations: u32,
    pub max_workgroup_count: [u32; 3],
    pub max_constant_buffer_size: usize,
    pub max_structured_buffer_size: usize,
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            max_workgroup_size: [1024, 1024, 64],
            max_workgroup_invocations: 1024,
            max_workgroup_count: [65535, 65535, 65535],
            max_constant_buffer_size: 64 * 1024,
            max_structured_buffer_size: 1 << 30,
        }
    }
}
