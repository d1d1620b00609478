use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytemuck::Pod;

use crate::gpu::{BufferBinding, ComputeError, Result};

/// Host function standing in for a compiled kernel entry point.
pub type HostKernelFn = dyn Fn(&mut Invocation<'_>) -> Result<()> + Send + Sync;

/// Named host functions the null backend can "compile" kernels against.
///
/// # Examples
/// ```
/// use dashi_compute::gpu::KernelLibrary;
///
/// let library = KernelLibrary::new().with_kernel("double", |inv| {
///     let i = inv.global_id[0] as usize;
///     if i < inv.len::<u32>(0)? {
///         let v: u32 = inv.read(0, i)?;
///         inv.write(1, i, v * 2)?;
///     }
///     Ok(())
/// });
/// assert!(library.contains("double"));
/// ```
#[derive(Clone, Default)]
pub struct KernelLibrary {
    kernels: HashMap<String, Arc<HostKernelFn>>,
}

impl fmt::Debug for KernelLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.kernels.keys().collect();
        names.sort();
        f.debug_struct("KernelLibrary").field("kernels", &names).finish()
    }
}

impl KernelLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kernel<F>(mut self, name: &str, func: F) -> Self
    where
        F: Fn(&mut Invocation<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.register(name, func);
        self
    }

    pub fn register<F>(&mut self, name: &str, func: F)
    where
        F: Fn(&mut Invocation<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.kernels.insert(name.to_string(), Arc::new(func));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.kernels.contains_key(name)
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<HostKernelFn>> {
        self.kernels.get(name).cloned()
    }
}

/// Parse a host module: one `entry <name>` per line, `#` starts a comment.
///
/// Returns the declared entry point names in order.
pub(crate) fn parse_module(source: &[u8]) -> Result<Vec<String>> {
    let text = std::str::from_utf8(source)
        .map_err(|e| ComputeError::compile(format!("source is not valid UTF-8: {}", e)))?;

    let mut entries = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = match line.find('#') {
            Some(idx) => &line[..idx],
            None => line,
        }
        .trim();
        if line.is_empty() {
            continue;
        }

        let mut words = line.split_whitespace();
        match (words.next(), words.next(), words.next()) {
            (Some("entry"), Some(name), None) if is_identifier(name) => {
                entries.push(name.to_string())
            }
            _ => {
                return Err(ComputeError::compile(format!(
                    "line {}: expected `entry <name>`, found `{}`",
                    line_no + 1,
                    line
                )))
            }
        }
    }

    Ok(entries)
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// One buffer argument as seen from inside a host kernel.
pub(crate) struct SlotView {
    pub slot: u32,
    pub binding: BufferBinding,
    /// Index into the dispatch's memory table.
    pub memory: usize,
}

/// A single kernel invocation executing on the host.
pub struct Invocation<'a> {
    pub global_id: [u32; 3],
    pub group_id: [u32; 3],
    pub local_id: [u32; 3],
    pub group_size: [u32; 3],
    pub(crate) slots: &'a [SlotView],
    pub(crate) memory: &'a mut [Vec<u8>],
}

impl<'a> Invocation<'a> {
    fn slot(&self, slot: u32) -> Result<&SlotView> {
        self.slots
            .iter()
            .find(|s| s.slot == slot)
            .ok_or_else(|| ComputeError::invalid(format!("no buffer bound at slot {}", slot)))
    }

    /// Size in bytes of the buffer bound at `slot`.
    pub fn byte_len(&self, slot: u32) -> Result<usize> {
        let view = self.slot(slot)?;
        Ok(self.memory[view.memory].len())
    }

    /// Number of whole `T` elements in the buffer bound at `slot`.
    pub fn len<T: Pod>(&self, slot: u32) -> Result<usize> {
        Ok(self.byte_len(slot)? / std::mem::size_of::<T>())
    }

    pub fn read<T: Pod>(&self, slot: u32, index: usize) -> Result<T> {
        let view = self.slot(slot)?;
        let bytes = &self.memory[view.memory];
        let size = std::mem::size_of::<T>();
        let start = index
            .checked_mul(size)
            .filter(|start| start + size <= bytes.len())
            .ok_or_else(|| {
                ComputeError::invalid(format!(
                    "read of element {} past the end of slot {} ({} bytes)",
                    index,
                    slot,
                    bytes.len()
                ))
            })?;

        Ok(bytemuck::pod_read_unaligned(&bytes[start..start + size]))
    }

    pub fn write<T: Pod>(&mut self, slot: u32, index: usize, value: T) -> Result<()> {
        let view = self.slot(slot)?;
        if view.binding != BufferBinding::Output {
            return Err(ComputeError::invalid(format!(
                "slot {} is bound as {:?} and cannot be written",
                slot, view.binding
            )));
        }

        let memory = view.memory;
        let bytes = &mut self.memory[memory];
        let size = std::mem::size_of::<T>();
        let start = index
            .checked_mul(size)
            .filter(|start| start + size <= bytes.len())
            .ok_or_else(|| {
                ComputeError::invalid(format!(
                    "write of element {} past the end of slot {}",
                    index, slot
                ))
            })?;

        bytes[start..start + size].copy_from_slice(bytemuck::bytes_of(&value));
        Ok(())
    }
}
