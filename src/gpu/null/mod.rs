//! Host replay backend.
//!
//! Commands are recorded into a stream exactly as a GPU backend would record
//! them, and only executed, in order, on the CPU when the stream is
//! submitted. Until then "device memory" keeps its old contents, so a read
//! that skips synchronization observes stale data just like it would on
//! hardware. Kernels are host closures registered in a [`KernelLibrary`].

mod kernel;

pub use kernel::{HostKernelFn, Invocation, KernelLibrary};

use std::collections::HashMap;
use std::sync::Arc;

use kernel::{parse_module, SlotView};

use super::{
    Backend, BackendKind, BoundBuffer, BufferBinding, BufferInfo, ComputeError, ContextLimits,
    DispatchGrid, KernelInfo, Result,
};

/// Creation parameters for [`NullBackend`].
#[derive(Debug, Clone, Default)]
pub struct NullInfo {
    pub kernels: KernelLibrary,
    /// Total bytes the device may allocate. `None` means unlimited.
    pub memory_budget: Option<usize>,
    pub limits: ContextLimits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NullBuffer {
    id: u32,
    size: usize,
}

#[derive(Clone)]
pub struct NullKernel {
    entry: String,
    func: Arc<HostKernelFn>,
}

struct RecordedBinding {
    slot: u32,
    binding: BufferBinding,
    buffer: u32,
}

enum NullCommand {
    BindKernel(String),
    Dispatch {
        kernel: NullKernel,
        bindings: Vec<RecordedBinding>,
        grid: DispatchGrid,
    },
    SyncToHost(u32),
}

#[derive(Default)]
pub struct NullStream {
    commands: Vec<NullCommand>,
    in_pass: bool,
}

pub struct NullBackend {
    kernels: KernelLibrary,
    limits: ContextLimits,
    memory_budget: Option<usize>,
    allocated: usize,
    memory: HashMap<u32, Vec<u8>>,
    next_id: u32,
    submissions: u64,
    dispatches: u64,
    host_syncs: u64,
    live_kernels: usize,
}

impl NullBackend {
    /// Streams submitted so far.
    pub fn submissions(&self) -> u64 {
        self.submissions
    }

    /// Dispatches executed so far.
    pub fn dispatches(&self) -> u64 {
        self.dispatches
    }

    /// GPU-to-host synchronizations executed so far.
    pub fn host_syncs(&self) -> u64 {
        self.host_syncs
    }

    /// Bytes currently allocated for buffers.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated
    }

    pub fn live_buffers(&self) -> usize {
        self.memory.len()
    }

    pub fn live_kernels(&self) -> usize {
        self.live_kernels
    }

    fn execute(&mut self, command: NullCommand) -> Result<()> {
        match command {
            NullCommand::BindKernel(entry) => {
                log::trace!("null: bind kernel `{}`", entry);
                Ok(())
            }
            NullCommand::SyncToHost(id) => {
                log::trace!("null: sync buffer {} to host", id);
                self.host_syncs += 1;
                Ok(())
            }
            NullCommand::Dispatch {
                kernel,
                bindings,
                grid,
            } => {
                self.dispatches += 1;
                self.run_dispatch(&kernel, &bindings, &grid)
            }
        }
    }

    fn run_dispatch(
        &mut self,
        kernel: &NullKernel,
        bindings: &[RecordedBinding],
        grid: &DispatchGrid,
    ) -> Result<()> {
        // Pull each distinct buffer out of device memory for the duration of
        // the dispatch; two slots may alias the same buffer.
        let mut ids: Vec<u32> = Vec::new();
        let mut slots = Vec::with_capacity(bindings.len());
        for b in bindings {
            let memory = match ids.iter().position(|&id| id == b.buffer) {
                Some(idx) => idx,
                None => {
                    ids.push(b.buffer);
                    ids.len() - 1
                }
            };
            slots.push(SlotView {
                slot: b.slot,
                binding: b.binding,
                memory,
            });
        }

        let mut memory = Vec::with_capacity(ids.len());
        for &id in &ids {
            match self.memory.remove(&id) {
                Some(bytes) => memory.push(bytes),
                None => {
                    for (id, bytes) in ids.iter().zip(memory.drain(..)) {
                        self.memory.insert(*id, bytes);
                    }
                    return Err(ComputeError::Kernel(format!(
                        "{}: buffer {} was released before the dispatch executed",
                        kernel.entry, id
                    )));
                }
            }
        }

        let res = run_grid(kernel, grid, &slots, &mut memory);

        for (id, bytes) in ids.into_iter().zip(memory) {
            self.memory.insert(id, bytes);
        }
        res
    }
}

fn run_grid(
    kernel: &NullKernel,
    grid: &DispatchGrid,
    slots: &[SlotView],
    memory: &mut [Vec<u8>],
) -> Result<()> {
    let [gx, gy, gz] = grid.groups;
    let [sx, sy, sz] = grid.group_size;

    for group_z in 0..gz {
        for group_y in 0..gy {
            for group_x in 0..gx {
                for local_z in 0..sz {
                    for local_y in 0..sy {
                        for local_x in 0..sx {
                            let mut inv = Invocation {
                                global_id: [
                                    group_x * sx + local_x,
                                    group_y * sy + local_y,
                                    group_z * sz + local_z,
                                ],
                                group_id: [group_x, group_y, group_z],
                                local_id: [local_x, local_y, local_z],
                                group_size: grid.group_size,
                                slots,
                                memory: &mut *memory,
                            };
                            (kernel.func)(&mut inv).map_err(|e| {
                                ComputeError::Kernel(format!(
                                    "{} at {:?}: {}",
                                    kernel.entry, inv.global_id, e
                                ))
                            })?;
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

impl Backend for NullBackend {
    const KIND: BackendKind = BackendKind::Null;

    type Info = NullInfo;
    type Buffer = NullBuffer;
    type Kernel = NullKernel;
    type Stream = NullStream;

    fn create(info: &NullInfo) -> Result<Self> {
        log::info!("null backend created");
        Ok(Self {
            kernels: info.kernels.clone(),
            limits: info.limits,
            memory_budget: info.memory_budget,
            allocated: 0,
            memory: HashMap::new(),
            next_id: 0,
            submissions: 0,
            dispatches: 0,
            host_syncs: 0,
            live_kernels: 0,
        })
    }

    fn destroy(&mut self) {
        debug_assert!(self.memory.is_empty(), "buffers outlived the null backend");
        self.memory.clear();
        self.allocated = 0;
    }

    fn limits(&self) -> ContextLimits {
        self.limits
    }

    fn create_buffer(&mut self, info: &BufferInfo) -> Result<NullBuffer> {
        if let Some(budget) = self.memory_budget {
            if self.allocated + info.byte_size > budget {
                return Err(ComputeError::OutOfMemory);
            }
        }

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.memory.insert(id, vec![0; info.byte_size]);
        self.allocated += info.byte_size;

        Ok(NullBuffer {
            id,
            size: info.byte_size,
        })
    }

    fn destroy_buffer(&mut self, buffer: NullBuffer) {
        if self.memory.remove(&buffer.id).is_some() {
            self.allocated -= buffer.size;
        }
    }

    fn read_buffer(&mut self, buffer: &mut NullBuffer, offset: usize, dst: &mut [u8]) -> Result<()> {
        let bytes = self
            .memory
            .get(&buffer.id)
            .ok_or_else(|| ComputeError::invalid(format!("null buffer {} is gone", buffer.id)))?;
        dst.copy_from_slice(&bytes[offset..offset + dst.len()]);
        Ok(())
    }

    fn write_buffer(&mut self, buffer: &mut NullBuffer, offset: usize, src: &[u8]) -> Result<()> {
        let bytes = self
            .memory
            .get_mut(&buffer.id)
            .ok_or_else(|| ComputeError::invalid(format!("null buffer {} is gone", buffer.id)))?;
        bytes[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn create_kernel(&mut self, info: &KernelInfo) -> Result<NullKernel> {
        let entries = parse_module(info.source)?;
        if !entries.iter().any(|e| e == info.entry_point) {
            return Err(ComputeError::EntryPointNotFound(info.entry_point.to_string()));
        }

        let func = self
            .kernels
            .get(info.entry_point)
            .ok_or_else(|| ComputeError::EntryPointNotFound(info.entry_point.to_string()))?;

        self.live_kernels += 1;
        Ok(NullKernel {
            entry: info.entry_point.to_string(),
            func,
        })
    }

    fn destroy_kernel(&mut self, _kernel: NullKernel) {
        self.live_kernels -= 1;
    }

    fn check_binding(&self, _kernel: &NullKernel, _slot: u32, _binding: BufferBinding) -> Result<()> {
        // Host kernels discover their arguments at run time.
        Ok(())
    }

    fn begin_stream(&mut self) -> Result<NullStream> {
        Ok(NullStream::default())
    }

    fn begin_compute_pass(&mut self, stream: &mut NullStream) -> Result<()> {
        debug_assert!(!stream.in_pass);
        stream.in_pass = true;
        Ok(())
    }

    fn end_compute_pass(&mut self, stream: &mut NullStream) {
        debug_assert!(stream.in_pass);
        stream.in_pass = false;
    }

    fn bind_kernel(&mut self, stream: &mut NullStream, kernel: &NullKernel) {
        stream.commands.push(NullCommand::BindKernel(kernel.entry.clone()));
    }

    fn dispatch(
        &mut self,
        stream: &mut NullStream,
        kernel: &NullKernel,
        bindings: &[BoundBuffer<'_, Self>],
        grid: &DispatchGrid,
    ) -> Result<()> {
        if !stream.in_pass {
            return Err(ComputeError::invalid("dispatch recorded outside a compute pass"));
        }

        stream.commands.push(NullCommand::Dispatch {
            kernel: kernel.clone(),
            bindings: bindings
                .iter()
                .map(|b| RecordedBinding {
                    slot: b.slot,
                    binding: b.binding,
                    buffer: b.buffer.id,
                })
                .collect(),
            grid: *grid,
        });
        Ok(())
    }

    fn make_gpu_writes_visible_to_host(&mut self, stream: &mut NullStream, buffer: &NullBuffer) {
        debug_assert!(!stream.in_pass);
        stream.commands.push(NullCommand::SyncToHost(buffer.id));
    }

    fn submit_and_wait(&mut self, stream: NullStream) -> Result<()> {
        self.submissions += 1;
        for command in stream.commands {
            self.execute(command)?;
        }
        Ok(())
    }
}
