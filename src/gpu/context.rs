use bytemuck::{Pod, Zeroable};

use super::state::CommandController;
use super::{
    ActiveBackend, Backend, BackendKind, BoundBuffer, Buffer, BufferBinding, BufferDesc,
    BufferInfo, BufferUsage, ComputeError, ContextLimits, DispatchGrid, EncoderState, Kernel,
    KernelInfo, Result,
};
use crate::utils::{Handle, Pool};

struct BufferRecord<B: Backend> {
    raw: B::Buffer,
    desc: BufferDesc,
    debug_name: String,
    /// Serial of the last stream that referenced the buffer.
    last_use: u64,
}

struct KernelRecord<B: Backend> {
    raw: B::Kernel,
    entry_point: String,
    last_use: u64,
}

#[derive(Debug, Clone, Copy)]
struct SlotBinding {
    slot: u32,
    binding: BufferBinding,
    buffer: Handle<Buffer>,
}

/// Resources deleted while the open stream still referenced them.
enum PendingRelease<B: Backend> {
    Buffer(B::Buffer),
    Kernel(B::Kernel),
}

/// Owns the device, its queue and every buffer/kernel created through it.
///
/// Work is recorded with "bind, bind, dispatch" calls; the context opens and
/// closes the underlying command stream itself. Reading a buffer that a
/// dispatch may have written drains the stream first, so host reads always
/// observe completed GPU work.
///
/// The backend is fixed at compile time: [`ActiveBackend`] unless a
/// backend type is named explicitly.
///
/// # Examples
/// ```
/// use dashi_compute::gpu::*;
///
/// let library = KernelLibrary::new().with_kernel("square", |inv| {
///     let i = inv.global_id[0] as usize;
///     if i < inv.len::<u32>(0)? {
///         let v: u32 = inv.read(0, i)?;
///         inv.write(1, i, v * v)?;
///     }
///     Ok(())
/// });
/// let mut ctx = Context::<NullBackend>::new(&NullInfo {
///     kernels: library,
///     ..Default::default()
/// })?;
///
/// let input = ctx.create_buffer(16, BufferUsage::Structured)?;
/// let output = ctx.create_buffer(16, BufferUsage::Structured)?;
/// ctx.write_slice(input, &[1u32, 2, 3, 4], 0)?;
///
/// let kernel = ctx.create_kernel(b"entry square", "square")?;
/// ctx.set_kernel(kernel)?;
/// ctx.set_kernel_buffer(input, 0, BufferBinding::Input)?;
/// ctx.set_kernel_buffer(output, 1, BufferBinding::Output)?;
/// ctx.dispatch([4, 1, 1], [64, 1, 1])?;
///
/// assert_eq!(ctx.read_vec::<u32>(output, 4, 0)?, vec![1, 4, 9, 16]);
/// ctx.destroy()?;
/// # Ok::<(), ComputeError>(())
/// ```
pub struct Context<B: Backend = ActiveBackend> {
    backend: B,
    controller: CommandController<B>,
    buffers: Pool<BufferRecord<B>, Buffer>,
    kernels: Pool<KernelRecord<B>, Kernel>,
    current_kernel: Option<Handle<Kernel>>,
    slots: Vec<SlotBinding>,
    release_queue: Vec<PendingRelease<B>>,
    limits: ContextLimits,
    destroyed: bool,
}

fn check_range(what: &str, offset: usize, len: usize, size: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(ComputeError::invalid(format!(
            "{} of {} bytes at offset {} overruns buffer of {} bytes",
            what, len, offset, size
        ))),
    }
}

impl<B: Backend> Context<B> {
    /// Open the device described by `info`.
    pub fn new(info: &B::Info) -> Result<Self> {
        let backend = B::create(info).map_err(|err| {
            log::error!("failed to create {} context: {}", B::KIND, err);
            err
        })?;
        let limits = backend.limits();
        log::debug!("{} context created ({:?})", B::KIND, limits);

        Ok(Self {
            backend,
            controller: CommandController::default(),
            buffers: Default::default(),
            kernels: Default::default(),
            current_kernel: None,
            slots: Vec::new(),
            release_queue: Vec::new(),
            limits,
            destroyed: false,
        })
    }

    /// Open the default device.
    pub fn create() -> Result<Self> {
        Self::new(&Default::default())
    }

    /// Drain outstanding work, release every resource still alive, then the
    /// device itself.
    ///
    /// The returned error, if any, comes from draining; teardown still
    /// completes.
    pub fn destroy(mut self) -> Result<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        let res = self.finish_work();

        let buffers = self.buffers.drain();
        let kernels = self.kernels.drain();
        if !buffers.is_empty() || !kernels.is_empty() {
            log::debug!(
                "releasing {} buffer(s) and {} kernel(s) still alive at teardown",
                buffers.len(),
                kernels.len()
            );
        }
        for record in buffers {
            self.backend.destroy_buffer(record.raw);
        }
        for record in kernels {
            self.backend.destroy_kernel(record.raw);
        }

        self.backend.destroy();
        self.destroyed = true;
        log::debug!("{} context destroyed", B::KIND);
        res
    }

    /// The backend compiled into this context.
    pub fn backend(&self) -> BackendKind {
        B::KIND
    }

    /// Backend implementation, for backend-specific queries.
    pub fn device(&self) -> &B {
        &self.backend
    }

    pub fn limits(&self) -> ContextLimits {
        self.limits
    }

    pub fn encoder_state(&self) -> EncoderState {
        self.controller.state()
    }

    ////////////////////////////////////////////////////////////////////////
    // Buffers

    pub fn create_buffer(&mut self, size: usize, usage: BufferUsage) -> Result<Handle<Buffer>> {
        self.make_buffer(&BufferInfo {
            byte_size: size,
            usage,
            ..Default::default()
        })
    }

    /// Like [`Self::create_buffer`], recording a per-element stride.
    pub fn create_structured_buffer(
        &mut self,
        size: usize,
        usage: BufferUsage,
        element_size: usize,
    ) -> Result<Handle<Buffer>> {
        self.make_buffer(&BufferInfo {
            byte_size: size,
            usage,
            element_size: Some(element_size),
            ..Default::default()
        })
    }

    pub fn make_buffer(&mut self, info: &BufferInfo) -> Result<Handle<Buffer>> {
        if info.byte_size == 0 {
            return Err(ComputeError::invalid("buffer size must be non-zero"));
        }

        if let Some(stride) = info.element_size {
            if stride == 0 || info.byte_size % stride != 0 {
                return Err(ComputeError::invalid(format!(
                    "element size {} does not evenly divide buffer size {}",
                    stride, info.byte_size
                )));
            }
        }

        let max = match info.usage {
            BufferUsage::Constant => self.limits.max_constant_buffer_size,
            BufferUsage::Structured => self.limits.max_structured_buffer_size,
        };
        if info.byte_size > max {
            return Err(ComputeError::invalid(format!(
                "{:?} buffer of {} bytes exceeds the device limit of {}",
                info.usage, info.byte_size, max
            )));
        }

        if let Some(data) = info.initial_data {
            check_range("initial data", 0, data.len(), info.byte_size)?;
        }

        let raw = self.backend.create_buffer(info).map_err(|err| {
            log::error!(
                "failed to create buffer `{}` ({} bytes): {}",
                info.debug_name,
                info.byte_size,
                err
            );
            err
        })?;

        let record = BufferRecord {
            raw,
            desc: BufferDesc {
                byte_size: info.byte_size,
                usage: info.usage,
                element_size: info.element_size,
                dirty: false,
            },
            debug_name: info.debug_name.to_string(),
            last_use: 0,
        };

        let handle = match self.buffers.insert(record) {
            Some(handle) => handle,
            None => return Err(ComputeError::invalid("buffer handle space exhausted")),
        };

        if let Some(data) = info.initial_data {
            if let Err(err) = self.write_buffer(handle, data, 0) {
                log::error!("failed to upload initial data for `{}`: {}", info.debug_name, err);
                if let Some(record) = self.buffers.take(handle) {
                    self.backend.destroy_buffer(record.raw);
                }
                return Err(err);
            }
        }

        Ok(handle)
    }

    /// Release a buffer.
    ///
    /// When the stream that is still recording references the buffer, the
    /// memory is kept until that stream completes. The handle is invalid
    /// immediately either way.
    pub fn delete_buffer(&mut self, buffer: Handle<Buffer>) -> Result<()> {
        let record = self
            .buffers
            .take(buffer)
            .ok_or_else(|| ComputeError::invalid("delete of an unknown buffer handle"))?;

        if self.controller.references(record.last_use) {
            log::debug!(
                "buffer `{}` still referenced by stream {}; release deferred",
                record.debug_name,
                record.last_use
            );
            self.release_queue.push(PendingRelease::Buffer(record.raw));
        } else {
            self.backend.destroy_buffer(record.raw);
        }

        Ok(())
    }

    pub fn buffer_info(&self, buffer: Handle<Buffer>) -> Result<BufferDesc> {
        self.buffers
            .get_ref(buffer)
            .map(|r| r.desc)
            .ok_or_else(|| ComputeError::invalid("unknown buffer handle"))
    }

    /// Copy `dst.len()` bytes starting at `src_offset` out of the buffer.
    ///
    /// If a dispatch may have written the buffer since it was last read, the
    /// open stream is finished first and this call blocks until the device
    /// completes it. Otherwise the copy happens immediately.
    pub fn read_buffer(
        &mut self,
        buffer: Handle<Buffer>,
        dst: &mut [u8],
        src_offset: usize,
    ) -> Result<()> {
        let desc = self.buffer_info(buffer)?;
        check_range("read", src_offset, dst.len(), desc.byte_size)?;

        if desc.dirty {
            self.make_gpu_writes_visible(buffer)?;
        }

        let record = self
            .buffers
            .get_mut_ref(buffer)
            .ok_or_else(|| ComputeError::invalid("unknown buffer handle"))?;
        self.backend.read_buffer(&mut record.raw, src_offset, dst)
    }

    /// Copy `src` into the buffer at `dst_offset`. Never waits on the device.
    pub fn write_buffer(&mut self, buffer: Handle<Buffer>, src: &[u8], dst_offset: usize) -> Result<()> {
        let record = self
            .buffers
            .get_mut_ref(buffer)
            .ok_or_else(|| ComputeError::invalid("unknown buffer handle"))?;
        check_range("write", dst_offset, src.len(), record.desc.byte_size)?;

        self.backend.write_buffer(&mut record.raw, dst_offset, src)
    }

    pub fn write_slice<T: Pod>(&mut self, buffer: Handle<Buffer>, data: &[T], dst_offset: usize) -> Result<()> {
        self.write_buffer(buffer, bytemuck::cast_slice(data), dst_offset)
    }

    /// Read `count` elements of `T` starting at byte `src_offset`.
    pub fn read_vec<T: Pod>(
        &mut self,
        buffer: Handle<Buffer>,
        count: usize,
        src_offset: usize,
    ) -> Result<Vec<T>> {
        let mut out = vec![<T as Zeroable>::zeroed(); count];
        self.read_buffer(buffer, bytemuck::cast_slice_mut(&mut out), src_offset)?;
        Ok(out)
    }

    fn make_gpu_writes_visible(&mut self, buffer: Handle<Buffer>) -> Result<()> {
        self.close_scope();

        let stream = self.controller.ensure_stream(&mut self.backend)?;
        let record = self
            .buffers
            .get_ref(buffer)
            .ok_or_else(|| ComputeError::invalid("unknown buffer handle"))?;
        self.backend.make_gpu_writes_visible_to_host(stream, &record.raw);

        self.finish_work()?;

        if let Some(record) = self.buffers.get_mut_ref(buffer) {
            record.desc.dirty = false;
        }
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////
    // Kernels

    /// Compile `source` and resolve `entry_point` into a pipeline.
    pub fn create_kernel(&mut self, source: &[u8], entry_point: &str) -> Result<Handle<Kernel>> {
        self.make_kernel(&KernelInfo {
            source,
            entry_point,
            ..Default::default()
        })
    }

    /// Compiling never touches the command stream, so a failure here leaves
    /// the encoder state exactly as it was.
    pub fn make_kernel(&mut self, info: &KernelInfo) -> Result<Handle<Kernel>> {
        let raw = match self.backend.create_kernel(info) {
            Ok(raw) => raw,
            Err(err) => {
                log::error!(
                    "failed to create kernel `{}` (entry `{}`): {}",
                    info.debug_name,
                    info.entry_point,
                    err
                );
                return Err(err);
            }
        };

        match self.kernels.insert(KernelRecord {
            raw,
            entry_point: info.entry_point.to_string(),
            last_use: 0,
        }) {
            Some(handle) => Ok(handle),
            None => Err(ComputeError::invalid("kernel handle space exhausted")),
        }
    }

    pub fn delete_kernel(&mut self, kernel: Handle<Kernel>) -> Result<()> {
        let record = self
            .kernels
            .take(kernel)
            .ok_or_else(|| ComputeError::invalid("delete of an unknown kernel handle"))?;

        if self.current_kernel == Some(kernel) {
            self.current_kernel = None;
            self.slots.clear();
        }

        if self.controller.references(record.last_use) {
            log::debug!(
                "kernel `{}` still referenced by stream {}; release deferred",
                record.entry_point,
                record.last_use
            );
            self.release_queue.push(PendingRelease::Kernel(record.raw));
        } else {
            self.backend.destroy_kernel(record.raw);
        }

        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////
    // Dispatch

    /// Make `kernel` current, opening a compute pass if none is recording.
    ///
    /// Buffers bound for a previous kernel are forgotten.
    pub fn set_kernel(&mut self, kernel: Handle<Kernel>) -> Result<()> {
        let record = self
            .kernels
            .get_mut_ref(kernel)
            .ok_or_else(|| ComputeError::invalid("set_kernel with an unknown kernel handle"))?;

        let stream = self.controller.ensure_encoding(&mut self.backend)?;
        self.backend.bind_kernel(stream, &record.raw);
        record.last_use = self.controller.serial();

        self.current_kernel = Some(kernel);
        self.slots.clear();
        Ok(())
    }

    /// Bind `buffer` to argument slot `index` for the next dispatch.
    ///
    /// Binding as [`BufferBinding::Output`] marks the buffer as GPU-written
    /// right away, so the next read synchronizes even if the dispatch is
    /// never issued.
    pub fn set_kernel_buffer(
        &mut self,
        buffer: Handle<Buffer>,
        index: u32,
        binding: BufferBinding,
    ) -> Result<()> {
        self.controller.encoding_stream("set_kernel_buffer")?;
        let kernel = self
            .current_kernel
            .ok_or_else(|| ComputeError::invalid("set_kernel_buffer without a bound kernel"))?;
        let kernel = self
            .kernels
            .get_ref(kernel)
            .ok_or_else(|| ComputeError::invalid("the bound kernel was deleted"))?;
        let serial = self.controller.serial();

        let record = self
            .buffers
            .get_mut_ref(buffer)
            .ok_or_else(|| ComputeError::invalid("set_kernel_buffer with an unknown buffer handle"))?;

        if !binding.accepts(record.desc.usage) {
            return Err(ComputeError::invalid(format!(
                "buffer `{}` has {:?} usage and cannot be bound as {:?}",
                record.debug_name, record.desc.usage, binding
            )));
        }
        self.backend.check_binding(&kernel.raw, index, binding)?;

        if binding == BufferBinding::Output {
            record.desc.dirty = true;
        }
        record.last_use = serial;

        self.slots.retain(|s| s.slot != index);
        self.slots.push(SlotBinding {
            slot: index,
            binding,
            buffer,
        });
        Ok(())
    }

    /// Record a dispatch covering `threads` invocations per axis, split into
    /// groups of `group_size`. Does not wait for anything.
    pub fn dispatch(&mut self, threads: [u32; 3], group_size: [u32; 3]) -> Result<()> {
        let stream = self.controller.encoding_stream("dispatch")?;
        let kernel = self
            .current_kernel
            .ok_or_else(|| ComputeError::invalid("dispatch without a bound kernel"))?;
        let kernel = self
            .kernels
            .get_ref(kernel)
            .ok_or_else(|| ComputeError::invalid("the bound kernel was deleted"))?;

        let grid = DispatchGrid::new(threads, group_size, &self.limits)?;
        if grid.is_empty() {
            log::debug!("dispatch of {:?} threads is empty; nothing recorded", threads);
            self.slots.clear();
            return Ok(());
        }

        let mut bound = Vec::with_capacity(self.slots.len());
        for s in &self.slots {
            let record = self.buffers.get_ref(s.buffer).ok_or_else(|| {
                ComputeError::invalid(format!("buffer bound at slot {} was deleted", s.slot))
            })?;
            bound.push(BoundBuffer {
                slot: s.slot,
                binding: s.binding,
                buffer: &record.raw,
            });
        }

        self.backend.dispatch(stream, &kernel.raw, &bound, &grid)?;
        log::trace!(
            "recorded `{}`: {:?} groups, {} invocations",
            kernel.entry_point,
            grid.groups,
            grid.total_invocations()
        );
        self.slots.clear();
        Ok(())
    }

    /// Submit everything recorded so far and block until the device is done.
    pub fn finish(&mut self) -> Result<()> {
        self.finish_work()
    }

    ////////////////////////////////////////////////////////////////////////
    // Stream bookkeeping

    /// Close the compute pass, if any. Bindings do not survive it.
    fn close_scope(&mut self) {
        if self.controller.flush_encoders(&mut self.backend) {
            self.current_kernel = None;
            self.slots.clear();
        }
    }

    fn finish_work(&mut self) -> Result<()> {
        self.current_kernel = None;
        self.slots.clear();

        let res = self.controller.finish_work(&mut self.backend);

        for pending in self.release_queue.drain(..) {
            match pending {
                PendingRelease::Buffer(raw) => self.backend.destroy_buffer(raw),
                PendingRelease::Kernel(raw) => self.backend.destroy_kernel(raw),
            }
        }

        res
    }
}

impl<B: Backend> Drop for Context<B> {
    fn drop(&mut self) {
        if self.destroyed {
            return;
        }

        if let Err(err) = self.teardown() {
            log::error!("error while dropping {} context: {}", B::KIND, err);
        }
    }
}
