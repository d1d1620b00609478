use std::ffi::{c_char, c_void, CStr, CString};
use std::io::Cursor;
use std::mem::ManuallyDrop;

use ash::extensions::ext::DebugUtils;
use ash::{vk, Entry};

use super::{
    Backend, BackendKind, BoundBuffer, BufferBinding, BufferInfo, ComputeError, ContextLimits,
    DispatchGrid, KernelInfo, Result,
};

mod command_pool;
pub mod device_selector;
mod memory;
mod pipelines;
pub mod spirv;

use command_pool::CommandPool;
pub use device_selector::{DeviceInfo, DeviceSelection, DeviceType};
pub use memory::VulkanBuffer;
pub use pipelines::VulkanKernel;

/// Names of debugging layers that should be enabled when validation is requested.
pub const DEBUG_LAYER_NAMES: [*const c_char; 1] =
    [b"VK_LAYER_KHRONOS_validation\0".as_ptr() as *const c_char];

const DESCRIPTOR_POOL_SETS: u32 = 64;

unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message).to_string_lossy();
    let level = if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::Level::Error
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::Level::Warn
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        log::Level::Debug
    } else {
        log::Level::Trace
    };
    log::log!(target: "dashi_compute::vulkan", level, "[{:?}] {}", message_type, message);
    vk::FALSE
}

/// Creation parameters for [`VulkanBackend`].
#[derive(Debug, Clone)]
pub struct VulkanInfo {
    pub app_name: String,
    pub device: DeviceSelection,
    /// Overrides `DASHI_VALIDATION=1` when set.
    pub enable_validation: Option<bool>,
}

impl Default for VulkanInfo {
    fn default() -> Self {
        Self {
            app_name: "dashi-compute".to_string(),
            device: DeviceSelection::Default,
            enable_validation: None,
        }
    }
}

/// A recording command buffer and the descriptor pools its dispatches used.
pub struct VulkanStream {
    cmd: vk::CommandBuffer,
    descriptor_pools: Vec<vk::DescriptorPool>,
    dispatches: u32,
}

/// Where a failed submission stopped.
enum SubmitError {
    /// Nothing reached the queue.
    Recording(ComputeError),
    /// The stream completed but the fence could not be reset.
    FenceReset(ComputeError),
    /// The stream was queued but its completion could not be observed.
    Waiting(ComputeError),
}

/// What happens to a stream's resources once submission returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposal {
    /// The device is done with the stream; reuse everything.
    Recycle,
    /// Reuse the stream, but the fence is stuck signaled and must be replaced.
    RecycleWithNewFence,
    /// The device may still be using the stream and the fence. Keep both
    /// until teardown and submit on a new fence.
    Abandon,
}

impl SubmitError {
    fn disposal(&self) -> Disposal {
        match self {
            SubmitError::Recording(_) => Disposal::Recycle,
            SubmitError::FenceReset(_) => Disposal::RecycleWithNewFence,
            SubmitError::Waiting(_) => Disposal::Abandon,
        }
    }

    fn into_inner(self) -> ComputeError {
        match self {
            SubmitError::Recording(err) | SubmitError::FenceReset(err) | SubmitError::Waiting(err) => err,
        }
    }
}

pub struct VulkanBackend {
    _entry: Entry,
    instance: ash::Instance,
    device: ash::Device,
    properties: vk::PhysicalDeviceProperties,
    info: DeviceInfo,
    queue: vk::Queue,
    allocator: ManuallyDrop<vk_mem::Allocator>,
    pool: CommandPool,
    fence: vk::Fence,
    free_descriptor_pools: Vec<vk::DescriptorPool>,
    /// Streams and fences the device may still be using after a failed wait.
    abandoned_streams: Vec<VulkanStream>,
    abandoned_fences: Vec<vk::Fence>,
    debug_utils: Option<DebugUtils>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
    destroyed: bool,
}

struct DeviceObjects {
    device: ash::Device,
    queue: vk::Queue,
    allocator: vk_mem::Allocator,
    pool: CommandPool,
    fence: vk::Fence,
}

impl VulkanBackend {
    /// The physical device this backend opened.
    pub fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    fn validation_requested(info: &VulkanInfo) -> bool {
        info.enable_validation.unwrap_or_else(|| {
            std::env::var("DASHI_VALIDATION")
                .map(|v| v == "1")
                .unwrap_or(false)
        })
    }

    fn create_instance(
        entry: &Entry,
        info: &VulkanInfo,
        enable_validation: bool,
    ) -> Result<ash::Instance> {
        let app_name = CString::new(info.app_name.as_str())
            .map_err(|_| ComputeError::invalid("application name contains a nul byte"))?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .api_version(vk::make_api_version(0, 1, 1, 0))
            .build();

        let mut inst_exts = Vec::new();
        let mut inst_layers = Vec::new();
        if enable_validation {
            inst_exts.push(DebugUtils::name().as_ptr());
            let available_layers = entry.enumerate_instance_layer_properties()?;
            for &layer in &DEBUG_LAYER_NAMES {
                let name = unsafe { CStr::from_ptr(layer) };
                if available_layers
                    .iter()
                    .any(|prop| unsafe { CStr::from_ptr(prop.layer_name.as_ptr()) == name })
                {
                    inst_layers.push(layer);
                } else {
                    log::warn!("validation requested but {:?} is not installed", name);
                }
            }
        }

        let instance = unsafe {
            entry.create_instance(
                &vk::InstanceCreateInfo::builder()
                    .application_info(&app_info)
                    .enabled_extension_names(&inst_exts)
                    .enabled_layer_names(&inst_layers)
                    .build(),
                None,
            )
        }?;
        Ok(instance)
    }

    fn create_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> (Option<DebugUtils>, Option<vk::DebugUtilsMessengerEXT>) {
        let debug_utils = DebugUtils::new(entry, instance);
        let messenger_ci = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(vulkan_debug_callback));

        match unsafe { debug_utils.create_debug_utils_messenger(&messenger_ci, None) } {
            Ok(messenger) => (Some(debug_utils), Some(messenger)),
            Err(err) => {
                log::warn!("failed to install the validation callback: {}", err);
                (None, None)
            }
        }
    }

    fn pick_device(
        instance: &ash::Instance,
        selection: &DeviceSelection,
    ) -> Result<(vk::PhysicalDevice, DeviceInfo, u32)> {
        let devices = device_selector::enumerate(instance)?;
        for (idx, (_, info)) in devices.iter().enumerate() {
            log::debug!("found device {}: {}", idx, info);
        }

        let infos: Vec<DeviceInfo> = devices.iter().map(|(_, info)| info.clone()).collect();
        let idx = device_selector::select(&infos, selection).ok_or(ComputeError::NoDevice)?;
        let (pdevice, info) = devices[idx].clone();
        let family = info.compute_family.ok_or(ComputeError::NoDevice)?;
        Ok((pdevice, info, family))
    }

    fn create_device_objects(
        instance: &ash::Instance,
        pdevice: vk::PhysicalDevice,
        family: u32,
    ) -> Result<DeviceObjects> {
        let priorities = [1.0];
        let queue_infos = [vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(family)
            .queue_priorities(&priorities)
            .build()];

        let device = unsafe {
            instance.create_device(
                pdevice,
                &vk::DeviceCreateInfo::builder()
                    .queue_create_infos(&queue_infos)
                    .build(),
                None,
            )
        }?;
        let queue = unsafe { device.get_device_queue(family, 0) };

        let allocator =
            match vk_mem::Allocator::new(vk_mem::AllocatorCreateInfo::new(instance, &device, pdevice))
            {
                Ok(allocator) => allocator,
                Err(err) => {
                    unsafe { device.destroy_device(None) };
                    return Err(err.into());
                }
            };

        let mut pool = match CommandPool::new(device.clone(), family) {
            Ok(pool) => pool,
            Err(err) => {
                drop(allocator);
                unsafe { device.destroy_device(None) };
                return Err(err);
            }
        };

        let fence = match unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) } {
            Ok(fence) => fence,
            Err(err) => {
                pool.destroy();
                drop(allocator);
                unsafe { device.destroy_device(None) };
                return Err(err.into());
            }
        };

        Ok(DeviceObjects {
            device,
            queue,
            allocator,
            pool,
            fence,
        })
    }

    fn set_name<T>(&self, obj: T, name: &str, t: vk::ObjectType)
    where
        T: vk::Handle,
    {
        if name.is_empty() {
            return;
        }
        if let Some(utils) = &self.debug_utils {
            let Ok(name) = CString::new(name) else {
                return;
            };
            let res = unsafe {
                utils.set_debug_utils_object_name(
                    self.device.handle(),
                    &vk::DebugUtilsObjectNameInfoEXT::builder()
                        .object_name(&name)
                        .object_handle(obj.as_raw())
                        .object_type(t)
                        .build(),
                )
            };
            if let Err(err) = res {
                log::debug!("failed to name {:?}: {}", t, err);
            }
        }
    }

    fn take_descriptor_pool(&mut self) -> Result<vk::DescriptorPool> {
        if let Some(pool) = self.free_descriptor_pools.pop() {
            return Ok(pool);
        }

        let sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: DESCRIPTOR_POOL_SETS,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: DESCRIPTOR_POOL_SETS * 4,
            },
        ];
        let pool = unsafe {
            self.device.create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo::builder()
                    .max_sets(DESCRIPTOR_POOL_SETS)
                    .pool_sizes(&sizes)
                    .build(),
                None,
            )
        }?;
        Ok(pool)
    }

    fn allocate_from(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> ash::prelude::VkResult<vk::DescriptorSet> {
        let layouts = [layout];
        let sets = unsafe {
            self.device.allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::builder()
                    .descriptor_pool(pool)
                    .set_layouts(&layouts)
                    .build(),
            )
        }?;
        Ok(sets[0])
    }

    fn allocate_set(
        &mut self,
        stream: &mut VulkanStream,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        if let Some(&pool) = stream.descriptor_pools.last() {
            match self.allocate_from(pool, layout) {
                Ok(set) => return Ok(set),
                Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY) | Err(vk::Result::ERROR_FRAGMENTED_POOL) => {}
                Err(err) => return Err(err.into()),
            }
        }

        let pool = self.take_descriptor_pool()?;
        stream.descriptor_pools.push(pool);
        Ok(self.allocate_from(pool, layout)?)
    }

    fn submit_stream(&self, stream: &VulkanStream) -> std::result::Result<(), SubmitError> {
        let recording = |err: vk::Result| SubmitError::Recording(err.into());
        unsafe {
            self.device.end_command_buffer(stream.cmd).map_err(recording)?;

            let cmds = [stream.cmd];
            let submit = vk::SubmitInfo::builder().command_buffers(&cmds).build();
            self.device
                .queue_submit(self.queue, &[submit], self.fence)
                .map_err(recording)?;

            self.device
                .wait_for_fences(&[self.fence], true, u64::MAX)
                .map_err(|err| SubmitError::Waiting(err.into()))?;
            self.device
                .reset_fences(&[self.fence])
                .map_err(|err| SubmitError::FenceReset(err.into()))?;
        }
        Ok(())
    }

    /// Swap in a fresh unsignaled fence. `retire` keeps the old one alive
    /// until teardown instead of destroying it now.
    fn replace_fence(&mut self, retire: bool) -> Result<()> {
        let fresh = unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::builder().build(), None)
        }?;
        let old = std::mem::replace(&mut self.fence, fresh);
        if retire {
            self.abandoned_fences.push(old);
        } else {
            unsafe { self.device.destroy_fence(old, None) };
        }
        Ok(())
    }

    fn recycle_stream(&mut self, stream: VulkanStream) {
        self.pool.recycle(stream.cmd);
        for pool in stream.descriptor_pools {
            let reset = unsafe {
                self.device
                    .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())
            };
            match reset {
                Ok(()) => self.free_descriptor_pools.push(pool),
                Err(_) => unsafe { self.device.destroy_descriptor_pool(pool, None) },
            }
        }
    }
}

impl Backend for VulkanBackend {
    const KIND: BackendKind = BackendKind::Vulkan;

    type Info = VulkanInfo;
    type Buffer = VulkanBuffer;
    type Kernel = VulkanKernel;
    type Stream = VulkanStream;

    fn create(info: &VulkanInfo) -> Result<Self> {
        let enable_validation = Self::validation_requested(info);
        let entry = unsafe { Entry::load() }?;
        let instance = Self::create_instance(&entry, info, enable_validation)?;

        let (debug_utils, debug_messenger) = if enable_validation {
            Self::create_debug_messenger(&entry, &instance)
        } else {
            (None, None)
        };

        let opened = Self::pick_device(&instance, &info.device).and_then(|(pdevice, dinfo, family)| {
            Self::create_device_objects(&instance, pdevice, family).map(|objects| (pdevice, dinfo, objects))
        });

        let (pdevice, dinfo, objects) = match opened {
            Ok(opened) => opened,
            Err(err) => {
                unsafe {
                    if let (Some(utils), Some(messenger)) = (&debug_utils, debug_messenger) {
                        utils.destroy_debug_utils_messenger(messenger, None);
                    }
                    instance.destroy_instance(None);
                }
                return Err(err);
            }
        };

        let properties = unsafe { instance.get_physical_device_properties(pdevice) };
        log::info!("opened Vulkan device {}", dinfo);

        Ok(Self {
            _entry: entry,
            instance,
            device: objects.device,
            properties,
            info: dinfo,
            queue: objects.queue,
            allocator: ManuallyDrop::new(objects.allocator),
            pool: objects.pool,
            fence: objects.fence,
            free_descriptor_pools: Vec::new(),
            abandoned_streams: Vec::new(),
            abandoned_fences: Vec::new(),
            debug_utils,
            debug_messenger,
            destroyed: false,
        })
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        unsafe {
            if let Err(err) = self.device.device_wait_idle() {
                log::error!("device_wait_idle failed during teardown: {}", err);
            }

            for pool in self.free_descriptor_pools.drain(..) {
                self.device.destroy_descriptor_pool(pool, None);
            }
            for stream in self.abandoned_streams.drain(..) {
                for pool in stream.descriptor_pools {
                    self.device.destroy_descriptor_pool(pool, None);
                }
            }
            for fence in self.abandoned_fences.drain(..) {
                self.device.destroy_fence(fence, None);
            }
            self.device.destroy_fence(self.fence, None);
            self.pool.destroy();

            // Destroy allocator before tearing down device and instance
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);

            if let (Some(utils), Some(messenger)) = (&self.debug_utils, self.debug_messenger.take()) {
                utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }

    fn limits(&self) -> ContextLimits {
        let l = &self.properties.limits;
        ContextLimits {
            max_workgroup_size: l.max_compute_work_group_size,
            max_workgroup_invocations: l.max_compute_work_group_invocations,
            max_workgroup_count: l.max_compute_work_group_count,
            max_constant_buffer_size: l.max_uniform_buffer_range as usize,
            max_structured_buffer_size: l.max_storage_buffer_range as usize,
        }
    }

    fn create_buffer(&mut self, info: &BufferInfo) -> Result<VulkanBuffer> {
        let buffer = memory::create(&self.allocator, info)?;
        self.set_name(buffer.raw, info.debug_name, vk::ObjectType::BUFFER);
        Ok(buffer)
    }

    fn destroy_buffer(&mut self, buffer: VulkanBuffer) {
        memory::destroy(&self.allocator, buffer);
    }

    fn read_buffer(&mut self, buffer: &mut VulkanBuffer, offset: usize, dst: &mut [u8]) -> Result<()> {
        memory::read(&self.allocator, buffer, offset, dst)
    }

    fn write_buffer(&mut self, buffer: &mut VulkanBuffer, offset: usize, src: &[u8]) -> Result<()> {
        memory::write(&self.allocator, buffer, offset, src)
    }

    fn create_kernel(&mut self, info: &KernelInfo) -> Result<VulkanKernel> {
        let words = ash::util::read_spv(&mut Cursor::new(info.source))
            .map_err(|err| ComputeError::compile(format!("invalid SPIR-V: {}", err)))?;
        let reflection = spirv::reflect(&words, info.entry_point)?;
        log::debug!(
            "kernel `{}` reflected: local size {:?}, {} binding(s)",
            info.entry_point,
            reflection.local_size,
            reflection.bindings.len()
        );

        let kernel = pipelines::create(&self.device, &words, info.entry_point, reflection)?;
        self.set_name(kernel.pipeline, info.debug_name, vk::ObjectType::PIPELINE);
        Ok(kernel)
    }

    fn destroy_kernel(&mut self, kernel: VulkanKernel) {
        pipelines::destroy(&self.device, kernel);
    }

    fn check_binding(&self, kernel: &VulkanKernel, slot: u32, binding: BufferBinding) -> Result<()> {
        let reflected = kernel.reflection.binding(slot).ok_or_else(|| {
            ComputeError::invalid(format!(
                "kernel `{}` has no buffer argument at slot {}",
                kernel.entry_point, slot
            ))
        })?;

        if !reflected.kind.accepts(binding) {
            return Err(ComputeError::invalid(format!(
                "slot {} of kernel `{}` is a {:?} buffer and cannot take a {:?} binding",
                slot, kernel.entry_point, reflected.kind, binding
            )));
        }
        Ok(())
    }

    fn begin_stream(&mut self) -> Result<VulkanStream> {
        let cmd = self.pool.alloc()?;
        let begun = unsafe {
            self.device.begin_command_buffer(
                cmd,
                &vk::CommandBufferBeginInfo::builder()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
                    .build(),
            )
        };
        if let Err(err) = begun {
            self.pool.recycle(cmd);
            return Err(err.into());
        }

        Ok(VulkanStream {
            cmd,
            descriptor_pools: Vec::new(),
            dispatches: 0,
        })
    }

    // Compute work needs no pass object in Vulkan; passes only show up as
    // debug labels.
    fn begin_compute_pass(&mut self, stream: &mut VulkanStream) -> Result<()> {
        if let Some(utils) = &self.debug_utils {
            let label = unsafe { CStr::from_bytes_with_nul_unchecked(b"compute pass\0") };
            unsafe {
                utils.cmd_begin_debug_utils_label(
                    stream.cmd,
                    &vk::DebugUtilsLabelEXT::builder().label_name(label).build(),
                );
            }
        }
        Ok(())
    }

    fn end_compute_pass(&mut self, stream: &mut VulkanStream) {
        if let Some(utils) = &self.debug_utils {
            unsafe { utils.cmd_end_debug_utils_label(stream.cmd) };
        }
    }

    fn bind_kernel(&mut self, stream: &mut VulkanStream, kernel: &VulkanKernel) {
        unsafe {
            self.device
                .cmd_bind_pipeline(stream.cmd, vk::PipelineBindPoint::COMPUTE, kernel.pipeline);
        }
    }

    fn dispatch(
        &mut self,
        stream: &mut VulkanStream,
        kernel: &VulkanKernel,
        bindings: &[BoundBuffer<'_, Self>],
        grid: &DispatchGrid,
    ) -> Result<()> {
        if let Some(local) = kernel.reflection.local_size {
            if local != grid.group_size {
                return Err(ComputeError::invalid(format!(
                    "kernel `{}` is compiled for groups of {:?}, not {:?}",
                    kernel.entry_point, local, grid.group_size
                )));
            }
        }

        let mut buffer_infos = Vec::with_capacity(kernel.reflection.bindings.len());
        for reflected in &kernel.reflection.bindings {
            let bound = bindings
                .iter()
                .find(|b| b.slot == reflected.binding)
                .ok_or_else(|| {
                    ComputeError::invalid(format!(
                        "slot {} of kernel `{}` has no buffer bound",
                        reflected.binding, kernel.entry_point
                    ))
                })?;
            buffer_infos.push(
                vk::DescriptorBufferInfo::builder()
                    .buffer(bound.buffer.raw)
                    .offset(0)
                    .range(vk::WHOLE_SIZE)
                    .build(),
            );
        }

        let set = if kernel.reflection.bindings.is_empty() {
            None
        } else {
            let set = self.allocate_set(stream, kernel.set_layout)?;
            let writes: Vec<vk::WriteDescriptorSet> = kernel
                .reflection
                .bindings
                .iter()
                .zip(buffer_infos.iter())
                .map(|(reflected, info)| {
                    vk::WriteDescriptorSet::builder()
                        .dst_set(set)
                        .dst_binding(reflected.binding)
                        .descriptor_type(pipelines::descriptor_type(reflected.kind))
                        .buffer_info(std::slice::from_ref(info))
                        .build()
                })
                .collect();
            unsafe { self.device.update_descriptor_sets(&writes, &[]) };
            Some(set)
        };

        unsafe {
            if stream.dispatches > 0 {
                let barrier = vk::MemoryBarrier::builder()
                    .src_access_mask(vk::AccessFlags::SHADER_WRITE)
                    .dst_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE)
                    .build();
                self.device.cmd_pipeline_barrier(
                    stream.cmd,
                    vk::PipelineStageFlags::COMPUTE_SHADER,
                    vk::PipelineStageFlags::COMPUTE_SHADER,
                    vk::DependencyFlags::empty(),
                    &[barrier],
                    &[],
                    &[],
                );
            }

            if let Some(set) = set {
                self.device.cmd_bind_descriptor_sets(
                    stream.cmd,
                    vk::PipelineBindPoint::COMPUTE,
                    kernel.layout,
                    0,
                    &[set],
                    &[],
                );
            }

            let [x, y, z] = grid.groups;
            self.device.cmd_dispatch(stream.cmd, x, y, z);
        }

        stream.dispatches += 1;
        Ok(())
    }

    fn make_gpu_writes_visible_to_host(&mut self, stream: &mut VulkanStream, buffer: &VulkanBuffer) {
        let barrier = vk::BufferMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::SHADER_WRITE)
            .dst_access_mask(vk::AccessFlags::HOST_READ)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(buffer.raw)
            .offset(0)
            .size(vk::WHOLE_SIZE)
            .build();

        unsafe {
            self.device.cmd_pipeline_barrier(
                stream.cmd,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::HOST,
                vk::DependencyFlags::empty(),
                &[],
                &[barrier],
                &[],
            );
        }
    }

    fn submit_and_wait(&mut self, stream: VulkanStream) -> Result<()> {
        let failure = match self.submit_stream(&stream) {
            Ok(()) => {
                self.recycle_stream(stream);
                return Ok(());
            }
            Err(failure) => failure,
        };

        let disposal = failure.disposal();
        let err = failure.into_inner();
        log::error!(
            "stream of {} dispatch(es) failed ({:?}): {}",
            stream.dispatches,
            disposal,
            err
        );

        match disposal {
            Disposal::Recycle => self.recycle_stream(stream),
            Disposal::RecycleWithNewFence => {
                self.recycle_stream(stream);
                self.replace_fence(false)?;
            }
            Disposal::Abandon => {
                self.abandoned_streams.push(stream);
                self.replace_fence(true)?;
            }
        }
        Err(err)
    }
}
