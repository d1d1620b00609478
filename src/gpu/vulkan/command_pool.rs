use ash::{vk, Device};
use std::{cell::UnsafeCell, marker::PhantomData, thread::ThreadId};

use crate::gpu::Result;

/// Thin wrapper around a Vulkan command pool.
///
/// Hands out primary command buffers and takes them back once the GPU is
/// done with them. The pool may be moved to another thread after creation
/// but must not be shared across threads.
pub struct CommandPool {
    device: Device,
    raw: vk::CommandPool,
    free: Vec<vk::CommandBuffer>,
    owner: ThreadId,
    // make !Sync
    _not_sync: PhantomData<UnsafeCell<()>>,
}

unsafe impl Send for CommandPool {}

impl CommandPool {
    /// Create a new command pool for the given queue family.
    pub(super) fn new(device: Device, family: u32) -> Result<Self> {
        let ci = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .build();
        let raw = unsafe { device.create_command_pool(&ci, None)? };
        Ok(Self {
            device,
            raw,
            free: Vec::new(),
            owner: std::thread::current().id(),
            _not_sync: PhantomData,
        })
    }

    fn assert_owner(&self) {
        debug_assert_eq!(
            self.owner,
            std::thread::current().id(),
            "CommandPool used from wrong thread"
        );
    }

    /// Take a reset primary command buffer, allocating one if none are free.
    pub fn alloc(&mut self) -> Result<vk::CommandBuffer> {
        self.assert_owner();
        if let Some(buf) = self.free.pop() {
            unsafe {
                self.device
                    .reset_command_buffer(buf, vk::CommandBufferResetFlags::empty())?;
            }
            return Ok(buf);
        }

        let cmd = unsafe {
            self.device.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::builder()
                    .command_pool(self.raw)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1)
                    .build(),
            )?
        };
        Ok(cmd[0])
    }

    /// Return a command buffer after GPU completion.
    pub fn recycle(&mut self, buf: vk::CommandBuffer) {
        self.assert_owner();
        self.free.push(buf);
    }

    /// Destroy the underlying Vulkan command pool. Command buffers allocated
    /// from this pool become invalid after this call.
    pub fn destroy(&mut self) {
        self.assert_owner();
        if self.raw == vk::CommandPool::null() {
            return;
        }
        unsafe {
            self.device.destroy_command_pool(self.raw, None);
        }
        self.raw = vk::CommandPool::null();
        self.free.clear();
    }
}
