use ash::vk;
use vk_mem::Alloc;

use crate::gpu::{BufferInfo, BufferUsage, Result};

/// A persistently mapped, host-visible buffer.
#[derive(Debug)]
pub struct VulkanBuffer {
    pub(super) raw: vk::Buffer,
    pub(super) alloc: vk_mem::Allocation,
    pub(super) mapped: *mut u8,
    pub(super) size: usize,
}

pub(super) fn usage_flags(usage: BufferUsage) -> vk::BufferUsageFlags {
    let base = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
    match usage {
        BufferUsage::Constant => base | vk::BufferUsageFlags::UNIFORM_BUFFER,
        BufferUsage::Structured => base | vk::BufferUsageFlags::STORAGE_BUFFER,
    }
}

pub(super) fn create(allocator: &vk_mem::Allocator, info: &BufferInfo) -> Result<VulkanBuffer> {
    let create_info = vk_mem::AllocationCreateInfo {
        usage: vk_mem::MemoryUsage::AutoPreferHost,
        flags: vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM,
        ..Default::default()
    };

    unsafe {
        let (raw, mut alloc) = allocator.create_buffer(
            &vk::BufferCreateInfo::builder()
                .size(info.byte_size as u64)
                .usage(usage_flags(info.usage))
                .sharing_mode(vk::SharingMode::EXCLUSIVE)
                .build(),
            &create_info,
        )?;

        let mapped = match allocator.map_memory(&mut alloc) {
            Ok(ptr) => ptr,
            Err(err) => {
                allocator.destroy_buffer(raw, &mut alloc);
                return Err(err.into());
            }
        };

        Ok(VulkanBuffer {
            raw,
            alloc,
            mapped,
            size: info.byte_size,
        })
    }
}

pub(super) fn destroy(allocator: &vk_mem::Allocator, mut buffer: VulkanBuffer) {
    unsafe {
        allocator.unmap_memory(&mut buffer.alloc);
        allocator.destroy_buffer(buffer.raw, &mut buffer.alloc);
    }
}

/// Copy into the mapping, then flush so the device sees it.
pub(super) fn write(
    allocator: &vk_mem::Allocator,
    buffer: &mut VulkanBuffer,
    offset: usize,
    src: &[u8],
) -> Result<()> {
    if src.is_empty() {
        return Ok(());
    }
    debug_assert!(offset + src.len() <= buffer.size);

    unsafe {
        std::ptr::copy_nonoverlapping(src.as_ptr(), buffer.mapped.add(offset), src.len());
    }
    allocator.flush_allocation(&buffer.alloc, offset, src.len())?;
    Ok(())
}

/// Invalidate the range, then copy out of the mapping.
pub(super) fn read(
    allocator: &vk_mem::Allocator,
    buffer: &mut VulkanBuffer,
    offset: usize,
    dst: &mut [u8],
) -> Result<()> {
    if dst.is_empty() {
        return Ok(());
    }
    debug_assert!(offset + dst.len() <= buffer.size);

    allocator.invalidate_allocation(&buffer.alloc, offset, dst.len())?;
    unsafe {
        std::ptr::copy_nonoverlapping(buffer.mapped.add(offset), dst.as_mut_ptr(), dst.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_maps_to_descriptor_type() {
        let constant = usage_flags(BufferUsage::Constant);
        assert!(constant.contains(vk::BufferUsageFlags::UNIFORM_BUFFER));
        assert!(!constant.contains(vk::BufferUsageFlags::STORAGE_BUFFER));

        let structured = usage_flags(BufferUsage::Structured);
        assert!(structured.contains(vk::BufferUsageFlags::STORAGE_BUFFER));
        assert!(structured.contains(vk::BufferUsageFlags::TRANSFER_DST));
    }
}
