//! Device memory allocation.
//!
//! Resource creation goes through the [`DeviceMemoryAllocator`] interface so
//! the allocation strategy can be swapped out. Two implementations are
//! provided:
//!
//! - [`SimpleAllocator`] performs one `vkAllocateMemory` per object, sized to
//!   the exact memory requirement. No pooling, no suballocation.
//! - [`BlockAllocator`] delegates to the Vulkan Memory Allocator library
//!   (via `vk-mem`), which services many objects from large memory blocks.
//!
//! Host access to allocated memory goes through [`MappedMemory`], a scoped
//! guard that unmaps on drop. Implementations must tolerate overlapping maps
//! of sub-allocations that share one `VkDeviceMemory` region; VMA refcounts
//! its mappings internally, and the simple allocator never shares a region
//! between objects.

use std::sync::Mutex;

use ash::vk;
use vk_mem::Alloc;

use crate::device::Device;
use crate::error::{Error, Result};

/// A region of device memory backing a buffer or image.
///
/// `memory` and `offset` locate the region inside its `VkDeviceMemory`
/// allocation; the cookie carries allocator-private bookkeeping.
pub struct AllocatedMemory {
    pub memory: vk::DeviceMemory,
    pub offset: vk::DeviceSize,
    cookie: Cookie,
}

enum Cookie {
    None,
    // vk-mem wants `&mut Allocation` for map/unmap/free while the interface
    // below is `&self`; recording is externally serialized per the crate's
    // threading contract, so a Mutex is sufficient.
    Block(Mutex<vk_mem::Allocation>),
}

impl AllocatedMemory {
    fn dedicated(memory: vk::DeviceMemory) -> Self {
        Self {
            memory,
            offset: 0,
            cookie: Cookie::None,
        }
    }
}

/// Strategy interface for buffer/image creation, memory binding, and host
/// mapping.
pub trait DeviceMemoryAllocator {
    /// Creates a buffer, allocates memory satisfying `required` (preferring
    /// `required | optional`), and binds the two.
    fn create_buffer(
        &self,
        info: &vk::BufferCreateInfo<'_>,
        required: vk::MemoryPropertyFlags,
        optional: vk::MemoryPropertyFlags,
    ) -> Result<(vk::Buffer, AllocatedMemory)>;

    /// Creates an image, allocates memory satisfying `required` (preferring
    /// `required | optional`), and binds the two.
    fn create_image(
        &self,
        info: &vk::ImageCreateInfo<'_>,
        required: vk::MemoryPropertyFlags,
        optional: vk::MemoryPropertyFlags,
    ) -> Result<(vk::Image, AllocatedMemory)>;

    /// Releases memory previously returned by this allocator.
    fn free_memory(&self, memory: &AllocatedMemory);

    /// Maps `size` bytes of the region, starting at its allocator-reported
    /// offset. Prefer [`MappedMemory::map`] over calling this directly.
    fn map_memory(&self, memory: &AllocatedMemory, size: vk::DeviceSize) -> Result<*mut u8>;

    /// Unmaps a region previously mapped with
    /// [`map_memory`](DeviceMemoryAllocator::map_memory).
    fn unmap_memory(&self, memory: &AllocatedMemory);
}

/// Scoped host mapping of an [`AllocatedMemory`] region. Unmaps on drop on
/// all exit paths.
pub struct MappedMemory<'a> {
    allocator: &'a dyn DeviceMemoryAllocator,
    memory: &'a AllocatedMemory,
    ptr: *mut u8,
    len: usize,
}

impl<'a> MappedMemory<'a> {
    pub fn map(
        allocator: &'a dyn DeviceMemoryAllocator,
        memory: &'a AllocatedMemory,
        size: vk::DeviceSize,
    ) -> Result<Self> {
        let ptr = allocator.map_memory(memory, size)?;
        Ok(Self {
            allocator,
            memory,
            ptr,
            len: size as usize,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for MappedMemory<'_> {
    fn drop(&mut self) {
        self.allocator.unmap_memory(self.memory);
    }
}

/// Picks a memory type index out of `type_filter` whose properties satisfy
/// `required | optional`, falling back to `required` alone.
pub(crate) fn find_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    required: vk::MemoryPropertyFlags,
    optional: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let types = &properties.memory_types[..properties.memory_type_count as usize];
    let preferred = required | optional;
    for (i, ty) in types.iter().enumerate() {
        if type_filter & (1 << i) != 0 && ty.property_flags.contains(preferred) {
            return Some(i as u32);
        }
    }
    for (i, ty) in types.iter().enumerate() {
        if type_filter & (1 << i) != 0 && ty.property_flags.contains(required) {
            return Some(i as u32);
        }
    }
    None
}

/// One dedicated `vkAllocateMemory` per object; no allocation strategy at
/// all. Useful as a baseline and for debugging memory issues.
pub struct SimpleAllocator {
    device: Device,
}

impl SimpleAllocator {
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    fn allocate(
        &self,
        requirements: vk::MemoryRequirements,
        required: vk::MemoryPropertyFlags,
        optional: vk::MemoryPropertyFlags,
    ) -> Result<vk::DeviceMemory> {
        let memory_type_index = find_memory_type(
            self.device.memory_properties(),
            requirements.memory_type_bits,
            required,
            optional,
        )
        .ok_or(Error::MemoryTypeLookup)?;
        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        unsafe { self.device.allocate_memory(&info, None) }.map_err(Error::Allocation)
    }
}

impl DeviceMemoryAllocator for SimpleAllocator {
    fn create_buffer(
        &self,
        info: &vk::BufferCreateInfo<'_>,
        required: vk::MemoryPropertyFlags,
        optional: vk::MemoryPropertyFlags,
    ) -> Result<(vk::Buffer, AllocatedMemory)> {
        unsafe {
            let buffer = self
                .device
                .create_buffer(info, None)
                .map_err(Error::Allocation)?;
            let requirements = self.device.get_buffer_memory_requirements(buffer);
            let memory = match self.allocate(requirements, required, optional) {
                Ok(memory) => memory,
                Err(e) => {
                    self.device.destroy_buffer(buffer, None);
                    return Err(e);
                }
            };
            if let Err(e) = self.device.bind_buffer_memory(buffer, memory, 0) {
                self.device.destroy_buffer(buffer, None);
                self.device.free_memory(memory, None);
                return Err(Error::Allocation(e));
            }
            Ok((buffer, AllocatedMemory::dedicated(memory)))
        }
    }

    fn create_image(
        &self,
        info: &vk::ImageCreateInfo<'_>,
        required: vk::MemoryPropertyFlags,
        optional: vk::MemoryPropertyFlags,
    ) -> Result<(vk::Image, AllocatedMemory)> {
        unsafe {
            let image = self
                .device
                .create_image(info, None)
                .map_err(Error::Allocation)?;
            let requirements = self.device.get_image_memory_requirements(image);
            let memory = match self.allocate(requirements, required, optional) {
                Ok(memory) => memory,
                Err(e) => {
                    self.device.destroy_image(image, None);
                    return Err(e);
                }
            };
            if let Err(e) = self.device.bind_image_memory(image, memory, 0) {
                self.device.destroy_image(image, None);
                self.device.free_memory(memory, None);
                return Err(Error::Allocation(e));
            }
            Ok((image, AllocatedMemory::dedicated(memory)))
        }
    }

    fn free_memory(&self, memory: &AllocatedMemory) {
        unsafe {
            self.device.free_memory(memory.memory, None);
        }
    }

    fn map_memory(&self, memory: &AllocatedMemory, size: vk::DeviceSize) -> Result<*mut u8> {
        let ptr = unsafe {
            self.device
                .map_memory(memory.memory, memory.offset, size, vk::MemoryMapFlags::empty())
        }
        .map_err(Error::Allocation)?;
        Ok(ptr as *mut u8)
    }

    fn unmap_memory(&self, memory: &AllocatedMemory) {
        unsafe {
            self.device.unmap_memory(memory.memory);
        }
    }
}

/// Block-based allocator delegating to the Vulkan Memory Allocator library.
///
/// Objects share large memory blocks; the cookie holds the VMA allocation
/// handle, and map/unmap go through VMA's refcounted mapping.
pub struct BlockAllocator {
    allocator: vk_mem::Allocator,
    _device: Device,
}

impl BlockAllocator {
    pub fn new(device: Device) -> Result<Self> {
        let info = vk_mem::AllocatorCreateInfo::new(
            device.instance(),
            device.ash_device(),
            device.physical_device(),
        );
        let allocator = unsafe { vk_mem::Allocator::new(info) }.map_err(Error::Allocation)?;
        Ok(Self {
            allocator,
            _device: device,
        })
    }

    fn block_cookie<'a>(memory: &'a AllocatedMemory) -> &'a Mutex<vk_mem::Allocation> {
        match &memory.cookie {
            Cookie::Block(allocation) => allocation,
            Cookie::None => panic!("memory was not allocated by the block allocator"),
        }
    }
}

impl DeviceMemoryAllocator for BlockAllocator {
    fn create_buffer(
        &self,
        info: &vk::BufferCreateInfo<'_>,
        required: vk::MemoryPropertyFlags,
        optional: vk::MemoryPropertyFlags,
    ) -> Result<(vk::Buffer, AllocatedMemory)> {
        let create_info = vk_mem::AllocationCreateInfo {
            required_flags: required,
            preferred_flags: optional,
            ..Default::default()
        };
        let (buffer, allocation) = unsafe { self.allocator.create_buffer(info, &create_info) }
            .map_err(Error::Allocation)?;
        let allocation_info = self.allocator.get_allocation_info(&allocation);
        Ok((
            buffer,
            AllocatedMemory {
                memory: allocation_info.device_memory,
                offset: allocation_info.offset,
                cookie: Cookie::Block(Mutex::new(allocation)),
            },
        ))
    }

    fn create_image(
        &self,
        info: &vk::ImageCreateInfo<'_>,
        required: vk::MemoryPropertyFlags,
        optional: vk::MemoryPropertyFlags,
    ) -> Result<(vk::Image, AllocatedMemory)> {
        let create_info = vk_mem::AllocationCreateInfo {
            required_flags: required,
            preferred_flags: optional,
            ..Default::default()
        };
        let (image, allocation) = unsafe { self.allocator.create_image(info, &create_info) }
            .map_err(Error::Allocation)?;
        let allocation_info = self.allocator.get_allocation_info(&allocation);
        Ok((
            image,
            AllocatedMemory {
                memory: allocation_info.device_memory,
                offset: allocation_info.offset,
                cookie: Cookie::Block(Mutex::new(allocation)),
            },
        ))
    }

    fn free_memory(&self, memory: &AllocatedMemory) {
        let mut allocation = Self::block_cookie(memory).lock().unwrap();
        unsafe {
            self.allocator.free_memory(&mut allocation);
        }
    }

    fn map_memory(&self, memory: &AllocatedMemory, _size: vk::DeviceSize) -> Result<*mut u8> {
        let mut allocation = Self::block_cookie(memory).lock().unwrap();
        unsafe { self.allocator.map_memory(&mut allocation) }.map_err(Error::Allocation)
    }

    fn unmap_memory(&self, memory: &AllocatedMemory) {
        let mut allocation = Self::block_cookie(memory).lock().unwrap();
        unsafe {
            self.allocator.unmap_memory(&mut allocation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: flags.len() as u32,
            ..Default::default()
        };
        for (i, &property_flags) in flags.iter().enumerate() {
            properties.memory_types[i].property_flags = property_flags;
        }
        properties
    }

    #[test]
    fn prefers_required_plus_optional() {
        let properties = properties(&[
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT
                | vk::MemoryPropertyFlags::HOST_CACHED,
        ]);
        let index = find_memory_type(
            &properties,
            0b11,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::HOST_CACHED,
        );
        assert_eq!(index, Some(1));
    }

    #[test]
    fn falls_back_to_required() {
        let properties = properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);
        let index = find_memory_type(
            &properties,
            0b11,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::HOST_CACHED,
        );
        assert_eq!(index, Some(1));
    }

    #[test]
    fn respects_type_filter() {
        let properties = properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);
        let index = find_memory_type(
            &properties,
            0b10,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::empty(),
        );
        assert_eq!(index, Some(1));
    }

    #[test]
    fn reports_lookup_failure() {
        let properties = properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        let index = find_memory_type(
            &properties,
            0b1,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::empty(),
        );
        assert_eq!(index, None);
    }
}
