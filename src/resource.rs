//! GPU resources and their host-side counterparts.
//!
//! Resources are cheap reference-counted handles; the backing Vulkan objects
//! are destroyed when the last clone drops. A [`Buffer`] of the
//! [`BufferType::DeviceLocal`] type always owns a same-size host-visible
//! [staging shadow](Buffer::staging_shadow); [`BufferType::Staging`] and
//! [`BufferType::Uniform`] buffers are host-visible themselves and never have
//! one. An [`Image`] is a 2D RGBA8 storage image with a full-size staging
//! shadow and a host-tracked current layout.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ash::vk;

use crate::alloc::{AllocatedMemory, DeviceMemoryAllocator};
use crate::device::Device;

/// Monotonic per-manager resource identifier. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(u64);

#[derive(Default)]
pub(crate) struct IdCounter(AtomicU64);

impl IdCounter {
    pub(crate) fn next(&self) -> ResourceId {
        ResourceId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// Descriptor kind a resource binds as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    StorageBuffer,
    StorageImage,
}

impl DescriptorKind {
    pub(crate) fn descriptor_type(self) -> vk::DescriptorType {
        match self {
            DescriptorKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            DescriptorKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
        }
    }
}

/// Memory placement of a [`Buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferType {
    /// Device-local storage buffer with an automatically managed staging
    /// shadow for host transfers.
    #[default]
    DeviceLocal,
    /// Host-visible, host-coherent transfer buffer.
    Staging,
    /// Host-visible uniform buffer.
    Uniform,
}

struct BufferInner {
    device: Device,
    allocator: Arc<dyn DeviceMemoryAllocator>,
    id: ResourceId,
    handle: vk::Buffer,
    memory: AllocatedMemory,
    size: vk::DeviceSize,
    buffer_type: BufferType,
    staging: Option<Buffer>,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_buffer(self.handle, None);
        }
        self.allocator.free_memory(&self.memory);
    }
}

/// A device buffer handle.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

impl Buffer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        device: Device,
        allocator: Arc<dyn DeviceMemoryAllocator>,
        id: ResourceId,
        handle: vk::Buffer,
        memory: AllocatedMemory,
        size: vk::DeviceSize,
        buffer_type: BufferType,
        staging: Option<Buffer>,
    ) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                device,
                allocator,
                id,
                handle,
                memory,
                size,
                buffer_type,
                staging,
            }),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.inner.id
    }

    pub fn handle(&self) -> vk::Buffer {
        self.inner.handle
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.inner.size
    }

    pub fn buffer_type(&self) -> BufferType {
        self.inner.buffer_type
    }

    /// The host-visible shadow of a [`BufferType::DeviceLocal`] buffer;
    /// `None` for the host-visible types.
    pub fn staging_shadow(&self) -> Option<&Buffer> {
        self.inner.staging.as_ref()
    }

    pub(crate) fn memory(&self) -> &AllocatedMemory {
        &self.inner.memory
    }

    /// This buffer as a bindable [`Resource`] handle.
    pub fn as_resource(&self) -> Resource {
        Resource::Buffer(self.clone())
    }
}

struct ImageInner {
    device: Device,
    allocator: Arc<dyn DeviceMemoryAllocator>,
    id: ResourceId,
    handle: vk::Image,
    view: vk::ImageView,
    width: u32,
    height: u32,
    channels: u32,
    // Raw vk::ImageLayout; tracked host-side so recorded transitions and the
    // host's view of the layout stay in lockstep.
    layout: AtomicI32,
    staging: Buffer,
    memory: AllocatedMemory,
}

impl Drop for ImageInner {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_image_view(self.view, None);
            self.device.destroy_image(self.handle, None);
        }
        self.allocator.free_memory(&self.memory);
    }
}

/// A 2D RGBA8 storage image handle.
#[derive(Clone)]
pub struct Image {
    inner: Arc<ImageInner>,
}

impl Image {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        device: Device,
        allocator: Arc<dyn DeviceMemoryAllocator>,
        id: ResourceId,
        handle: vk::Image,
        memory: AllocatedMemory,
        view: vk::ImageView,
        width: u32,
        height: u32,
        staging: Buffer,
    ) -> Self {
        Self {
            inner: Arc::new(ImageInner {
                device,
                allocator,
                id,
                handle,
                view,
                width,
                height,
                channels: 4,
                layout: AtomicI32::new(vk::ImageLayout::UNDEFINED.as_raw()),
                staging,
                memory,
            }),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.inner.id
    }

    pub fn handle(&self) -> vk::Image {
        self.inner.handle
    }

    pub fn view(&self) -> vk::ImageView {
        self.inner.view
    }

    pub fn width(&self) -> u32 {
        self.inner.width
    }

    pub fn height(&self) -> u32 {
        self.inner.height
    }

    pub fn channels(&self) -> u32 {
        self.inner.channels
    }

    /// Total pixel data size in bytes (width x height x channels).
    pub fn size(&self) -> vk::DeviceSize {
        self.inner.width as u64 * self.inner.height as u64 * self.inner.channels as u64
    }

    /// The layout the image is in between recorded operations.
    pub fn layout(&self) -> vk::ImageLayout {
        vk::ImageLayout::from_raw(self.inner.layout.load(Ordering::Relaxed))
    }

    pub(crate) fn set_layout(&self, layout: vk::ImageLayout) {
        self.inner.layout.store(layout.as_raw(), Ordering::Relaxed);
    }

    /// The full-size staging shadow carrying pixel data across the
    /// host-device boundary.
    pub fn staging_shadow(&self) -> &Buffer {
        &self.inner.staging
    }

    /// This image as a bindable [`Resource`] handle.
    pub fn as_resource(&self) -> Resource {
        Resource::Image(self.clone())
    }
}

/// Any resource a job can bind or transfer.
#[derive(Clone)]
pub enum Resource {
    Buffer(Buffer),
    Image(Image),
}

impl Resource {
    pub fn id(&self) -> ResourceId {
        match self {
            Resource::Buffer(buffer) => buffer.id(),
            Resource::Image(image) => image.id(),
        }
    }

    pub fn kind(&self) -> DescriptorKind {
        match self {
            Resource::Buffer(_) => DescriptorKind::StorageBuffer,
            Resource::Image(_) => DescriptorKind::StorageImage,
        }
    }

    pub fn size(&self) -> vk::DeviceSize {
        match self {
            Resource::Buffer(buffer) => buffer.size(),
            Resource::Image(image) => image.size(),
        }
    }
}

impl From<Buffer> for Resource {
    fn from(buffer: Buffer) -> Self {
        Resource::Buffer(buffer)
    }
}

impl From<&Buffer> for Resource {
    fn from(buffer: &Buffer) -> Self {
        Resource::Buffer(buffer.clone())
    }
}

impl From<Image> for Resource {
    fn from(image: Image) -> Self {
        Resource::Image(image)
    }
}

impl From<&Image> for Resource {
    fn from(image: &Image) -> Self {
        Resource::Image(image.clone())
    }
}

struct ResourceSetInner {
    device: Device,
    layout: vk::DescriptorSetLayout,
    descriptor_set: vk::DescriptorSet,
    resources: Vec<Resource>,
}

impl Drop for ResourceSetInner {
    fn drop(&mut self) {
        unsafe {
            // The descriptor set itself is reclaimed with the pool.
            self.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

/// A pre-built descriptor set over an ordered list of resources.
///
/// Created once through the manager and bound any number of times; reuse
/// avoids a descriptor allocation per dispatch.
#[derive(Clone)]
pub struct ResourceSet {
    inner: Arc<ResourceSetInner>,
}

impl ResourceSet {
    pub(crate) fn new(
        device: Device,
        layout: vk::DescriptorSetLayout,
        descriptor_set: vk::DescriptorSet,
        resources: Vec<Resource>,
    ) -> Self {
        Self {
            inner: Arc::new(ResourceSetInner {
                device,
                layout,
                descriptor_set,
                resources,
            }),
        }
    }

    pub fn descriptor_set(&self) -> vk::DescriptorSet {
        self.inner.descriptor_set
    }

    pub(crate) fn resources(&self) -> &[Resource] {
        &self.inner.resources
    }
}

/// A completion-signal handle returned by [`Job::submit_with`](crate::Job::submit_with).
///
/// Non-owning: the underlying semaphore belongs to the job that produced it
/// and stays valid until that job drops. The handle is absent when no signal
/// was requested at submit time.
#[derive(Debug, Clone, Copy, Default)]
pub struct Semaphore {
    handle: Option<vk::Semaphore>,
}

impl Semaphore {
    pub(crate) fn new(handle: Option<vk::Semaphore>) -> Self {
        Self { handle }
    }

    /// Whether a completion signal was requested at submit time.
    pub fn is_signaling(&self) -> bool {
        self.handle.is_some()
    }

    pub fn handle(&self) -> Option<vk::Semaphore> {
        self.handle
    }
}

/// Host-side byte storage feeding and receiving deferred transfers.
///
/// Uploads queued with [`Job::sync_resource_to_device`](crate::Job::sync_resource_to_device)
/// read from the `HostBuffer` when the job is submitted, and downloads queued
/// with [`Job::sync_resource_to_host`](crate::Job::sync_resource_to_host)
/// write into it when the job is awaited, so rewriting the contents between
/// submits of a recorded job feeds fresh data to each execution.
#[derive(Clone)]
pub struct HostBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl HostBuffer {
    /// A zero-filled buffer of `len` bytes.
    pub fn with_len(len: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0; len])),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytes.to_vec())),
        }
    }

    /// Copies a plain-data slice into a new buffer.
    pub fn from_slice<T: Copy>(data: &[T]) -> Self {
        let bytes = unsafe {
            std::slice::from_raw_parts(data.as_ptr() as *const u8, std::mem::size_of_val(data))
        };
        Self::from_bytes(bytes)
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrites the contents from a plain-data slice. The length must
    /// match the buffer's current length.
    pub fn write_slice<T: Copy>(&self, data: &[T]) {
        let new = unsafe {
            std::slice::from_raw_parts(data.as_ptr() as *const u8, std::mem::size_of_val(data))
        };
        let mut bytes = self.bytes.lock().unwrap();
        assert_eq!(bytes.len(), new.len(), "host buffer length mismatch");
        bytes.copy_from_slice(new);
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.lock().unwrap().clone()
    }

    /// Reads the contents back as a plain-data vector.
    pub fn read_slice<T: Copy>(&self) -> Vec<T> {
        let bytes = self.bytes.lock().unwrap();
        bytes
            .chunks_exact(std::mem::size_of::<T>())
            .map(|chunk| unsafe { std::ptr::read_unaligned(chunk.as_ptr() as *const T) })
            .collect()
    }

    pub(crate) fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.bytes.lock().unwrap())
    }

    pub(crate) fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.bytes.lock().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_counter_is_monotonic() {
        let counter = IdCounter::default();
        let a = counter.next();
        let b = counter.next();
        assert!(b > a);
    }

    #[test]
    fn host_buffer_round_trips_typed_data() {
        let host = HostBuffer::from_slice(&[1u32, 2, 3]);
        assert_eq!(host.len(), 12);
        assert_eq!(host.read_slice::<u32>(), vec![1, 2, 3]);
        host.write_slice(&[4u32, 5, 6]);
        assert_eq!(host.read_slice::<u32>(), vec![4, 5, 6]);
    }
}
