//! The resource registry and job factory.
//!
//! A [`JobManager`] owns the device connection, the memory allocator, the
//! descriptor and command pools, and a cache of reflected shader modules
//! keyed by path. Everything a job touches is created through it.
//!
//! The manager and the handles it returns are single-threaded by contract:
//! the descriptor pool, command pool, and shader cache are not internally
//! synchronized against concurrent recording. Serialize externally if jobs
//! must be recorded from more than one thread.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ash::vk;

use crate::alloc::{BlockAllocator, DeviceMemoryAllocator, SimpleAllocator};
use crate::device::{Device, DeviceComputeLimits, DeviceOptions};
use crate::error::{Error, Result};
use crate::job::Job;
use crate::pipeline::{create_descriptor_set_layout, SpecializationInfo, Task};
use crate::reflect::{self, ShaderInfo};
use crate::resource::{
    Buffer, BufferType, IdCounter, Image, Resource, ResourceSet,
};

/// Which [`DeviceMemoryAllocator`] implementation backs resource creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocatorKind {
    /// One dedicated device allocation per resource.
    Simple,
    /// Block suballocation through the Vulkan Memory Allocator library.
    #[default]
    Block,
}

/// Configuration for [`JobManager::with_options`].
#[derive(Default)]
pub struct JobManagerOptions {
    /// Enable the validation layer and debug messenger.
    pub validation: Option<bool>,
    pub allocator: AllocatorKind,
}

pub(crate) struct DescriptorArena {
    device: Device,
    pool: vk::DescriptorPool,
}

impl DescriptorArena {
    fn new(device: Device) -> Result<Self> {
        let sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: 256,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: 256,
            },
        ];
        let info = vk::DescriptorPoolCreateInfo::default()
            .pool_sizes(&sizes)
            .max_sets(256);
        let pool = unsafe { device.create_descriptor_pool(&info, None) }
            .map_err(|e| Error::DeviceInit(format!("failed to create descriptor pool: {e}")))?;
        Ok(Self { device, pool })
    }

    pub(crate) fn allocate(&self, layout: vk::DescriptorSetLayout) -> Result<vk::DescriptorSet> {
        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);
        let sets =
            unsafe { self.device.allocate_descriptor_sets(&info) }.map_err(Error::Allocation)?;
        Ok(sets[0])
    }
}

impl Drop for DescriptorArena {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_pool(self.pool, None);
        }
    }
}

pub(crate) struct CommandArena {
    device: Device,
    pool: vk::CommandPool,
}

impl CommandArena {
    fn new(device: Device) -> Result<Self> {
        let info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(device.queue_family_index());
        let pool = unsafe { device.create_command_pool(&info, None) }
            .map_err(|e| Error::DeviceInit(format!("failed to create command pool: {e}")))?;
        Ok(Self { device, pool })
    }

    fn allocate_primary(&self) -> Result<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers =
            unsafe { self.device.allocate_command_buffers(&info) }.map_err(Error::Allocation)?;
        Ok(buffers[0])
    }

    pub(crate) fn free(&self, command_buffer: vk::CommandBuffer) {
        unsafe {
            self.device
                .free_command_buffers(self.pool, &[command_buffer]);
        }
    }
}

impl Drop for CommandArena {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_command_pool(self.pool, None);
        }
    }
}

/// Writes one binding per resource into `set`: storage buffers bind their
/// whole range, storage images bind their view in the `GENERAL` layout.
pub(crate) fn update_descriptor_set(
    device: &Device,
    set: vk::DescriptorSet,
    resources: &[Resource],
) {
    enum Slot {
        Buffer(usize),
        Image(usize),
    }

    let mut buffer_infos = Vec::with_capacity(resources.len());
    let mut image_infos = Vec::with_capacity(resources.len());
    let slots: Vec<Slot> = resources
        .iter()
        .map(|resource| match resource {
            Resource::Buffer(buffer) => {
                buffer_infos.push(vk::DescriptorBufferInfo {
                    buffer: buffer.handle(),
                    offset: 0,
                    range: vk::WHOLE_SIZE,
                });
                Slot::Buffer(buffer_infos.len() - 1)
            }
            Resource::Image(image) => {
                image_infos.push(vk::DescriptorImageInfo {
                    sampler: vk::Sampler::null(),
                    image_view: image.view(),
                    image_layout: vk::ImageLayout::GENERAL,
                });
                Slot::Image(image_infos.len() - 1)
            }
        })
        .collect();

    let writes: Vec<vk::WriteDescriptorSet> = slots
        .iter()
        .enumerate()
        .map(|(binding, slot)| {
            let write = vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(binding as u32)
                .dst_array_element(0);
            match slot {
                Slot::Buffer(index) => write
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(std::slice::from_ref(&buffer_infos[*index])),
                Slot::Image(index) => write
                    .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                    .image_info(std::slice::from_ref(&image_infos[*index])),
            }
        })
        .collect();

    unsafe {
        device.update_descriptor_sets(&writes, &[]);
    }
}

struct CachedShader {
    module: vk::ShaderModule,
    info: Arc<ShaderInfo>,
}

/// Owner of the device connection and every pool a job draws from.
pub struct JobManager {
    device: Device,
    allocator: Arc<dyn DeviceMemoryAllocator>,
    descriptors: Arc<DescriptorArena>,
    commands: Arc<CommandArena>,
    shaders: HashMap<PathBuf, CachedShader>,
    ids: IdCounter,
}

impl JobManager {
    /// Brings up a device with default options and a block allocator.
    pub fn new() -> Result<Self> {
        Self::with_options(&JobManagerOptions::default())
    }

    pub fn with_options(options: &JobManagerOptions) -> Result<Self> {
        let device_options = DeviceOptions {
            validation: options
                .validation
                .unwrap_or_else(|| DeviceOptions::default().validation),
        };
        let device = Device::new(&device_options)?;
        let allocator: Arc<dyn DeviceMemoryAllocator> = match options.allocator {
            AllocatorKind::Simple => Arc::new(SimpleAllocator::new(device.clone())),
            AllocatorKind::Block => Arc::new(BlockAllocator::new(device.clone())?),
        };
        let descriptors = Arc::new(DescriptorArena::new(device.clone())?);
        let commands = Arc::new(CommandArena::new(device.clone())?);
        Ok(Self {
            device,
            allocator,
            descriptors,
            commands,
            shaders: HashMap::new(),
            ids: IdCounter::default(),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The allocator resources are created through.
    pub fn allocator(&self) -> &Arc<dyn DeviceMemoryAllocator> {
        &self.allocator
    }

    /// The compute limits of the selected physical device.
    pub fn compute_limits(&self) -> DeviceComputeLimits {
        self.device.compute_limits()
    }

    /// Loads, reflects, and compiles the compute shader at `path` into a
    /// [`Task`]. Modules are cached by path, so repeated tasks over the same
    /// shader reuse the module and its reflection.
    pub fn create_task(&mut self, path: impl AsRef<Path>) -> Result<Task> {
        self.build_task(path.as_ref(), None)
    }

    /// [`create_task`](Self::create_task) with specialization constants
    /// applied at pipeline creation.
    pub fn create_task_with_specialization(
        &mut self,
        path: impl AsRef<Path>,
        specialization: &SpecializationInfo,
    ) -> Result<Task> {
        self.build_task(path.as_ref(), Some(specialization))
    }

    fn build_task(
        &mut self,
        path: &Path,
        specialization: Option<&SpecializationInfo>,
    ) -> Result<Task> {
        let (module, info) = self.shader_entry(path)?;
        Task::new(self.device.clone(), module, info, specialization)
    }

    fn shader_entry(&mut self, path: &Path) -> Result<(vk::ShaderModule, Arc<ShaderInfo>)> {
        if let Some(cached) = self.shaders.get(path) {
            return Ok((cached.module, cached.info.clone()));
        }
        tracing::debug!(path = %path.display(), "loading and reflecting shader module");
        let bytes = std::fs::read(path).map_err(|source| Error::ShaderLoad {
            path: path.to_path_buf(),
            source,
        })?;
        let words = reflect::words_from_bytes(&bytes)?;
        let info = Arc::new(reflect::reflect(&words)?);
        let module_info = vk::ShaderModuleCreateInfo::default().code(&words);
        let module = unsafe { self.device.create_shader_module(&module_info, None) }
            .map_err(|e| Error::ShaderReflect(format!("module creation failed: {e}")))?;
        self.shaders.insert(
            path.to_path_buf(),
            CachedShader {
                module,
                info: info.clone(),
            },
        );
        Ok((module, info))
    }

    /// Creates a device-local storage buffer with a staging shadow.
    pub fn create_buffer(&self, size: vk::DeviceSize) -> Result<Buffer> {
        self.create_buffer_with_type(size, BufferType::DeviceLocal)
    }

    /// Creates a buffer of the given type. [`BufferType::DeviceLocal`]
    /// buffers get an automatically managed same-size staging shadow.
    pub fn create_buffer_with_type(
        &self,
        size: vk::DeviceSize,
        buffer_type: BufferType,
    ) -> Result<Buffer> {
        let (usage, required, optional) = match buffer_type {
            BufferType::DeviceLocal => (
                vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::TRANSFER_DST
                    | vk::BufferUsageFlags::STORAGE_BUFFER,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                vk::MemoryPropertyFlags::empty(),
            ),
            BufferType::Staging => (
                vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                vk::MemoryPropertyFlags::HOST_CACHED,
            ),
            BufferType::Uniform => (
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                vk::MemoryPropertyFlags::empty(),
            ),
        };

        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let (handle, memory) = self.allocator.create_buffer(&info, required, optional)?;

        let staging = if buffer_type == BufferType::DeviceLocal {
            Some(self.create_buffer_with_type(size, BufferType::Staging)?)
        } else {
            None
        };

        Ok(Buffer::new(
            self.device.clone(),
            self.allocator.clone(),
            self.ids.next(),
            handle,
            memory,
            size,
            buffer_type,
            staging,
        ))
    }

    /// Creates a device-local 2D RGBA8 storage image with a full-size
    /// staging shadow. The initial layout is `UNDEFINED`; upload data or
    /// call [`Job::sync_resource_to_device`](crate::Job::sync_resource_to_device)
    /// with `None` to move it to `GENERAL` before the first dispatch.
    pub fn create_image(&self, width: u32, height: u32) -> Result<Image> {
        const FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(FORMAT)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(
                vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::STORAGE,
            )
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let (handle, memory) = self.allocator.create_image(
            &info,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::empty(),
        )?;

        let view_info = vk::ImageViewCreateInfo::default()
            .image(handle)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(FORMAT)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        let view = match unsafe { self.device.create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(e) => {
                unsafe { self.device.destroy_image(handle, None) };
                self.allocator.free_memory(&memory);
                return Err(Error::Allocation(e));
            }
        };

        let staging_size = width as u64 * height as u64 * 4;
        let staging = match self.create_buffer_with_type(staging_size, BufferType::Staging) {
            Ok(staging) => staging,
            Err(e) => {
                unsafe {
                    self.device.destroy_image_view(view, None);
                    self.device.destroy_image(handle, None);
                }
                self.allocator.free_memory(&memory);
                return Err(e);
            }
        };

        Ok(Image::new(
            self.device.clone(),
            self.allocator.clone(),
            self.ids.next(),
            handle,
            memory,
            view,
            width,
            height,
            staging,
        ))
    }

    /// Builds a descriptor set over `resources` once, for reuse across any
    /// number of dispatches.
    pub fn create_resource_set(&self, resources: &[Resource]) -> Result<ResourceSet> {
        let kinds: Vec<_> = resources.iter().map(Resource::kind).collect();
        let layout = create_descriptor_set_layout(&self.device, &kinds)?;
        let set = match self.descriptors.allocate(layout) {
            Ok(set) => set,
            Err(e) => {
                unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
                return Err(e);
            }
        };
        update_descriptor_set(&self.device, set, resources);
        Ok(ResourceSet::new(
            self.device.clone(),
            layout,
            set,
            resources.to_vec(),
        ))
    }

    /// Creates a job with a fresh primary command buffer and a pre-signaled
    /// fence, ready for recording.
    pub fn create_job(&self) -> Result<Job> {
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
        let fence = unsafe { self.device.create_fence(&fence_info, None) }
            .map_err(|e| Error::DeviceInit(format!("failed to create fence: {e}")))?;
        let command_buffer = match self.commands.allocate_primary() {
            Ok(command_buffer) => command_buffer,
            Err(e) => {
                unsafe { self.device.destroy_fence(fence, None) };
                return Err(e);
            }
        };
        Job::new(
            self.device.clone(),
            self.allocator.clone(),
            self.descriptors.clone(),
            self.commands.clone(),
            command_buffer,
            self.device.queue(),
            fence,
        )
        .map_err(|e| {
            unsafe { self.device.destroy_fence(fence, None) };
            self.commands.free(command_buffer);
            e
        })
    }

    /// Wraps an externally owned command buffer in a job for recording only.
    /// Submitting or awaiting such a job fails with
    /// [`Error::IllegalState`]; the caller owns begin/end/submit.
    pub fn create_job_for_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Job {
        Job::for_external(
            self.device.clone(),
            self.allocator.clone(),
            self.descriptors.clone(),
            command_buffer,
        )
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        for shader in self.shaders.values() {
            unsafe {
                self.device.destroy_shader_module(shader.module, None);
            }
        }
    }
}
