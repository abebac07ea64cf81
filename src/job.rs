//! Job recording, submission, and completion.
//!
//! A [`Job`] records a linear script of operations into one command buffer:
//! task dispatches, host-device transfers, device-device copies, push
//! constants, and barriers. Host-side copies are deferred: uploads are
//! flushed into host-visible memory when the job is submitted, downloads are
//! flushed out when it is awaited. With automatic data-dependency management
//! enabled (the default), buffer memory barriers between operations are
//! derived from the shaders' reflected access flags.
//!
//! # Lifecycle
//!
//! ```text
//! Recording --submit--> Submitted --await(success)--> Completed --submit--> Submitted ...
//!                                  `-await(timeout)-> Submitted (retry)
//! ```
//!
//! The command buffer is closed on the first submit; later submits re-enqueue
//! the already-recorded commands, re-running the deferred transfers against
//! the current [`HostBuffer`] contents. Recording after the first submit and
//! submitting again without awaiting both fail with
//! [`Error::IllegalState`].

use std::collections::BTreeMap;
use std::sync::Arc;

use ash::vk;
use smallvec::SmallVec;

use crate::alloc::{DeviceMemoryAllocator, MappedMemory};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::manager::{update_descriptor_set, CommandArena, DescriptorArena};
use crate::pipeline::Task;
use crate::resource::{Buffer, BufferType, HostBuffer, Image, Resource, ResourceSet, Semaphore};
use crate::tracking::{
    map_stage, AccessFlags, BarrierBatch, DependencyTracker, Stage, TrackedResource,
};

/// Workgroup counts for a dispatch. Converts from `u32`, pairs, triples, and
/// `[u32; 3]`; unspecified dimensions default to 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupCount {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl From<u32> for GroupCount {
    fn from(x: u32) -> Self {
        Self { x, y: 1, z: 1 }
    }
}

impl From<(u32, u32)> for GroupCount {
    fn from((x, y): (u32, u32)) -> Self {
        Self { x, y, z: 1 }
    }
}

impl From<(u32, u32, u32)> for GroupCount {
    fn from((x, y, z): (u32, u32, u32)) -> Self {
        Self { x, y, z }
    }
}

impl From<[u32; 3]> for GroupCount {
    fn from([x, y, z]: [u32; 3]) -> Self {
        Self { x, y, z }
    }
}

enum PendingBinding {
    Set(ResourceSet),
    List(Vec<Resource>),
}

impl PendingBinding {
    fn resources(&self) -> &[Resource] {
        match self {
            PendingBinding::Set(set) => set.resources(),
            PendingBinding::List(resources) => resources,
        }
    }
}

struct HostTransfer {
    /// Host-visible buffer on the device side of the copy.
    target: Buffer,
    size: vk::DeviceSize,
    host: HostBuffer,
}

struct Submission {
    queue: vk::Queue,
    fence: vk::Fence,
}

/// A recorded, submittable unit of GPU work. Created through
/// [`JobManager::create_job`](crate::JobManager::create_job).
pub struct Job {
    device: Device,
    allocator: Arc<dyn DeviceMemoryAllocator>,
    descriptors: Arc<DescriptorArena>,
    commands: Option<Arc<CommandArena>>,
    command_buffer: vk::CommandBuffer,
    submission: Option<Submission>,
    signal_semaphore: Option<vk::Semaphore>,
    is_recorded: bool,
    is_submitted: bool,
    auto_barriers: bool,
    pending_bindings: BTreeMap<u32, PendingBinding>,
    pending_constants: Option<Box<[u8]>>,
    pre_transfers: Vec<HostTransfer>,
    post_transfers: Vec<HostTransfer>,
    tracker: DependencyTracker,
    retained_resources: Vec<Resource>,
    retained_sets: Vec<ResourceSet>,
}

impl Job {
    pub(crate) fn new(
        device: Device,
        allocator: Arc<dyn DeviceMemoryAllocator>,
        descriptors: Arc<DescriptorArena>,
        commands: Arc<CommandArena>,
        command_buffer: vk::CommandBuffer,
        queue: vk::Queue,
        fence: vk::Fence,
    ) -> Result<Self> {
        unsafe {
            device
                .begin_command_buffer(command_buffer, &vk::CommandBufferBeginInfo::default())
                .map_err(Error::Recording)?;
        }
        Ok(Self {
            device,
            allocator,
            descriptors,
            commands: Some(commands),
            command_buffer,
            submission: Some(Submission { queue, fence }),
            signal_semaphore: None,
            is_recorded: false,
            is_submitted: false,
            auto_barriers: true,
            pending_bindings: BTreeMap::new(),
            pending_constants: None,
            pre_transfers: Vec::new(),
            post_transfers: Vec::new(),
            tracker: DependencyTracker::new(),
            retained_resources: Vec::new(),
            retained_sets: Vec::new(),
        })
    }

    /// Wraps an externally owned command buffer. The job records into it but
    /// never begins, ends, submits, or awaits it; [`submit_with`](Self::submit_with)
    /// and [`await_completion`](Self::await_completion) fail with
    /// [`Error::IllegalState`].
    pub(crate) fn for_external(
        device: Device,
        allocator: Arc<dyn DeviceMemoryAllocator>,
        descriptors: Arc<DescriptorArena>,
        command_buffer: vk::CommandBuffer,
    ) -> Self {
        Self {
            device,
            allocator,
            descriptors,
            commands: None,
            command_buffer,
            submission: None,
            signal_semaphore: None,
            is_recorded: false,
            is_submitted: false,
            auto_barriers: true,
            pending_bindings: BTreeMap::new(),
            pending_constants: None,
            pre_transfers: Vec::new(),
            post_transfers: Vec::new(),
            tracker: DependencyTracker::new(),
            retained_resources: Vec::new(),
            retained_sets: Vec::new(),
        }
    }

    /// Toggles automatic barrier insertion between transfers and task
    /// dispatches. Call before recording anything; with the toggle off, all
    /// barriers must be placed manually through the `wait_*` and `add_*`
    /// helpers.
    pub fn set_auto_data_dependency_management(&mut self, value: bool) -> &mut Self {
        self.auto_barriers = value;
        self
    }

    /// The underlying command buffer.
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    fn ensure_recording(&self) -> Result<()> {
        if self.is_recorded {
            return Err(Error::IllegalState(
                "job was already submitted; no further recording is possible",
            ));
        }
        Ok(())
    }

    /// Stages resources to be bound at `set_index` for the next dispatch.
    /// A later call for the same index replaces the earlier one.
    pub fn use_resources(&mut self, set_index: u32, resources: &[Resource]) -> Result<&mut Self> {
        self.ensure_recording()?;
        self.pending_bindings
            .insert(set_index, PendingBinding::List(resources.to_vec()));
        Ok(self)
    }

    /// Stages a pre-built [`ResourceSet`] at `set_index` for the next
    /// dispatch. A later call for the same index replaces the earlier one.
    pub fn use_resource_set(&mut self, set_index: u32, set: &ResourceSet) -> Result<&mut Self> {
        self.ensure_recording()?;
        self.pending_bindings
            .insert(set_index, PendingBinding::Set(set.clone()));
        Ok(self)
    }

    /// Records a dispatch of `task` with the pending bindings and pending
    /// push constants, inserting dependency barriers first when automatic
    /// management is enabled.
    pub fn add_task(&mut self, task: &Task, groups: impl Into<GroupCount>) -> Result<&mut Self> {
        self.ensure_recording()?;
        let groups = groups.into();

        if self.auto_barriers {
            self.check_pending_dependencies(task)?;
        }

        unsafe {
            self.device.cmd_bind_pipeline(
                self.command_buffer,
                vk::PipelineBindPoint::COMPUTE,
                task.pipeline(),
            );
        }
        self.bind_pending_resources(task)?;
        unsafe {
            self.device
                .cmd_dispatch(self.command_buffer, groups.x, groups.y, groups.z);
        }
        Ok(self)
    }

    /// [`use_resources`](Self::use_resources) for each element, then
    /// [`add_task`](Self::add_task).
    pub fn add_task_with_resources(
        &mut self,
        task: &Task,
        resources: &[&[Resource]],
        groups: impl Into<GroupCount>,
    ) -> Result<&mut Self> {
        for (i, row) in resources.iter().enumerate() {
            self.use_resources(i as u32, row)?;
        }
        self.add_task(task, groups)
    }

    /// [`use_resource_set`](Self::use_resource_set) for each element, then
    /// [`add_task`](Self::add_task).
    pub fn add_task_with_sets(
        &mut self,
        task: &Task,
        sets: &[ResourceSet],
        groups: impl Into<GroupCount>,
    ) -> Result<&mut Self> {
        for (i, set) in sets.iter().enumerate() {
            self.use_resource_set(i as u32, set)?;
        }
        self.add_task(task, groups)
    }

    /// Queues an upload into `resource`.
    ///
    /// For buffers, the copy into host-visible memory happens at submit time
    /// (or [`complete_pre_execution_transfers`](Self::complete_pre_execution_transfers));
    /// device-local buffers additionally record a staging-to-buffer copy.
    /// `min(data.len(), resource.size())` bytes are transferred.
    ///
    /// For images, the pixel data must match the image size exactly. Passing
    /// `None` performs no copy and only ensures the image is in the
    /// `GENERAL` layout, which every image needs before its first dispatch.
    pub fn sync_resource_to_device(
        &mut self,
        resource: &Resource,
        data: Option<&HostBuffer>,
    ) -> Result<&mut Self> {
        self.ensure_recording()?;
        match resource {
            Resource::Buffer(buffer) => {
                let size = data
                    .map(|host| (host.len() as u64).min(buffer.size()))
                    .unwrap_or(buffer.size());
                match buffer.buffer_type() {
                    BufferType::DeviceLocal => {
                        let staging = buffer
                            .staging_shadow()
                            .expect("device-local buffers always have a staging shadow")
                            .clone();
                        if let Some(host) = data {
                            self.pre_transfers.push(HostTransfer {
                                target: staging.clone(),
                                size,
                                host: host.clone(),
                            });
                        }
                        if self.auto_barriers {
                            let batch = self.tracker.track(
                                Stage::Transfer,
                                &[(tracked(resource), AccessFlags::WRITE)],
                            )?;
                            self.emit_batch(Stage::Transfer, &batch);
                        }
                        let region = vk::BufferCopy {
                            src_offset: 0,
                            dst_offset: 0,
                            size,
                        };
                        unsafe {
                            self.device.cmd_copy_buffer(
                                self.command_buffer,
                                staging.handle(),
                                buffer.handle(),
                                &[region],
                            );
                        }
                        self.retained_resources.push(resource.clone());
                    }
                    BufferType::Staging | BufferType::Uniform => {
                        if let Some(host) = data {
                            self.pre_transfers.push(HostTransfer {
                                target: buffer.clone(),
                                size,
                                host: host.clone(),
                            });
                        }
                    }
                }
            }
            Resource::Image(image) => {
                let host = match data {
                    Some(host) => host,
                    None => {
                        self.transition_image(image, vk::ImageLayout::GENERAL)?;
                        return Ok(self);
                    }
                };
                if host.len() as u64 != image.size() {
                    return Err(Error::SizeMismatch {
                        resource: image.size(),
                        data: host.len() as u64,
                    });
                }
                let staging = image.staging_shadow().clone();
                self.pre_transfers.push(HostTransfer {
                    target: staging.clone(),
                    size: image.size(),
                    host: host.clone(),
                });
                self.transition_image(image, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;
                let region = buffer_image_region(image.width(), image.height());
                unsafe {
                    self.device.cmd_copy_buffer_to_image(
                        self.command_buffer,
                        staging.handle(),
                        image.handle(),
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    );
                }
                self.transition_image(image, vk::ImageLayout::GENERAL)?;
                self.retained_resources.push(resource.clone());
            }
        }
        Ok(self)
    }

    /// Queues a download from `resource` into `data`, flushed when the job
    /// is awaited (or by
    /// [`complete_post_execution_transfers`](Self::complete_post_execution_transfers)).
    ///
    /// Buffers transfer `min(data.len(), resource.size())` bytes; for images,
    /// `data` must be at least the image size.
    pub fn sync_resource_to_host(
        &mut self,
        resource: &Resource,
        data: &HostBuffer,
    ) -> Result<&mut Self> {
        self.ensure_recording()?;
        match resource {
            Resource::Buffer(buffer) => {
                let size = (data.len() as u64).min(buffer.size());
                match buffer.buffer_type() {
                    BufferType::DeviceLocal => {
                        let staging = buffer
                            .staging_shadow()
                            .expect("device-local buffers always have a staging shadow")
                            .clone();
                        if self.auto_barriers {
                            let batch = self.tracker.track(
                                Stage::Transfer,
                                &[(tracked(resource), AccessFlags::READ)],
                            )?;
                            self.emit_batch(Stage::Transfer, &batch);
                        }
                        let region = vk::BufferCopy {
                            src_offset: 0,
                            dst_offset: 0,
                            size,
                        };
                        unsafe {
                            self.device.cmd_copy_buffer(
                                self.command_buffer,
                                buffer.handle(),
                                staging.handle(),
                                &[region],
                            );
                        }
                        self.post_transfers.push(HostTransfer {
                            target: staging,
                            size,
                            host: data.clone(),
                        });
                        self.retained_resources.push(resource.clone());
                    }
                    BufferType::Staging | BufferType::Uniform => {
                        self.post_transfers.push(HostTransfer {
                            target: buffer.clone(),
                            size,
                            host: data.clone(),
                        });
                    }
                }
            }
            Resource::Image(image) => {
                if (data.len() as u64) < image.size() {
                    return Err(Error::SizeMismatch {
                        resource: image.size(),
                        data: data.len() as u64,
                    });
                }
                let staging = image.staging_shadow().clone();
                self.transition_image(image, vk::ImageLayout::TRANSFER_SRC_OPTIMAL)?;
                let region = buffer_image_region(image.width(), image.height());
                unsafe {
                    self.device.cmd_copy_image_to_buffer(
                        self.command_buffer,
                        image.handle(),
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        staging.handle(),
                        &[region],
                    );
                }
                self.transition_image(image, vk::ImageLayout::GENERAL)?;
                self.post_transfers.push(HostTransfer {
                    target: staging,
                    size: image.size(),
                    host: data.clone(),
                });
                self.retained_resources.push(resource.clone());
            }
        }
        Ok(self)
    }

    /// Records a device-side copy between two resources of the same kind.
    /// Buffer pairs copy `min(src.size(), dst.size())` bytes; image pairs
    /// copy the clipped common extent. Buffer-image pairs fail with
    /// [`Error::UnsupportedSync`].
    pub fn sync_resources(&mut self, src: &Resource, dst: &Resource) -> Result<&mut Self> {
        self.ensure_recording()?;
        match (src, dst) {
            (Resource::Buffer(src_buffer), Resource::Buffer(dst_buffer)) => {
                if self.auto_barriers {
                    let batch = self.tracker.track(
                        Stage::Transfer,
                        &[
                            (tracked(src), AccessFlags::READ),
                            (tracked(dst), AccessFlags::WRITE),
                        ],
                    )?;
                    self.emit_batch(Stage::Transfer, &batch);
                }
                let region = vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size: src_buffer.size().min(dst_buffer.size()),
                };
                unsafe {
                    self.device.cmd_copy_buffer(
                        self.command_buffer,
                        src_buffer.handle(),
                        dst_buffer.handle(),
                        &[region],
                    );
                }
            }
            (Resource::Image(src_image), Resource::Image(dst_image)) => {
                self.transition_image(src_image, vk::ImageLayout::TRANSFER_SRC_OPTIMAL)?;
                self.transition_image(dst_image, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;
                let subresource = vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                };
                let region = vk::ImageCopy {
                    src_subresource: subresource,
                    dst_subresource: subresource,
                    extent: vk::Extent3D {
                        width: src_image.width().min(dst_image.width()),
                        height: src_image.height().min(dst_image.height()),
                        depth: 1,
                    },
                    ..Default::default()
                };
                unsafe {
                    self.device.cmd_copy_image(
                        self.command_buffer,
                        src_image.handle(),
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        dst_image.handle(),
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    );
                }
                self.transition_image(src_image, vk::ImageLayout::GENERAL)?;
                self.transition_image(dst_image, vk::ImageLayout::GENERAL)?;
            }
            _ => return Err(Error::UnsupportedSync),
        }
        self.retained_resources.push(src.clone());
        self.retained_resources.push(dst.clone());
        Ok(self)
    }

    /// Stores push-constant bytes for the next dispatch. A later call
    /// replaces any pending data.
    pub fn push_constants(&mut self, data: &[u8]) -> Result<&mut Self> {
        self.ensure_recording()?;
        self.pending_constants = Some(data.to_vec().into_boxed_slice());
        Ok(self)
    }

    /// [`push_constants`](Self::push_constants) from any plain-data value.
    pub fn push_constants_value<T: Copy>(&mut self, value: &T) -> Result<&mut Self> {
        let bytes = unsafe {
            std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>())
        };
        self.push_constants(bytes)
    }

    /// Makes later tasks wait for all earlier task writes. Also resets the
    /// dependency tracker, since the global barrier now covers everything
    /// recorded so far.
    pub fn wait_for_tasks_finish(&mut self) -> Result<&mut Self> {
        self.ensure_recording()?;
        self.tracker.clear();
        self.add_memory_barrier(
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::SHADER_WRITE,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::SHADER_READ,
        )
    }

    /// Makes later tasks wait for earlier transfer writes.
    pub fn wait_after_transfers(&mut self) -> Result<&mut Self> {
        self.add_memory_barrier(
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
        )
    }

    /// Makes later transfers wait for earlier task writes.
    pub fn wait_before_transfers(&mut self) -> Result<&mut Self> {
        self.add_memory_barrier(
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::SHADER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_READ,
        )
    }

    /// Records a global memory barrier. Does not update the dependency
    /// tracker.
    pub fn add_memory_barrier(
        &mut self,
        src_stage: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_stage: vk::PipelineStageFlags,
        dst_access: vk::AccessFlags,
    ) -> Result<&mut Self> {
        self.ensure_recording()?;
        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access);
        unsafe {
            self.device.cmd_pipeline_barrier(
                self.command_buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }
        Ok(self)
    }

    /// Records an execution-only barrier. Does not update the dependency
    /// tracker.
    pub fn add_execution_barrier(
        &mut self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) -> Result<&mut Self> {
        self.ensure_recording()?;
        unsafe {
            self.device.cmd_pipeline_barrier(
                self.command_buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[],
            );
        }
        Ok(self)
    }

    /// Manually transitions an image's layout. Only needed when integrating
    /// with an external pipeline; inside the job system layouts are managed
    /// at the operation sites.
    pub fn transition_image_layout(
        &mut self,
        image: &Image,
        new_layout: vk::ImageLayout,
    ) -> Result<&mut Self> {
        self.ensure_recording()?;
        self.transition_image(image, new_layout)?;
        Ok(self)
    }

    /// Submits without requesting a completion signal.
    pub fn submit(&mut self) -> Result<&mut Self> {
        self.submit_with(false, &[])?;
        Ok(self)
    }

    /// Closes the command buffer (first submit only), flushes pending
    /// uploads into host-visible memory, and enqueues the job.
    ///
    /// With `signal` set, a semaphore signaling job completion is created
    /// lazily, attached to the submission, and returned for chaining into
    /// another job's `wait_semaphores`.
    pub fn submit_with(
        &mut self,
        signal: bool,
        wait_semaphores: &[Semaphore],
    ) -> Result<Semaphore> {
        let submission = self
            .submission
            .as_ref()
            .ok_or(Error::IllegalState("job wraps an external command buffer"))?;
        let queue = submission.queue;
        let fence = submission.fence;

        if !self.is_recorded {
            unsafe {
                self.device
                    .end_command_buffer(self.command_buffer)
                    .map_err(Error::Recording)?;
            }
            self.is_recorded = true;
        }
        if self.is_submitted {
            return Err(Error::IllegalState(
                "job was submitted again without awaiting its completion",
            ));
        }

        self.complete_pre_execution_transfers()?;

        let signal_handle = if signal {
            Some(self.ensure_signal_semaphore()?)
        } else {
            None
        };

        let waits: SmallVec<[vk::Semaphore; 4]> = wait_semaphores
            .iter()
            .filter_map(|semaphore| semaphore.handle())
            .collect();
        let wait_stages: SmallVec<[vk::PipelineStageFlags; 4]> =
            smallvec::smallvec![vk::PipelineStageFlags::ALL_COMMANDS; waits.len()];

        let command_buffers = [self.command_buffer];
        let signals = signal_handle.map(|handle| [handle]);
        let mut submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
        if !waits.is_empty() {
            submit_info = submit_info
                .wait_semaphores(&waits)
                .wait_dst_stage_mask(&wait_stages);
        }
        if let Some(signals) = &signals {
            submit_info = submit_info.signal_semaphores(signals);
        }

        unsafe {
            self.device
                .reset_fences(&[fence])
                .map_err(Error::Submission)?;
            self.device
                .queue_submit(queue, &[submit_info], fence)
                .map_err(Error::Submission)?;
        }
        self.is_submitted = true;

        Ok(Semaphore::new(signal_handle))
    }

    /// Waits up to `timeout_ns` nanoseconds for the submitted work.
    ///
    /// On completion, flushes pending downloads to their [`HostBuffer`]s and
    /// returns `Ok(true)`; the job may then be submitted again. A timeout
    /// returns `Ok(false)`.
    pub fn await_completion(&mut self, timeout_ns: u64) -> Result<bool> {
        let submission = self
            .submission
            .as_ref()
            .ok_or(Error::IllegalState("job wraps an external command buffer"))?;
        match unsafe {
            self.device
                .wait_for_fences(&[submission.fence], true, timeout_ns)
        } {
            Ok(()) => {
                self.complete_post_execution_transfers()?;
                self.is_submitted = false;
                Ok(true)
            }
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(Error::Wait(e)),
        }
    }

    /// Non-blocking completion check; equivalent to
    /// [`await_completion(0)`](Self::await_completion).
    pub fn is_complete(&mut self) -> Result<bool> {
        self.await_completion(0)
    }

    /// Flushes queued uploads from their [`HostBuffer`]s into host-visible
    /// device memory. Called by [`submit_with`](Self::submit_with); call
    /// directly only when the command buffer is submitted outside the job
    /// system.
    pub fn complete_pre_execution_transfers(&self) -> Result<()> {
        for transfer in &self.pre_transfers {
            let len = transfer
                .size
                .min(transfer.host.len() as u64)
                .min(transfer.target.size());
            if len == 0 {
                continue;
            }
            let mut mapped =
                MappedMemory::map(self.allocator.as_ref(), transfer.target.memory(), len)?;
            transfer.host.with_bytes(|bytes| {
                mapped.as_mut_slice()[..len as usize].copy_from_slice(&bytes[..len as usize]);
            });
        }
        Ok(())
    }

    /// Flushes queued downloads from host-visible device memory into their
    /// [`HostBuffer`]s. Called by [`await_completion`](Self::await_completion)
    /// on success; call directly only when the command buffer is awaited
    /// outside the job system.
    pub fn complete_post_execution_transfers(&self) -> Result<()> {
        for transfer in &self.post_transfers {
            let len = transfer
                .size
                .min(transfer.host.len() as u64)
                .min(transfer.target.size());
            if len == 0 {
                continue;
            }
            let mapped =
                MappedMemory::map(self.allocator.as_ref(), transfer.target.memory(), len)?;
            transfer.host.with_bytes_mut(|bytes| {
                bytes[..len as usize].copy_from_slice(&mapped.as_slice()[..len as usize]);
            });
        }
        Ok(())
    }

    fn ensure_signal_semaphore(&mut self) -> Result<vk::Semaphore> {
        if let Some(semaphore) = self.signal_semaphore {
            return Ok(semaphore);
        }
        let semaphore =
            unsafe { self.device.create_semaphore(&Default::default(), None) }.map_err(|e| {
                Error::DeviceInit(format!("failed to create signal semaphore: {e}"))
            })?;
        self.signal_semaphore = Some(semaphore);
        Ok(semaphore)
    }

    fn check_pending_dependencies(&mut self, task: &Task) -> Result<()> {
        let access = task.access_flags();
        let mut tracked_accesses: Vec<(TrackedResource, AccessFlags)> = Vec::new();
        for (&pos, binding) in &self.pending_bindings {
            let resources = binding.resources();
            let expected = access.get(pos as usize).map(Vec::len).unwrap_or(0);
            if pos as usize >= access.len() || resources.len() != expected {
                return Err(Error::LayoutMismatch {
                    set: pos,
                    expected,
                    supplied: resources.len(),
                });
            }
            for (resource, &flags) in resources.iter().zip(&access[pos as usize]) {
                tracked_accesses.push((tracked(resource), flags));
            }
        }
        let batch = self.tracker.track(Stage::Task, &tracked_accesses)?;
        self.emit_batch(Stage::Task, &batch);
        Ok(())
    }

    fn bind_pending_resources(&mut self, task: &Task) -> Result<()> {
        let bindings = std::mem::take(&mut self.pending_bindings);
        let mut positions: SmallVec<[u32; 4]> = SmallVec::new();
        let mut handles: SmallVec<[vk::DescriptorSet; 4]> = SmallVec::new();

        for (pos, binding) in bindings {
            let handle = match binding {
                PendingBinding::Set(set) => {
                    let handle = set.descriptor_set();
                    self.retained_sets.push(set);
                    handle
                }
                PendingBinding::List(resources) => {
                    let layout = task.set_layout(pos).ok_or(Error::LayoutMismatch {
                        set: pos,
                        expected: 0,
                        supplied: resources.len(),
                    })?;
                    let set = self.descriptors.allocate(layout)?;
                    update_descriptor_set(&self.device, set, &resources);
                    self.retained_resources.extend(resources);
                    set
                }
            };
            positions.push(pos);
            handles.push(handle);
        }

        let mut start = 0usize;
        for (first_set, count) in coalesce_descriptor_runs(&positions) {
            let run = &handles[start..start + count as usize];
            unsafe {
                self.device.cmd_bind_descriptor_sets(
                    self.command_buffer,
                    vk::PipelineBindPoint::COMPUTE,
                    task.pipeline_layout(),
                    first_set,
                    run,
                    &[],
                );
            }
            start += count as usize;
        }

        if let Some(blob) = self.pending_constants.take() {
            let size = task.push_constant_size() as usize;
            if size > 0 {
                let mut data = vec![0u8; size];
                let copied = size.min(blob.len());
                data[..copied].copy_from_slice(&blob[..copied]);
                unsafe {
                    self.device.cmd_push_constants(
                        self.command_buffer,
                        task.pipeline_layout(),
                        vk::ShaderStageFlags::COMPUTE,
                        0,
                        &data,
                    );
                }
            }
        }
        Ok(())
    }

    fn emit_batch(&self, stage: Stage, batch: &BarrierBatch) {
        if batch.is_empty() {
            return;
        }
        let dst_stage = map_stage(stage);
        let groups = [
            (
                vk::PipelineStageFlags::COMPUTE_SHADER,
                &batch.from_compute,
            ),
            (vk::PipelineStageFlags::TRANSFER, &batch.from_transfer),
        ];
        for (src_stage, barriers) in groups {
            if barriers.is_empty() {
                continue;
            }
            let raw: SmallVec<[vk::BufferMemoryBarrier; 4]> = barriers
                .iter()
                .map(|barrier| {
                    vk::BufferMemoryBarrier::default()
                        .src_access_mask(barrier.src_access)
                        .dst_access_mask(barrier.dst_access)
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .buffer(barrier.buffer)
                        .offset(0)
                        .size(vk::WHOLE_SIZE)
                })
                .collect();
            unsafe {
                self.device.cmd_pipeline_barrier(
                    self.command_buffer,
                    src_stage,
                    dst_stage,
                    vk::DependencyFlags::empty(),
                    &[],
                    &raw,
                    &[],
                );
            }
        }
    }

    fn transition_image(&mut self, image: &Image, new_layout: vk::ImageLayout) -> Result<()> {
        let old_layout = image.layout();
        if old_layout == new_layout {
            return Ok(());
        }
        let (src_access, src_stage) = match old_layout {
            vk::ImageLayout::UNDEFINED => (
                vk::AccessFlags::empty(),
                vk::PipelineStageFlags::TOP_OF_PIPE,
            ),
            vk::ImageLayout::GENERAL => (
                vk::AccessFlags::SHADER_WRITE,
                vk::PipelineStageFlags::COMPUTE_SHADER,
            ),
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL | vk::ImageLayout::TRANSFER_DST_OPTIMAL => (
                vk::AccessFlags::TRANSFER_WRITE,
                vk::PipelineStageFlags::TRANSFER,
            ),
            _ => {
                return Err(Error::UnsupportedLayoutTransition {
                    from: old_layout,
                    to: new_layout,
                })
            }
        };
        let (dst_access, dst_stage) = match new_layout {
            vk::ImageLayout::GENERAL => (
                vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
                vk::PipelineStageFlags::COMPUTE_SHADER,
            ),
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL => (
                vk::AccessFlags::TRANSFER_READ,
                vk::PipelineStageFlags::TRANSFER,
            ),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL => (
                vk::AccessFlags::TRANSFER_WRITE,
                vk::PipelineStageFlags::TRANSFER,
            ),
            _ => {
                return Err(Error::UnsupportedLayoutTransition {
                    from: old_layout,
                    to: new_layout,
                })
            }
        };

        let barrier = vk::ImageMemoryBarrier::default()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image.handle())
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        unsafe {
            self.device.cmd_pipeline_barrier(
                self.command_buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
        image.set_layout(new_layout);
        Ok(())
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        if let Some(submission) = &self.submission {
            if self.is_submitted {
                tracing::warn!("dropping a submitted job; blocking on its fence first");
                unsafe {
                    let _ = self
                        .device
                        .wait_for_fences(&[submission.fence], true, u64::MAX);
                }
            }
            unsafe {
                self.device.destroy_fence(submission.fence, None);
            }
        }
        if let Some(semaphore) = self.signal_semaphore.take() {
            unsafe {
                self.device.destroy_semaphore(semaphore, None);
            }
        }
        if let Some(commands) = &self.commands {
            commands.free(self.command_buffer);
        }
    }
}

fn tracked(resource: &Resource) -> TrackedResource {
    TrackedResource {
        id: resource.id(),
        kind: resource.kind(),
        buffer: match resource {
            Resource::Buffer(buffer) => buffer.handle(),
            Resource::Image(_) => vk::Buffer::null(),
        },
    }
}

fn buffer_image_region(width: u32, height: u32) -> vk::BufferImageCopy {
    vk::BufferImageCopy {
        buffer_offset: 0,
        buffer_row_length: 0,
        buffer_image_height: 0,
        image_subresource: vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        },
        image_offset: vk::Offset3D::default(),
        image_extent: vk::Extent3D {
            width,
            height,
            depth: 1,
        },
    }
}

/// Splits ascending set indices into runs of consecutive values, returning
/// `(first_set, count)` per run. Each run becomes one bind command.
fn coalesce_descriptor_runs(positions: &[u32]) -> SmallVec<[(u32, u32); 4]> {
    let mut runs: SmallVec<[(u32, u32); 4]> = SmallVec::new();
    for &pos in positions {
        match runs.last_mut() {
            Some((first, count)) if *first + *count == pos => *count += 1,
            _ => runs.push((pos, 1)),
        }
    }
    runs
}
