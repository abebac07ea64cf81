//! # Scoria
//!
//! Host-side orchestration for Vulkan compute work: declare tasks and
//! resources, record jobs, submit, await, resubmit.
//!
//! A [`JobManager`] owns the device connection and creates everything else:
//! [`Task`]s (compiled compute shaders with reflected parameter layouts),
//! [`Buffer`]s and [`Image`]s (device resources with host-staging shadows),
//! [`ResourceSet`]s (pre-built descriptor sets), and [`Job`]s: recorded
//! sequences of dispatches, transfers, copies, push constants, and barriers.
//!
//! With automatic data-dependency management enabled (the default), the
//! recorder consults each shader's reflected read/write access per binding
//! and inserts the pipeline barriers between operations itself.
//!
//! ## Quick Start
//!
//! ```no_run
//! use scoria::prelude::*;
//!
//! # fn main() -> scoria::Result<()> {
//! let mut manager = JobManager::new()?;
//!
//! let task = manager.create_task("shaders/double.spv")?;
//! let buffer = manager.create_buffer(1024)?;
//!
//! let input = HostBuffer::from_slice(&[1u32; 256]);
//! let output = HostBuffer::with_len(1024);
//!
//! let mut job = manager.create_job()?;
//! job.sync_resource_to_device(&Resource::from(&buffer), Some(&input))?
//!     .use_resources(0, &[Resource::from(&buffer)])?
//!     .add_task(&task, 256)?
//!     .sync_resource_to_host(&Resource::from(&buffer), &output)?;
//!
//! job.submit()?;
//! job.await_completion(u64::MAX)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Reuse
//!
//! A job is recorded once; submitting it again re-executes the recorded
//! commands. Deferred transfers re-read their [`HostBuffer`]s at each
//! submit and re-fill them at each await, so a recorded job can be driven
//! with fresh inputs in a loop. Jobs can also be chained on the device by
//! passing the [`Semaphore`] returned from
//! [`Job::submit_with`] as a wait semaphore of a later submit.
//!
//! ## Threading
//!
//! Recording and submission of a single job belong to one host thread, and
//! the manager's pools are not internally synchronized; serialize externally
//! when sharing a manager across threads. Within a job, recording order is
//! GPU execution order, subject to the inserted barriers. Across jobs,
//! ordering exists only through fences (host side) or semaphores (device
//! side).

pub mod alloc;
pub mod device;
pub mod error;
pub mod job;
pub mod manager;
pub mod pipeline;
pub mod reflect;
pub mod resource;
pub mod tracking;

pub use device::{Device, DeviceComputeLimits, DeviceOptions};
pub use error::{Error, Result};
pub use job::{GroupCount, Job};
pub use manager::{AllocatorKind, JobManager, JobManagerOptions};
pub use pipeline::{SpecializationInfo, Task};
pub use resource::{
    Buffer, BufferType, DescriptorKind, HostBuffer, Image, Resource, ResourceId, ResourceSet,
    Semaphore,
};
pub use tracking::{AccessFlags, Stage};

pub use ash;

pub mod prelude {
    pub use crate::{
        ash,
        ash::vk,
        Buffer, BufferType, GroupCount, HostBuffer, Image, Job, JobManager, Resource,
        ResourceSet, Semaphore, SpecializationInfo, Task,
    };
}
