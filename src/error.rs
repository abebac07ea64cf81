//! Error types for job recording, submission, and resource creation.

use std::path::PathBuf;

use ash::vk;

/// Crate-wide result alias. Recorder methods return `Result<&mut Job>` so
/// fluent chains short-circuit on the first failure.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure conditions surfaced by the job system.
///
/// Recording errors are fatal to the job that produced them: a job whose
/// recording failed must not be submitted. Submission and wait errors are
/// surfaced to the caller; a fence timeout is reported as a successful
/// non-signaling return from [`Job::await_completion`](crate::Job::await_completion),
/// not as an error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Underlying API bring-up failed (instance, device, queue, pool, fence).
    #[error("device initialization failed: {0}")]
    DeviceInit(String),

    /// Device memory or pool allocation failed.
    #[error("allocation failed: {0}")]
    Allocation(vk::Result),

    /// No device memory type satisfies the required property flags.
    #[error("no suitable device memory type")]
    MemoryTypeLookup,

    /// Shader file missing or unreadable.
    #[error("failed to read shader {path:?}: {source}")]
    ShaderLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed shader bytecode or an unsupported descriptor kind.
    #[error("shader reflection failed: {0}")]
    ShaderReflect(String),

    /// Command buffer begin/end failed.
    #[error("command buffer recording failed: {0}")]
    Recording(vk::Result),

    /// Queue submission failed.
    #[error("queue submission failed: {0}")]
    Submission(vk::Result),

    /// Fence wait failed (distinct from a timeout).
    #[error("fence wait failed: {0}")]
    Wait(vk::Result),

    /// Operation not legal in the job's current state.
    #[error("illegal job state: {0}")]
    IllegalState(&'static str),

    /// Bound resources disagree with the task's reflected descriptor layout.
    #[error("bound resources do not match shader layout: set {set} expects {expected} bindings, {supplied} supplied")]
    LayoutMismatch {
        set: u32,
        expected: usize,
        supplied: usize,
    },

    /// Resource-to-resource sync between a buffer and an image.
    #[error("unsupported sync between resources")]
    UnsupportedSync,

    /// Resource kind not handled by the automatic dependency tracker.
    #[error("unsupported resource type in dependency tracking")]
    UnsupportedResourceType,

    /// Image layout transition outside the supported table.
    #[error("unsupported image layout transition: {from:?} -> {to:?}")]
    UnsupportedLayoutTransition {
        from: vk::ImageLayout,
        to: vk::ImageLayout,
    },

    /// Host data length incompatible with the resource size.
    #[error("data size {data} does not match resource size {resource}")]
    SizeMismatch { resource: u64, data: u64 },
}
