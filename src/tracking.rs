//! Automatic data-dependency tracking and barrier derivation.
//!
//! Each [`Job`](crate::Job) keeps a [`DependencyTracker`]: a map from
//! resource id to the last recorded access that is not yet covered by a
//! barrier. When a new operation touches resources, the tracker compares the
//! requested access against the last unguarded one and produces the buffer
//! memory barriers the command stream needs, grouped by source stage so the
//! recorder can issue at most one pipeline-barrier command per group.
//!
//! Read-after-read needs no barrier and is elided, as is any pairing with an
//! [`AccessFlags::NONE`] side (a binding the shader declares but never
//! touches). A resource used twice by one dispatch is handled once with the
//! OR of its requested accesses.
//!
//! Images do not participate: their hazards are covered by the eager layout
//! transitions recorded at the operation sites, and an image access that
//! would otherwise require a barrier here fails with
//! [`Error::UnsupportedResourceType`].

use std::collections::{BTreeMap, HashMap};
use std::ops::{BitOr, BitOrAssign};

use ash::vk;
use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::resource::{DescriptorKind, ResourceId};

/// How an operation touches a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessFlags(u32);

impl AccessFlags {
    pub const NONE: AccessFlags = AccessFlags(0);
    pub const READ: AccessFlags = AccessFlags(1);
    pub const WRITE: AccessFlags = AccessFlags(1 << 1);

    pub fn contains(self, other: AccessFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for AccessFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for AccessFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Pipeline stage class an access happens in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Host-device or device-device copies.
    Transfer,
    /// Compute shader dispatches.
    Task,
}

pub(crate) fn map_stage(stage: Stage) -> vk::PipelineStageFlags {
    match stage {
        Stage::Transfer => vk::PipelineStageFlags::TRANSFER,
        Stage::Task => vk::PipelineStageFlags::COMPUTE_SHADER,
    }
}

/// The exact stage/access translation the emitted barriers use.
pub(crate) fn map_stage_and_access(
    stage: Stage,
    access: AccessFlags,
) -> (vk::PipelineStageFlags, vk::AccessFlags) {
    let mut mask = vk::AccessFlags::empty();
    match stage {
        Stage::Task => {
            if access.contains(AccessFlags::READ) {
                mask |= vk::AccessFlags::SHADER_READ;
            }
            if access.contains(AccessFlags::WRITE) {
                mask |= vk::AccessFlags::SHADER_WRITE;
            }
            (vk::PipelineStageFlags::COMPUTE_SHADER, mask)
        }
        Stage::Transfer => {
            if access.contains(AccessFlags::READ) {
                mask |= vk::AccessFlags::TRANSFER_READ;
            }
            if access.contains(AccessFlags::WRITE) {
                mask |= vk::AccessFlags::TRANSFER_WRITE;
            }
            (vk::PipelineStageFlags::TRANSFER, mask)
        }
    }
}

/// A resource as the tracker sees it: identity, kind, and the buffer handle
/// a barrier would name.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TrackedResource {
    pub id: ResourceId,
    pub kind: DescriptorKind,
    pub buffer: vk::Buffer,
}

/// One buffer memory barrier to record, with the source and destination
/// access masks already derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BufferBarrier {
    pub buffer: vk::Buffer,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
}

/// Barriers produced for one operation, bucketed by the stage of the prior
/// access. The recorder issues at most one pipeline-barrier command per
/// non-empty bucket, with the destination stage of the new operation.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct BarrierBatch {
    pub from_compute: SmallVec<[BufferBarrier; 4]>,
    pub from_transfer: SmallVec<[BufferBarrier; 4]>,
}

impl BarrierBatch {
    pub fn is_empty(&self) -> bool {
        self.from_compute.is_empty() && self.from_transfer.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct LastAccess {
    access: AccessFlags,
    stage: Stage,
}

/// Per-job map of the last unguarded access to each resource.
#[derive(Default)]
pub(crate) struct DependencyTracker {
    unguarded: HashMap<ResourceId, LastAccess>,
}

impl DependencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets all recorded accesses. Called when a global barrier covers
    /// everything that came before.
    pub fn clear(&mut self) {
        self.unguarded.clear();
    }

    /// Registers one operation's accesses and derives the barriers that must
    /// precede it.
    pub fn track(
        &mut self,
        stage: Stage,
        accesses: &[(TrackedResource, AccessFlags)],
    ) -> Result<BarrierBatch> {
        // Coalesce duplicates, OR-ing their access bits; iteration in id
        // order keeps the emitted barriers deterministic.
        let mut unique: BTreeMap<ResourceId, (TrackedResource, AccessFlags)> = BTreeMap::new();
        for &(resource, access) in accesses {
            unique
                .entry(resource.id)
                .and_modify(|entry| entry.1 |= access)
                .or_insert((resource, access));
        }

        let mut batch = BarrierBatch::default();
        for (id, (resource, requested)) in unique {
            if let Some(last) = self.unguarded.get(&id) {
                let read_after_read =
                    last.access == AccessFlags::READ && requested == AccessFlags::READ;
                if !read_after_read && !last.access.is_none() && !requested.is_none() {
                    if resource.kind != DescriptorKind::StorageBuffer {
                        return Err(Error::UnsupportedResourceType);
                    }
                    let (_, src_access) = map_stage_and_access(last.stage, last.access);
                    let (_, dst_access) = map_stage_and_access(stage, requested);
                    let barrier = BufferBarrier {
                        buffer: resource.buffer,
                        src_access,
                        dst_access,
                    };
                    match last.stage {
                        Stage::Task => batch.from_compute.push(barrier),
                        Stage::Transfer => batch.from_transfer.push(barrier),
                    }
                }
            }
            self.unguarded.insert(
                id,
                LastAccess {
                    access: requested,
                    stage,
                },
            );
        }
        Ok(batch)
    }
}
