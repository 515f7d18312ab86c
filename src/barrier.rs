// Barriers: queue family ownership transfer and image layout transitions
//
// A buffer written on one queue family and read on another needs a
// release barrier on the producer's command buffer and an acquire barrier
// with the same range and family pair on the consumer's. The release hands
// back a PendingAcquire that carries the exact parameters, so the two
// halves can't disagree. The TransferLedger tracks ownership and refuses
// to let a frame finish recording with a release still open.

use std::collections::HashMap;

use ash::vk;

use crate::error::{FrameError, FrameResult};
use crate::gpu::{GpuDevice, QueueFamily};

/// Region of a buffer covered by a barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRange {
    pub buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

impl BufferRange {
    /// Whole buffer, as the original allocation size
    pub fn whole(buffer: vk::Buffer, size: vk::DeviceSize) -> Self {
        Self {
            buffer,
            offset: 0,
            size,
        }
    }
}

/// Pipeline stage + access pair on one side of a dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessScope {
    pub stage: vk::PipelineStageFlags,
    pub access: vk::AccessFlags,
}

impl AccessScope {
    pub const TRANSFER_WRITE: Self = Self {
        stage: vk::PipelineStageFlags::TRANSFER,
        access: vk::AccessFlags::TRANSFER_WRITE,
    };
    pub const TRANSFER_READ: Self = Self {
        stage: vk::PipelineStageFlags::TRANSFER,
        access: vk::AccessFlags::TRANSFER_READ,
    };
    pub const COMPUTE_WRITE: Self = Self {
        stage: vk::PipelineStageFlags::COMPUTE_SHADER,
        access: vk::AccessFlags::SHADER_WRITE,
    };
    pub const VERTEX_READ: Self = Self {
        stage: vk::PipelineStageFlags::VERTEX_INPUT,
        access: vk::AccessFlags::VERTEX_ATTRIBUTE_READ,
    };
}

/// A planned handoff of a buffer range from one queue family to another
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnershipTransfer {
    pub range: BufferRange,
    pub src_family: QueueFamily,
    pub src_scope: AccessScope,
    pub dst_family: QueueFamily,
    pub dst_scope: AccessScope,
}

impl OwnershipTransfer {
    pub fn new(
        range: BufferRange,
        src_family: QueueFamily,
        src_scope: AccessScope,
        dst_family: QueueFamily,
        dst_scope: AccessScope,
    ) -> Self {
        Self {
            range,
            src_family,
            src_scope,
            dst_family,
            dst_scope,
        }
    }

    /// No ownership change needed, an ordinary barrier is enough
    #[inline]
    pub fn is_same_family(&self) -> bool {
        self.src_family == self.dst_family
    }

    /// Record the release half on the producer's command buffer.
    pub fn release<D: GpuDevice>(
        self,
        device: &D,
        cmd: vk::CommandBuffer,
        ledger: &mut TransferLedger,
    ) -> FrameResult<PendingAcquire> {
        ledger.begin_release(&self)?;

        if !self.is_same_family() {
            // dst access is ignored by a release
            let barrier = self.buffer_barrier(self.src_scope.access, vk::AccessFlags::empty());
            device.pipeline_barrier(
                cmd,
                self.src_scope.stage,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                &[barrier],
                &[],
            );
            log::trace!(
                "Released {:?} from family {} to {}",
                self.range.buffer,
                self.src_family.0,
                self.dst_family.0
            );
        }

        Ok(PendingAcquire { transfer: self })
    }

    fn buffer_barrier(
        &self,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
    ) -> vk::BufferMemoryBarrier<'static> {
        let (src_family, dst_family) = if self.is_same_family() {
            (vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED)
        } else {
            (self.src_family.0, self.dst_family.0)
        };

        vk::BufferMemoryBarrier::default()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .src_queue_family_index(src_family)
            .dst_queue_family_index(dst_family)
            .buffer(self.range.buffer)
            .offset(self.range.offset)
            .size(self.range.size)
    }
}

/// Second half of an ownership transfer. Must be acquired on the consumer
/// queue before the frame finishes recording.
#[must_use = "a released buffer must be acquired by the destination queue"]
#[derive(Debug)]
pub struct PendingAcquire {
    transfer: OwnershipTransfer,
}

impl PendingAcquire {
    pub fn transfer(&self) -> &OwnershipTransfer {
        &self.transfer
    }

    /// Record the acquire half on the consumer's command buffer.
    pub fn acquire<D: GpuDevice>(
        self,
        device: &D,
        cmd: vk::CommandBuffer,
        ledger: &mut TransferLedger,
    ) -> FrameResult<()> {
        let t = self.transfer;
        ledger.complete_acquire(&t)?;

        if t.is_same_family() {
            let barrier = t.buffer_barrier(t.src_scope.access, t.dst_scope.access);
            device.pipeline_barrier(cmd, t.src_scope.stage, t.dst_scope.stage, &[barrier], &[]);
        } else {
            // src access is ignored by an acquire
            let barrier = t.buffer_barrier(vk::AccessFlags::empty(), t.dst_scope.access);
            device.pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                t.dst_scope.stage,
                &[barrier],
                &[],
            );
        }
        Ok(())
    }
}

/// Ownership state for every buffer that crosses queues
#[derive(Debug, Default)]
pub struct TransferLedger {
    owners: HashMap<vk::Buffer, QueueFamily>,
    in_transit: Vec<OwnershipTransfer>,
}

impl TransferLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner(&self, buffer: vk::Buffer) -> Option<QueueFamily> {
        self.owners.get(&buffer).copied()
    }

    /// Take a buffer on `family` without preserving its contents.
    ///
    /// Only valid when the previous consumer is known to be finished (the
    /// slot fence covers it) and the new owner overwrites the whole range.
    pub fn claim_discarding(&mut self, range: BufferRange, family: QueueFamily) -> FrameResult<()> {
        if self.in_transit.iter().any(|t| t.range.buffer == range.buffer) {
            return Err(FrameError::misuse(format!(
                "claiming {:?} while a transfer of it is still open",
                range.buffer
            )));
        }
        self.owners.insert(range.buffer, family);
        Ok(())
    }

    fn begin_release(&mut self, transfer: &OwnershipTransfer) -> FrameResult<()> {
        let buffer = transfer.range.buffer;
        if self.in_transit.iter().any(|t| t.range.buffer == buffer) {
            return Err(FrameError::misuse(format!(
                "releasing {:?} twice without an acquire in between",
                buffer
            )));
        }
        match self.owners.get(&buffer) {
            Some(owner) if *owner != transfer.src_family => {
                return Err(FrameError::misuse(format!(
                    "family {} releasing {:?} owned by family {}",
                    transfer.src_family.0, buffer, owner.0
                )));
            }
            _ => {}
        }
        self.in_transit.push(*transfer);
        Ok(())
    }

    fn complete_acquire(&mut self, transfer: &OwnershipTransfer) -> FrameResult<()> {
        let position = self
            .in_transit
            .iter()
            .position(|t| t == transfer)
            .ok_or_else(|| {
                FrameError::misuse(format!(
                    "acquire of {:?} without a matching release",
                    transfer.range.buffer
                ))
            })?;
        self.in_transit.swap_remove(position);
        self.owners.insert(transfer.range.buffer, transfer.dst_family);
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.in_transit.len()
    }

    /// Error if any release has not been matched by its acquire
    pub fn ensure_settled(&self) -> FrameResult<()> {
        match self.in_transit.first() {
            None => Ok(()),
            Some(open) => Err(FrameError::misuse(format!(
                "{} release barrier(s) without a matching acquire (first: {:?} family {} -> {})",
                self.in_transit.len(),
                open.range.buffer,
                open.src_family.0,
                open.dst_family.0
            ))),
        }
    }

    /// Forget open transfers after a failed frame so the next one can start clean
    pub fn abandon_pending(&mut self) {
        if !self.in_transit.is_empty() {
            log::warn!("Dropping {} unfinished ownership transfer(s)", self.in_transit.len());
            for t in self.in_transit.drain(..) {
                self.owners.remove(&t.range.buffer);
            }
        }
    }
}

/// Masks and stages for a one-shot image layout change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutTransition {
    pub src: AccessScope,
    pub dst: AccessScope,
    pub aspect: vk::ImageAspectFlags,
}

/// Look up the barrier parameters for a layout change we know how to do.
pub fn layout_transition(
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> FrameResult<LayoutTransition> {
    use vk::ImageLayout as L;

    let nothing = AccessScope {
        stage: vk::PipelineStageFlags::TOP_OF_PIPE,
        access: vk::AccessFlags::empty(),
    };

    let transition = match (old, new) {
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => LayoutTransition {
            src: nothing,
            dst: AccessScope::TRANSFER_WRITE,
            aspect: vk::ImageAspectFlags::COLOR,
        },
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => LayoutTransition {
            src: AccessScope::TRANSFER_WRITE,
            dst: AccessScope {
                stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
                access: vk::AccessFlags::SHADER_READ,
            },
            aspect: vk::ImageAspectFlags::COLOR,
        },
        // Depth is read in early tests and written in late tests
        (L::UNDEFINED, L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL) => LayoutTransition {
            src: nothing,
            dst: AccessScope {
                stage: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                access: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            },
            aspect: vk::ImageAspectFlags::DEPTH,
        },
        (L::UNDEFINED, L::COLOR_ATTACHMENT_OPTIMAL) => LayoutTransition {
            src: nothing,
            dst: AccessScope {
                stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            },
            aspect: vk::ImageAspectFlags::COLOR,
        },
        (L::COLOR_ATTACHMENT_OPTIMAL, L::PRESENT_SRC_KHR) => LayoutTransition {
            src: AccessScope {
                stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            },
            dst: AccessScope {
                stage: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                access: vk::AccessFlags::empty(),
            },
            aspect: vk::ImageAspectFlags::COLOR,
        },
        _ => return Err(FrameError::UnsupportedTransition { old, new }),
    };
    Ok(transition)
}

/// Record a layout change for the first mip level / layer of `image`
pub fn transition_image<D: GpuDevice>(
    device: &D,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> FrameResult<()> {
    let t = layout_transition(old, new)?;
    let barrier = vk::ImageMemoryBarrier::default()
        .src_access_mask(t.src.access)
        .dst_access_mask(t.dst.access)
        .old_layout(old)
        .new_layout(new)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: t.aspect,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });
    device.pipeline_barrier(cmd, t.src.stage, t.dst.stage, &[], &[barrier]);
    Ok(())
}
