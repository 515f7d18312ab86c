// Frame slot ring
//
// N slots allocated up front, visited strictly in order. Steady-state
// frames never allocate.

use ash::vk;

use super::slot::FrameSlot;
use crate::error::{FrameError, FrameResult};
use crate::gpu::GpuDevice;

pub struct FrameSlotRing<D: GpuDevice> {
    slots: Vec<FrameSlot<D>>,
    current: usize,
}

impl<D: GpuDevice> FrameSlotRing<D> {
    pub fn new(
        device: &D,
        frames_in_flight: usize,
        uniform_size: vk::DeviceSize,
        compute_lane: bool,
    ) -> FrameResult<Self> {
        if frames_in_flight == 0 {
            return Err(FrameError::Config(
                "max_frames_in_flight must be at least 1".to_string(),
            ));
        }

        let mut slots = Vec::with_capacity(frames_in_flight);
        for i in 0..frames_in_flight {
            match FrameSlot::new(device, uniform_size, compute_lane) {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    // Nothing was submitted yet, so partial slots are safe to drop
                    for slot in slots {
                        slot.destroy(device);
                    }
                    return Err(e);
                }
            }
            log::debug!("Created frame slot {}", i);
        }

        log::info!(
            "Frame ring created with {} frames in flight{}",
            frames_in_flight,
            if compute_lane { " (compute lane enabled)" } else { "" }
        );

        Ok(Self { slots, current: 0 })
    }

    #[inline]
    pub fn current(&self) -> &FrameSlot<D> {
        &self.slots[self.current]
    }

    #[inline]
    pub fn current_mut(&mut self) -> &mut FrameSlot<D> {
        &mut self.slots[self.current]
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.current
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.slots.len();
    }

    pub fn iter(&self) -> impl Iterator<Item = &FrameSlot<D>> {
        self.slots.iter()
    }

    /// Destroy every slot. The device must be idle: a slot whose fence has
    /// not signaled is still referenced by the GPU, so nothing is destroyed
    /// and the ring is handed back with the error.
    pub fn destroy(self, device: &D) -> Result<(), (Self, FrameError)> {
        for (i, slot) in self.slots.iter().enumerate() {
            let signaled = match device.fence_signaled(slot.in_flight) {
                Ok(signaled) => signaled,
                Err(e) => return Err((self, e)),
            };
            if !signaled {
                let err = FrameError::misuse(format!(
                    "destroying frame slot {} while its fence is unsignaled",
                    i
                ));
                return Err((self, err));
            }
        }

        for slot in self.slots {
            slot.destroy(device);
        }
        log::info!("Frame ring destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{QueueRole, Submission};
    use crate::mock::MockDevice;

    #[test]
    fn zero_slots_is_a_config_error() {
        let device = MockDevice::new();
        let result = FrameSlotRing::new(&device, 0, 64, false);
        assert!(matches!(result, Err(FrameError::Config(_))));
    }

    #[test]
    fn all_slots_allocated_eagerly() {
        let device = MockDevice::new();
        let ring = FrameSlotRing::new(&device, 3, 64, false).unwrap();
        assert_eq!(ring.len(), 3);
        // 2 semaphores + 1 fence + 1 command buffer + 1 uniform per slot
        assert_eq!(device.live_objects(), 15);
    }

    #[test]
    fn advance_visits_every_slot_in_order() {
        let device = MockDevice::new();
        let mut ring = FrameSlotRing::new(&device, 3, 64, false).unwrap();
        let fences: Vec<_> = ring.iter().map(|s| s.in_flight).collect();

        let mut visited = Vec::new();
        for _ in 0..7 {
            visited.push(ring.current().in_flight);
            ring.advance();
        }
        assert_eq!(
            visited,
            vec![fences[0], fences[1], fences[2], fences[0], fences[1], fences[2], fences[0]]
        );
        assert_eq!(ring.index(), 1);
    }

    #[test]
    fn destroying_busy_slot_is_refused() {
        let device = MockDevice::new();
        let ring = FrameSlotRing::new(&device, 2, 64, false).unwrap();

        let slot = ring.current();
        device.reset_fence(slot.in_flight).unwrap();
        device
            .submit(
                QueueRole::Graphics,
                &Submission {
                    command_buffers: &[slot.command_buffer],
                    fence: Some(slot.in_flight),
                    ..Default::default()
                },
            )
            .unwrap();

        let (ring, err) = match ring.destroy(&device) {
            Ok(()) => panic!("busy ring was destroyed"),
            Err(pair) => pair,
        };
        assert!(matches!(err, FrameError::ProtocolMisuse(_)));
        assert_eq!(device.live_objects(), 10);

        device.wait_idle().unwrap();
        assert!(ring.destroy(&device).is_ok());
        assert_eq!(device.live_objects(), 0);
    }
}
