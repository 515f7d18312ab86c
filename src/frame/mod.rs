// Frame pacing: slots, the slot ring and the per-frame coordinator

pub mod coordinator;
pub mod ring;
pub mod slot;

pub use coordinator::{
    CoordinatorSettings, FrameOutcome, FrameRecorder, FrameReport, RecordContext,
    SubmissionCoordinator,
};
pub use ring::FrameSlotRing;
pub use slot::{ComputeLane, FrameSlot};
