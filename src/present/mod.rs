// Presentation surface and the generation arena behind it

pub mod arena;
pub mod surface;

pub use arena::{ArenaHandle, GenArena};
pub use surface::{
    AcquireOutcome, PresentOutcome, PresentationSurface, RebuildOutcome, SurfaceResource,
    SwapchainBackend, SwapchainImages,
};
