// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash with explicit ownership of every handle.
// Swapchain-dependent objects live in one deletion queue, lifetime objects
// in another; both are flushed only after a device-idle barrier.

pub mod buffer;
pub mod commands;
pub mod deletion_queue;
pub mod descriptors;
pub mod device;
pub mod image;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use deletion_queue::DeletionQueue;
pub use device::VulkanDevice;
pub use swapchain::{AcquireOutcome, PresentOutcome, Swapchain, SwapchainPreferences};
pub use sync::{FrameBackend, FrameOutcome, FrameScheduler, FrameSync};
