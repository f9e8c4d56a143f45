// =============================================================================
// VULKAN FRAME ENGINE
// =============================================================================
//
// Frame-in-flight rendering on top of ash:
//
// ┌─────────────────────────────────────────────────────────────────┐
// │  Host loop (winit ApplicationHandler, main.rs)                  │
// │    └── Renderer                                                 │
// │          ├── FrameScheduler (fences, semaphores, image fences)  │
// │          └── RenderContext (FrameBackend over real Vulkan)      │
// │                ├── VulkanDevice (instance, surface, allocator)  │
// │                ├── Swapchain + dependent objects                │
// │                └── DeletionQueues (main, swapchain)             │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Wait for the slot's fence
// 2. Acquire a swapchain image (stale -> recreate, skip frame)
// 3. Wait for whichever frame last used that image
// 4. Record, reset fence, submit
// 5. Present (stale/suboptimal -> recreate)
// 6. Advance to the next slot

pub mod assets;
pub mod backend;
pub mod config;
pub mod renderer;
pub mod uniforms;
pub mod window;

pub use config::Config;
pub use renderer::Renderer;
pub use window::WindowContext;
