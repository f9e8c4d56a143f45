// Synchronization primitives and the frame-in-flight protocol
//
// Fences for GPU-CPU sync, semaphores for GPU-GPU ordering.
// FrameScheduler drives one frame at a time through a FrameBackend:
//
//   wait slot fence -> acquire -> wait image fence -> record
//     -> reset fence + submit -> present -> next slot
//
// Staleness (out-of-date / suboptimal surface) never escapes as an error,
// it routes into swapchain recreation.

use anyhow::{ensure, Result};
use ash::vk;

use super::swapchain::{AcquireOutcome, PresentOutcome};
use super::VulkanDevice;

/// Frame synchronization - one per frame in flight
#[derive(Debug, Clone, Copy)]
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &VulkanDevice) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let fence_info = vk::FenceCreateInfo::builder()
            .flags(vk::FenceCreateFlags::SIGNALED); // First wait must not block

        unsafe {
            Ok(Self {
                image_available: device.device.create_semaphore(&semaphore_info, None)?,
                render_finished: device.device.create_semaphore(&semaphore_info, None)?,
                in_flight_fence: device.device.create_fence(&fence_info, None)?,
            })
        }
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}

/// Where a frame slot is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Acquiring,
    Recording,
    Submitted,
    Presenting,
}

impl FrameState {
    /// Legal transitions. A stale acquire drops straight back to Idle.
    pub fn can_advance_to(self, next: FrameState) -> bool {
        use FrameState::*;
        matches!(
            (self, next),
            (Idle, Acquiring)
                | (Acquiring, Recording)
                | (Acquiring, Idle)
                | (Recording, Submitted)
                | (Submitted, Presenting)
                | (Presenting, Idle)
        )
    }
}

/// Result of one `draw_frame` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Work was submitted and handed to presentation. `recreated` is set
    /// when the swapchain was rebuilt afterwards.
    Presented {
        slot: usize,
        image_index: u32,
        recreated: bool,
    },
    /// The surface was stale at acquire time; the swapchain was rebuilt
    /// and nothing was drawn.
    Recreated,
    /// The window has no drawable area.
    Skipped,
}

/// GPU operations the frame protocol needs.
///
/// The renderer implements this over real Vulkan objects; tests drive the
/// scheduler with a simulated GPU.
pub trait FrameBackend {
    /// Block until `fence` is signaled.
    fn wait_for_fence(&mut self, fence: vk::Fence) -> Result<()>;

    fn reset_fence(&mut self, fence: vk::Fence) -> Result<()>;

    fn acquire_next_image(&mut self, image_available: vk::Semaphore) -> Result<AcquireOutcome>;

    /// Prepare the command buffer targeting `image_index`.
    fn record(&mut self, image_index: u32) -> Result<()>;

    /// Submit the image's command buffer: wait `image_available`, signal
    /// `render_finished` and `in_flight_fence`.
    fn submit(&mut self, image_index: u32, sync: &FrameSync) -> Result<()>;

    fn present(&mut self, image_index: u32, render_finished: vk::Semaphore)
        -> Result<PresentOutcome>;

    fn wait_idle(&mut self) -> Result<()>;

    /// Tear down and rebuild everything that depends on the swapchain.
    /// Returns the new image count (0 when there is nothing to draw to).
    fn recreate_swapchain(&mut self) -> Result<u32>;
}

struct FrameSlot {
    sync: FrameSync,
    state: FrameState,
}

/// Per-frame-in-flight fence/semaphore controller
pub struct FrameScheduler {
    slots: Vec<FrameSlot>,
    /// Fence of the frame that last rendered to each swapchain image (null = none)
    images_in_flight: Vec<vk::Fence>,
    current_frame: usize,
    recreate_requested: bool,
}

impl FrameScheduler {
    pub fn new(frames: Vec<FrameSync>, image_count: u32) -> Result<Self> {
        ensure!(!frames.is_empty(), "At least one frame in flight is required");

        log::info!(
            "Frame scheduler: {} frames in flight, {} swapchain images",
            frames.len(),
            image_count
        );

        Ok(Self {
            slots: frames
                .into_iter()
                .map(|sync| FrameSlot {
                    sync,
                    state: FrameState::Idle,
                })
                .collect(),
            images_in_flight: vec![vk::Fence::null(); image_count as usize],
            current_frame: 0,
            recreate_requested: false,
        })
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    /// Slot the next `draw_frame` will use
    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    pub fn image_count(&self) -> usize {
        self.images_in_flight.len()
    }

    pub fn slot_state(&self, slot: usize) -> FrameState {
        self.slots[slot].state
    }

    /// Fence currently guarding `image_index`, if any frame used it.
    pub fn image_fence(&self, image_index: u32) -> Option<vk::Fence> {
        self.images_in_flight
            .get(image_index as usize)
            .copied()
            .filter(|fence| *fence != vk::Fence::null())
    }

    /// Rebuild the swapchain after the next presented frame (window resize,
    /// present mode change).
    pub fn request_recreate(&mut self) {
        self.recreate_requested = true;
    }

    pub fn recreate_requested(&self) -> bool {
        self.recreate_requested
    }

    /// Run one frame through the protocol.
    pub fn draw_frame<B: FrameBackend>(&mut self, backend: &mut B) -> Result<FrameOutcome> {
        let slot = self.current_frame;
        let sync = self.slots[slot].sync;

        // The GPU may still be executing the last submission of this slot
        backend.wait_for_fence(sync.in_flight_fence)?;

        self.transition(slot, FrameState::Acquiring);
        let (image_index, acquire_suboptimal) =
            match backend.acquire_next_image(sync.image_available)? {
                AcquireOutcome::Ready { image_index, suboptimal } => (image_index, suboptimal),
                AcquireOutcome::Stale => {
                    // Fence stays signaled: nothing was submitted for this slot
                    self.transition(slot, FrameState::Idle);
                    log::debug!("Swapchain out of date at acquire, recreating");
                    self.recreate(backend)?;
                    return Ok(FrameOutcome::Recreated);
                }
            };

        let image = image_index as usize;
        ensure!(
            image < self.images_in_flight.len(),
            "Acquired image index {} outside swapchain of {} images",
            image_index,
            self.images_in_flight.len()
        );

        // Another slot may still be rendering into this image
        let previous = self.images_in_flight[image];
        if previous != vk::Fence::null() && previous != sync.in_flight_fence {
            backend.wait_for_fence(previous)?;
        }
        self.images_in_flight[image] = sync.in_flight_fence;

        self.transition(slot, FrameState::Recording);
        backend.record(image_index)?;

        // Reset only right before submitting, so an early return above
        // never leaves an unsignaled fence nobody will signal
        backend.reset_fence(sync.in_flight_fence)?;
        backend.submit(image_index, &sync)?;
        self.transition(slot, FrameState::Submitted);

        self.transition(slot, FrameState::Presenting);
        let present = backend.present(image_index, sync.render_finished)?;
        self.transition(slot, FrameState::Idle);

        self.current_frame = (self.current_frame + 1) % self.slots.len();

        let stale = present == PresentOutcome::Stale;
        let recreated = stale || acquire_suboptimal || self.recreate_requested;
        if recreated {
            log::debug!(
                "Recreating swapchain after present (stale: {}, suboptimal acquire: {}, requested: {})",
                stale,
                acquire_suboptimal,
                self.recreate_requested
            );
            self.recreate(backend)?;
        }

        Ok(FrameOutcome::Presented {
            slot,
            image_index,
            recreated,
        })
    }

    /// Device-idle barrier, full swapchain rebuild, fresh image fence table.
    pub fn recreate<B: FrameBackend>(&mut self, backend: &mut B) -> Result<()> {
        backend.wait_idle()?;
        let image_count = backend.recreate_swapchain()?;

        self.images_in_flight.clear();
        self.images_in_flight
            .resize(image_count as usize, vk::Fence::null());
        self.recreate_requested = false;

        log::info!("Swapchain recreated with {} images", image_count);
        Ok(())
    }

    fn transition(&mut self, slot: usize, next: FrameState) {
        let state = &mut self.slots[slot].state;
        debug_assert!(
            state.can_advance_to(next),
            "Illegal frame transition {:?} -> {:?} in slot {}",
            state,
            next,
            slot
        );
        log::trace!("Frame slot {}: {:?} -> {:?}", slot, state, next);
        *state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use ash::vk::Handle;
    use std::collections::{HashMap, VecDeque};

    const FENCE_BASE: u64 = 100;
    const IMAGE_AVAILABLE_BASE: u64 = 200;
    const RENDER_FINISHED_BASE: u64 = 300;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum FenceState {
        Signaled,
        Unsignaled,
        Pending,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Wait(u64),
        Reset(u64),
        Acquire { slot: u64, image_index: Option<u32> },
        Record(u32),
        Submit { image_index: u32, fence: u64 },
        Present(u32),
        WaitIdle,
        Recreate(u32),
    }

    /// Fence/semaphore bookkeeping standing in for a real device
    struct SimulatedGpu {
        fences: HashMap<u64, FenceState>,
        image_count: u32,
        next_image: u32,
        acquire_script: VecDeque<AcquireOutcome>,
        present_script: VecDeque<PresentOutcome>,
        /// Submissions complete as soon as they are queued
        immediate_completion: bool,
        image_count_after_recreate: u32,
        blocking_waits: Vec<u64>,
        events: Vec<Event>,
    }

    impl SimulatedGpu {
        fn new(frames: usize, image_count: u32) -> Self {
            Self {
                fences: (0..frames as u64)
                    .map(|i| (FENCE_BASE + i, FenceState::Signaled))
                    .collect(),
                image_count,
                next_image: 0,
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                immediate_completion: true,
                image_count_after_recreate: image_count,
                blocking_waits: Vec::new(),
                events: Vec::new(),
            }
        }
    }

    impl FrameBackend for SimulatedGpu {
        fn wait_for_fence(&mut self, fence: vk::Fence) -> Result<()> {
            let raw = fence.as_raw();
            self.events.push(Event::Wait(raw));
            match self.fences[&raw] {
                FenceState::Signaled => {}
                FenceState::Pending => {
                    // CPU blocks until the GPU finishes
                    self.blocking_waits.push(raw);
                    self.fences.insert(raw, FenceState::Signaled);
                }
                FenceState::Unsignaled => bail!("deadlock: fence {} will never be signaled", raw),
            }
            Ok(())
        }

        fn reset_fence(&mut self, fence: vk::Fence) -> Result<()> {
            self.events.push(Event::Reset(fence.as_raw()));
            self.fences.insert(fence.as_raw(), FenceState::Unsignaled);
            Ok(())
        }

        fn acquire_next_image(&mut self, image_available: vk::Semaphore) -> Result<AcquireOutcome> {
            let outcome = self.acquire_script.pop_front().unwrap_or_else(|| {
                let image_index = self.next_image % self.image_count;
                self.next_image += 1;
                AcquireOutcome::Ready {
                    image_index,
                    suboptimal: false,
                }
            });
            let image_index = match outcome {
                AcquireOutcome::Ready { image_index, .. } => Some(image_index),
                AcquireOutcome::Stale => None,
            };
            self.events.push(Event::Acquire {
                slot: image_available.as_raw() - IMAGE_AVAILABLE_BASE,
                image_index,
            });
            Ok(outcome)
        }

        fn record(&mut self, image_index: u32) -> Result<()> {
            self.events.push(Event::Record(image_index));
            Ok(())
        }

        fn submit(&mut self, image_index: u32, sync: &FrameSync) -> Result<()> {
            let raw = sync.in_flight_fence.as_raw();
            if self.fences[&raw] != FenceState::Unsignaled {
                bail!("fence {} submitted without reset", raw);
            }
            self.events.push(Event::Submit {
                image_index,
                fence: raw,
            });
            let state = if self.immediate_completion {
                FenceState::Signaled
            } else {
                FenceState::Pending
            };
            self.fences.insert(raw, state);
            Ok(())
        }

        fn present(
            &mut self,
            image_index: u32,
            _render_finished: vk::Semaphore,
        ) -> Result<PresentOutcome> {
            self.events.push(Event::Present(image_index));
            Ok(self
                .present_script
                .pop_front()
                .unwrap_or(PresentOutcome::Presented))
        }

        fn wait_idle(&mut self) -> Result<()> {
            self.events.push(Event::WaitIdle);
            for state in self.fences.values_mut() {
                if *state == FenceState::Pending {
                    *state = FenceState::Signaled;
                }
            }
            Ok(())
        }

        fn recreate_swapchain(&mut self) -> Result<u32> {
            if let Some((raw, _)) = self.fences.iter().find(|(_, s)| **s == FenceState::Pending) {
                bail!("swapchain torn down while fence {} is still pending", raw);
            }
            self.image_count = self.image_count_after_recreate;
            self.next_image = 0;
            self.events.push(Event::Recreate(self.image_count));
            Ok(self.image_count)
        }
    }

    fn frame_syncs(count: usize) -> Vec<FrameSync> {
        (0..count as u64)
            .map(|i| FrameSync {
                image_available: vk::Semaphore::from_raw(IMAGE_AVAILABLE_BASE + i),
                render_finished: vk::Semaphore::from_raw(RENDER_FINISHED_BASE + i),
                in_flight_fence: vk::Fence::from_raw(FENCE_BASE + i),
            })
            .collect()
    }

    fn scheduler(frames: usize, image_count: u32) -> FrameScheduler {
        FrameScheduler::new(frame_syncs(frames), image_count).unwrap()
    }

    /// Index of the first event matching `pred`
    fn event_position(gpu: &SimulatedGpu, pred: impl Fn(&Event) -> bool) -> usize {
        gpu.events
            .iter()
            .position(pred)
            .unwrap_or_else(|| panic!("event missing from {:?}", gpu.events))
    }

    fn assert_idle_before_recreate(gpu: &SimulatedGpu) {
        let idle = event_position(gpu, |e| *e == Event::WaitIdle);
        let recreate = event_position(gpu, |e| matches!(e, Event::Recreate(_)));
        assert!(
            idle < recreate,
            "device-idle barrier must precede teardown: {:?}",
            gpu.events
        );
    }

    fn presented_slot(outcome: FrameOutcome) -> usize {
        match outcome {
            FrameOutcome::Presented { slot, .. } => slot,
            other => panic!("expected a presented frame, got {:?}", other),
        }
    }

    #[test]
    fn two_slots_alternate_over_five_frames() {
        let mut frames = scheduler(2, 3);
        let mut gpu = SimulatedGpu::new(2, 3);

        let slots: Vec<usize> = (0..5)
            .map(|_| presented_slot(frames.draw_frame(&mut gpu).unwrap()))
            .collect();

        assert_eq!(slots, vec![0, 1, 0, 1, 0]);
        assert_eq!(frames.current_frame(), 1);
    }

    #[test]
    fn slot_fence_is_waited_before_its_command_buffer_is_recorded() {
        let mut frames = scheduler(2, 3);
        let mut gpu = SimulatedGpu::new(2, 3);
        gpu.immediate_completion = false;

        for _ in 0..7 {
            frames.draw_frame(&mut gpu).unwrap();
        }

        // fence -> submitted and not yet waited on
        let mut outstanding: HashMap<u64, bool> = HashMap::new();
        let mut current_slot = None;
        for event in &gpu.events {
            match event {
                Event::Submit { fence, .. } => {
                    outstanding.insert(*fence, true);
                }
                Event::Wait(fence) => {
                    outstanding.insert(*fence, false);
                }
                Event::Acquire { slot, .. } => current_slot = Some(*slot),
                Event::Record(_) => {
                    let fence = FENCE_BASE + current_slot.unwrap();
                    assert!(
                        !outstanding.get(&fence).copied().unwrap_or(false),
                        "recorded while fence {} was still in flight",
                        fence
                    );
                }
                _ => {}
            }
        }
    }

    #[test]
    fn reused_image_blocks_on_the_fence_of_its_previous_frame() {
        let mut frames = scheduler(2, 1);
        let mut gpu = SimulatedGpu::new(2, 1);
        gpu.immediate_completion = false;

        frames.draw_frame(&mut gpu).unwrap();
        assert!(gpu.blocking_waits.is_empty());
        assert_eq!(frames.image_fence(0), Some(vk::Fence::from_raw(FENCE_BASE)));

        // Slot 1 gets image 0 while slot 0's submission is still running
        frames.draw_frame(&mut gpu).unwrap();
        assert_eq!(gpu.blocking_waits, vec![FENCE_BASE]);
        assert_eq!(frames.image_fence(0), Some(vk::Fence::from_raw(FENCE_BASE + 1)));

        let wait_index = gpu
            .events
            .iter()
            .rposition(|e| *e == Event::Wait(FENCE_BASE))
            .unwrap();
        let record_index = gpu.events.iter().rposition(|e| *e == Event::Record(0)).unwrap();
        assert!(wait_index < record_index);
    }

    #[test]
    fn stale_acquire_recreates_then_next_acquire_is_in_range() {
        let mut frames = scheduler(2, 3);
        let mut gpu = SimulatedGpu::new(2, 3);
        gpu.immediate_completion = false;
        gpu.acquire_script.push_back(AcquireOutcome::Stale);
        gpu.image_count_after_recreate = 4;

        let outcome = frames.draw_frame(&mut gpu).unwrap();
        assert_eq!(outcome, FrameOutcome::Recreated);
        assert_idle_before_recreate(&gpu);
        assert!(gpu.events.contains(&Event::Recreate(4)));
        assert_eq!(frames.image_count(), 4);
        // The skipped frame keeps its slot and never touched its fence
        assert_eq!(frames.current_frame(), 0);
        assert!(!gpu.events.iter().any(|e| matches!(e, Event::Reset(_))));

        match frames.draw_frame(&mut gpu).unwrap() {
            FrameOutcome::Presented { slot, image_index, .. } => {
                assert_eq!(slot, 0);
                assert!((image_index as usize) < frames.image_count());
            }
            other => panic!("expected a presented frame, got {:?}", other),
        }
    }

    #[test]
    fn stale_present_triggers_recreation() {
        let mut frames = scheduler(2, 3);
        let mut gpu = SimulatedGpu::new(2, 3);
        // The frame just submitted is still executing when present reports stale
        gpu.immediate_completion = false;
        gpu.present_script.push_back(PresentOutcome::Stale);

        let outcome = frames.draw_frame(&mut gpu).unwrap();

        assert_eq!(
            outcome,
            FrameOutcome::Presented {
                slot: 0,
                image_index: 0,
                recreated: true
            }
        );
        assert_eq!(gpu.events.last(), Some(&Event::Recreate(3)));
        assert_idle_before_recreate(&gpu);
        assert_eq!(frames.current_frame(), 1);
    }

    #[test]
    fn suboptimal_acquire_still_draws_then_recreates() {
        let mut frames = scheduler(2, 3);
        let mut gpu = SimulatedGpu::new(2, 3);
        gpu.acquire_script.push_back(AcquireOutcome::Ready {
            image_index: 2,
            suboptimal: true,
        });

        let outcome = frames.draw_frame(&mut gpu).unwrap();

        assert_eq!(
            outcome,
            FrameOutcome::Presented {
                slot: 0,
                image_index: 2,
                recreated: true
            }
        );
        assert!(gpu.events.contains(&Event::Present(2)));
    }

    #[test]
    fn recreation_clears_image_fences() {
        let mut frames = scheduler(2, 2);
        let mut gpu = SimulatedGpu::new(2, 2);
        gpu.immediate_completion = false;
        gpu.image_count_after_recreate = 3;

        frames.draw_frame(&mut gpu).unwrap();
        frames.draw_frame(&mut gpu).unwrap();
        assert!(frames.image_fence(0).is_some());

        frames.request_recreate();
        frames.draw_frame(&mut gpu).unwrap();

        assert!(!frames.recreate_requested());
        assert_eq!(frames.image_count(), 3);
        assert!((0..3).all(|i| frames.image_fence(i).is_none()));
    }

    #[test]
    fn out_of_range_image_index_is_fatal() {
        let mut frames = scheduler(2, 2);
        let mut gpu = SimulatedGpu::new(2, 2);
        gpu.acquire_script.push_back(AcquireOutcome::Ready {
            image_index: 5,
            suboptimal: false,
        });

        assert!(frames.draw_frame(&mut gpu).is_err());
    }

    #[test]
    fn slots_return_to_idle_after_each_frame() {
        let mut frames = scheduler(3, 3);
        let mut gpu = SimulatedGpu::new(3, 3);
        gpu.acquire_script.push_back(AcquireOutcome::Stale);

        for _ in 0..4 {
            frames.draw_frame(&mut gpu).unwrap();
            assert!((0..3).all(|slot| frames.slot_state(slot) == FrameState::Idle));
        }
    }

    #[test]
    fn frame_state_cycle() {
        use FrameState::*;
        let cycle = [Idle, Acquiring, Recording, Submitted, Presenting, Idle];
        assert!(cycle.windows(2).all(|w| w[0].can_advance_to(w[1])));
        assert!(Acquiring.can_advance_to(Idle));
        assert!(!Idle.can_advance_to(Recording));
        assert!(!Submitted.can_advance_to(Idle));
    }

    #[test]
    fn scheduler_needs_at_least_one_slot() {
        assert!(FrameScheduler::new(Vec::new(), 3).is_err());
    }
}
