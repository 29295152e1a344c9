//! Per-slot synchronization for frames in flight.
//!
//! Every frame slot owns a submission fence, an image-available semaphore, a
//! render-finished semaphore and a pool of semaphores for cross-queue edges
//! inside the frame. A slot cycles through [`SlotPhase`]:
//!
//! ```text
//! Idle -> Recording -> Submitted -> Complete -> Recording -> ...
//! ```
//!
//! `Submitted -> Complete` happens only when the fence is observed signaled,
//! either by [`FenceScheduler::poll`] or by the bounded wait in
//! [`FenceScheduler::reclaim`]. A slot's command pools and per-frame objects
//! may be reused only once it is no longer `Submitted`.

use crate::backend::{FenceWait, GpuBackend};
use crate::error::{RenderGraphError, Result};
use ash::vk;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// Synchronization objects of one frame slot.
#[derive(Debug, Clone, Copy)]
pub struct FrameSync {
    /// Signaled when the slot's last batch completes.
    pub in_flight_fence: vk::Fence,
    /// Signaled by the presentation engine when the swap image is ready.
    pub image_available: vk::Semaphore,
    /// Signaled by the final batch; presentation waits on it.
    pub render_finished: vk::Semaphore,
}

impl FrameSync {
    fn new(backend: &dyn GpuBackend) -> Result<Self> {
        // Created signaled so the first reset has something to reset.
        let in_flight_fence = backend.create_fence(true)?;
        let image_available = backend.create_semaphore()?;
        let render_finished = backend.create_semaphore()?;
        Ok(Self {
            in_flight_fence,
            image_available,
            render_finished,
        })
    }

    fn destroy(&self, backend: &dyn GpuBackend) {
        backend.destroy_semaphore(self.image_available);
        backend.destroy_semaphore(self.render_finished);
        backend.destroy_fence(self.in_flight_fence);
    }
}

/// Binary semaphores for the queue-to-queue edges of one frame.
///
/// Every semaphore handed out is signaled and waited exactly once within the
/// frame, so the pool can be rewound as soon as the slot's fence is observed.
#[derive(Debug, Default)]
pub struct SemaphorePool {
    semaphores: Vec<vk::Semaphore>,
    next: usize,
}

impl SemaphorePool {
    pub fn acquire(&mut self, backend: &dyn GpuBackend) -> Result<vk::Semaphore> {
        if self.next == self.semaphores.len() {
            self.semaphores.push(backend.create_semaphore()?);
        }
        let semaphore = self.semaphores[self.next];
        self.next += 1;
        Ok(semaphore)
    }

    pub fn reset(&mut self) {
        self.next = 0;
    }

    pub fn in_use(&self) -> usize {
        self.next
    }

    pub fn capacity(&self) -> usize {
        self.semaphores.len()
    }

    fn destroy(&mut self, backend: &dyn GpuBackend) {
        for semaphore in self.semaphores.drain(..) {
            backend.destroy_semaphore(semaphore);
        }
        self.next = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPhase {
    Idle,
    Recording,
    Submitted,
    Complete,
}

#[derive(Debug)]
struct Slot {
    sync: FrameSync,
    semaphores: SemaphorePool,
    phase: SlotPhase,
    frame_number: Option<u64>,
}

/// Drives the fence and semaphore state of the frame-slot ring.
#[derive(Debug)]
pub struct FenceScheduler {
    slots: Vec<Slot>,
    current: usize,
    timeout: Duration,
    frame_counter: u64,
    last_completed_frame: u64,
}

impl FenceScheduler {
    pub fn new(backend: &dyn GpuBackend, frames_in_flight: usize, timeout: Duration) -> Result<Self> {
        if frames_in_flight == 0 {
            return Err(RenderGraphError::Initialization(
                "at least one frame in flight is required".to_string(),
            ));
        }
        let mut slots: Vec<Slot> = Vec::with_capacity(frames_in_flight);
        for _ in 0..frames_in_flight {
            match FrameSync::new(backend) {
                Ok(sync) => slots.push(Slot {
                    sync,
                    semaphores: SemaphorePool::default(),
                    phase: SlotPhase::Idle,
                    frame_number: None,
                }),
                Err(e) => {
                    for slot in &slots {
                        slot.sync.destroy(backend);
                    }
                    return Err(e);
                }
            }
        }
        debug!("Created {} frame slots", frames_in_flight);
        Ok(Self {
            slots,
            current: 0,
            timeout,
            frame_counter: 0,
            last_completed_frame: 0,
        })
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn sync(&self, slot: usize) -> &FrameSync {
        &self.slots[slot].sync
    }

    pub fn phase(&self, slot: usize) -> SlotPhase {
        self.slots[slot].phase
    }

    /// Frame number last recorded into `slot`.
    pub fn frame_number(&self, slot: usize) -> Option<u64> {
        self.slots[slot].frame_number
    }

    /// Number of the most recently begun frame. Frames are numbered from 1.
    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    /// Highest frame whose fence has been observed signaled, 0 before any.
    pub fn last_completed_frame(&self) -> u64 {
        self.last_completed_frame
    }

    fn complete(&mut self, slot: usize) {
        let entry = &mut self.slots[slot];
        entry.phase = SlotPhase::Complete;
        if let Some(frame) = entry.frame_number {
            self.last_completed_frame = self.last_completed_frame.max(frame);
        }
        trace!("Frame slot {} complete", slot);
    }

    /// Moves every submitted slot whose fence is signaled to `Complete`.
    pub fn poll(&mut self, backend: &dyn GpuBackend) -> Result<()> {
        for slot in 0..self.slots.len() {
            if self.slots[slot].phase == SlotPhase::Submitted
                && backend.fence_signaled(self.slots[slot].sync.in_flight_fence)?
            {
                self.complete(slot);
            }
        }
        Ok(())
    }

    /// Blocks until the current slot's previous submission has completed.
    ///
    /// Fails with `Timeout` when the fence stays unsignaled past the
    /// configured bound.
    pub fn reclaim(&mut self, backend: &dyn GpuBackend) -> Result<()> {
        let slot = self.current;
        match self.slots[slot].phase {
            SlotPhase::Submitted => {
                let started = Instant::now();
                match backend.wait_for_fence(self.slots[slot].sync.in_flight_fence, self.timeout)? {
                    FenceWait::Signaled => {
                        self.complete(slot);
                        Ok(())
                    }
                    FenceWait::TimedOut => {
                        let waited = started.elapsed().max(self.timeout);
                        error!("Frame slot {} did not complete within {:?}", slot, self.timeout);
                        Err(RenderGraphError::Timeout { slot, waited })
                    }
                }
            }
            SlotPhase::Recording => {
                warn!("Frame slot {} reclaimed while still recording", slot);
                Ok(())
            }
            SlotPhase::Idle | SlotPhase::Complete => Ok(()),
        }
    }

    /// Starts recording a new frame into the current slot and returns its number.
    pub fn begin(&mut self, backend: &dyn GpuBackend) -> Result<u64> {
        let slot = self.current;
        if self.slots[slot].phase == SlotPhase::Submitted {
            return Err(RenderGraphError::Initialization(format!(
                "frame slot {} reused before its fence was observed",
                slot
            )));
        }
        backend.reset_fence(self.slots[slot].sync.in_flight_fence)?;
        self.frame_counter += 1;
        let entry = &mut self.slots[slot];
        entry.semaphores.reset();
        entry.phase = SlotPhase::Recording;
        entry.frame_number = Some(self.frame_counter);
        Ok(self.frame_counter)
    }

    /// A semaphore for one cross-queue edge of the current frame.
    pub fn edge_semaphore(&mut self, backend: &dyn GpuBackend) -> Result<vk::Semaphore> {
        self.slots[self.current].semaphores.acquire(backend)
    }

    pub fn mark_submitted(&mut self) {
        self.slots[self.current].phase = SlotPhase::Submitted;
    }

    /// Returns a slot that recorded nothing to `Idle`.
    pub fn cancel(&mut self) {
        let entry = &mut self.slots[self.current];
        if entry.phase == SlotPhase::Recording {
            entry.phase = SlotPhase::Idle;
            entry.frame_number = None;
        }
    }

    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.slots.len();
    }

    /// Marks every submission complete. Only valid right after a device idle wait.
    pub fn mark_all_complete(&mut self) {
        for slot in 0..self.slots.len() {
            if self.slots[slot].phase == SlotPhase::Submitted {
                self.complete(slot);
            }
        }
        self.last_completed_frame = self
            .last_completed_frame
            .max(self.slots.iter().filter_map(|s| s.frame_number).max().unwrap_or(0));
    }

    pub(crate) fn destroy(&mut self, backend: &dyn GpuBackend) {
        for slot in &mut self.slots {
            slot.semaphores.destroy(backend);
            slot.sync.destroy(backend);
        }
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::{SimConfig, SimulatedDevice};
    use crate::backend::{QueueKind, SubmitBatch};
    use pretty_assertions::assert_eq;

    fn scheduler(device: &SimulatedDevice, frames: usize) -> FenceScheduler {
        FenceScheduler::new(device, frames, Duration::from_millis(50)).unwrap()
    }

    fn submit_current(device: &SimulatedDevice, scheduler: &mut FenceScheduler) {
        let fence = scheduler.sync(scheduler.current()).in_flight_fence;
        device
            .submit(
                QueueKind::Graphics,
                &SubmitBatch {
                    fence: Some(fence),
                    ..SubmitBatch::default()
                },
            )
            .unwrap();
        scheduler.mark_submitted();
    }

    #[test]
    fn slots_cycle_through_phases() {
        let device = SimulatedDevice::new(SimConfig::default());
        let mut scheduler = scheduler(&device, 2);
        assert_eq!(scheduler.phase(0), SlotPhase::Idle);
        assert_eq!(scheduler.begin(&device).unwrap(), 1);
        assert_eq!(scheduler.phase(0), SlotPhase::Recording);
        submit_current(&device, &mut scheduler);
        assert_eq!(scheduler.phase(0), SlotPhase::Submitted);
        scheduler.advance();
        assert_eq!(scheduler.current(), 1);
        scheduler.advance();
        scheduler.reclaim(&device).unwrap();
        assert_eq!(scheduler.phase(0), SlotPhase::Complete);
        assert_eq!(scheduler.last_completed_frame(), 1);
    }

    #[test]
    fn submitted_slot_cannot_begin_again() {
        let device = SimulatedDevice::new(SimConfig::default());
        let mut scheduler = scheduler(&device, 1);
        scheduler.begin(&device).unwrap();
        submit_current(&device, &mut scheduler);
        assert!(scheduler.begin(&device).is_err());
    }

    #[test]
    fn poll_only_completes_signaled_fences() {
        let device = SimulatedDevice::new(SimConfig::default());
        let mut scheduler = scheduler(&device, 2);
        scheduler.begin(&device).unwrap();
        submit_current(&device, &mut scheduler);
        scheduler.poll(&device).unwrap();
        assert_eq!(scheduler.phase(0), SlotPhase::Submitted);
        device.complete_all();
        scheduler.poll(&device).unwrap();
        assert_eq!(scheduler.phase(0), SlotPhase::Complete);
    }

    #[test]
    fn hung_device_times_out() {
        let device = SimulatedDevice::new(SimConfig::default());
        let mut scheduler = scheduler(&device, 1);
        scheduler.begin(&device).unwrap();
        submit_current(&device, &mut scheduler);
        device.hang();
        let err = scheduler.reclaim(&device).unwrap_err();
        assert!(matches!(err, RenderGraphError::Timeout { slot: 0, .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn edge_semaphores_are_reused_after_reset() {
        let device = SimulatedDevice::new(SimConfig::default());
        let mut scheduler = scheduler(&device, 1);
        scheduler.begin(&device).unwrap();
        let a = scheduler.edge_semaphore(&device).unwrap();
        let b = scheduler.edge_semaphore(&device).unwrap();
        assert_ne!(a, b);
        scheduler.cancel();
        scheduler.begin(&device).unwrap();
        assert_eq!(scheduler.edge_semaphore(&device).unwrap(), a);
    }
}
