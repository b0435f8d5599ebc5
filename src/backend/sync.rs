// Synchronization primitives
//
// Fences and semaphores for GPU-CPU and GPU-GPU sync

use anyhow::{Context, Result};
use ash::vk;
use super::VulkanDevice;

fn create_semaphore(device: &VulkanDevice) -> Result<vk::Semaphore> {
    let semaphore_info = vk::SemaphoreCreateInfo::builder();
    unsafe {
        device.device.create_semaphore(&semaphore_info, None)
            .context("Failed to create semaphore")
    }
}

/// Frame synchronization - one per frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &VulkanDevice) -> Result<Self> {
        let fence_info = vk::FenceCreateInfo::builder()
            .flags(vk::FenceCreateFlags::SIGNALED); // First wait must not block

        let image_available = create_semaphore(device)?;
        let in_flight_fence = match unsafe { device.device.create_fence(&fence_info, None) } {
            Ok(fence) => fence,
            Err(e) => {
                unsafe { device.device.destroy_semaphore(image_available, None) };
                return Err(e).context("Failed to create fence");
            }
        };

        Ok(Self {
            image_available,
            in_flight_fence,
        })
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}

/// Round-robin over the frames in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSlot {
    current: usize,
    count: usize,
}

impl FrameSlot {
    pub fn new(count: usize) -> Self {
        Self {
            current: 0,
            count: count.max(1),
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.count;
    }
}

/// Per swapchain image: the fence of the frame that last rendered to it and
/// the semaphore its present waits on.
///
/// Render-finished semaphores live here rather than in `FrameSync` so a
/// semaphore is only signaled again once its image comes back from the
/// presentation engine.
#[derive(Debug, Default)]
pub struct ImageSync {
    fences: Vec<vk::Fence>,
    render_finished: Vec<vk::Semaphore>,
}

impl ImageSync {
    pub fn new(device: &VulkanDevice, image_count: usize) -> Result<Self> {
        let mut render_finished = Vec::with_capacity(image_count);
        for _ in 0..image_count {
            match create_semaphore(device) {
                Ok(semaphore) => render_finished.push(semaphore),
                Err(e) => {
                    for semaphore in render_finished {
                        unsafe { device.device.destroy_semaphore(semaphore, None) };
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self::from_semaphores(render_finished))
    }

    pub fn from_semaphores(render_finished: Vec<vk::Semaphore>) -> Self {
        Self {
            fences: vec![vk::Fence::null(); render_finished.len()],
            render_finished,
        }
    }

    /// Record `fence` as the image's owner.
    ///
    /// Returns the previous owner's fence if it still has to be waited on,
    /// and the semaphore this image's present should wait on.
    pub fn claim(&mut self, image: usize, fence: vk::Fence) -> Result<(Option<vk::Fence>, vk::Semaphore)> {
        let semaphore = *self
            .render_finished
            .get(image)
            .with_context(|| format!("No sync objects for swapchain image {}", image))?;
        let slot = self
            .fences
            .get_mut(image)
            .with_context(|| format!("No fence slot for swapchain image {}", image))?;

        let previous = std::mem::replace(slot, fence);
        let wait = (previous != vk::Fence::null() && previous != fence).then_some(previous);
        Ok((wait, semaphore))
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        for semaphore in self.render_finished.drain(..) {
            unsafe { device.destroy_semaphore(semaphore, None) };
        }
        self.fences.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn image_sync(count: u64) -> ImageSync {
        ImageSync::from_semaphores((0..count).map(|i| vk::Semaphore::from_raw(100 + i)).collect())
    }

    #[test]
    fn slots_wrap_around() {
        let mut slot = FrameSlot::new(2);
        let seen: Vec<usize> = (0..5)
            .map(|_| {
                let current = slot.current();
                slot.advance();
                current
            })
            .collect();
        assert_eq!(seen, vec![0, 1, 0, 1, 0]);
    }

    #[test]
    fn zero_slots_means_one() {
        let mut slot = FrameSlot::new(0);
        slot.advance();
        assert_eq!(slot.current(), 0);
    }

    #[test]
    fn image_claims_report_previous_owner() {
        let a = vk::Fence::from_raw(1);
        let b = vk::Fence::from_raw(2);
        let mut sync = image_sync(3);

        assert_eq!(sync.claim(0, a).unwrap().0, None);
        assert_eq!(sync.claim(1, b).unwrap().0, None);
        assert_eq!(sync.claim(0, b).unwrap().0, Some(a));
        // Same slot coming back to its own image already waited on its fence
        assert_eq!(sync.claim(0, b).unwrap().0, None);
    }

    #[test]
    fn render_finished_follows_the_image_not_the_frame_slot() {
        // Two frames in flight cycling over three images
        let fences = [vk::Fence::from_raw(1), vk::Fence::from_raw(2)];
        let mut sync = image_sync(3);

        let mut slot = FrameSlot::new(fences.len());
        for image in [0usize, 1, 2, 0, 1, 2] {
            let (_, semaphore) = sync.claim(image, fences[slot.current()]).unwrap();
            assert_eq!(semaphore, vk::Semaphore::from_raw(100 + image as u64));
            slot.advance();
        }
    }

    #[test]
    fn unknown_image_is_an_error() {
        let mut sync = image_sync(2);
        assert!(sync.claim(2, vk::Fence::from_raw(1)).is_err());
        assert!(ImageSync::default().claim(0, vk::Fence::from_raw(1)).is_err());
    }
}
