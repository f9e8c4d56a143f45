// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen.
// The whole set is rebuilt on resize/out-of-date; it is never patched.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;

/// What the caller asks for; the surface decides what it gets
#[derive(Debug, Clone, Copy)]
pub struct SwapchainPreferences {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
}

impl Default for SwapchainPreferences {
    fn default() -> Self {
        Self {
            surface_format: vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            present_mode: vk::PresentModeKHR::MAILBOX,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Image acquired. A suboptimal image is still usable for this frame.
    Ready { image_index: u32, suboptimal: bool },
    /// Surface changed under us; the swapchain must be rebuilt.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// Out of date or suboptimal
    Stale,
}

/// Presentable images plus their views.
///
/// Cloning copies handles only; exactly one clone gets `destroy`ed, from
/// the swapchain deletion queue.
#[derive(Clone)]
pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_loader: ash::extensions::khr::Swapchain,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    pub fn new(
        device: Arc<VulkanDevice>,
        width: u32,
        height: u32,
        preferences: &SwapchainPreferences,
    ) -> Result<Self> {
        log::info!("Creating swapchain: {}x{}", width, height);

        let support = device.surface_support(device.physical_device)?;

        let surface_format = choose_surface_format(&support.formats, preferences.surface_format)
            .context("Surface reports no formats")?;
        let present_mode = choose_present_mode(&support.present_modes, preferences.present_mode);
        let extent = choose_extent(&support.capabilities, width, height);
        let image_count = choose_image_count(&support.capabilities);

        log::info!(
            "Swapchain format {:?}/{:?}, present mode {:?}, {} images requested",
            surface_format.format,
            surface_format.color_space,
            present_mode,
            image_count
        );

        let swapchain_loader =
            ash::extensions::khr::Swapchain::new(&device.instance, &device.device);

        // Graphics and present may live on different families
        let family_indices = [
            device.queue_families.graphics,
            device.queue_families.present,
        ];
        let (sharing_mode, shared_families) = if device.queue_families.is_unified() {
            (vk::SharingMode::EXCLUSIVE, &family_indices[..0])
        } else {
            (vk::SharingMode::CONCURRENT, &family_indices[..])
        };

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(device.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(shared_families)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        let images = unsafe { swapchain_loader.get_swapchain_images(swapchain) }?;

        log::info!("Created swapchain with {} images", images.len());

        let image_views = images
            .iter()
            .map(|&image| {
                let create_info = vk::ImageViewCreateInfo::builder()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(surface_format.format)
                    .components(vk::ComponentMapping::default())
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    });

                unsafe {
                    device
                        .device
                        .create_image_view(&create_info, None)
                        .context("Failed to create swapchain image view")
                }
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            swapchain,
            swapchain_loader,
            images,
            image_views,
            format: surface_format.format,
            extent,
            device,
        })
    }

    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    /// Acquire next image for rendering
    pub fn acquire_next_image(
        &self,
        timeout: u64,
        semaphore: vk::Semaphore,
    ) -> Result<AcquireOutcome> {
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                timeout,
                semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Ready {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::Stale),
            Err(e) => Err(e).context("Failed to acquire swapchain image"),
        }
    }

    /// Present rendered image to screen
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<PresentOutcome> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.swapchain_loader.queue_present(queue, &present_info) };

        match result {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::Stale),
            Err(e) => Err(e).context("Failed to present swapchain image"),
        }
    }

    /// Destroy the views and the swapchain. Device must be idle.
    pub fn destroy(&self) {
        unsafe {
            for &view in &self.image_views {
                self.device.device.destroy_image_view(view, None);
            }
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

/// Preferred format/colorspace pair if offered, else the first one.
pub fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    preferred: vk::SurfaceFormatKHR,
) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| f.format == preferred.format && f.color_space == preferred.color_space)
        .or_else(|| formats.first().copied())
}

/// Preferred mode if offered, else FIFO (the only mode Vulkan guarantees).
pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if modes.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Surface extent, or the window size clamped to the surface limits when
/// the surface leaves it to us (current extent = u32::MAX).
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }

    vk::Extent2D {
        width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum, capped by the maximum (0 = no maximum).
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    fn caps(current: (u32, u32), min: (u32, u32), max: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: min.0,
                height: min.1,
            },
            max_image_extent: vk::Extent2D {
                width: max.0,
                height: max.1,
            },
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        }
    }

    #[test]
    fn preferred_surface_format_wins() {
        let preferred = SwapchainPreferences::default().surface_format;
        let formats = [
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            preferred,
        ];

        let chosen = choose_surface_format(&formats, preferred).unwrap();
        assert_eq!(chosen.format, preferred.format);
        assert_eq!(chosen.color_space, preferred.color_space);
    }

    #[test]
    fn surface_format_falls_back_to_first() {
        let preferred = SwapchainPreferences::default().surface_format;
        let first = format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR);
        // Right format, wrong colorspace does not count
        let formats = [
            first,
            format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT),
        ];

        let chosen = choose_surface_format(&formats, preferred).unwrap();
        assert_eq!(chosen.format, first.format);
        assert_eq!(chosen.color_space, first.color_space);
        assert!(choose_surface_format(&[], preferred).is_none());
    }

    #[test]
    fn present_mode_prefers_requested_then_fifo() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn fixed_surface_extent_is_used_as_is() {
        let caps = caps((800, 600), (1, 1), (4096, 4096));
        let extent = choose_extent(&caps, 1920, 1080);
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn window_size_is_clamped_when_surface_defers() {
        let caps = caps((u32::MAX, u32::MAX), (64, 64), (1024, 768));

        let big = choose_extent(&caps, 1920, 1080);
        assert_eq!((big.width, big.height), (1024, 768));

        let small = choose_extent(&caps, 10, 500);
        assert_eq!((small.width, small.height), (64, 500));
    }

    #[test]
    fn image_count_is_min_plus_one_capped_by_max() {
        let mut caps = caps((1, 1), (1, 1), (1, 1));
        assert_eq!(choose_image_count(&caps), 3);

        caps.max_image_count = 2;
        assert_eq!(choose_image_count(&caps), 2);
    }
}
