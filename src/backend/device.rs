// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Window surface creation
// - Physical device selection (prefer discrete GPU)
// - Logical device + graphics/present queue creation
// - Memory allocator setup

use anyhow::{Context, Result};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::collections::BTreeSet;
use std::ffi::{CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::Arc;

/// Required Vulkan device features for our renderer
const REQUIRED_DEVICE_FEATURES: vk::PhysicalDeviceFeatures = vk::PhysicalDeviceFeatures {
    sampler_anisotropy: vk::TRUE,
    ..unsafe { std::mem::zeroed() }
};

const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// Queue family indices the renderer needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    /// One family does both graphics and present
    pub fn is_unified(&self) -> bool {
        self.graphics == self.present
    }

    fn unique(&self) -> BTreeSet<u32> {
        [self.graphics, self.present].into_iter().collect()
    }
}

/// What the surface supports on a given GPU
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    /// Dropped by hand, before the logical device
    pub allocator: ManuallyDrop<Mutex<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: Entry,

    pub surface: vk::SurfaceKHR,
    pub surface_loader: ash::extensions::khr::Surface,

    pub queue_families: QueueFamilies,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,

    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    pub properties: vk::PhysicalDeviceProperties,
    pub depth_format: vk::Format,
}

impl VulkanDevice {
    /// Create Vulkan device presenting to the given window
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `enable_validation` - Enable Vulkan validation layers (debug only)
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let instance = Self::create_instance(&entry, app_name, enable_validation, display_handle)?;

        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        let surface = unsafe {
            ash_window::create_surface(&entry, &instance, display_handle, window_handle, None)
        }
        .context("Failed to create window surface")?;
        let surface_loader = ash::extensions::khr::Surface::new(&entry, &instance);

        let (physical_device, queue_families) =
            Self::pick_physical_device(&instance, &surface_loader, surface)?;

        let (device, graphics_queue, present_queue) =
            Self::create_logical_device(&instance, physical_device, queue_families)?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!(
            "Queue families: graphics {}, present {}",
            queue_families.graphics,
            queue_families.present
        );

        let depth_format = Self::find_depth_format(&instance, physical_device)?;

        let allocator = Self::create_allocator(&instance, physical_device, &device)?;

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device,
            instance,
            _entry: entry,
            surface,
            surface_loader,
            queue_families,
            graphics_queue,
            present_queue,
            debug_utils,
            properties,
            depth_format,
        }))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        display_handle: RawDisplayHandle,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("vk-frame-engine")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        // Surface extensions for whatever windowing system we run on
        let mut extensions = ash_window::enumerate_required_extensions(display_handle)
            .context("Windowing system is not supported by Vulkan")?
            .to_vec();

        if enable_validation {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        }

        let layer_names = if enable_validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(MESSENGER_SEVERITIES)
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &ash::extensions::khr::Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<(vk::PhysicalDevice, QueueFamilies)> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            let features = unsafe { instance.get_physical_device_features(device) };
            let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }.to_string_lossy();

            if !Self::check_device_features(&features) {
                log::debug!("Skipping {}: missing required features", name);
                continue;
            }

            if !Self::supports_swapchain(instance, device)? {
                log::debug!("Skipping {}: no swapchain support", name);
                continue;
            }

            let queue_families =
                unsafe { instance.get_physical_device_queue_family_properties(device) };
            let families = find_queue_families(&queue_families, |index| unsafe {
                surface_loader
                    .get_physical_device_surface_support(device, index, surface)
                    .context("Failed to query present support")
            })?;

            let Some(families) = families else {
                log::debug!("Skipping {}: no graphics/present queues", name);
                continue;
            };

            // Need at least one format and one present mode for the swapchain
            let formats =
                unsafe { surface_loader.get_physical_device_surface_formats(device, surface) }?;
            let modes = unsafe {
                surface_loader.get_physical_device_surface_present_modes(device, surface)
            }?;
            if formats.is_empty() || modes.is_empty() {
                log::debug!("Skipping {}: surface unsupported", name);
                continue;
            }

            let score = device_type_score(props.device_type);
            if score > best_score {
                best_score = score;
                best_device = Some((device, families));
            }
        }

        best_device.ok_or_else(|| anyhow::anyhow!("No suitable GPU found"))
    }

    fn check_device_features(features: &vk::PhysicalDeviceFeatures) -> bool {
        features.sampler_anisotropy == vk::TRUE
    }

    fn supports_swapchain(instance: &ash::Instance, device: vk::PhysicalDevice) -> Result<bool> {
        let extensions = unsafe { instance.enumerate_device_extension_properties(device) }?;
        let swapchain = ash::extensions::khr::Swapchain::name();

        Ok(extensions
            .iter()
            .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == swapchain))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_families: QueueFamilies,
    ) -> Result<(ash::Device, vk::Queue, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = queue_families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extensions = [ash::extensions::khr::Swapchain::name().as_ptr()];

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&REQUIRED_DEVICE_FEATURES);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        let graphics_queue = unsafe { device.get_device_queue(queue_families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(queue_families.present, 0) };

        Ok((device, graphics_queue, present_queue))
    }

    fn find_depth_format(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> Result<vk::Format> {
        DEPTH_FORMAT_CANDIDATES
            .iter()
            .copied()
            .find(|&format| {
                let props = unsafe {
                    instance.get_physical_device_format_properties(physical_device, format)
                };
                props
                    .optimal_tiling_features
                    .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
            })
            .context("No supported depth format")
    }

    fn create_allocator(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<Allocator> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create GPU memory allocator")?;

        Ok(allocator)
    }

    /// Query what the window surface supports on `physical_device`
    pub fn surface_support(&self, physical_device: vk::PhysicalDevice) -> Result<SurfaceSupport> {
        unsafe {
            Ok(SurfaceSupport {
                capabilities: self
                    .surface_loader
                    .get_physical_device_surface_capabilities(physical_device, self.surface)?,
                formats: self
                    .surface_loader
                    .get_physical_device_surface_formats(physical_device, self.surface)?,
                present_modes: self
                    .surface_loader
                    .get_physical_device_surface_present_modes(physical_device, self.surface)?,
            })
        }
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("Failed to wait for device idle")?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        // Cleanup in reverse order
        unsafe {
            // Allocator frees its memory blocks through the device
            ManuallyDrop::drop(&mut self.allocator);

            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

/// Pick graphics and present families, preferring one family that does both.
pub fn find_queue_families<F>(
    families: &[vk::QueueFamilyProperties],
    supports_present: F,
) -> Result<Option<QueueFamilies>>
where
    F: Fn(u32) -> Result<bool>,
{
    let mut graphics = None;
    let mut present = None;

    for (index, props) in families.iter().enumerate() {
        let index = index as u32;
        let has_graphics =
            props.queue_count > 0 && props.queue_flags.contains(vk::QueueFlags::GRAPHICS);
        let has_present = supports_present(index)?;

        if has_graphics && has_present {
            return Ok(Some(QueueFamilies {
                graphics: index,
                present: index,
            }));
        }
        if has_graphics && graphics.is_none() {
            graphics = Some(index);
        }
        if has_present && present.is_none() {
            present = Some(index);
        }
    }

    Ok(graphics.zip(present).map(|(graphics, present)| QueueFamilies { graphics, present }))
}

fn device_type_score(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        _ => 1,
    }
}

/// Severities the debug messenger forwards. Info and verbose end up at
/// debug level, so `RUST_LOG=debug` shows them.
const MESSENGER_SEVERITIES: vk::DebugUtilsMessageSeverityFlagsEXT =
    vk::DebugUtilsMessageSeverityFlagsEXT::from_raw(
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR.as_raw()
            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING.as_raw()
            | vk::DebugUtilsMessageSeverityFlagsEXT::INFO.as_raw()
            | vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE.as_raw(),
    );

fn validation_log_level(severity: vk::DebugUtilsMessageSeverityFlagsEXT) -> log::Level {
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::Level::Error
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::Level::Warn
    } else {
        log::Level::Debug
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    log::log!(
        validation_log_level(message_severity),
        "[Vulkan] {}",
        message.to_string_lossy()
    );

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn prefers_a_family_that_does_both() {
        let families = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
        ];
        let found = find_queue_families(&families, |i| Ok(i != 0)).unwrap();

        assert_eq!(
            found,
            Some(QueueFamilies {
                graphics: 2,
                present: 2
            })
        );
        assert!(found.unwrap().is_unified());
    }

    #[test]
    fn splits_graphics_and_present_when_needed() {
        let families = [family(vk::QueueFlags::GRAPHICS), family(vk::QueueFlags::TRANSFER)];
        let found = find_queue_families(&families, |i| Ok(i == 1)).unwrap().unwrap();

        assert_eq!(found.graphics, 0);
        assert_eq!(found.present, 1);
        assert!(!found.is_unified());
        assert_eq!(found.unique().len(), 2);
    }

    #[test]
    fn no_present_support_means_no_families() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        assert_eq!(find_queue_families(&families, |_| Ok(false)).unwrap(), None);
    }

    #[test]
    fn discrete_gpus_score_highest() {
        assert!(
            device_type_score(vk::PhysicalDeviceType::DISCRETE_GPU)
                > device_type_score(vk::PhysicalDeviceType::INTEGRATED_GPU)
        );
        assert!(
            device_type_score(vk::PhysicalDeviceType::INTEGRATED_GPU)
                > device_type_score(vk::PhysicalDeviceType::CPU)
        );
    }

    #[test]
    fn info_and_verbose_messages_reach_the_debug_level() {
        type Severity = vk::DebugUtilsMessageSeverityFlagsEXT;

        assert!(MESSENGER_SEVERITIES.contains(Severity::INFO | Severity::VERBOSE));
        assert_eq!(validation_log_level(Severity::ERROR), log::Level::Error);
        assert_eq!(validation_log_level(Severity::WARNING), log::Level::Warn);
        assert_eq!(validation_log_level(Severity::INFO), log::Level::Debug);
        assert_eq!(validation_log_level(Severity::VERBOSE), log::Level::Debug);
    }
}
