// Vulkan Device - instance, surface and GPU interface
//
// Responsibilities:
// - Instance creation with the window system's surface extensions
// - Optional validation layers + debug messenger
// - Window surface
// - Physical device selection (prefer discrete GPU that can present)
// - Logical device with graphics and present queues
// - Memory allocator setup

use anyhow::{Context, Result};
use ash::extensions::{ext::DebugUtils, khr};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::ffi::{c_char, CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::Arc;

const VALIDATION_LAYERS: &[&CStr] = &[c"VK_LAYER_KHRONOS_validation"];

/// Queue family indices for drawing and presenting (may be the same family)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    /// Pick queue families, preferring one family that can both draw and present.
    ///
    /// `supports_present` is asked about each family index in order.
    pub fn find<F>(families: &[vk::QueueFamilyProperties], mut supports_present: F) -> Result<Option<Self>>
    where
        F: FnMut(u32) -> Result<bool>,
    {
        let mut graphics = None;
        let mut present = None;

        for (index, family) in families.iter().enumerate() {
            let index = index as u32;
            if family.queue_count == 0 {
                continue;
            }

            let can_draw = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
            let can_present = supports_present(index)?;

            if can_draw && can_present {
                return Ok(Some(Self {
                    graphics: index,
                    present: index,
                }));
            }
            if can_draw && graphics.is_none() {
                graphics = Some(index);
            }
            if can_present && present.is_none() {
                present = Some(index);
            }
        }

        Ok(graphics.zip(present).map(|(graphics, present)| Self { graphics, present }))
    }

    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }

    /// Distinct family indices, one queue gets created per entry
    pub fn unique(&self) -> Vec<u32> {
        if self.is_shared() {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }
}

/// Higher is better; discrete GPUs win
pub fn device_type_score(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 10,
        _ => 1,
    }
}

/// Keep the requested layers the loader knows about, in request order
pub fn select_layers<'a>(requested: &[&'a CStr], available: &[&CStr]) -> Vec<&'a CStr> {
    requested
        .iter()
        .copied()
        .filter(|layer| {
            let found = available.contains(layer);
            if !found {
                log::warn!("Validation layer {:?} not available, skipping", layer);
            }
            found
        })
        .collect()
}

fn fixed_name(raw: &[c_char]) -> &CStr {
    unsafe { CStr::from_ptr(raw.as_ptr()) }
}

/// Cleanup for a half-built device. Steps run newest first on drop unless
/// the build finished and disarmed it.
#[derive(Default)]
struct Rollback {
    steps: Vec<Box<dyn FnOnce()>>,
}

impl Rollback {
    fn push(&mut self, step: impl FnOnce() + 'static) {
        self.steps.push(Box::new(step));
    }

    fn disarm(mut self) {
        self.steps.clear();
    }
}

impl Drop for Rollback {
    fn drop(&mut self) {
        while let Some(step) = self.steps.pop() {
            step();
        }
    }
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Dropped by hand before the device goes away
    allocator: ManuallyDrop<Mutex<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub surface: vk::SurfaceKHR,
    pub surface_loader: khr::Surface,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    pub instance: ash::Instance,
    _entry: Entry,

    // Queue handles
    pub queue_families: QueueFamilies,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
}

impl VulkanDevice {
    /// Create the instance, the window surface and the device
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `enable_validation` - Enable Vulkan validation layers (debug only)
    /// * `window` - Window to present to
    pub fn new<W>(app_name: &str, enable_validation: bool, window: &W) -> Result<Arc<Self>>
    where
        W: HasRawDisplayHandle + HasRawWindowHandle,
    {
        log::info!("Creating Vulkan device: {}", app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        // Step 2: Create instance
        let (instance, debug_enabled) =
            Self::create_instance(&entry, app_name, enable_validation, window)?;

        // Declared after `entry` so it runs before the library is unloaded
        let mut rollback = Rollback::default();
        {
            let instance = instance.clone();
            rollback.push(move || unsafe { instance.destroy_instance(None) });
        }

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if debug_enabled {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };
        if let Some((ref utils, messenger)) = debug_utils {
            let utils = utils.clone();
            rollback.push(move || unsafe { utils.destroy_debug_utils_messenger(messenger, None) });
        }

        // Step 4: Create surface
        let surface_loader = khr::Surface::new(&entry, &instance);
        let surface = unsafe {
            ash_window::create_surface(
                &entry,
                &instance,
                window.raw_display_handle(),
                window.raw_window_handle(),
                None,
            )
        }
        .context("Failed to create window surface")?;
        {
            let surface_loader = surface_loader.clone();
            rollback.push(move || unsafe { surface_loader.destroy_surface(surface, None) });
        }

        // Step 5: Pick physical device (GPU)
        let (physical_device, queue_families) =
            Self::pick_physical_device(&instance, &surface_loader, surface)?;

        // Step 6: Create logical device
        let device = Self::create_logical_device(&instance, physical_device, &queue_families)?;
        {
            let device = device.clone();
            rollback.push(move || unsafe { device.destroy_device(None) });
        }
        let graphics_queue = unsafe { device.get_device_queue(queue_families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(queue_families.present, 0) };

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };

        log::info!(
            "Selected GPU: {}",
            fixed_name(&properties.device_name).to_string_lossy()
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

        // Step 7: Create memory allocator
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create memory allocator")?;

        // Drop for VulkanDevice owns the cleanup from here
        rollback.disarm();

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device,
            surface,
            surface_loader,
            debug_utils,
            instance,
            _entry: entry,
            queue_families,
            graphics_queue,
            present_queue,
        }))
    }

    /// Returns the instance and whether the debug utils extension got enabled
    fn create_instance<W: HasRawDisplayHandle>(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        window: &W,
    ) -> Result<(ash::Instance, bool)> {
        let available_extensions = entry
            .enumerate_instance_extension_properties(None)
            .context("Failed to enumerate instance extensions")?;
        for extension in &available_extensions {
            log::debug!(
                "Instance extension: {}",
                fixed_name(&extension.extension_name).to_string_lossy()
            );
        }

        let available_layers = entry
            .enumerate_instance_layer_properties()
            .context("Failed to enumerate instance layers")?;
        for layer in &available_layers {
            log::debug!("Instance layer: {}", fixed_name(&layer.layer_name).to_string_lossy());
        }

        let app_name_cstr = CString::new(app_name)?;
        let engine_name = c"vk-cube";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_0);

        // Surface extensions for whatever window system we run on
        let mut extensions = ash_window::enumerate_required_extensions(window.raw_display_handle())
            .context("Failed to query required surface extensions")?
            .to_vec();

        // Validation layers
        let layer_names = if enable_validation {
            let available: Vec<&CStr> = available_layers
                .iter()
                .map(|layer| fixed_name(&layer.layer_name))
                .collect();
            select_layers(VALIDATION_LAYERS, &available)
        } else {
            Vec::new()
        };
        let layer_ptrs: Vec<*const c_char> = layer_names.iter().map(|name| name.as_ptr()).collect();

        let debug_enabled = enable_validation
            && available_extensions
                .iter()
                .any(|ext| fixed_name(&ext.extension_name) == DebugUtils::name());
        if debug_enabled {
            extensions.push(DebugUtils::name().as_ptr());
        } else if enable_validation {
            log::warn!("VK_EXT_debug_utils not available, validation output goes to stdout");
        }

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_ptrs);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok((instance, debug_enabled))
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
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
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<(vk::PhysicalDevice, QueueFamilies)> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        let mut best: Option<(u32, vk::PhysicalDevice, QueueFamilies)> = None;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            let name = fixed_name(&props.device_name).to_string_lossy().into_owned();
            log::info!("Found GPU: {} ({:?})", name, props.device_type);

            if !Self::supports_swapchain(instance, device)? {
                log::info!("Skipping {}: no swapchain support", name);
                continue;
            }

            let queue_families =
                unsafe { instance.get_physical_device_queue_family_properties(device) };
            for (index, family) in queue_families.iter().enumerate() {
                log::debug!(
                    "  Queue family {}: {:?} x{}",
                    index,
                    family.queue_flags,
                    family.queue_count
                );
            }

            let families = QueueFamilies::find(&queue_families, |index| unsafe {
                surface_loader
                    .get_physical_device_surface_support(device, index, surface)
                    .context("Failed to query surface support")
            })?;

            let Some(families) = families else {
                log::info!("Skipping {}: cannot draw and present to this window", name);
                continue;
            };

            // Ties keep the first device reported
            let score = device_type_score(props.device_type);
            if best.map_or(true, |(best_score, _, _)| score > best_score) {
                best = Some((score, device, families));
            }
        }

        best.map(|(_, device, families)| (device, families))
            .ok_or_else(|| anyhow::anyhow!("No suitable GPU found"))
    }

    fn supports_swapchain(instance: &ash::Instance, device: vk::PhysicalDevice) -> Result<bool> {
        let extensions = unsafe { instance.enumerate_device_extension_properties(device) }
            .context("Failed to enumerate device extensions")?;

        for extension in &extensions {
            log::trace!(
                "  Device extension: {} v{}",
                fixed_name(&extension.extension_name).to_string_lossy(),
                extension.spec_version
            );
        }

        Ok(extensions
            .iter()
            .any(|ext| fixed_name(&ext.extension_name) == khr::Swapchain::name()))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_families: &QueueFamilies,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = queue_families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        // Required device extensions
        let extensions = [khr::Swapchain::name().as_ptr()];
        let features = vk::PhysicalDeviceFeatures::default();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")
    }

    /// Allocate device memory through the shared allocator
    pub fn allocate(&self, desc: &AllocationCreateDesc) -> Result<Allocation> {
        self.allocator
            .lock()
            .allocate(desc)
            .with_context(|| format!("Failed to allocate memory for {}", desc.name))
    }

    pub fn free(&self, allocation: Allocation) -> Result<()> {
        self.allocator
            .lock()
            .free(allocation)
            .context("Failed to free memory")
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("Failed to wait for device idle")
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        // Cleanup in reverse order
        unsafe {
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

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan {:?}] {}", message_type, message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan {:?}] {}", message_type, message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan {:?}] {}", message_type, message.to_string_lossy());
        }
    }

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
    fn prefers_family_that_does_both() {
        let families = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER),
        ];
        let found = QueueFamilies::find(&families, |i| Ok(i != 0)).unwrap();
        assert_eq!(
            found,
            Some(QueueFamilies {
                graphics: 2,
                present: 2
            })
        );
        assert_eq!(found.unwrap().unique(), vec![2]);
    }

    #[test]
    fn splits_graphics_and_present() {
        let families = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::TRANSFER),
        ];
        let found = QueueFamilies::find(&families, |i| Ok(i == 1)).unwrap().unwrap();
        assert_eq!(found.graphics, 0);
        assert_eq!(found.present, 1);
        assert!(!found.is_shared());
        assert_eq!(found.unique(), vec![0, 1]);
    }

    #[test]
    fn no_family_without_present_or_graphics() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        assert_eq!(QueueFamilies::find(&families, |_| Ok(false)).unwrap(), None);

        let families = [family(vk::QueueFlags::COMPUTE)];
        assert_eq!(QueueFamilies::find(&families, |_| Ok(true)).unwrap(), None);
    }

    #[test]
    fn empty_families_are_ignored() {
        let mut empty = family(vk::QueueFlags::GRAPHICS);
        empty.queue_count = 0;
        let families = [empty, family(vk::QueueFlags::GRAPHICS)];
        let found = QueueFamilies::find(&families, |_| Ok(true)).unwrap().unwrap();
        assert_eq!(found.graphics, 1);
    }

    #[test]
    fn present_query_errors_propagate() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        let result = QueueFamilies::find(&families, |_| anyhow::bail!("lost"));
        assert!(result.is_err());
    }

    #[test]
    fn discrete_beats_integrated() {
        let discrete = device_type_score(vk::PhysicalDeviceType::DISCRETE_GPU);
        let integrated = device_type_score(vk::PhysicalDeviceType::INTEGRATED_GPU);
        let virt = device_type_score(vk::PhysicalDeviceType::VIRTUAL_GPU);
        let cpu = device_type_score(vk::PhysicalDeviceType::CPU);
        assert!(discrete > integrated && integrated > virt && virt > cpu);
        assert!(cpu > 0);
    }

    #[test]
    fn missing_layers_are_skipped() {
        let requested = [c"VK_LAYER_KHRONOS_validation", c"VK_LAYER_LUNARG_core_validation"];
        let available = [c"VK_LAYER_MESA_overlay", c"VK_LAYER_KHRONOS_validation"];
        assert_eq!(
            select_layers(&requested, &available),
            vec![c"VK_LAYER_KHRONOS_validation"]
        );
        assert!(select_layers(&requested, &[]).is_empty());
    }

    #[test]
    fn rollback_runs_newest_first() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let order = Rc::new(RefCell::new(Vec::new()));
        {
            let mut rollback = Rollback::default();
            for step in ["instance", "messenger", "surface"] {
                let order = order.clone();
                rollback.push(move || order.borrow_mut().push(step));
            }
        }
        assert_eq!(*order.borrow(), vec!["surface", "messenger", "instance"]);
    }

    #[test]
    fn disarmed_rollback_does_nothing() {
        use std::cell::Cell;
        use std::rc::Rc;

        let ran = Rc::new(Cell::new(false));
        let mut rollback = Rollback::default();
        let flag = ran.clone();
        rollback.push(move || flag.set(true));
        rollback.disarm();
        assert!(!ran.get());
    }
}
