//! Instance and logical device bring-up.
//!
//! The [`Device`] is the crate's connection to the Vulkan implementation. It
//! owns the instance, the selected physical device, the logical device, and a
//! single queue with compute and transfer capability. All other objects hold a
//! cheap [`Device`] clone; instance-level state is torn down when the last
//! clone drops.

use std::ffi::{c_void, CStr};
use std::ops::Deref;
use std::sync::Arc;

use ash::vk;

use crate::error::{Error, Result};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Configuration for [`Device::new`].
pub struct DeviceOptions {
    /// Enable the Khronos validation layer and a debug-utils messenger that
    /// forwards warnings and errors to `tracing`.
    pub validation: bool,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            validation: cfg!(debug_assertions),
        }
    }
}

/// Snapshot of the physical device's compute limits, cached at device
/// creation.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceComputeLimits {
    pub max_compute_shared_memory_size: u32,
    pub max_compute_work_group_count: [u32; 3],
    pub max_compute_work_group_invocations: u32,
    pub max_compute_work_group_size: [u32; 3],
}

/// A reference-counted logical device handle.
///
/// Dereferences to [`ash::Device`], so raw Vulkan entry points are available
/// directly on it.
#[derive(Clone)]
pub struct Device(Arc<DeviceInner>);

struct DeviceInner {
    _entry: ash::Entry,
    instance: ash::Instance,
    debug: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    queue_family_index: u32,
    queue: vk::Queue,
    compute_limits: DeviceComputeLimits,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl Deref for Device {
    type Target = ash::Device;

    fn deref(&self) -> &Self::Target {
        &self.0.device
    }
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_device(None);
            if let Some((loader, messenger)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

impl Device {
    /// Creates an instance, picks the first physical device exposing a queue
    /// family with both compute and transfer capability, and builds a logical
    /// device with a single queue from that family.
    pub fn new(options: &DeviceOptions) -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| Error::DeviceInit(format!("failed to load Vulkan: {e}")))?;

        let validation = options.validation && validation_layer_available(&entry);
        if options.validation && !validation {
            tracing::warn!("validation requested but VK_LAYER_KHRONOS_validation is unavailable");
        }

        let app_info = vk::ApplicationInfo::default()
            .application_name(c"scoria")
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_1);

        let layers = [VALIDATION_LAYER.as_ptr()];
        let extensions = [ash::ext::debug_utils::NAME.as_ptr()];
        let mut debug_info = debug_messenger_info();

        let mut create_info = vk::InstanceCreateInfo::default().application_info(&app_info);
        if validation {
            create_info = create_info
                .enabled_layer_names(&layers)
                .enabled_extension_names(&extensions)
                .push_next(&mut debug_info);
        }

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(|e| Error::DeviceInit(format!("failed to create instance: {e}")))?;

        let debug = if validation {
            let loader = ash::ext::debug_utils::Instance::new(&entry, &instance);
            let messenger =
                unsafe { loader.create_debug_utils_messenger(&debug_messenger_info(), None) }
                    .map_err(|e| {
                        Error::DeviceInit(format!("failed to create debug messenger: {e}"))
                    })?;
            Some((loader, messenger))
        } else {
            None
        };

        let (physical_device, queue_family_index) = match pick_physical_device(&instance) {
            Some(found) => found,
            None => {
                unsafe {
                    if let Some((loader, messenger)) = &debug {
                        loader.destroy_debug_utils_messenger(*messenger, None);
                    }
                    instance.destroy_instance(None);
                }
                return Err(Error::DeviceInit(
                    "no device with a compute-and-transfer queue family".into(),
                ));
            }
        };

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let device_name = properties
            .device_name_as_c_str()
            .unwrap_or(c"unknown")
            .to_string_lossy()
            .into_owned();
        tracing::info!(device = %device_name, queue_family = queue_family_index, "selected compute device");

        let queue_priorities = [1.0f32];
        let queue_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family_index)
            .queue_priorities(&queue_priorities);
        let queue_infos = [queue_info];
        let device_info = vk::DeviceCreateInfo::default().queue_create_infos(&queue_infos);

        let device = unsafe { instance.create_device(physical_device, &device_info, None) }
            .map_err(|e| Error::DeviceInit(format!("failed to create logical device: {e}")))?;

        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let limits = properties.limits;
        let compute_limits = DeviceComputeLimits {
            max_compute_shared_memory_size: limits.max_compute_shared_memory_size,
            max_compute_work_group_count: limits.max_compute_work_group_count,
            max_compute_work_group_invocations: limits.max_compute_work_group_invocations,
            max_compute_work_group_size: limits.max_compute_work_group_size,
        };

        Ok(Self(Arc::new(DeviceInner {
            _entry: entry,
            instance,
            debug,
            physical_device,
            device,
            queue_family_index,
            queue,
            compute_limits,
            memory_properties,
        })))
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.0.instance
    }

    /// The raw `ash` device, for callers that need it in a non-receiver
    /// position (the `Deref` impl covers method calls).
    pub fn ash_device(&self) -> &ash::Device {
        &self.0.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.0.physical_device
    }

    pub fn queue(&self) -> vk::Queue {
        self.0.queue
    }

    pub fn queue_family_index(&self) -> u32 {
        self.0.queue_family_index
    }

    pub fn compute_limits(&self) -> DeviceComputeLimits {
        self.0.compute_limits
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.0.memory_properties
    }
}

fn validation_layer_available(entry: &ash::Entry) -> bool {
    let layers = match unsafe { entry.enumerate_instance_layer_properties() } {
        Ok(layers) => layers,
        Err(_) => return false,
    };
    layers.iter().any(|layer| {
        layer
            .layer_name_as_c_str()
            .map(|name| name == VALIDATION_LAYER)
            .unwrap_or(false)
    })
}

fn pick_physical_device(instance: &ash::Instance) -> Option<(vk::PhysicalDevice, u32)> {
    let devices = unsafe { instance.enumerate_physical_devices() }.ok()?;
    for device in devices {
        let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
        let family = families.iter().position(|family| {
            family
                .queue_flags
                .contains(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER)
        });
        if let Some(index) = family {
            return Some((device, index as u32));
        }
    }
    None
}

fn debug_messenger_info<'a>() -> vk::DebugUtilsMessengerCreateInfoEXT<'a> {
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback))
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    let message = if data.is_null() {
        String::new()
    } else {
        let data = &*data;
        if data.p_message.is_null() {
            String::new()
        } else {
            CStr::from_ptr(data.p_message).to_string_lossy().into_owned()
        }
    };
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        tracing::error!(target: "scoria::validation", "{message}");
    } else {
        tracing::warn!(target: "scoria::validation", "{message}");
    }
    vk::FALSE
}
