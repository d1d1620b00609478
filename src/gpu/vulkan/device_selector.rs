use ash::vk;
use std::ffi::CStr;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Dedicated,
    Integrated,
    #[default]
    Other,
}

impl From<vk::PhysicalDeviceType> for DeviceType {
    fn from(value: vk::PhysicalDeviceType) -> Self {
        match value {
            vk::PhysicalDeviceType::DISCRETE_GPU => DeviceType::Dedicated,
            vk::PhysicalDeviceType::INTEGRATED_GPU => DeviceType::Integrated,
            _ => DeviceType::Other,
        }
    }
}

/// Which physical device a Vulkan context should open.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub enum DeviceSelection {
    /// First compute-capable device, preferring a dedicated GPU.
    #[default]
    Default,
    /// Position in the driver's enumeration order.
    Index(usize),
    /// First device whose name contains this text (case-insensitive).
    Name(String),
}

#[derive(Debug, Default, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub kind: DeviceType,
    pub driver_version: u32,
    /// First queue family advertising compute, if any.
    pub compute_family: Option<u32>,
}

impl std::fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[Name {} -- {:?} -- Driver Ver {}]",
            self.name, self.kind, self.driver_version
        )
    }
}

impl From<vk::PhysicalDeviceProperties> for DeviceInfo {
    fn from(value: vk::PhysicalDeviceProperties) -> Self {
        DeviceInfo {
            name: unsafe {
                CStr::from_ptr(value.device_name.as_ptr())
                    .to_str()
                    .unwrap_or("UNKNOWN")
                    .to_string()
            },
            kind: value.device_type.into(),
            driver_version: value.driver_version,
            compute_family: None,
        }
    }
}

/// Describe every physical device the instance can see, in enumeration order.
pub(super) fn enumerate(
    instance: &ash::Instance,
) -> Result<Vec<(vk::PhysicalDevice, DeviceInfo)>, vk::Result> {
    let pdevices = unsafe { instance.enumerate_physical_devices()? };

    Ok(pdevices
        .into_iter()
        .map(|pdevice| {
            let properties = unsafe { instance.get_physical_device_properties(pdevice) };
            let families =
                unsafe { instance.get_physical_device_queue_family_properties(pdevice) };

            let mut info: DeviceInfo = properties.into();
            info.compute_family = families
                .iter()
                .position(|f| f.queue_flags.contains(vk::QueueFlags::COMPUTE))
                .map(|idx| idx as u32);
            (pdevice, info)
        })
        .collect())
}

/// Pick a device index out of `devices`. Devices without a compute queue are
/// never chosen.
pub fn select(devices: &[DeviceInfo], selection: &DeviceSelection) -> Option<usize> {
    let usable = |info: &DeviceInfo| info.compute_family.is_some();

    match selection {
        DeviceSelection::Default => devices
            .iter()
            .position(|d| usable(d) && d.kind == DeviceType::Dedicated)
            .or_else(|| devices.iter().position(usable)),
        DeviceSelection::Index(idx) => devices.get(*idx).filter(|d| usable(d)).map(|_| *idx),
        DeviceSelection::Name(name) => {
            let needle = name.to_lowercase();
            devices
                .iter()
                .position(|d| usable(d) && d.name.to_lowercase().contains(&needle))
        }
    }
}
