//! Per-device timing properties.
//!
//! The tracker needs two numbers per device to express GPU ticks on the CPU
//! timeline: the tick period from the device limits, and an approximate
//! CPU-to-GPU clock offset measured by the embedding layer at device
//! creation.

use std::collections::HashMap;
use std::sync::RwLock;

use ash::vk;

pub trait DeviceInfoProvider: Send + Sync {
    /// Nanoseconds per timestamp tick (`VkPhysicalDeviceLimits::timestampPeriod`).
    fn timestamp_period(&self, device: vk::Device) -> f32;

    /// Approximate `cpu_ns - gpu_ns` for this device's timestamp clock.
    fn gpu_cpu_offset_ns(&self, device: vk::Device) -> i64;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceTimingInfo {
    pub timestamp_period: f32,
    pub gpu_cpu_offset_ns: i64,
}

/// Registry implementation backed by a map the embedding layer fills at
/// device creation and drains at destruction.
#[derive(Default)]
pub struct DeviceInfoRegistry {
    devices: RwLock<HashMap<vk::Device, DeviceTimingInfo>>,
}

impl DeviceInfoRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_device(&self, device: vk::Device, info: DeviceTimingInfo) {
        self.devices.write().unwrap().insert(device, info);
    }

    pub fn unregister_device(&self, device: vk::Device) {
        self.devices.write().unwrap().remove(&device);
    }

    pub fn set_gpu_cpu_offset_ns(&self, device: vk::Device, offset_ns: i64) {
        let mut devices = self.devices.write().unwrap();
        let info = devices
            .get_mut(&device)
            .unwrap_or_else(|| panic!("device {:?} was never registered", device));
        info.gpu_cpu_offset_ns = offset_ns;
    }

    fn info(&self, device: vk::Device) -> DeviceTimingInfo {
        *self
            .devices
            .read()
            .unwrap()
            .get(&device)
            .unwrap_or_else(|| panic!("device {:?} was never registered", device))
    }
}

impl DeviceInfoProvider for DeviceInfoRegistry {
    fn timestamp_period(&self, device: vk::Device) -> f32 {
        self.info(device).timestamp_period
    }

    fn gpu_cpu_offset_ns(&self, device: vk::Device) -> i64 {
        self.info(device).gpu_cpu_offset_ns
    }
}

/// Estimate the CPU-to-GPU clock offset from paired samples taken while the
/// two clocks observed the same instants: the mean of the pairwise
/// differences. Both sides must already be in nanoseconds.
pub fn approximate_offset_ns(samples: &[(u64, u64)]) -> i64 {
    assert!(!samples.is_empty(), "offset estimation needs samples");
    let sum: i64 = samples
        .iter()
        .map(|&(cpu_ns, gpu_ns)| cpu_ns as i64 - gpu_ns as i64)
        .sum();
    sum / samples.len() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn test_registry_round_trip() {
        let registry = DeviceInfoRegistry::new();
        let device = vk::Device::from_raw(0x10);
        registry.register_device(
            device,
            DeviceTimingInfo {
                timestamp_period: 2.5,
                gpu_cpu_offset_ns: -1_000,
            },
        );
        assert_eq!(registry.timestamp_period(device), 2.5);
        assert_eq!(registry.gpu_cpu_offset_ns(device), -1_000);

        registry.set_gpu_cpu_offset_ns(device, 42);
        assert_eq!(registry.gpu_cpu_offset_ns(device), 42);
    }

    #[test]
    #[should_panic]
    fn test_unknown_device_panics() {
        let registry = DeviceInfoRegistry::new();
        registry.timestamp_period(vk::Device::from_raw(0xdead));
    }

    #[test]
    fn test_offset_is_mean_of_differences() {
        // cpu - gpu: 100 and 200 -> 150.
        assert_eq!(approximate_offset_ns(&[(1_100, 1_000), (2_200, 2_000)]), 150);
        // Negative offsets (gpu clock ahead) work too.
        assert_eq!(approximate_offset_ns(&[(1_000, 1_100)]), -100);
    }
}
