//! The driver seam.
//!
//! Everything the capture core asks of Vulkan goes through this trait, so the
//! tracker and slot pool never hold driver function pointers themselves and
//! tests can script the GPU. Calls are keyed by device because that is how
//! the function tables are looked up. `AshDispatch` is the real
//! implementation on top of registered `ash` device tables.

use std::collections::HashMap;
use std::sync::RwLock;

use ash::vk;

/// Per-device driver calls needed for timestamp capture.
///
/// `read_timestamp` is non-blocking: `Ok(Some(ticks))` when the value is
/// available, `Ok(None)` when the GPU has not produced it yet, `Err` on a
/// real driver error.
pub trait DeviceDispatch: Send + Sync {
    fn create_timestamp_query_pool(
        &self,
        device: vk::Device,
        query_count: u32,
    ) -> Result<vk::QueryPool, String>;

    /// Host-side reset of `count` physical entries starting at `first`.
    fn reset_query_slots(&self, device: vk::Device, pool: vk::QueryPool, first: u32, count: u32);

    /// Record a timestamp write into `command_buffer` at the given physical
    /// entry.
    fn write_timestamp(
        &self,
        device: vk::Device,
        command_buffer: vk::CommandBuffer,
        stage: vk::PipelineStageFlags,
        pool: vk::QueryPool,
        physical_slot: u32,
    );

    fn read_timestamp(
        &self,
        device: vk::Device,
        pool: vk::QueryPool,
        physical_slot: u32,
    ) -> Result<Option<u64>, String>;
}

/// Real driver dispatch over `ash` device tables.
///
/// The embedding layer registers each `ash::Device` it creates; look-up is by
/// raw `vk::Device` handle. Host query reset is core in Vulkan 1.2, which the
/// devices are expected to target.
#[derive(Default)]
pub struct AshDispatch {
    devices: RwLock<HashMap<vk::Device, ash::Device>>,
}

impl AshDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_device(&self, device: ash::Device) {
        self.devices
            .write()
            .unwrap()
            .insert(device.handle(), device);
    }

    pub fn unregister_device(&self, device: vk::Device) {
        self.devices.write().unwrap().remove(&device);
    }

    fn device(&self, device: vk::Device) -> ash::Device {
        self.devices
            .read()
            .unwrap()
            .get(&device)
            .cloned()
            .unwrap_or_else(|| panic!("device {:?} was never registered", device))
    }
}

impl DeviceDispatch for AshDispatch {
    fn create_timestamp_query_pool(
        &self,
        device: vk::Device,
        query_count: u32,
    ) -> Result<vk::QueryPool, String> {
        let device = self.device(device);
        let create_info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(query_count);
        unsafe {
            device
                .create_query_pool(&create_info, None)
                .map_err(|e| format!("Failed to create timestamp query pool: {:?}", e))
        }
    }

    fn reset_query_slots(&self, device: vk::Device, pool: vk::QueryPool, first: u32, count: u32) {
        let device = self.device(device);
        unsafe {
            device.reset_query_pool(pool, first, count);
        }
    }

    fn write_timestamp(
        &self,
        device: vk::Device,
        command_buffer: vk::CommandBuffer,
        stage: vk::PipelineStageFlags,
        pool: vk::QueryPool,
        physical_slot: u32,
    ) {
        let device = self.device(device);
        unsafe {
            device.cmd_write_timestamp(command_buffer, stage, pool, physical_slot);
        }
    }

    fn read_timestamp(
        &self,
        device: vk::Device,
        pool: vk::QueryPool,
        physical_slot: u32,
    ) -> Result<Option<u64>, String> {
        let device = self.device(device);
        let mut data = [0u64; 1];
        let result = unsafe {
            device.get_query_pool_results(
                pool,
                physical_slot,
                &mut data,
                vk::QueryResultFlags::TYPE_64,
            )
        };
        match result {
            Ok(()) => Ok(Some(data[0])),
            Err(vk::Result::NOT_READY) => Ok(None),
            Err(e) => Err(format!("Failed to read query slot: {:?}", e)),
        }
    }
}
