//! Timestamp query slot pool.
//!
//! Each *logical* slot stands for a begin/end pair of physical query-pool
//! entries: begin-kind timestamps live at `2 * slot`, end-kind at
//! `2 * slot + 1`, and a hardware reset always covers the pair. Slot state
//! moves `Ready -> PendingOnGpu -> PendingHardwareReset -> Ready`; slots that
//! were allocated but never reached the GPU roll back to `Ready` directly.
//!
//! Consumed slots are not reset one by one: they accumulate until the batch
//! threshold and go back to the driver in a single burst.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ash::vk;

use crate::config::CaptureConfig;
use crate::vulkan::dispatch::DeviceDispatch;

/// Physical entry receiving begin-kind (top-of-pipe) timestamps.
pub fn physical_begin_slot(logical_slot: u32) -> u32 {
    logical_slot * 2
}

/// Physical entry receiving end-kind (bottom-of-pipe) timestamps.
pub fn physical_end_slot(logical_slot: u32) -> u32 {
    logical_slot * 2 + 1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Ready,
    PendingOnGpu,
    PendingHardwareReset,
}

struct DeviceSlots {
    query_pool: vk::QueryPool,
    slots: Vec<SlotState>,
    /// Rotating scan start; the slot after the last allocation.
    next_free_hint: u32,
    /// Logical slots read out and awaiting their batched hardware reset.
    pending_reset: Vec<u32>,
}

pub struct TimerSlotPool {
    dispatch: Arc<dyn DeviceDispatch>,
    num_logical_slots: u32,
    reset_batch: usize,
    devices: Mutex<HashMap<vk::Device, DeviceSlots>>,
}

impl TimerSlotPool {
    pub fn new(dispatch: Arc<dyn DeviceDispatch>, config: CaptureConfig) -> Self {
        Self {
            dispatch,
            num_logical_slots: config.num_logical_slots,
            reset_batch: config.reset_batch as usize,
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// The device's hardware query pool, created on first use: a timestamp
    /// pool with two physical entries per logical slot, fully host-reset
    /// before any slot is handed out.
    pub fn get_query_pool(&self, device: vk::Device) -> vk::QueryPool {
        let mut devices = self.devices.lock().unwrap();
        if let Some(state) = devices.get(&device) {
            return state.query_pool;
        }

        let physical_count = self.num_logical_slots * 2;
        let query_pool = match self
            .dispatch
            .create_timestamp_query_pool(device, physical_count)
        {
            Ok(pool) => pool,
            Err(e) => {
                log::error!("timestamp query pool creation failed: {}", e);
                panic!("cannot capture on device {:?}: {}", device, e);
            }
        };
        self.dispatch
            .reset_query_slots(device, query_pool, 0, physical_count);
        log::info!(
            "created timestamp query pool for device {:?} ({} logical slots)",
            device,
            self.num_logical_slots
        );

        devices.insert(
            device,
            DeviceSlots {
                query_pool,
                slots: vec![SlotState::Ready; self.num_logical_slots as usize],
                next_free_hint: 0,
                pending_reset: Vec::new(),
            },
        );
        query_pool
    }

    /// Claim the next `Ready` logical slot, scanning from the rotating
    /// cursor. `None` means every slot is in flight - the capture is
    /// outrunning completion and the caller should treat that as fatal.
    pub fn next_ready_slot(&self, device: vk::Device) -> Option<u32> {
        let mut devices = self.devices.lock().unwrap();
        let state = device_state(&mut devices, device);

        let start = state.next_free_hint;
        let mut current = start;
        loop {
            if state.slots[current as usize] == SlotState::Ready {
                state.slots[current as usize] = SlotState::PendingOnGpu;
                state.next_free_hint = (current + 1) % self.num_logical_slots;
                return Some(current);
            }
            current = (current + 1) % self.num_logical_slots;
            if current == start {
                return None;
            }
        }
    }

    /// Hand back logical slots whose results have been read. They queue for a
    /// hardware reset, issued in one burst once the backlog reaches the
    /// configured batch size.
    pub fn reset_slots(&self, device: vk::Device, logical_slots: &[u32]) {
        if logical_slots.is_empty() {
            return;
        }
        let mut devices = self.devices.lock().unwrap();
        let state = device_state(&mut devices, device);
        for &slot in logical_slots {
            assert!(slot < self.num_logical_slots, "slot {} out of range", slot);
            assert_eq!(
                state.slots[slot as usize],
                SlotState::PendingOnGpu,
                "slot {} reset without an outstanding query",
                slot
            );
            state.slots[slot as usize] = SlotState::PendingHardwareReset;
            state.pending_reset.push(slot);
        }
        if state.pending_reset.len() >= self.reset_batch {
            self.flush_resets_locked(device, state);
        }
    }

    /// Force the batched hardware reset regardless of backlog size.
    pub fn flush_resets(&self, device: vk::Device) {
        let mut devices = self.devices.lock().unwrap();
        let state = device_state(&mut devices, device);
        self.flush_resets_locked(device, state);
    }

    fn flush_resets_locked(&self, device: vk::Device, state: &mut DeviceSlots) {
        if state.pending_reset.is_empty() {
            return;
        }
        log::debug!(
            "hardware-resetting {} timestamp slots on device {:?}",
            state.pending_reset.len(),
            device
        );
        for slot in state.pending_reset.drain(..) {
            self.dispatch.reset_query_slots(
                device,
                state.query_pool,
                physical_begin_slot(slot),
                2,
            );
            state.slots[slot as usize] = SlotState::Ready;
        }
    }

    /// Return slots that were allocated but never submitted to the GPU (the
    /// recording command buffer was reset first). Nothing was written, so no
    /// hardware reset is needed.
    pub fn rollback_pending(&self, device: vk::Device, logical_slots: &[u32]) {
        if logical_slots.is_empty() {
            return;
        }
        let mut devices = self.devices.lock().unwrap();
        let state = device_state(&mut devices, device);
        for &slot in logical_slots {
            assert!(slot < self.num_logical_slots, "slot {} out of range", slot);
            assert_eq!(
                state.slots[slot as usize],
                SlotState::PendingOnGpu,
                "slot {} rolled back without an outstanding query",
                slot
            );
            state.slots[slot as usize] = SlotState::Ready;
        }
    }

    /// `(ready, pending_on_gpu, pending_hardware_reset)` counts, for health
    /// logging.
    pub fn slot_state_counts(&self, device: vk::Device) -> (u32, u32, u32) {
        let mut devices = self.devices.lock().unwrap();
        let state = device_state(&mut devices, device);
        let mut counts = (0, 0, 0);
        for slot in &state.slots {
            match slot {
                SlotState::Ready => counts.0 += 1,
                SlotState::PendingOnGpu => counts.1 += 1,
                SlotState::PendingHardwareReset => counts.2 += 1,
            }
        }
        counts
    }
}

fn device_state<'a>(
    devices: &'a mut HashMap<vk::Device, DeviceSlots>,
    device: vk::Device,
) -> &'a mut DeviceSlots {
    devices
        .get_mut(&device)
        .unwrap_or_else(|| panic!("device {:?} has no slot pool yet", device))
}
