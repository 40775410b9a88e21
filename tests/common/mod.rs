//! Shared test doubles: a scripted GPU standing in for the driver dispatch,
//! and a sink that collects emitted events.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use ash::vk;
use ash::vk::Handle;
use silhouette::sink::{QueueSubmissionEvent, SubmissionSink};
use silhouette::vulkan::DeviceDispatch;

/// Fake driver. Timestamp writes are logged in order and given the ticks
/// 100, 200, 300, ... so tests can predict every GPU value. A written slot
/// stays invisible to reads until the test "completes" it, mimicking work
/// still in flight on the real GPU.
#[derive(Default)]
pub struct FakeGpu {
    state: Mutex<FakeGpuState>,
}

#[derive(Default)]
struct FakeGpuState {
    next_pool_handle: u64,
    created_pool_sizes: Vec<u32>,
    /// (pool, physical slot, ticks) in write order.
    write_log: Vec<(vk::QueryPool, u32, u64)>,
    written: HashMap<(vk::QueryPool, u32), u64>,
    ready: HashSet<(vk::QueryPool, u32)>,
    /// (pool, first, count) ranges handed to reset_query_slots.
    reset_ranges: Vec<(vk::QueryPool, u32, u32)>,
}

impl FakeGpu {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every written slot readable.
    pub fn complete_all(&self) {
        let mut state = self.state.lock().unwrap();
        let keys: Vec<_> = state.written.keys().copied().collect();
        state.ready.extend(keys);
    }

    /// Make only the first `n` writes (in record order) readable.
    pub fn complete_first_writes(&self, n: usize) {
        let mut state = self.state.lock().unwrap();
        let keys: Vec<_> = state
            .write_log
            .iter()
            .take(n)
            .map(|&(pool, slot, _)| (pool, slot))
            .collect();
        state.ready.extend(keys);
    }

    /// Ticks assigned to the i-th write (0-based).
    pub fn ticks_of_write(&self, i: usize) -> u64 {
        self.state.lock().unwrap().write_log[i].2
    }

    pub fn write_count(&self) -> usize {
        self.state.lock().unwrap().write_log.len()
    }

    pub fn reset_ranges(&self) -> Vec<(u32, u32)> {
        self.state
            .lock()
            .unwrap()
            .reset_ranges
            .iter()
            .map(|&(_, first, count)| (first, count))
            .collect()
    }

    pub fn created_pool_sizes(&self) -> Vec<u32> {
        self.state.lock().unwrap().created_pool_sizes.clone()
    }
}

impl DeviceDispatch for FakeGpu {
    fn create_timestamp_query_pool(
        &self,
        _device: vk::Device,
        query_count: u32,
    ) -> Result<vk::QueryPool, String> {
        let mut state = self.state.lock().unwrap();
        state.next_pool_handle += 1;
        state.created_pool_sizes.push(query_count);
        Ok(vk::QueryPool::from_raw(state.next_pool_handle))
    }

    fn reset_query_slots(&self, _device: vk::Device, pool: vk::QueryPool, first: u32, count: u32) {
        let mut state = self.state.lock().unwrap();
        state.reset_ranges.push((pool, first, count));
        for slot in first..first + count {
            state.written.remove(&(pool, slot));
            state.ready.remove(&(pool, slot));
        }
    }

    fn write_timestamp(
        &self,
        _device: vk::Device,
        _command_buffer: vk::CommandBuffer,
        _stage: vk::PipelineStageFlags,
        pool: vk::QueryPool,
        physical_slot: u32,
    ) {
        let mut state = self.state.lock().unwrap();
        let ticks = (state.write_log.len() as u64 + 1) * 100;
        state.write_log.push((pool, physical_slot, ticks));
        state.written.insert((pool, physical_slot), ticks);
    }

    fn read_timestamp(
        &self,
        _device: vk::Device,
        pool: vk::QueryPool,
        physical_slot: u32,
    ) -> Result<Option<u64>, String> {
        let state = self.state.lock().unwrap();
        let key = (pool, physical_slot);
        if state.ready.contains(&key) {
            Ok(Some(state.written[&key]))
        } else {
            Ok(None)
        }
    }
}

/// Sink that stores everything it receives.
#[derive(Default)]
pub struct CollectingSink {
    submissions: Mutex<Vec<QueueSubmissionEvent>>,
    strings: Mutex<Vec<(u64, String)>>,
}

impl CollectingSink {
    pub fn submissions(&self) -> Vec<QueueSubmissionEvent> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn strings(&self) -> Vec<(u64, String)> {
        self.strings.lock().unwrap().clone()
    }
}

impl SubmissionSink for CollectingSink {
    fn write_submission(&self, event: QueueSubmissionEvent) {
        self.submissions.lock().unwrap().push(event);
    }

    fn write_interned_string(&self, key: u64, text: &str) {
        self.strings.lock().unwrap().push((key, text.to_string()));
    }
}
