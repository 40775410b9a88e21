//! # GPU Span Tracker (The Shadow)
//!
//! Follows the intercepted Vulkan command stream and turns it into completed,
//! time-correlated submission events. Four tables carry the state:
//!
//! - command pool -> its command buffers
//! - command buffer -> owning device
//! - command buffer -> recording state (timestamp slots + markers)
//! - queue -> pending submissions and the in-flight debug-marker stack
//!
//! All four live behind one tracker-wide `RwLock`; the driver itself is never
//! called while holding it, except for the non-blocking readiness probes of
//! the completion scan.
//!
//! Marker texts are recorded whether or not a capture is running - the
//! queue's nesting depth must stay correct across capture toggles. Slot
//! allocation, timestamp writes and submission records only happen while
//! capturing.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Instant;

use ash::vk;

use crate::capture::CaptureGate;
use crate::intern::StringInterner;
use crate::sink::{
    CommandBufferTiming, CompletedMarkerEvent, MarkerBeginEvent, QueueSubmissionEvent,
    SubmissionSink, SubmitInfoEvent,
};
use crate::vulkan::devices::DeviceInfoProvider;
use crate::vulkan::dispatch::DeviceDispatch;
use crate::vulkan::slots::{physical_begin_slot, physical_end_slot, TimerSlotPool};

/// Host-side identity of one submit call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SubmissionMeta {
    thread_id: u32,
    pre_submit_cpu_ns: u64,
    /// Stamped by `post_submit`; `None` while the driver call is in flight.
    post_submit_cpu_ns: Option<u64>,
}

#[derive(Debug, Clone)]
enum RecordedMarker {
    Begin { text: String, slot: Option<u32> },
    End { slot: Option<u32> },
}

/// Lives from `mark_cb_begin` until the owning submission's `post_submit`
/// (or until a reset discards it).
#[derive(Debug, Default)]
struct CommandBufferState {
    begin_slot: Option<u32>,
    /// Invariant: `Some` only when `begin_slot` is `Some`.
    end_slot: Option<u32>,
    markers: Vec<RecordedMarker>,
}

#[derive(Debug, Clone, Copy)]
struct SubmittedSpan {
    begin_slot: u32,
    end_slot: u32,
}

#[derive(Debug, Clone, Copy)]
struct MarkerSlotInfo {
    meta: SubmissionMeta,
    slot: u32,
}

/// A begin marker still waiting for its end, parked on the queue.
#[derive(Debug)]
struct MarkerStackEntry {
    text: String,
    /// Stack size at begin time - the nesting level.
    depth: u32,
    /// Absent when the begin was recorded without a slot (capture off, or
    /// the capture started mid-marker).
    begin: Option<MarkerSlotInfo>,
}

#[derive(Debug)]
struct CompletedMarker {
    text: String,
    depth: u32,
    begin: Option<MarkerSlotInfo>,
    end: MarkerSlotInfo,
}

#[derive(Debug)]
struct QueueSubmission {
    meta: SubmissionMeta,
    /// One span list per original submit-info, in submit order. Groups may
    /// be empty.
    submit_infos: Vec<Vec<SubmittedSpan>>,
    num_begin_markers: u32,
    completed_markers: Vec<CompletedMarker>,
}

#[derive(Debug, Default)]
struct QueueState {
    submissions: VecDeque<QueueSubmission>,
    marker_stack: Vec<MarkerStackEntry>,
}

#[derive(Default)]
struct TrackerTables {
    pool_to_command_buffers: HashMap<vk::CommandPool, HashSet<vk::CommandBuffer>>,
    command_buffer_to_device: HashMap<vk::CommandBuffer, vk::Device>,
    command_buffer_to_state: HashMap<vk::CommandBuffer, CommandBufferState>,
    queues: HashMap<vk::Queue, QueueState>,
}

pub struct GpuSpanTracker {
    tables: RwLock<TrackerTables>,
    dispatch: Arc<dyn DeviceDispatch>,
    slot_pool: Arc<TimerSlotPool>,
    device_info: Arc<dyn DeviceInfoProvider>,
    gate: Arc<dyn CaptureGate>,
    sink: Arc<dyn SubmissionSink>,
    interner: Arc<StringInterner>,
}

impl GpuSpanTracker {
    pub fn new(
        dispatch: Arc<dyn DeviceDispatch>,
        slot_pool: Arc<TimerSlotPool>,
        device_info: Arc<dyn DeviceInfoProvider>,
        gate: Arc<dyn CaptureGate>,
        sink: Arc<dyn SubmissionSink>,
        interner: Arc<StringInterner>,
    ) -> Self {
        Self {
            tables: RwLock::new(TrackerTables::default()),
            dispatch,
            slot_pool,
            device_info,
            gate,
            sink,
            interner,
        }
    }

    /// Register freshly allocated command buffers as belonging to `pool` on
    /// `device`.
    pub fn track_cbs(&self, device: vk::Device, pool: vk::CommandPool, cbs: &[vk::CommandBuffer]) {
        let mut tables = self.tables.write().unwrap();
        let TrackerTables {
            pool_to_command_buffers,
            command_buffer_to_device,
            ..
        } = &mut *tables;
        let associated = pool_to_command_buffers.entry(pool).or_default();
        for &cb in cbs {
            assert_ne!(cb, vk::CommandBuffer::null(), "null command buffer tracked");
            assert!(
                associated.insert(cb),
                "command buffer {:?} tracked twice for pool {:?}",
                cb,
                pool
            );
            command_buffer_to_device.insert(cb, device);
        }
    }

    /// Inverse of `track_cbs`, on free. Drops any leftover recording state.
    pub fn untrack_cbs(
        &self,
        device: vk::Device,
        pool: vk::CommandPool,
        cbs: &[vk::CommandBuffer],
    ) {
        let mut tables = self.tables.write().unwrap();
        let TrackerTables {
            pool_to_command_buffers,
            command_buffer_to_device,
            command_buffer_to_state,
            ..
        } = &mut *tables;
        let associated = pool_to_command_buffers
            .get_mut(&pool)
            .unwrap_or_else(|| panic!("pool {:?} is not tracked", pool));
        for &cb in cbs {
            assert_ne!(cb, vk::CommandBuffer::null(), "null command buffer untracked");
            assert!(
                associated.remove(&cb),
                "command buffer {:?} was not tracked for pool {:?}",
                cb,
                pool
            );
            let stored = command_buffer_to_device
                .remove(&cb)
                .unwrap_or_else(|| panic!("command buffer {:?} has no device", cb));
            assert_eq!(
                stored, device,
                "command buffer {:?} untracked on the wrong device",
                cb
            );
            command_buffer_to_state.remove(&cb);
        }
        if associated.is_empty() {
            pool_to_command_buffers.remove(&pool);
        }
    }

    /// `vkBeginCommandBuffer`: start a fresh recording state, and while
    /// capturing, open the command buffer's span with a top-of-pipe
    /// timestamp.
    pub fn mark_cb_begin(&self, cb: vk::CommandBuffer) {
        assert_ne!(cb, vk::CommandBuffer::null(), "null command buffer begun");
        let device = self.device_of(cb);
        self.tables
            .write()
            .unwrap()
            .command_buffer_to_state
            .insert(cb, CommandBufferState::default());

        if !self.gate.is_capturing() {
            return;
        }
        let slot = self.allocate_slot(device);
        self.dispatch.write_timestamp(
            device,
            cb,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            self.slot_pool.get_query_pool(device),
            physical_begin_slot(slot),
        );
        self.tables
            .write()
            .unwrap()
            .command_buffer_to_state
            .get_mut(&cb)
            .expect("state was just created")
            .begin_slot = Some(slot);
    }

    /// `vkEndCommandBuffer`: close the span with a bottom-of-pipe timestamp.
    /// Nothing happens when capture is off or the begin was never captured.
    pub fn mark_cb_end(&self, cb: vk::CommandBuffer) {
        assert_ne!(cb, vk::CommandBuffer::null(), "null command buffer ended");
        if !self.gate.is_capturing() {
            return;
        }
        let device = self.device_of(cb);
        {
            let tables = self.tables.read().unwrap();
            match tables.command_buffer_to_state.get(&cb) {
                Some(state) if state.begin_slot.is_some() => {}
                _ => return,
            }
        }
        let slot = self.allocate_slot(device);
        self.dispatch.write_timestamp(
            device,
            cb,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            self.slot_pool.get_query_pool(device),
            physical_end_slot(slot),
        );
        self.tables
            .write()
            .unwrap()
            .command_buffer_to_state
            .get_mut(&cb)
            .unwrap_or_else(|| panic!("command buffer {:?} lost its state mid-recording", cb))
            .end_slot = Some(slot);
    }

    /// Debug marker push. The text is recorded unconditionally so nesting
    /// depth survives capture toggles; the timestamp slot only exists while
    /// capturing.
    pub fn mark_marker_begin(&self, cb: vk::CommandBuffer, text: &str) {
        assert_ne!(cb, vk::CommandBuffer::null(), "marker on null command buffer");
        let device = self.device_of(cb);
        let slot = if self.gate.is_capturing() {
            let slot = self.allocate_slot(device);
            self.dispatch.write_timestamp(
                device,
                cb,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                self.slot_pool.get_query_pool(device),
                physical_begin_slot(slot),
            );
            Some(slot)
        } else {
            None
        };
        self.tables
            .write()
            .unwrap()
            .command_buffer_to_state
            .get_mut(&cb)
            .unwrap_or_else(|| panic!("marker recorded into un-begun command buffer {:?}", cb))
            .markers
            .push(RecordedMarker::Begin {
                text: text.to_string(),
                slot,
            });
    }

    /// Debug marker pop, mirroring `mark_marker_begin`.
    pub fn mark_marker_end(&self, cb: vk::CommandBuffer) {
        assert_ne!(cb, vk::CommandBuffer::null(), "marker on null command buffer");
        let device = self.device_of(cb);
        let slot = if self.gate.is_capturing() {
            let slot = self.allocate_slot(device);
            self.dispatch.write_timestamp(
                device,
                cb,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                self.slot_pool.get_query_pool(device),
                physical_end_slot(slot),
            );
            Some(slot)
        } else {
            None
        };
        self.tables
            .write()
            .unwrap()
            .command_buffer_to_state
            .get_mut(&cb)
            .unwrap_or_else(|| panic!("marker recorded into un-begun command buffer {:?}", cb))
            .markers
            .push(RecordedMarker::End { slot });
    }

    /// Just before `vkQueueSubmit`: while capturing, snapshot every command
    /// buffer span into a new pending submission, stamped with the calling
    /// thread and the pre-submit CPU time.
    pub fn pre_submit(&self, queue: vk::Queue, submits: &[&[vk::CommandBuffer]]) {
        if !self.gate.is_capturing() {
            return;
        }
        let meta = SubmissionMeta {
            thread_id: current_thread_id(),
            pre_submit_cpu_ns: monotonic_now_ns(),
            post_submit_cpu_ns: None,
        };

        let mut tables = self.tables.write().unwrap();
        let TrackerTables {
            command_buffer_to_state,
            queues,
            ..
        } = &mut *tables;

        let mut submit_infos = Vec::with_capacity(submits.len());
        for group in submits {
            let mut spans = Vec::new();
            for cb in *group {
                let Some(state) = command_buffer_to_state.get(cb) else {
                    continue;
                };
                let Some(begin_slot) = state.begin_slot else {
                    continue;
                };
                let end_slot = state.end_slot.unwrap_or_else(|| {
                    panic!(
                        "command buffer {:?} submitted with a begin timestamp but no end",
                        cb
                    )
                });
                spans.push(SubmittedSpan {
                    begin_slot,
                    end_slot,
                });
            }
            submit_infos.push(spans);
        }

        queues
            .entry(queue)
            .or_default()
            .submissions
            .push_back(QueueSubmission {
                meta,
                submit_infos,
                num_begin_markers: 0,
                completed_markers: Vec::new(),
            });
    }

    /// Just after `vkQueueSubmit` returns: stamp the post-submit CPU time,
    /// then - capturing or not - fold every submitted command buffer's
    /// markers into the queue's nesting stack and retire the recording
    /// states. This is the only path that removes command-buffer state in
    /// normal operation.
    pub fn post_submit(&self, queue: vk::Queue, submits: &[&[vk::CommandBuffer]]) {
        let now = monotonic_now_ns();
        let mut tables = self.tables.write().unwrap();
        let TrackerTables {
            command_buffer_to_state,
            queues,
            ..
        } = &mut *tables;
        let queue_state = queues.entry(queue).or_default();
        let QueueState {
            submissions,
            marker_stack,
        } = queue_state;

        // The submission appended by our pre_submit, if there was one. An
        // already-stamped tail belongs to an earlier submit call.
        let current_idx = match submissions.back() {
            Some(s) if s.meta.post_submit_cpu_ns.is_none() => Some(submissions.len() - 1),
            _ => None,
        };
        if let Some(idx) = current_idx {
            submissions[idx].meta.post_submit_cpu_ns = Some(now);
        }
        let current_meta = current_idx.map(|idx| submissions[idx].meta);

        for group in submits {
            for cb in *group {
                let Some(state) = command_buffer_to_state.remove(cb) else {
                    continue;
                };
                for marker in state.markers {
                    match marker {
                        RecordedMarker::Begin { text, slot } => {
                            let depth = marker_stack.len() as u32;
                            let begin = match (slot, current_meta) {
                                (Some(slot), Some(meta)) => Some(MarkerSlotInfo { meta, slot }),
                                _ => None,
                            };
                            if begin.is_some() {
                                submissions[current_idx.expect("begin info implies a submission")]
                                    .num_begin_markers += 1;
                            }
                            marker_stack.push(MarkerStackEntry { text, depth, begin });
                        }
                        RecordedMarker::End { slot } => {
                            let entry = marker_stack.pop().unwrap_or_else(|| {
                                panic!("marker end without a begin on queue {:?}", queue)
                            });
                            if let (Some(slot), Some(meta)) = (slot, current_meta) {
                                submissions[current_idx.expect("end info implies a submission")]
                                    .completed_markers
                                    .push(CompletedMarker {
                                        text: entry.text,
                                        depth: entry.depth,
                                        begin: entry.begin,
                                        end: MarkerSlotInfo { meta, slot },
                                    });
                            }
                        }
                    }
                }
            }
        }
    }

    /// Reclamation pass: emit every submission whose GPU work has finished,
    /// then hand its slots back to the pool for a batched reset.
    ///
    /// GPU completion follows submission order per queue, so each queue is
    /// scanned oldest-first and the scan stops at the first submission whose
    /// probe comes back not-ready.
    pub fn complete_submits(&self, device: vk::Device) {
        let pool = self.slot_pool.get_query_pool(device);

        let mut to_emit: Vec<QueueSubmission> = Vec::new();
        {
            let mut tables = self.tables.write().unwrap();
            for queue_state in tables.queues.values_mut() {
                loop {
                    let (post_stamped, probe_slot) = match queue_state.submissions.front() {
                        None => break,
                        Some(submission) => (
                            submission.meta.post_submit_cpu_ns.is_some(),
                            submission
                                .submit_infos
                                .iter()
                                .rev()
                                .find_map(|group| group.last())
                                .map(|span| span.end_slot),
                        ),
                    };
                    if !post_stamped {
                        // The submit call is still between pre and post.
                        break;
                    }
                    let Some(end_slot) = probe_slot else {
                        // Nothing was captured for this submission; prune it
                        // without touching the GPU.
                        queue_state.submissions.pop_front();
                        continue;
                    };
                    let probe =
                        self.dispatch
                            .read_timestamp(device, pool, physical_end_slot(end_slot));
                    match probe {
                        Ok(Some(_)) => {
                            let submission = queue_state.submissions.pop_front().unwrap();
                            to_emit.push(submission);
                        }
                        Ok(None) => break,
                        Err(e) => panic!("readiness probe failed on device {:?}: {}", device, e),
                    }
                }
            }
        }

        if to_emit.is_empty() {
            return;
        }

        let period = self.device_info.timestamp_period(device) as f64;
        let offset_ns = self.device_info.gpu_cpu_offset_ns(device);
        let mut consumed_slots: Vec<u32> = Vec::new();

        for submission in to_emit {
            let mut submit_infos = Vec::with_capacity(submission.submit_infos.len());
            for group in &submission.submit_infos {
                let mut command_buffers = Vec::with_capacity(group.len());
                for span in group {
                    let begin_ticks =
                        self.read_completed_ticks(device, pool, physical_begin_slot(span.begin_slot));
                    let end_ticks =
                        self.read_completed_ticks(device, pool, physical_end_slot(span.end_slot));
                    command_buffers.push(CommandBufferTiming {
                        begin_gpu_ns: gpu_ticks_to_ns(begin_ticks, period),
                        end_gpu_ns: gpu_ticks_to_ns(end_ticks, period),
                    });
                    consumed_slots.push(span.begin_slot);
                    consumed_slots.push(span.end_slot);
                }
                submit_infos.push(SubmitInfoEvent { command_buffers });
            }

            let mut completed_markers = Vec::with_capacity(submission.completed_markers.len());
            for marker in &submission.completed_markers {
                let end_ticks =
                    self.read_completed_ticks(device, pool, physical_end_slot(marker.end.slot));
                consumed_slots.push(marker.end.slot);
                let begin = marker.begin.map(|begin_info| {
                    let ticks = self.read_completed_ticks(
                        device,
                        pool,
                        physical_begin_slot(begin_info.slot),
                    );
                    consumed_slots.push(begin_info.slot);
                    MarkerBeginEvent {
                        thread_id: begin_info.meta.thread_id,
                        pre_submit_cpu_ns: begin_info.meta.pre_submit_cpu_ns,
                        post_submit_cpu_ns: begin_info
                            .meta
                            .post_submit_cpu_ns
                            .expect("marker begin info always carries a stamped submission"),
                        gpu_ns: gpu_ticks_to_ns(ticks, period),
                    }
                });
                let (text_key, newly_interned) = self.interner.intern(&marker.text);
                if newly_interned {
                    self.sink.write_interned_string(text_key, &marker.text);
                }
                completed_markers.push(CompletedMarkerEvent {
                    text_key,
                    depth: marker.depth,
                    end_gpu_ns: gpu_ticks_to_ns(end_ticks, period),
                    begin,
                });
            }

            self.sink.write_submission(QueueSubmissionEvent {
                thread_id: submission.meta.thread_id,
                pre_submit_cpu_ns: submission.meta.pre_submit_cpu_ns,
                post_submit_cpu_ns: submission
                    .meta
                    .post_submit_cpu_ns
                    .expect("only post-stamped submissions are extracted"),
                gpu_cpu_offset_ns: offset_ns,
                submit_infos,
                num_begin_markers: submission.num_begin_markers,
                completed_markers,
            });
        }

        self.slot_pool.reset_slots(device, &consumed_slots);
        let (ready, on_gpu, pending_reset) = self.slot_pool.slot_state_counts(device);
        log::debug!(
            "device {:?} slots after completion: {} ready, {} on gpu, {} awaiting reset",
            device,
            ready,
            on_gpu,
            pending_reset
        );
    }

    /// `vkResetCommandBuffer` (or an implicit re-begin): throw away the
    /// recording state and roll its never-submitted slots straight back to
    /// ready - the timestamp writes never reached the GPU.
    pub fn reset_cb(&self, cb: vk::CommandBuffer) {
        assert_ne!(cb, vk::CommandBuffer::null(), "null command buffer reset");
        let rollback: Vec<u32>;
        let device;
        {
            let mut tables = self.tables.write().unwrap();
            let Some(state) = tables.command_buffer_to_state.remove(&cb) else {
                return;
            };
            device = *tables
                .command_buffer_to_device
                .get(&cb)
                .unwrap_or_else(|| panic!("command buffer {:?} is not tracked", cb));
            let mut slots = Vec::new();
            slots.extend(state.begin_slot);
            slots.extend(state.end_slot);
            for marker in &state.markers {
                match marker {
                    RecordedMarker::Begin { slot, .. } | RecordedMarker::End { slot } => {
                        slots.extend(*slot);
                    }
                }
            }
            rollback = slots;
        }
        self.slot_pool.rollback_pending(device, &rollback);
    }

    /// `vkResetCommandPool`: reset every command buffer of the pool.
    pub fn reset_pool(&self, pool: vk::CommandPool) {
        let cbs: Vec<vk::CommandBuffer> = {
            let tables = self.tables.read().unwrap();
            tables
                .pool_to_command_buffers
                .get(&pool)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default()
        };
        for cb in cbs {
            self.reset_cb(cb);
        }
    }

    fn device_of(&self, cb: vk::CommandBuffer) -> vk::Device {
        let tables = self.tables.read().unwrap();
        *tables
            .command_buffer_to_device
            .get(&cb)
            .unwrap_or_else(|| panic!("command buffer {:?} is not tracked", cb))
    }

    fn allocate_slot(&self, device: vk::Device) -> u32 {
        // Ensure the device's pool exists before asking for a slot.
        let _ = self.slot_pool.get_query_pool(device);
        self.slot_pool.next_ready_slot(device).unwrap_or_else(|| {
            log::error!("timestamp slot pool exhausted on device {:?}", device);
            panic!("out of timestamp query slots; completion is not keeping up")
        })
    }

    fn read_completed_ticks(
        &self,
        device: vk::Device,
        pool: vk::QueryPool,
        physical_slot: u32,
    ) -> u64 {
        match self.dispatch.read_timestamp(device, pool, physical_slot) {
            Ok(Some(ticks)) => ticks,
            Ok(None) => panic!(
                "query slot {} not ready although its submission completed",
                physical_slot
            ),
            Err(e) => panic!("query read failed during completion: {}", e),
        }
    }
}

fn gpu_ticks_to_ns(ticks: u64, period: f64) -> u64 {
    (ticks as f64 * period) as u64
}

/// Small stable per-thread id. `std` offers no portable numeric thread id,
/// so threads self-register against a process-local counter on first use.
fn current_thread_id() -> u32 {
    static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);
    thread_local! {
        static THREAD_ID: u32 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
    }
    THREAD_ID.with(|id| *id)
}

/// Monotonic nanoseconds against a process-local base instant.
fn monotonic_now_ns() -> u64 {
    static BASE: OnceLock<Instant> = OnceLock::new();
    BASE.get_or_init(Instant::now).elapsed().as_nanos() as u64
}
