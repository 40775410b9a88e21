//! Serialized submission events and the sink that receives them.
//!
//! One `QueueSubmissionEvent` is produced per completed `vkQueueSubmit`. GPU
//! times are in nanoseconds on the GPU clock; `gpu_cpu_offset_ns` lets the
//! consumer shift them onto the CPU clock. Marker texts travel as interned
//! keys, announced once through `write_interned_string`.

use serde::{Deserialize, Serialize};

/// GPU-side timing of one command buffer inside a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandBufferTiming {
    pub begin_gpu_ns: u64,
    pub end_gpu_ns: u64,
}

/// One submit-info group, in submit order. May be empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitInfoEvent {
    pub command_buffers: Vec<CommandBufferTiming>,
}

/// Where and when a completed marker's begin was recorded. Absent when the
/// capture started mid-marker and no begin slot exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerBeginEvent {
    pub thread_id: u32,
    pub pre_submit_cpu_ns: u64,
    pub post_submit_cpu_ns: u64,
    pub gpu_ns: u64,
}

/// A debug marker whose end executed inside this submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedMarkerEvent {
    pub text_key: u64,
    /// Nesting level on the queue at begin time (0 = outermost).
    pub depth: u32,
    pub end_gpu_ns: u64,
    pub begin: Option<MarkerBeginEvent>,
}

/// One completed queue submission with correlated CPU and GPU timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSubmissionEvent {
    pub thread_id: u32,
    pub pre_submit_cpu_ns: u64,
    pub post_submit_cpu_ns: u64,
    pub gpu_cpu_offset_ns: i64,
    pub submit_infos: Vec<SubmitInfoEvent>,
    /// Begin markers recorded (with a slot) during this submission. Can
    /// exceed `completed_markers.len()` while markers are still open.
    pub num_begin_markers: u32,
    pub completed_markers: Vec<CompletedMarkerEvent>,
}

/// Consumer of the tracker's output. Implementations forward to a transport
/// or a file; tests collect.
pub trait SubmissionSink: Send + Sync {
    fn write_submission(&self, event: QueueSubmissionEvent);

    /// Announces a newly interned marker text. Called at most once per text
    /// per capture session, before any event referencing `key`.
    fn write_interned_string(&self, key: u64, text: &str);
}
