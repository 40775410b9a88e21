//! # Silhouette (The Shadow Recorder)
//!
//! A capture core for CPU/GPU tracing, built from two independent engines:
//!
//! - **EventMerger (The Funnel):** receives pre-sorted perf-event streams from
//!   many kernel ring buffers and emits one globally time-ordered stream,
//!   lagging real time by a fixed lateness window so stragglers cannot break
//!   ordering.
//! - **GpuSpanTracker (The Shadow):** rides along the Vulkan command stream,
//!   injects timestamp queries around command buffers and nested debug
//!   markers, and once the GPU has caught up, correlates the results with the
//!   host submission timeline into structured submission events.
//!
//! ## Boundaries
//! Everything that touches the outside world goes through a trait: the driver
//! (`DeviceDispatch`), device timing properties (`DeviceInfoProvider`), the
//! capture toggle (`CaptureGate`), and the event consumer (`SubmissionSink`).
//! The kernel ring-buffer reader and the Vulkan layer shim live above this
//! crate and drive it; transports live below it and receive from it.

pub mod capture;
pub mod config;
pub mod intern;
pub mod merger;
pub mod sink;
pub mod vulkan;

/// Convenient re-exports for common usage
pub mod prelude {
    // Merger side
    pub use crate::merger::{EventMerger, EventVisitor, StreamId, Timestamped};

    // Tracker side
    pub use crate::vulkan::{
        AshDispatch, DeviceDispatch, DeviceInfoProvider, DeviceInfoRegistry, GpuSpanTracker,
        TimerSlotPool,
    };

    // Collaborators
    pub use crate::capture::{CaptureFlag, CaptureGate};
    pub use crate::config::CaptureConfig;
    pub use crate::intern::StringInterner;
    pub use crate::sink::{QueueSubmissionEvent, SubmissionSink};
}

pub use crate::capture::{CaptureFlag, CaptureGate};
pub use crate::config::CaptureConfig;
pub use crate::merger::EventMerger;
pub use crate::vulkan::{GpuSpanTracker, TimerSlotPool};
