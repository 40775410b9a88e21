//! Vulkan-side capture: submission tracking and timestamp-slot management.

pub mod devices;
pub mod dispatch;
pub mod slots;
pub mod tracker;

pub use devices::{approximate_offset_ns, DeviceInfoProvider, DeviceInfoRegistry, DeviceTimingInfo};
pub use dispatch::{AshDispatch, DeviceDispatch};
pub use slots::TimerSlotPool;
pub use tracker::GpuSpanTracker;
