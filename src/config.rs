//! # Capture Configuration
//!
//! The few knobs the capture core exposes. These are process-lifetime values:
//! they are read once when the merger, tracker and slot pool are built and
//! **cannot be changed mid-session**.

/// Lateness window in nanoseconds: how far the merger lags real time so that
/// events still in flight between ring buffers cannot arrive behind the
/// already-emitted stream. 100 ms absorbs per-stream arrival jitter with a
/// lot of margin.
pub const DEFAULT_LATENESS_WINDOW_NS: u64 = 100_000_000;

/// Logical timestamp slots per device. Each logical slot backs a begin/end
/// pair of physical query-pool entries, so the hardware pool is created with
/// twice this many entries.
pub const DEFAULT_NUM_LOGICAL_SLOTS: u32 = 16384;

/// How many consumed slots accumulate before the pool issues their hardware
/// reset in one go.
pub const DEFAULT_RESET_BATCH: u32 = 64;

/// Main capture configuration.
///
/// # Example
/// ```rust
/// use silhouette::config::CaptureConfig;
///
/// let config = CaptureConfig::default()
///     .lateness_window_ns(50_000_000)
///     .reset_batch(128);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Merger lateness window, in nanoseconds.
    pub lateness_window_ns: u64,

    /// Logical timestamp slots per device.
    pub num_logical_slots: u32,

    /// Slot count that triggers a batched hardware reset.
    pub reset_batch: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            lateness_window_ns: DEFAULT_LATENESS_WINDOW_NS,
            num_logical_slots: DEFAULT_NUM_LOGICAL_SLOTS,
            reset_batch: DEFAULT_RESET_BATCH,
        }
    }
}

impl CaptureConfig {
    pub fn lateness_window_ns(mut self, ns: u64) -> Self {
        self.lateness_window_ns = ns;
        self
    }

    pub fn num_logical_slots(mut self, slots: u32) -> Self {
        assert!(slots > 0, "slot pool cannot be empty");
        self.num_logical_slots = slots;
        self
    }

    pub fn reset_batch(mut self, batch: u32) -> Self {
        assert!(batch > 0, "reset batch must be at least 1");
        self.reset_batch = batch;
        self
    }

    /// Physical query-pool entries backing the logical slots.
    pub fn num_physical_slots(&self) -> u32 {
        self.num_logical_slots * 2
    }
}
