//! Hub tuning knobs.

use std::path::PathBuf;
use std::time::Duration;

/// Default age after which a deferred packet is dropped.
pub const DEFAULT_DEFERRED_TTL: Duration = Duration::from_secs(60);
/// Default replay interval of the deferred queues.
pub const DEFAULT_DEFERRED_TICK: Duration = Duration::from_millis(100);
/// Default bound of each deferred queue.
pub const DEFAULT_DEFERRED_CAPACITY: usize = 5_000;
/// Default capacity of a module socket's mailbox.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

/// Runtime settings of a [`crate::VxProto`] hub.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Packets waiting longer than this for their destination are dropped.
    pub deferred_ttl: Duration,
    /// How often the deferred queues are replayed.
    pub deferred_tick: Duration,
    /// Maximum entries per deferred queue; the oldest entry is evicted first.
    pub deferred_capacity: usize,
    /// Capacity of each module socket's mailbox.
    pub mailbox_capacity: usize,
    /// Directory chunked file transfers are reassembled in.
    pub files_dir: PathBuf,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            deferred_ttl: DEFAULT_DEFERRED_TTL,
            deferred_tick: DEFAULT_DEFERRED_TICK,
            deferred_capacity: DEFAULT_DEFERRED_CAPACITY,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            files_dir: std::env::temp_dir().join("vxproto-files"),
        }
    }
}
