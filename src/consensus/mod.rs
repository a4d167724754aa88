pub mod message_log;
pub mod pacemaker;

pub use message_log::MessageLog;
pub use pacemaker::{EnterTimer, Timer, WishAggregator};

/// PBFT's checkpoint window: message-log buckets are keyed modulo this,
/// and a stable checkpoint GCs everything below it (spec.md §4.4, §4.8).
pub const CHECKPOINT_WINDOW: u64 = 10;
