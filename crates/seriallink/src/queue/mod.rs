//! Outbound byte queue
//!
//! Pending sends are kept in a bounded FIFO and written one at a time.
//! When a burst outgrows the bound, the most recently queued items are
//! dropped so older sends keep their delivery order.

mod output;

pub use output::{DrainStep, OutputItem, OutputQueue, SendCallback};

/// Default bound of the output queue
pub const DEFAULT_CAPACITY: usize = 100;
