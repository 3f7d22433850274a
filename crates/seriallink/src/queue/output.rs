//! Single-flight output queue

use std::collections::VecDeque;
use std::fmt;

use bytes::Bytes;

use crate::transport::{SendInfo, TransportError};

/// Completion callback of a queued send
pub type SendCallback = Box<dyn FnOnce(Result<SendInfo, TransportError>) + Send + 'static>;

/// A pending send
pub struct OutputItem {
    pub payload: Bytes,
    pub callback: Option<SendCallback>,
}

impl OutputItem {
    pub fn new(payload: impl Into<Bytes>, callback: Option<SendCallback>) -> Self {
        Self {
            payload: payload.into(),
            callback,
        }
    }
}

impl fmt::Debug for OutputItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputItem")
            .field("len", &self.payload.len())
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// Outcome of completing the head item
pub struct DrainStep {
    /// Callback of the item whose write just completed
    pub callback: Option<SendCallback>,
    /// Items trimmed from the tail in this step
    pub dropped: usize,
    /// Whether another write should be issued
    pub more: bool,
}

/// Bounded FIFO of pending sends
///
/// `draining` is set while exactly one write for the head item is
/// outstanding. The `epoch` changes on every [`clear`](Self::clear) so a
/// write that completes after teardown can recognise it is stale.
#[derive(Debug)]
pub struct OutputQueue {
    items: VecDeque<OutputItem>,
    capacity: usize,
    draining: bool,
    epoch: u64,
}

impl OutputQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity: capacity.max(1),
            draining: false,
            epoch: 0,
        }
    }

    /// Append an item; returns true when the caller must start draining
    pub fn push(&mut self, item: OutputItem) -> bool {
        self.items.push_back(item);
        if self.draining {
            return false;
        }
        self.draining = true;
        true
    }

    /// Payload of the item at the head, left in place until its write completes
    pub fn head_payload(&self) -> Option<Bytes> {
        self.items.front().map(|item| item.payload.clone())
    }

    /// Finish the head item's write
    ///
    /// The tail is trimmed first so that at most `capacity` items, the
    /// completed head included, remain; then the head is removed.
    pub fn complete_head(&mut self) -> DrainStep {
        let mut dropped = 0;
        while self.items.len() > self.capacity {
            self.items.pop_back();
            dropped += 1;
        }

        let callback = self.items.pop_front().and_then(|item| item.callback);
        let more = !self.items.is_empty();
        if !more {
            self.draining = false;
        }

        DrainStep {
            callback,
            dropped,
            more,
        }
    }

    /// Discard every item without running callbacks; returns how many were discarded
    pub fn clear(&mut self) -> usize {
        let discarded = self.items.len();
        self.items.clear();
        self.draining = false;
        self.epoch = self.epoch.wrapping_add(1);
        discarded
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for OutputQueue {
    fn default() -> Self {
        Self::new(super::DEFAULT_CAPACITY)
    }
}
