//! Send buffering across the pre-ready and disconnect windows.

use std::collections::VecDeque;

/// Callback invoked when a buffered send is dropped instead of delivered.
pub(crate) type DiscardFn = Box<dyn FnOnce() + Send>;

pub(crate) struct BufferedSend {
    pub data: String,
    pub discard: Option<DiscardFn>,
}

/// FIFO buffer of frames queued while the socket cannot deliver them.
#[derive(Default)]
pub(crate) struct SendBuffer {
    entries: VecDeque<BufferedSend>,
}

impl SendBuffer {
    pub(crate) fn push(&mut self, data: String, discard: Option<DiscardFn>) {
        self.entries.push_back(BufferedSend { data, discard });
    }

    /// Take all buffered frames for flushing, in insertion order. Discard
    /// callbacks are dropped: the frames are about to be delivered.
    pub(crate) fn drain_frames(&mut self) -> Vec<String> {
        self.entries.drain(..).map(|entry| entry.data).collect()
    }

    /// Take all entries for discarding; the caller invokes the callbacks in
    /// insertion order outside any lock.
    pub(crate) fn take_entries(&mut self) -> Vec<BufferedSend> {
        self.entries.drain(..).collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
