//! Per-device daemon resources (§2.3, §5 "Daemon-side"): a default
//! execution stream, `K` alternate streams, and the stack allocator they
//! share, ref-counted across every index that runs on this device.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::allocator::StackAllocator;

/// Default number of alternate streams per device, used for overlapping
/// copies while kernel launches stay on the default stream.
pub const DEFAULT_ALT_STREAMS: usize = 2;

/// Placeholder for an accelerator execution stream. There is no real
/// device backing this process, so a stream is just an identity tag that
/// lets code reason about "the default stream" vs. "an alternate stream"
/// the way the real daemon's dispatch logic does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamId(pub u32);

pub struct DeviceResources {
    device: u32,
    default_stream: StreamId,
    alt_streams: Vec<StreamId>,
    allocator: Arc<StackAllocator>,
    refs: AtomicUsize,
}

impl DeviceResources {
    pub fn new(device: u32, resource_size: usize, alt_streams: usize) -> Self {
        let allocator = if resource_size == 0 {
            Arc::new(StackAllocator::new_owned(device, 0))
        } else {
            Arc::new(StackAllocator::new_owned(device, resource_size))
        };
        Self {
            device,
            default_stream: StreamId(0),
            alt_streams: (1..=alt_streams as u32).map(StreamId).collect(),
            allocator,
            refs: AtomicUsize::new(0),
        }
    }

    pub fn device(&self) -> u32 {
        self.device
    }

    pub fn default_stream(&self) -> StreamId {
        self.default_stream
    }

    pub fn alt_stream(&self, index: usize) -> StreamId {
        self.alt_streams[index % self.alt_streams.len()]
    }

    pub fn allocator(&self) -> &Arc<StackAllocator> {
        &self.allocator
    }

    pub fn acquire(&self) -> usize {
        self.refs.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn release(&self) -> usize {
        self.refs.fetch_sub(1, Ordering::SeqCst) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alt_streams_wrap_around() {
        let res = DeviceResources::new(0, 4096, DEFAULT_ALT_STREAMS);
        assert_eq!(res.alt_stream(0), StreamId(1));
        assert_eq!(res.alt_stream(1), StreamId(2));
        assert_eq!(res.alt_stream(2), StreamId(1));
    }
}
