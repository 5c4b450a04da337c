//! Per-device stack allocator (§4.2): a bump allocator backing every
//! ephemeral tensor used during one `add` or `search` call on the daemon.
//!
//! Reservations are move-only handles; dropping one pops the stack region
//! it occupied (or frees the fallback block it fell through to). Release
//! order must mirror construction order, LIFO — nested reservations for a
//! single search (query norms, tile outputs, reducer outputs) are expected
//! to unwind in reverse, and violating that is treated as an internal
//! invariant failure rather than a silent leak.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::warn;
use vsearch_common::{Error, Result};

const ALIGN: usize = 8;

fn align_up(n: usize) -> usize {
    (n + ALIGN - 1) & !(ALIGN - 1)
}

/// Whether the allocator owns the backing region (allocated on setup) or
/// wraps memory handed to it by the caller.
enum Backing {
    Owned(Vec<u8>),
    Borrowed,
}

struct StackState {
    region: Backing,
    capacity: usize,
    /// Offset of the next free byte in the stack region.
    top: usize,
    /// Monotonically increasing id assigned to each live reservation, used
    /// to assert LIFO release order.
    next_generation: u64,
    /// Live stack reservations in allocation order: `(generation, offset,
    /// size)`. A release must pop from the back; anything else is a LIFO
    /// violation.
    live_stack: Vec<(u64, usize, usize)>,
}

/// One allocator per device, shared by every index that runs on it.
/// `resource_size` of `0` (see [`vsearch_common::config::IndexConfig`])
/// disables the stack: every reservation falls straight through to the
/// fallback allocator.
pub struct StackAllocator {
    device: u32,
    state: Mutex<StackState>,
    stack_high_water: AtomicU64,
    fallback_high_water: AtomicU64,
    fallback_live_bytes: AtomicU64,
}

impl StackAllocator {
    /// Allocates and owns a region of `capacity` bytes.
    pub fn new_owned(device: u32, capacity: usize) -> Self {
        Self::new(device, Backing::Owned(vec![0u8; capacity]), capacity)
    }

    /// Wraps `capacity` bytes of externally owned device memory.
    pub fn new_borrowed(device: u32, capacity: usize) -> Self {
        Self::new(device, Backing::Borrowed, capacity)
    }

    fn new(device: u32, region: Backing, capacity: usize) -> Self {
        Self {
            device,
            state: Mutex::new(StackState {
                region,
                capacity,
                top: 0,
                next_generation: 0,
                live_stack: Vec::new(),
            }),
            stack_high_water: AtomicU64::new(0),
            fallback_high_water: AtomicU64::new(0),
            fallback_live_bytes: AtomicU64::new(0),
        }
    }

    /// Reserves `size` bytes, 8-byte aligned. Falls through to the device
    /// (fallback) allocator when the stack region has no room left; a
    /// fallback reservation is functionally identical to the caller but is
    /// logged at `warn` since it defeats the point of the stack allocator.
    pub fn get_memory(&self, size: usize) -> Reservation<'_> {
        let size = align_up(size);
        let mut state = self.state.lock();
        let generation = state.next_generation;
        state.next_generation += 1;

        if state.top + size <= state.capacity {
            let offset = state.top;
            state.top += size;
            state.live_stack.push((generation, offset, size));
            let new_high = state.top as u64;
            self.stack_high_water.fetch_max(new_high, Ordering::Relaxed);
            Reservation {
                allocator: self,
                generation,
                kind: ReservationKind::Stack { offset, size },
            }
        } else {
            warn!(
                device = self.device,
                requested = size,
                remaining = state.capacity - state.top,
                "stack allocator exhausted, falling back to device allocator"
            );
            drop(state);
            let live = self
                .fallback_live_bytes
                .fetch_add(size as u64, Ordering::Relaxed)
                + size as u64;
            self.fallback_high_water.fetch_max(live, Ordering::Relaxed);
            Reservation {
                allocator: self,
                generation,
                kind: ReservationKind::Fallback {
                    block: vec![0u8; size],
                },
            }
        }
    }

    /// High-water mark of bytes live in the stack region, in bytes.
    pub fn stack_high_water(&self) -> u64 {
        self.stack_high_water.load(Ordering::Relaxed)
    }

    /// High-water mark of bytes live in fallback (device-allocator)
    /// reservations at any one time.
    pub fn fallback_high_water(&self) -> u64 {
        self.fallback_high_water.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    pub fn stack_used(&self) -> usize {
        self.state.lock().top
    }

    fn release_stack(&self, generation: u64, offset: usize, size: usize) -> Result<()> {
        let mut state = self.state.lock();
        match state.live_stack.last() {
            Some(&(top_gen, top_offset, top_size))
                if top_gen == generation && top_offset == offset && top_size == size =>
            {
                state.live_stack.pop();
                state.top = offset;
                Ok(())
            }
            _ => Err(Error::invariant(format!(
                "stack allocator LIFO violation on device {}: released generation {generation} \
                 is not the most recent live reservation",
                self.device
            ))),
        }
    }

    fn release_fallback(&self, size: usize) {
        self.fallback_live_bytes
            .fetch_sub(size as u64, Ordering::Relaxed);
    }
}

enum ReservationKind {
    Stack { offset: usize, size: usize },
    Fallback { block: Vec<u8> },
}

/// RAII handle to `size` bytes of ephemeral memory. Dropping it pops the
/// stack (if it was a stack reservation) or frees the fallback block.
///
/// # Panics
/// The `Drop` impl panics on a detected LIFO violation in debug builds
/// (`debug_assert`); release builds instead log the [`Error::Invariant`]
/// and leak the stack offset rather than corrupt the allocator's notion of
/// `top`, since unwinding out of `Drop` during another panic would abort
/// the process.
pub struct Reservation<'a> {
    allocator: &'a StackAllocator,
    generation: u64,
    kind: ReservationKind,
}

impl<'a> Reservation<'a> {
    pub fn size(&self) -> usize {
        match &self.kind {
            ReservationKind::Stack { size, .. } => *size,
            ReservationKind::Fallback { block } => block.len(),
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self.kind, ReservationKind::Fallback { .. })
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.kind {
            ReservationKind::Fallback { block } => block.as_mut_slice(),
            ReservationKind::Stack { offset, size } => {
                let mut state = self.allocator.state.lock();
                match &mut state.region {
                    Backing::Owned(region) => {
                        // Safety-free path: we hold the allocator mutex and
                        // return a slice scoped to `self`'s lifetime, not
                        // the guard's, since the region itself outlives the
                        // allocator and is never reallocated.
                        let ptr = region[*offset..*offset + *size].as_mut_ptr();
                        let len = *size;
                        unsafe { std::slice::from_raw_parts_mut(ptr, len) }
                    }
                    Backing::Borrowed => {
                        panic!("borrowed stack region has no host-visible backing")
                    }
                }
            }
        }
    }
}

impl<'a> Drop for Reservation<'a> {
    fn drop(&mut self) {
        match &self.kind {
            ReservationKind::Stack { offset, size } => {
                if let Err(e) = self.allocator.release_stack(self.generation, *offset, *size) {
                    if cfg!(debug_assertions) {
                        panic!("{e}");
                    } else {
                        tracing::error!(error = %e, "stack allocator LIFO violation");
                    }
                }
            }
            ReservationKind::Fallback { block } => {
                self.allocator.release_fallback(block.len());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_allocates_in_order() {
        let alloc = StackAllocator::new_owned(0, 1024);
        let a = alloc.get_memory(100);
        assert!(!a.is_fallback());
        assert_eq!(alloc.stack_used(), 104); // aligned up from 100
        let b = alloc.get_memory(50);
        assert_eq!(alloc.stack_used(), 104 + 56);
        drop(b);
        assert_eq!(alloc.stack_used(), 104);
        drop(a);
        assert_eq!(alloc.stack_used(), 0);
        assert_eq!(alloc.stack_high_water(), 160);
    }

    #[test]
    fn falls_through_when_exhausted() {
        let alloc = StackAllocator::new_owned(0, 64);
        let a = alloc.get_memory(32);
        assert!(!a.is_fallback());
        let b = alloc.get_memory(64);
        assert!(b.is_fallback());
        assert_eq!(alloc.fallback_high_water(), 64);
    }

    #[test]
    #[should_panic(expected = "LIFO violation")]
    fn out_of_order_release_panics_in_debug() {
        let alloc = StackAllocator::new_owned(0, 1024);
        let a = alloc.get_memory(16);
        let b = alloc.get_memory(16);
        drop(a);
        drop(b);
    }
}
