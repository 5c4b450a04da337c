//! Growable device-memory buffer (§4.3), used for IVF `codes`/`ids` per
//! list and for Flat `codes`/id map.
//!
//! There is no real accelerator backing this process, so "device memory"
//! is a plain `Vec<T>`; what this type models faithfully is the growth
//! policy and the reserve/append/resize/reclaim surface the daemon kernels
//! are written against, which is what the spec and the round-trip tests
//! care about.

use serde::{Deserialize, Serialize};

/// Which memory space a [`DeviceVec`] claims to live in. The real daemon
/// distinguishes normal device allocations from huge-page-backed ones for
/// large, long-lived buffers (coarse centroids, PQ tables); both behave
/// identically here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemorySpace {
    Device,
    DeviceHugePage,
}

/// Growth factor applied on a non-exact grow: `max(preferred, 1.5 *
/// capacity)`.
const GROWTH_FACTOR_NUM: usize = 3;
const GROWTH_FACTOR_DEN: usize = 2;

#[derive(Debug, Clone)]
pub struct DeviceVec<T> {
    space: MemorySpace,
    data: Vec<T>,
}

impl<T: Clone + Default> DeviceVec<T> {
    pub fn new(space: MemorySpace) -> Self {
        Self {
            space,
            data: Vec::new(),
        }
    }

    pub fn with_capacity(space: MemorySpace, capacity: usize) -> Self {
        Self {
            space,
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn space(&self) -> MemorySpace {
        self.space
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Reads require a staging copy to host on real hardware; here that is
    /// just a bounds-checked clone.
    pub fn get(&self, index: usize) -> Option<T> {
        self.data.get(index).cloned()
    }

    fn grow_to_at_least(&mut self, preferred: usize) {
        if preferred <= self.data.capacity() {
            return;
        }
        let grown = self.data.capacity() * GROWTH_FACTOR_NUM / GROWTH_FACTOR_DEN;
        let target = preferred.max(grown);
        self.data.reserve(target - self.data.len());
    }

    /// Appends `src` to the end. When `reserve_exact` is false, growth
    /// follows the 1.5x policy; when true, the backing store grows to
    /// exactly accommodate the new length.
    pub fn append(&mut self, src: &[T], reserve_exact: bool) {
        let new_len = self.data.len() + src.len();
        if reserve_exact {
            if new_len > self.data.capacity() {
                self.data.reserve_exact(new_len - self.data.len());
            }
        } else {
            self.grow_to_at_least(new_len);
        }
        self.data.extend_from_slice(src);
    }

    /// Resizes to `n` elements, padding with `T::default()` when growing.
    pub fn resize(&mut self, n: usize, reserve_exact: bool) {
        if n > self.data.capacity() {
            if reserve_exact {
                self.data.reserve_exact(n - self.data.len());
            } else {
                self.grow_to_at_least(n);
            }
        }
        self.data.resize(n, T::default());
    }

    /// Reserves room for `n` additional elements without changing `size`.
    pub fn reserve(&mut self, n: usize) {
        self.grow_to_at_least(self.data.len() + n);
    }

    /// Shrinks capacity. When `exact` is true, capacity drops to exactly
    /// `size`; otherwise this is a best-effort `shrink_to_fit`.
    pub fn reclaim(&mut self, exact: bool) -> usize {
        let before = self.data.capacity();
        if exact {
            self.data.shrink_to(self.data.len());
        } else {
            self.data.shrink_to_fit();
        }
        before.saturating_sub(self.data.capacity())
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Removes the elements at `positions` (assumed sorted ascending,
    /// deduplicated), compacting the remainder in place. Used by IVF
    /// remove to drop matching entries from `codes`/`ids` together.
    pub fn remove_positions(&mut self, positions: &[usize]) {
        if positions.is_empty() {
            return;
        }
        let mut write = 0usize;
        let mut next_removed = 0usize;
        for read in 0..self.data.len() {
            if next_removed < positions.len() && positions[next_removed] == read {
                next_removed += 1;
                continue;
            }
            if write != read {
                self.data.swap(write, read);
            }
            write += 1;
        }
        self.data.truncate(write);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_grows_by_policy() {
        let mut v: DeviceVec<u8> = DeviceVec::with_capacity(MemorySpace::Device, 4);
        v.append(&[1, 2, 3, 4], false);
        assert_eq!(v.size(), 4);
        let cap_before = v.capacity();
        v.append(&[5], false);
        assert_eq!(v.size(), 5);
        assert!(v.capacity() >= cap_before * 3 / 2);
    }

    #[test]
    fn reclaim_exact_shrinks_to_size() {
        let mut v: DeviceVec<u8> = DeviceVec::with_capacity(MemorySpace::Device, 1024);
        v.append(&[1, 2, 3], false);
        v.reclaim(true);
        assert_eq!(v.capacity(), 3);
    }

    #[test]
    fn remove_positions_compacts() {
        let mut v: DeviceVec<u32> = DeviceVec::new(MemorySpace::Device);
        v.append(&[10, 11, 12, 13, 14], false);
        v.remove_positions(&[1, 3]);
        assert_eq!(v.data(), &[10, 12, 14]);
    }
}
