//! Daemon-side index kernels (§4.4): Flat, IVF (Flat/PQ/SQ), PreTransform,
//! and the Int8 variants, plus the paging discipline and tiled top-k
//! reduction shared by all of them.

pub mod flat;
pub mod ivf;
pub mod nn_reduction;
pub mod pretransform;

use half::f16;
use vsearch_common::selector::IdSelector;
use vsearch_common::{Metric, Result};

/// Add requests page by whichever is smaller, `ADD_PAGE_SIZE_BYTES` raw
/// vector bytes or `ADD_VEC_SIZE` vectors (§4.4). At least one vector is
/// always dispatched per page, even if it alone exceeds the byte cap.
pub fn add_page_vecs(bytes_per_vec: usize) -> usize {
    let by_bytes = (vsearch_common::ADD_PAGE_SIZE_BYTES / bytes_per_vec.max(1)).max(1);
    by_bytes.min(vsearch_common::ADD_VEC_SIZE).max(1)
}

/// Yields `(start, count)` pages covering `0..n` using [`add_page_vecs`].
pub fn add_pages(n: usize, bytes_per_vec: usize) -> impl Iterator<Item = (usize, usize)> {
    let page = add_page_vecs(bytes_per_vec);
    (0..n).step_by(page.max(1)).map(move |start| {
        let count = page.min(n - start);
        (start, count)
    })
}

/// Search batch sizes the daemon prefers, largest first; [`search_pages`]
/// greedily picks the largest one that still fits the remaining request,
/// falling back to single-query calls for the tail (§4.4 "Search").
pub const PREFERRED_SEARCH_BATCHES: &[usize] = &[4096, 1024, 256, 64, 16, 4, 1];

/// Yields `(start, count)` pages covering `0..n`, greedily sized from
/// [`PREFERRED_SEARCH_BATCHES`].
pub fn search_pages(n: usize) -> Vec<(usize, usize)> {
    let mut pages = Vec::new();
    let mut start = 0usize;
    while start < n {
        let remaining = n - start;
        let batch = PREFERRED_SEARCH_BATCHES
            .iter()
            .copied()
            .find(|&b| b <= remaining)
            .unwrap_or(1)
            .min(remaining);
        pages.push((start, batch));
        start += batch;
    }
    pages
}

/// Accelerator tile width: the base-distance operator processes vectors in
/// groups of this many along the base dimension. A hardware constant,
/// preserved for numeric parity even though the tile kernel itself is
/// modeled behind [`IndexKernel`] rather than invoked on real hardware
/// (§9).
pub const TILE_BASE_GROUP: usize = 16;

/// Width of one `Min64`/`Maxs` reducer block: the operator folds the
/// per-tile distances in groups of 64 base vectors before handing
/// candidates to the host-side merge.
pub const REDUCER_BLOCK: usize = 64;

/// `ceil(base / REDUCER_BLOCK) * 2`: the fp16 output stride of the
/// `Min64`/`Maxs` reducer (value, index interleaved) for a base of size
/// `base` (§4.4.1, §9).
pub fn reducer_output_len(base: usize) -> usize {
    ((base + REDUCER_BLOCK - 1) / REDUCER_BLOCK) * 2
}

/// Per-query distance accumulator that merges tiled reducer output into a
/// global top-k, mirroring the two-stage tile-then-host-merge design
/// (§4.4.1 "Top-k"). Holds at most `k` candidates and orders them per
/// `metric`'s sort direction, with a stable tie-break by label.
pub struct TopKAccumulator {
    k: usize,
    metric: Metric,
    candidates: Vec<(f32, u32)>,
}

impl TopKAccumulator {
    pub fn new(k: usize, metric: Metric) -> Self {
        Self {
            k,
            metric,
            candidates: Vec::with_capacity(k),
        }
    }

    /// Folds one reducer block's worth of (distance, label) candidates in.
    /// Mirrors the kernel processing `REDUCER_BLOCK` base vectors at a
    /// time: the caller passes one block here per tile, though the merge
    /// itself is correct regardless of how candidates are grouped.
    pub fn offer_block(&mut self, block: &[(f32, u32)]) {
        for &c in block {
            self.offer(c);
        }
    }

    pub fn offer(&mut self, candidate: (f32, u32)) {
        self.candidates.push(candidate);
    }

    /// Produces the final, sorted top-k: distinct labels, ordered monotone
    /// by distance per the index's metric, stable tie-break by label
    /// position (§8).
    pub fn finish(mut self) -> Vec<(f32, u32)> {
        self.candidates
            .sort_by(|a, b| self.metric.cmp_results(*a, *b));
        self.candidates.dedup_by_key(|c| c.1);
        self.candidates.truncate(self.k);
        self.candidates
    }
}

/// Result of one `search` call before the host rewrites local positions to
/// external ids: `n * k` row-major distances/labels, padded with
/// `u32::MAX` labels (and `f16::INFINITY`/`NEG_INFINITY` distances,
/// depending on sort direction) when fewer than `k` results exist for a
/// query.
pub struct SearchOutput {
    pub distances: Vec<f16>,
    pub labels: Vec<u32>,
}

impl SearchOutput {
    pub fn new(n: usize, k: usize) -> Self {
        Self {
            distances: vec![f16::from_f32(0.0); n * k],
            labels: vec![u32::MAX; n * k],
        }
    }

    pub fn fill_row(&mut self, row: usize, k: usize, results: &[(f32, u32)]) {
        for (col, &(dist, label)) in results.iter().enumerate() {
            self.distances[row * k + col] = f16::from_f32(dist);
            self.labels[row * k + col] = label;
        }
    }
}

/// Shared capability set every daemon index family implements (§4.4
/// "Common", §9 "Dynamic dispatch across index families"). The host
/// façade and the RPC dispatcher both program against this trait rather
/// than downcasting to a concrete family.
pub trait IndexKernel: Send {
    fn dim(&self) -> u32;
    fn metric(&self) -> Metric;
    fn ntotal(&self) -> u64;
    fn is_trained(&self) -> bool;

    /// May be a no-op (Flat always reports trained).
    fn train(&mut self, n: u32, x: &[f32]) -> Result<()>;

    /// Pages internally per [`add_pages`]; `ids` is `Some` for families
    /// that accept user ids (IVF), `None` for families that only ever
    /// assign ids implicitly by position (Flat).
    fn add(&mut self, n: u32, x: &[f32], ids: Option<&[u64]>) -> Result<u64>;

    /// Pages internally per [`search_pages`].
    fn search(&self, n: u32, x: &[f32], k: u32) -> Result<SearchOutput>;

    fn remove_ids(&mut self, selector: &dyn IdSelector) -> Result<u64>;
    fn reset(&mut self) -> Result<()>;
    fn reserve_memory(&mut self, n: u64) -> Result<()>;
    fn reclaim_memory(&mut self) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_pages_respects_vec_cap() {
        let pages: Vec<_> = add_pages(1_200_000, 4).collect();
        // bytes_per_vec=4 means byte cap (256MiB/4=64M) dominates the
        // ADD_VEC_SIZE cap (500k), so pages should be 500k-sized.
        assert_eq!(pages[0], (0, vsearch_common::ADD_VEC_SIZE));
    }

    #[test]
    fn add_pages_always_emits_at_least_one_vector() {
        // A single oversized vector must still page through in one call.
        let pages: Vec<_> = add_pages(1, vsearch_common::ADD_PAGE_SIZE_BYTES * 10).collect();
        assert_eq!(pages, vec![(0, 1)]);
    }

    #[test]
    fn search_pages_cover_whole_request_greedily() {
        let pages = search_pages(1025);
        let total: usize = pages.iter().map(|(_, c)| c).sum();
        assert_eq!(total, 1025);
        assert_eq!(pages[0], (0, 1024));
    }

    #[test]
    fn reducer_stride_matches_hardware_formula() {
        assert_eq!(reducer_output_len(64), 2);
        assert_eq!(reducer_output_len(65), 4);
        assert_eq!(reducer_output_len(0), 0);
    }

    #[test]
    fn topk_accumulator_sorts_and_dedupes() {
        let mut acc = TopKAccumulator::new(2, Metric::L2);
        acc.offer_block(&[(3.0, 1), (1.0, 2), (1.0, 2), (0.5, 3)]);
        let got = acc.finish();
        assert_eq!(got, vec![(0.5, 3), (1.0, 2)]);
    }
}
