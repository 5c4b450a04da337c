//! Flat kernels (§4.4.1): brute-force storage with a tiled matmul + top-k
//! reducer, for the fp16 and int8 element families.

use half::f16;
use vsearch_common::selector::IdSelector;
use vsearch_common::vector::{
    f16_slice_to_f32, f32_slice_to_f16, l2_norm_squared, l2_sq_from_dot,
};
use vsearch_common::{Error, Metric, Result};

use crate::device_vector::{DeviceVec, MemorySpace};
use crate::kernels::{
    add_pages, search_pages, IndexKernel, SearchOutput, TopKAccumulator, REDUCER_BLOCK,
};

/// Tile size used by the dedicated int8 L2-norm kernel (§4.4.1 "Int8 L2
/// norm"). The real operator batches the fixed 256x16 permutation multiply
/// over inputs this wide; the identity-diagonal structure of that matrix
/// means the batched form is equivalent to a plain per-vector sum of
/// squares, which is what this module computes.
pub const COMPUTE_BATCH: usize = 16384;

/// `Flat` (fp16 family). Storage is a contiguous `codes[ntotal * dim]`;
/// ids are never stored explicitly (auto-ids are the row position).
pub struct FlatIndex {
    dim: u32,
    metric: Metric,
    codes: DeviceVec<f16>,
}

impl FlatIndex {
    pub fn new(dim: u32, metric: Metric) -> Self {
        Self {
            dim,
            metric,
            codes: DeviceVec::new(MemorySpace::Device),
        }
    }

    fn ntotal_usize(&self) -> usize {
        self.codes.size() / self.dim as usize
    }

    fn row(&self, pos: usize) -> &[f16] {
        let d = self.dim as usize;
        &self.codes.data()[pos * d..(pos + 1) * d]
    }

    /// Raw row-major fp16 base, for `IndexFlatGetBase`.
    pub fn base_codes(&self) -> &[f16] {
        self.codes.data()
    }

    fn add_impl(&mut self, x: &[f32]) -> Result<()> {
        let coded = f32_slice_to_f16(x);
        self.codes.append(&coded, false);
        Ok(())
    }

    fn search_one(&self, q: &[f32]) -> Vec<(f32, u32)> {
        let ntotal = self.ntotal_usize();
        let norm_q = l2_norm_squared(q);
        let mut acc_all = Vec::with_capacity(ntotal);
        let mut block_start = 0usize;
        while block_start < ntotal {
            let block_end = (block_start + REDUCER_BLOCK).min(ntotal);
            for pos in block_start..block_end {
                let b = f16_slice_to_f32(self.row(pos));
                let dot: f32 = q.iter().zip(b.iter()).map(|(a, c)| a * c).sum();
                let dist = match self.metric {
                    Metric::L2 => l2_sq_from_dot(norm_q, l2_norm_squared(&b), dot),
                    Metric::InnerProduct | Metric::Cosine => dot,
                };
                acc_all.push((dist, pos as u32));
            }
            block_start = block_end;
        }
        acc_all
    }
}

impl IndexKernel for FlatIndex {
    fn dim(&self) -> u32 {
        self.dim
    }

    fn metric(&self) -> Metric {
        self.metric
    }

    fn ntotal(&self) -> u64 {
        self.ntotal_usize() as u64
    }

    fn is_trained(&self) -> bool {
        true
    }

    fn train(&mut self, _n: u32, _x: &[f32]) -> Result<()> {
        Ok(())
    }

    fn add(&mut self, n: u32, x: &[f32], ids: Option<&[u64]>) -> Result<u64> {
        if ids.is_some() {
            return Err(Error::precondition("Flat only accepts auto-assigned ids"));
        }
        let d = self.dim as usize;
        for (start, count) in add_pages(n as usize, d * std::mem::size_of::<f16>()) {
            self.add_impl(&x[start * d..(start + count) * d])?;
        }
        Ok(self.ntotal())
    }

    fn search(&self, n: u32, x: &[f32], k: u32) -> Result<SearchOutput> {
        let d = self.dim as usize;
        let mut out = SearchOutput::new(n as usize, k as usize);
        for (start, count) in search_pages(n as usize) {
            for i in 0..count {
                let row = start + i;
                let q = &x[row * d..(row + 1) * d];
                let mut acc = TopKAccumulator::new(k as usize, self.metric);
                for chunk in self.search_one(q).chunks(REDUCER_BLOCK) {
                    acc.offer_block(chunk);
                }
                out.fill_row(row, k as usize, &acc.finish());
            }
        }
        Ok(out)
    }

    fn remove_ids(&mut self, selector: &dyn IdSelector) -> Result<u64> {
        let ntotal = self.ntotal_usize();
        let d = self.dim as usize;
        let positions: Vec<usize> = (0..ntotal)
            .filter(|&p| selector.is_member(p as u64))
            .collect();
        if positions.is_empty() {
            return Ok(0);
        }
        // Expand row positions into element positions before compacting:
        // `codes` is flat, so one removed row removes `dim` contiguous
        // elements.
        let element_positions: Vec<usize> = positions
            .iter()
            .flat_map(|&p| (p * d)..(p * d + d))
            .collect();
        self.codes.remove_positions(&element_positions);
        Ok(positions.len() as u64)
    }

    fn reset(&mut self) -> Result<()> {
        self.codes.clear();
        Ok(())
    }

    fn reserve_memory(&mut self, n: u64) -> Result<()> {
        self.codes.reserve(n as usize * self.dim as usize);
        Ok(())
    }

    fn reclaim_memory(&mut self) -> Result<u64> {
        Ok(self.codes.reclaim(true) as u64)
    }
}

/// Computes a vector's L2 norm-squared the way the dedicated int8 kernel
/// does: in `COMPUTE_BATCH`-sized tiles (§4.4.1).
pub fn int8_l2_norm_squared(v: &[i8]) -> f32 {
    v.chunks(COMPUTE_BATCH)
        .map(|chunk| chunk.iter().map(|&x| (x as i32 * x as i32) as f32).sum::<f32>())
        .sum()
}

/// `Int8-Flat`: codes stored as `i8`, ids stored explicitly (§4.4.1). Used
/// for cosine (via L2-normalized-at-add codes) and raw inner product, as
/// well as int8 L2.
pub struct Int8FlatIndex {
    dim: u32,
    metric: Metric,
    normalize_on_add: bool,
    codes: DeviceVec<i8>,
    ids: DeviceVec<u64>,
}

impl Int8FlatIndex {
    pub fn new(dim: u32, metric: Metric) -> Self {
        Self {
            dim,
            metric,
            normalize_on_add: matches!(metric, Metric::Cosine),
            codes: DeviceVec::new(MemorySpace::Device),
            ids: DeviceVec::new(MemorySpace::Device),
        }
    }

    fn ntotal_usize(&self) -> usize {
        self.ids.size()
    }

    fn row(&self, pos: usize) -> &[i8] {
        let d = self.dim as usize;
        &self.codes.data()[pos * d..(pos + 1) * d]
    }

    pub fn base_codes_and_ids(&self) -> (&[i8], &[u64]) {
        (self.codes.data(), self.ids.data())
    }
}

impl IndexKernel for Int8FlatIndex {
    fn dim(&self) -> u32 {
        self.dim
    }

    fn metric(&self) -> Metric {
        self.metric
    }

    fn ntotal(&self) -> u64 {
        self.ntotal_usize() as u64
    }

    fn is_trained(&self) -> bool {
        true
    }

    fn train(&mut self, _n: u32, _x: &[f32]) -> Result<()> {
        Ok(())
    }

    fn add(&mut self, n: u32, x: &[f32], ids: Option<&[u64]>) -> Result<u64> {
        let d = self.dim as usize;
        let bytes_per_vec = d;
        let base_ntotal = self.ntotal_usize() as u64;
        for (start, count) in add_pages(n as usize, bytes_per_vec) {
            for i in 0..count {
                let row = start + i;
                let v = &x[row * d..(row + 1) * d];
                let coded = if self.normalize_on_add {
                    vsearch_common::vector::normalize_and_quantize_i8(v)
                } else {
                    v.iter()
                        .map(|&c| c.round().clamp(i8::MIN as f32, i8::MAX as f32) as i8)
                        .collect()
                };
                self.codes.append(&coded, false);
                let id = match ids {
                    Some(ids) => ids[row],
                    None => base_ntotal + row as u64,
                };
                self.ids.append(&[id], false);
            }
        }
        Ok(self.ntotal())
    }

    fn search(&self, n: u32, x: &[f32], k: u32) -> Result<SearchOutput> {
        let d = self.dim as usize;
        let ntotal = self.ntotal_usize();
        let mut out = SearchOutput::new(n as usize, k as usize);
        for (start, count) in search_pages(n as usize) {
            for i in 0..count {
                let row = start + i;
                let q = &x[row * d..(row + 1) * d];
                let qcode: Vec<i8> = q
                    .iter()
                    .map(|&c| c.round().clamp(i8::MIN as f32, i8::MAX as f32) as i8)
                    .collect();
                let norm_q = int8_l2_norm_squared(&qcode);
                let mut acc = TopKAccumulator::new(k as usize, self.metric);
                let mut block = Vec::with_capacity(REDUCER_BLOCK);
                for pos in 0..ntotal {
                    let b = self.row(pos);
                    let dot: i32 = qcode.iter().zip(b.iter()).map(|(&a, &c)| a as i32 * c as i32).sum();
                    let dist = match self.metric {
                        Metric::L2 => l2_sq_from_dot(norm_q, int8_l2_norm_squared(b), dot as f32),
                        Metric::InnerProduct => dot as f32,
                        // Codes were L2-normalized and scaled by i8::MAX at
                        // add time, so dividing the raw dot back down by
                        // i8::MAX^2 recovers a cosine similarity in [-1, 1].
                        Metric::Cosine => dot as f32 / (i8::MAX as f32 * i8::MAX as f32),
                    };
                    block.push((dist, pos as u32));
                    if block.len() == REDUCER_BLOCK {
                        acc.offer_block(&block);
                        block.clear();
                    }
                }
                if !block.is_empty() {
                    acc.offer_block(&block);
                }
                let results = acc.finish();
                let rewritten: Vec<(f32, u32)> = results
                    .into_iter()
                    .map(|(dist, pos)| (dist, self.ids.get(pos as usize).unwrap_or(u64::MAX) as u32))
                    .collect();
                out.fill_row(row, k as usize, &rewritten);
            }
        }
        Ok(out)
    }

    fn remove_ids(&mut self, selector: &dyn IdSelector) -> Result<u64> {
        let d = self.dim as usize;
        let positions: Vec<usize> = (0..self.ntotal_usize())
            .filter(|&p| selector.is_member(self.ids.get(p).unwrap()))
            .collect();
        if positions.is_empty() {
            return Ok(0);
        }
        let element_positions: Vec<usize> = positions
            .iter()
            .flat_map(|&p| (p * d)..(p * d + d))
            .collect();
        self.codes.remove_positions(&element_positions);
        self.ids.remove_positions(&positions);
        Ok(positions.len() as u64)
    }

    fn reset(&mut self) -> Result<()> {
        self.codes.clear();
        self.ids.clear();
        Ok(())
    }

    fn reserve_memory(&mut self, n: u64) -> Result<()> {
        self.codes.reserve(n as usize * self.dim as usize);
        self.ids.reserve(n as usize);
        Ok(())
    }

    fn reclaim_memory(&mut self) -> Result<u64> {
        Ok(self.codes.reclaim(true) as u64 + self.ids.reclaim(true) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_l2_scenario_1() {
        let mut idx = FlatIndex::new(4, Metric::L2);
        let base = vec![
            1.0, 0.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, 0.0, //
            0.0, 0.0, 1.0, 0.0,
        ];
        idx.add(3, &base, None).unwrap();
        let out = idx.search(1, &[1.0, 0.0, 0.0, 0.0], 2).unwrap();
        assert_eq!(out.labels, vec![0, 1]);
        assert_eq!(out.distances[0].to_f32(), 0.0);
        assert_eq!(out.distances[1].to_f32(), 2.0);
    }

    #[test]
    fn flat_remove_compacts_codes() {
        let mut idx = FlatIndex::new(2, Metric::L2);
        idx.add(3, &[1.0, 1.0, 2.0, 2.0, 3.0, 3.0], None).unwrap();
        let sel = vsearch_common::selector::IdSelectorRange::new(1, 2);
        let removed = idx.remove_ids(&sel).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(idx.ntotal(), 2);
        assert_eq!(f16_slice_to_f32(idx.base_codes()), vec![1.0, 1.0, 3.0, 3.0]);
    }

    #[test]
    fn int8_flat_cosine_self_search() {
        let mut idx = Int8FlatIndex::new(4, Metric::Cosine);
        let base = vec![1.0, 2.0, 3.0, 4.0, 4.0, 3.0, 2.0, 1.0];
        idx.add(2, &base, None).unwrap();
        // Cosine's contract is that the caller (the façade, over the wire)
        // already normalized and scaled the query the same way `add` does;
        // `search` only rounds. Feed a query consistent with that contract.
        let query: Vec<f32> = vsearch_common::vector::normalize_and_quantize_i8(&[1.0, 2.0, 3.0, 4.0])
            .into_iter()
            .map(|c| c as f32)
            .collect();
        let out = idx.search(1, &query, 1).unwrap();
        assert_eq!(out.labels[0], 0);
        let tol = 2f32.powi(-10);
        assert!((out.distances[0].to_f32() - 1.0).abs() < tol);
    }
}
