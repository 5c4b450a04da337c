//! IVF family kernels (§4.4.2): coarse/fine two-stage search shared by
//! IVF-Flat, IVF-PQ, and IVF-SQ, parameterized over a [`FineEncoder`] that
//! knows how to encode/decode one family's codes.

use half::f16;
use vsearch_common::selector::IdSelector;
use vsearch_common::vector::{f16_slice_to_f32, l2_norm_squared, l2_sq_from_dot};
use vsearch_common::{Error, Metric, Result};

use crate::device_vector::{DeviceVec, MemorySpace};
use crate::kernels::{
    add_pages, search_pages, IndexKernel, SearchOutput, TopKAccumulator, REDUCER_BLOCK,
};

/// Coarse centroid table shared by every IVF family member: an `nlist x
/// dim` row-major matrix, trained once on the host and replicated here.
pub struct CoarseQuantizer {
    nlist: u32,
    dim: u32,
    centroids: Vec<f32>,
    set: bool,
}

impl CoarseQuantizer {
    pub fn new(nlist: u32, dim: u32) -> Self {
        Self {
            nlist,
            dim,
            centroids: vec![0.0; nlist as usize * dim as usize],
            set: false,
        }
    }

    pub fn nlist(&self) -> u32 {
        self.nlist
    }

    pub fn is_set(&self) -> bool {
        self.set
    }

    pub fn update(&mut self, centroids: Vec<f32>) -> Result<()> {
        if centroids.len() != self.nlist as usize * self.dim as usize {
            return Err(Error::precondition(format!(
                "coarse centroid update expected {} values, got {}",
                self.nlist as usize * self.dim as usize,
                centroids.len()
            )));
        }
        self.centroids = centroids;
        self.set = true;
        Ok(())
    }

    pub fn centroid(&self, list_id: u32) -> &[f32] {
        let d = self.dim as usize;
        let i = list_id as usize;
        &self.centroids[i * d..(i + 1) * d]
    }

    fn distance_to(&self, list_id: u32, x: &[f32], metric: Metric) -> f32 {
        let c = self.centroid(list_id);
        let dot: f32 = x.iter().zip(c.iter()).map(|(a, b)| a * b).sum();
        match metric {
            Metric::L2 => l2_sq_from_dot(l2_norm_squared(x), l2_norm_squared(c), dot),
            Metric::InnerProduct | Metric::Cosine => dot,
        }
    }

    /// Coarse (L1) stage: returns the top-`nprobe` list ids for `x`.
    pub fn topk_lists(&self, x: &[f32], nprobe: u32, metric: Metric) -> Vec<u32> {
        let nprobe = (nprobe as usize).min(self.nlist as usize);
        let mut scored: Vec<(f32, u32)> = (0..self.nlist)
            .map(|list_id| (self.distance_to(list_id, x, metric), list_id))
            .collect();
        scored.sort_by(|a, b| metric.cmp_results(*a, *b));
        scored.truncate(nprobe);
        scored.into_iter().map(|(_, id)| id).collect()
    }

    pub fn assign(&self, x: &[f32], metric: Metric) -> u32 {
        self.topk_lists(x, 1, metric)[0]
    }
}

/// Per-family code encode/decode + fine-stage distance (§4.4.2 "Fine
/// stage"). Each implementor reconstructs an approximate vector (exact for
/// Flat, residual-corrected for PQ/SQ) and scores it against the query the
/// same way regardless of family, which is mathematically equivalent to
/// the real kernel's table-lookup/dequantize-on-the-fly shortcuts.
pub trait FineEncoder: Send {
    fn code_len(&self) -> usize;
    fn is_trained(&self) -> bool;
    fn encode(&self, coarse: &CoarseQuantizer, list_id: u32, x: &[f32]) -> Vec<u8>;
    fn reconstruct(&self, coarse: &CoarseQuantizer, list_id: u32, code: &[u8]) -> Vec<f32>;
}

fn fine_distance<E: FineEncoder + ?Sized>(
    enc: &E,
    coarse: &CoarseQuantizer,
    list_id: u32,
    metric: Metric,
    query: &[f32],
    code: &[u8],
) -> f32 {
    let approx = enc.reconstruct(coarse, list_id, code);
    let dot: f32 = query.iter().zip(approx.iter()).map(|(a, b)| a * b).sum();
    match metric {
        Metric::L2 => l2_sq_from_dot(l2_norm_squared(query), l2_norm_squared(&approx), dot),
        Metric::InnerProduct | Metric::Cosine => dot,
    }
}

/// Flat fine-stage encoder for IVF-Flat: stores the full vector in fp16,
/// no residual.
pub struct FlatIvfEncoder {
    dim: u32,
}

impl FlatIvfEncoder {
    pub fn new(dim: u32) -> Self {
        Self { dim }
    }
}

impl FineEncoder for FlatIvfEncoder {
    fn code_len(&self) -> usize {
        self.dim as usize * std::mem::size_of::<f16>()
    }

    fn is_trained(&self) -> bool {
        true
    }

    fn encode(&self, _coarse: &CoarseQuantizer, _list_id: u32, x: &[f32]) -> Vec<u8> {
        let coded: Vec<f16> = x.iter().map(|&v| f16::from_f32(v)).collect();
        bytemuck::cast_slice(&coded).to_vec()
    }

    fn reconstruct(&self, _coarse: &CoarseQuantizer, _list_id: u32, code: &[u8]) -> Vec<f32> {
        let f16s: &[f16] = bytemuck::cast_slice(code);
        f16_slice_to_f32(f16s)
    }
}

/// Int8 fine-stage encoder for Int8-IVF-Flat: stores the full vector
/// quantized to signed bytes, no residual. Mirrors [`FlatIvfEncoder`] but
/// for the int8 element family (§3 "Vector").
pub struct Int8IvfFlatEncoder {
    dim: u32,
    normalize_on_add: bool,
}

impl Int8IvfFlatEncoder {
    pub fn new(dim: u32, normalize_on_add: bool) -> Self {
        Self {
            dim,
            normalize_on_add,
        }
    }
}

impl FineEncoder for Int8IvfFlatEncoder {
    fn code_len(&self) -> usize {
        self.dim as usize
    }

    fn is_trained(&self) -> bool {
        true
    }

    fn encode(&self, _coarse: &CoarseQuantizer, _list_id: u32, x: &[f32]) -> Vec<u8> {
        let coded: Vec<i8> = if self.normalize_on_add {
            vsearch_common::vector::normalize_and_quantize_i8(x)
        } else {
            x.iter()
                .map(|&v| v.round().clamp(i8::MIN as f32, i8::MAX as f32) as i8)
                .collect()
        };
        bytemuck::cast_slice(&coded).to_vec()
    }

    fn reconstruct(&self, _coarse: &CoarseQuantizer, _list_id: u32, code: &[u8]) -> Vec<f32> {
        let i8s: &[i8] = bytemuck::cast_slice(code);
        i8s.iter().map(|&v| v as f32).collect()
    }
}

/// Product-quantization fine-stage encoder (§4.4.2, IVF-PQ): `m`
/// sub-quantizers of `ksub = 2^bits` centroids each over `dim/m`
/// components, residual-encoded against the coarse centroid.
pub struct PqEncoder {
    dim: u32,
    m: u32,
    bits: u32,
    ksub: u32,
    dsub: u32,
    /// `m * ksub * dsub` row-major.
    centroids: Vec<f32>,
    trained: bool,
}

impl PqEncoder {
    pub fn new(dim: u32, m: u32, bits: u32) -> Self {
        let ksub = 1u32 << bits;
        let dsub = dim / m;
        Self {
            dim,
            m,
            bits,
            ksub,
            dsub,
            centroids: vec![0.0; (m * ksub * dsub) as usize],
            trained: false,
        }
    }

    pub fn m(&self) -> u32 {
        self.m
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn update_pq_cent(&mut self, centroids: Vec<f32>) -> Result<()> {
        let expected = (self.m * self.ksub * self.dsub) as usize;
        if centroids.len() != expected {
            return Err(Error::precondition(format!(
                "PQ centroid update expected {expected} values, got {}",
                centroids.len()
            )));
        }
        self.centroids = centroids;
        self.trained = true;
        Ok(())
    }

    fn sub_centroid(&self, sub: u32, code: u8) -> &[f32] {
        let dsub = self.dsub as usize;
        let ksub = self.ksub as usize;
        let base = (sub as usize * ksub + code as usize) * dsub;
        &self.centroids[base..base + dsub]
    }
}

impl FineEncoder for PqEncoder {
    fn code_len(&self) -> usize {
        self.m as usize
    }

    fn is_trained(&self) -> bool {
        self.trained
    }

    fn encode(&self, coarse: &CoarseQuantizer, list_id: u32, x: &[f32]) -> Vec<u8> {
        let centroid = coarse.centroid(list_id);
        let residual: Vec<f32> = x.iter().zip(centroid.iter()).map(|(a, b)| a - b).collect();
        let dsub = self.dsub as usize;
        (0..self.m)
            .map(|sub| {
                let sub_vec = &residual[sub as usize * dsub..(sub as usize + 1) * dsub];
                let mut best = (f32::MAX, 0u8);
                for code in 0..self.ksub {
                    let c = self.sub_centroid(sub, code as u8);
                    let d: f32 = sub_vec
                        .iter()
                        .zip(c.iter())
                        .map(|(a, b)| (a - b) * (a - b))
                        .sum();
                    if d < best.0 {
                        best = (d, code as u8);
                    }
                }
                best.1
            })
            .collect()
    }

    fn reconstruct(&self, coarse: &CoarseQuantizer, list_id: u32, code: &[u8]) -> Vec<f32> {
        let centroid = coarse.centroid(list_id);
        let dsub = self.dsub as usize;
        let mut out = Vec::with_capacity(self.dim as usize);
        for (sub, &c) in code.iter().enumerate() {
            let sub_centroid = self.sub_centroid(sub as u32, c);
            let base = sub * dsub;
            for (i, &v) in sub_centroid.iter().enumerate() {
                out.push(v + centroid[base + i]);
            }
        }
        out
    }
}

/// Scalar-quantization fine-stage encoder (§4.4.2, §3): per-dimension
/// `vmin`/`vdiff`, uniform 8-bit codes, optionally residual-encoded
/// against the coarse centroid.
pub struct SqEncoder {
    dim: u32,
    residual: bool,
    vmin: Vec<f32>,
    vdiff: Vec<f32>,
    trained: bool,
}

impl SqEncoder {
    pub fn new(dim: u32, residual: bool) -> Self {
        Self {
            dim,
            residual,
            vmin: vec![0.0; dim as usize],
            vdiff: vec![1.0; dim as usize],
            trained: false,
        }
    }

    pub fn update_sq_trained_value(&mut self, vmin: Vec<f32>, vdiff: Vec<f32>) -> Result<()> {
        if vmin.len() != self.dim as usize || vdiff.len() != self.dim as usize {
            return Err(Error::precondition("SQ trained value dim mismatch"));
        }
        self.vmin = vmin;
        self.vdiff = vdiff;
        self.trained = true;
        Ok(())
    }
}

impl FineEncoder for SqEncoder {
    fn code_len(&self) -> usize {
        self.dim as usize
    }

    fn is_trained(&self) -> bool {
        self.trained
    }

    fn encode(&self, coarse: &CoarseQuantizer, list_id: u32, x: &[f32]) -> Vec<u8> {
        let target: Vec<f32> = if self.residual {
            let c = coarse.centroid(list_id);
            x.iter().zip(c.iter()).map(|(a, b)| a - b).collect()
        } else {
            x.to_vec()
        };
        target
            .iter()
            .zip(self.vmin.iter())
            .zip(self.vdiff.iter())
            .map(|((&v, &vmin), &vdiff)| {
                let level = if vdiff.abs() > f32::EPSILON {
                    ((v - vmin) / vdiff).round()
                } else {
                    0.0
                };
                level.clamp(0.0, 255.0) as u8
            })
            .collect()
    }

    fn reconstruct(&self, coarse: &CoarseQuantizer, list_id: u32, code: &[u8]) -> Vec<f32> {
        let dequant: Vec<f32> = code
            .iter()
            .zip(self.vmin.iter())
            .zip(self.vdiff.iter())
            .map(|((&c, &vmin), &vdiff)| vmin + c as f32 * vdiff)
            .collect();
        if self.residual {
            let c = coarse.centroid(list_id);
            dequant.iter().zip(c.iter()).map(|(a, b)| a + b).collect()
        } else {
            dequant
        }
    }
}

/// One coarse list's storage: parallel `codes`/`ids` device vectors kept
/// in lockstep (§3 "Coarse list").
struct IvfList {
    codes: DeviceVec<u8>,
    ids: DeviceVec<u32>,
}

impl IvfList {
    fn new() -> Self {
        Self {
            codes: DeviceVec::new(MemorySpace::Device),
            ids: DeviceVec::new(MemorySpace::Device),
        }
    }

    fn len(&self) -> usize {
        self.ids.size()
    }
}

/// Shared IVF implementation: coarse assignment, per-list storage, and
/// two-stage search, generic over the fine-stage [`FineEncoder`].
pub struct IvfIndex<E: FineEncoder> {
    dim: u32,
    metric: Metric,
    nprobe: u32,
    coarse: CoarseQuantizer,
    lists: Vec<IvfList>,
    encoder: E,
}

impl<E: FineEncoder> IvfIndex<E> {
    pub fn new(dim: u32, metric: Metric, nlist: u32, nprobe: u32, encoder: E) -> Self {
        let lists = (0..nlist).map(|_| IvfList::new()).collect();
        Self {
            dim,
            metric,
            nprobe,
            coarse: CoarseQuantizer::new(nlist, dim),
            lists,
            encoder,
        }
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    pub fn encoder_mut(&mut self) -> &mut E {
        &mut self.encoder
    }

    pub fn update_coarse_cent(&mut self, centroids: Vec<f32>) -> Result<()> {
        self.coarse.update(centroids)
    }

    /// Capped at `min(nlist, MAX_K_SELECTION)` regardless of the request
    /// (§4.7, §8 boundary behaviors).
    pub fn update_nprobe(&mut self, nprobe: u32) {
        self.nprobe = nprobe
            .min(self.coarse.nlist())
            .min(vsearch_common::MAX_K_SELECTION as u32);
    }

    pub fn nprobe(&self) -> u32 {
        self.nprobe
    }

    pub fn nlist(&self) -> u32 {
        self.coarse.nlist()
    }

    pub fn get_list_length(&self, list_id: u32) -> Result<u64> {
        self.list(list_id).map(|l| l.len() as u64)
    }

    pub fn get_list_codes(&self, list_id: u32) -> Result<(&[u8], &[u32])> {
        let list = self.list(list_id)?;
        Ok((list.codes.data(), list.ids.data()))
    }

    /// The daemon never reshapes codes into a tile-major layout in this
    /// implementation (there is no tile kernel to feed), so this always
    /// reports "no reshape needed" and `materialize_row_major` is simply
    /// `get_list_codes` (§4.4.2, §9 "PQ code layout on device").
    pub fn needs_reshape(&self, _list_id: u32) -> bool {
        false
    }

    pub fn materialize_row_major(&self, list_id: u32) -> Result<Vec<u8>> {
        Ok(self.list(list_id)?.codes.data().to_vec())
    }

    pub fn reserve_list(&mut self, list_id: u32, n: u64) -> Result<()> {
        let code_len = self.encoder.code_len();
        let list = self.list_mut(list_id)?;
        list.codes.reserve(n as usize * code_len);
        list.ids.reserve(n as usize);
        Ok(())
    }

    pub fn reclaim_list(&mut self, list_id: u32) -> Result<u64> {
        let list = self.list_mut(list_id)?;
        Ok(list.codes.reclaim(true) as u64 + list.ids.reclaim(true) as u64)
    }

    fn list(&self, list_id: u32) -> Result<&IvfList> {
        self.lists
            .get(list_id as usize)
            .ok_or_else(|| Error::precondition(format!("list id {list_id} out of range")))
    }

    fn list_mut(&mut self, list_id: u32) -> Result<&mut IvfList> {
        self.lists
            .get_mut(list_id as usize)
            .ok_or_else(|| Error::precondition(format!("list id {list_id} out of range")))
    }

    fn add_one(&mut self, x: &[f32], id: u64) -> Result<()> {
        let list_id = self.coarse.assign(x, self.metric);
        let code = self.encoder.encode(&self.coarse, list_id, x);
        let list = self.list_mut(list_id)?;
        list.codes.append(&code, false);
        list.ids.append(&[id as u32], false);
        Ok(())
    }
}

impl<E: FineEncoder> IndexKernel for IvfIndex<E> {
    fn dim(&self) -> u32 {
        self.dim
    }

    fn metric(&self) -> Metric {
        self.metric
    }

    fn ntotal(&self) -> u64 {
        self.lists.iter().map(|l| l.len() as u64).sum()
    }

    fn is_trained(&self) -> bool {
        self.coarse.is_set() && self.encoder.is_trained()
    }

    /// No-op: IVF training happens on the host (k-means, PQ/SQ table
    /// fitting) and is pushed here through `update_coarse_cent` /
    /// `update_pq_cent` / `update_sq_trained_value` instead (§4.5
    /// "Train").
    fn train(&mut self, _n: u32, _x: &[f32]) -> Result<()> {
        Ok(())
    }

    fn add(&mut self, n: u32, x: &[f32], ids: Option<&[u64]>) -> Result<u64> {
        if !self.is_trained() {
            return Err(Error::precondition("add called before index is trained"));
        }
        let d = self.dim as usize;
        let base_ntotal = self.ntotal();
        let bytes_per_vec = d * 4 + self.encoder.code_len();
        for (start, count) in add_pages(n as usize, bytes_per_vec) {
            for i in 0..count {
                let row = start + i;
                let v = &x[row * d..(row + 1) * d];
                let id = match ids {
                    Some(ids) => ids[row],
                    None => base_ntotal + row as u64,
                };
                self.add_one(v, id)?;
            }
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
                let probes = self.coarse.topk_lists(q, self.nprobe, self.metric);
                let mut acc = TopKAccumulator::new(k as usize, self.metric);
                for &list_id in &probes {
                    let list = &self.lists[list_id as usize];
                    let code_len = self.encoder.code_len();
                    let mut block = Vec::with_capacity(REDUCER_BLOCK);
                    for (pos, id) in list.ids.data().iter().enumerate() {
                        let code = &list.codes.data()[pos * code_len..(pos + 1) * code_len];
                        let dist =
                            fine_distance(&self.encoder, &self.coarse, list_id, self.metric, q, code);
                        block.push((dist, *id));
                        if block.len() == REDUCER_BLOCK {
                            acc.offer_block(&block);
                            block.clear();
                        }
                    }
                    if !block.is_empty() {
                        acc.offer_block(&block);
                    }
                }
                out.fill_row(row, k as usize, &acc.finish());
            }
        }
        Ok(out)
    }

    fn remove_ids(&mut self, selector: &dyn IdSelector) -> Result<u64> {
        let mut total_removed = 0u64;
        for list in &mut self.lists {
            let positions: Vec<usize> = list
                .ids
                .data()
                .iter()
                .enumerate()
                .filter(|(_, &id)| selector.is_member(id as u64))
                .map(|(pos, _)| pos)
                .collect();
            if positions.is_empty() {
                continue;
            }
            let code_len = self.encoder.code_len();
            let element_positions: Vec<usize> = positions
                .iter()
                .flat_map(|&p| (p * code_len)..(p * code_len + code_len))
                .collect();
            list.codes.remove_positions(&element_positions);
            list.ids.remove_positions(&positions);
            total_removed += positions.len() as u64;
        }
        Ok(total_removed)
    }

    fn reset(&mut self) -> Result<()> {
        for list in &mut self.lists {
            list.codes.clear();
            list.ids.clear();
        }
        Ok(())
    }

    /// Spread evenly across lists; callers that want to target one list
    /// use [`IvfIndex::reserve_list`] directly (the wire-level
    /// `IndexReserveMem` carries an optional `list_id` for exactly this;
    /// see `vsearch-daemon::dispatch`).
    fn reserve_memory(&mut self, n: u64) -> Result<()> {
        let per_list = n / self.lists.len().max(1) as u64;
        for list_id in 0..self.lists.len() as u32 {
            self.reserve_list(list_id, per_list)?;
        }
        Ok(())
    }

    fn reclaim_memory(&mut self) -> Result<u64> {
        let mut total = 0u64;
        for list_id in 0..self.lists.len() as u32 {
            total += self.reclaim_list(list_id)?;
        }
        Ok(total)
    }
}

pub type IvfFlatIndex = IvfIndex<FlatIvfEncoder>;
pub type IvfPqIndex = IvfIndex<PqEncoder>;
pub type IvfSqIndex = IvfIndex<SqEncoder>;
pub type Int8IvfFlatIndex = IvfIndex<Int8IvfFlatEncoder>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ivf_flat_scenario_2() {
        let mut idx = IvfFlatIndex::new(8, Metric::L2, 2, 1, FlatIvfEncoder::new(8));
        idx.update_coarse_cent(vec![
            0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, //
            1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0,
        ])
        .unwrap();
        assert!(idx.is_trained());
        idx.add(1, &[0.1; 8], Some(&[42])).unwrap();
        assert_eq!(idx.ntotal(), 1);
        let out = idx.search(1, &[0.0; 8], 1).unwrap();
        assert_eq!(out.labels[0], 42);
    }

    #[test]
    fn ivf_pq_ntotal_matches_sum_of_lists() {
        let mut idx = IvfPqIndex::new(16, Metric::L2, 8, 4, PqEncoder::new(16, 4, 8));
        let centroids: Vec<f32> = (0..8 * 16).map(|i| (i % 7) as f32 * 0.1).collect();
        idx.update_coarse_cent(centroids).unwrap();
        idx.encoder_mut()
            .update_pq_cent(vec![0.0; 4 * 256 * 4])
            .unwrap();
        assert!(idx.is_trained());

        let mut rng_state = 12345u64;
        let mut next = || {
            rng_state = rng_state.wrapping_mul(6364136223846793005).wrapping_add(1);
            ((rng_state >> 33) as f32 / u32::MAX as f32) * 2.0 - 1.0
        };
        let vectors: Vec<f32> = (0..1000 * 16).map(|_| next()).collect();
        idx.add(1000, &vectors, None).unwrap();
        assert_eq!(idx.ntotal(), 1000);
        let sum_lists: u64 = (0..idx.nlist())
            .map(|l| idx.get_list_length(l).unwrap())
            .sum();
        assert_eq!(sum_lists, 1000);
    }

    #[test]
    fn ivf_remove_range() {
        let mut idx = IvfFlatIndex::new(4, Metric::L2, 4, 4, FlatIvfEncoder::new(4));
        idx.update_coarse_cent(vec![
            0.0, 0.0, 0.0, 0.0, 10.0, 0.0, 0.0, 0.0, 0.0, 10.0, 0.0, 0.0, 0.0, 0.0, 10.0, 0.0,
        ])
        .unwrap();
        let ids: Vec<u64> = (0..30).collect();
        let vectors: Vec<f32> = (0..30).flat_map(|i| vec![i as f32 * 0.01; 4]).collect();
        idx.add(30, &vectors, Some(&ids)).unwrap();
        assert_eq!(idx.ntotal(), 30);

        let sel = vsearch_common::selector::IdSelectorRange::new(10, 20);
        let removed = idx.remove_ids(&sel).unwrap();
        assert_eq!(removed, 10);
        assert_eq!(idx.ntotal(), 20);

        let out = idx.search(30, &vectors, 1).unwrap();
        for row in 0..30 {
            let label = out.labels[row];
            assert!(!(10..20).contains(&label), "label {label} should be removed");
        }
    }
}
