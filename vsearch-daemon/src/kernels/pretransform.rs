//! `PreTransform` (§4.4.3): applies an ordered chain of linear transforms
//! `A_i x + b_i` before handing the result to an inner index.

use vsearch_common::selector::IdSelector;
use vsearch_common::{Error, Metric, Result};

use crate::kernels::{IndexKernel, SearchOutput};

/// One `A x + b` stage. `a` is `d_out * d_in` row-major; `b` is `d_out`
/// wide, or empty when the stage has no bias.
pub struct LinearTransform {
    d_in: u32,
    d_out: u32,
    a: Vec<f32>,
    b: Vec<f32>,
    trained: bool,
}

impl LinearTransform {
    pub fn new(d_in: u32, d_out: u32, has_bias: bool) -> Self {
        Self {
            d_in,
            d_out,
            a: vec![0.0; d_in as usize * d_out as usize],
            b: if has_bias {
                vec![0.0; d_out as usize]
            } else {
                Vec::new()
            },
            trained: false,
        }
    }

    pub fn d_in(&self) -> u32 {
        self.d_in
    }

    pub fn d_out(&self) -> u32 {
        self.d_out
    }

    pub fn update_trained_value(&mut self, a: Vec<f32>, b: Vec<f32>) -> Result<()> {
        let expected_a = self.d_in as usize * self.d_out as usize;
        if a.len() != expected_a {
            return Err(Error::precondition(format!(
                "linear transform expected {expected_a} values for A, got {}",
                a.len()
            )));
        }
        if !b.is_empty() && b.len() != self.d_out as usize {
            return Err(Error::precondition("linear transform bias dim mismatch"));
        }
        self.a = a;
        self.b = b;
        self.trained = true;
        Ok(())
    }

    pub fn is_trained(&self) -> bool {
        self.trained
    }

    /// Applies this stage to one row: `y = A x + b`.
    pub fn apply_one(&self, x: &[f32], out: &mut [f32]) {
        let d_in = self.d_in as usize;
        for (row, slot) in out.iter_mut().enumerate() {
            let a_row = &self.a[row * d_in..(row + 1) * d_in];
            let dot: f32 = a_row.iter().zip(x.iter()).map(|(a, b)| a * b).sum();
            *slot = dot + self.b.get(row).copied().unwrap_or(0.0);
        }
    }
}

/// Wraps an inner [`IndexKernel`] behind a chain of [`LinearTransform`]
/// stages. Prepend is the only mutator of the chain; search stays
/// read-only otherwise (§4.4.3, §9).
///
/// In the real daemon the chain is applied into a pair of ping-pong
/// buffers allocated from the per-device stack allocator, sized `n x
/// max_dim`; here the buffers are ordinary `Vec`s but the sequential
/// stage-by-stage application is the same.
pub struct PreTransformIndex {
    dim: u32,
    chain: Vec<LinearTransform>,
    inner: Box<dyn IndexKernel>,
}

impl PreTransformIndex {
    pub fn new(dim: u32, inner: Box<dyn IndexKernel>) -> Self {
        Self {
            dim,
            chain: Vec::new(),
            inner,
        }
    }

    /// Adds a transform at the head of the chain, updating the
    /// outward-facing `dim` to the new head's `d_in` and re-checking the
    /// dimension contract (§4.4.3).
    pub fn prepend(&mut self, transform: LinearTransform) -> Result<()> {
        let expected_out = self
            .chain
            .first()
            .map(|t| t.d_in())
            .unwrap_or(self.inner.dim());
        if transform.d_out() != expected_out {
            return Err(Error::precondition(format!(
                "prepended transform d_out {} does not match next stage's d_in {}",
                transform.d_out(),
                expected_out
            )));
        }
        self.dim = transform.d_in();
        self.chain.insert(0, transform);
        Ok(())
    }

    fn apply_chain(&self, n: usize, x: &[f32]) -> Result<Vec<f32>> {
        if self.chain.is_empty() {
            return Ok(x.to_vec());
        }
        let mut cur_dim = self.dim as usize;
        let mut current = x.to_vec();
        for stage in &self.chain {
            if !stage.is_trained() {
                return Err(Error::precondition("transform chain has an untrained stage"));
            }
            let out_dim = stage.d_out() as usize;
            let mut next = vec![0.0f32; n * out_dim];
            for row in 0..n {
                stage.apply_one(
                    &current[row * cur_dim..(row + 1) * cur_dim],
                    &mut next[row * out_dim..(row + 1) * out_dim],
                );
            }
            current = next;
            cur_dim = out_dim;
        }
        if cur_dim != self.inner.dim() as usize {
            return Err(Error::precondition(format!(
                "transform chain output dim {cur_dim} does not match inner index dim {}",
                self.inner.dim()
            )));
        }
        Ok(current)
    }
}

impl IndexKernel for PreTransformIndex {
    fn dim(&self) -> u32 {
        self.dim
    }

    fn metric(&self) -> Metric {
        self.inner.metric()
    }

    fn ntotal(&self) -> u64 {
        self.inner.ntotal()
    }

    fn is_trained(&self) -> bool {
        self.chain.iter().all(|t| t.is_trained()) && self.inner.is_trained()
    }

    fn train(&mut self, n: u32, x: &[f32]) -> Result<()> {
        let transformed = self.apply_chain(n as usize, x)?;
        self.inner.train(n, &transformed)
    }

    fn add(&mut self, n: u32, x: &[f32], ids: Option<&[u64]>) -> Result<u64> {
        let transformed = self.apply_chain(n as usize, x)?;
        self.inner.add(n, &transformed, ids)
    }

    fn search(&self, n: u32, x: &[f32], k: u32) -> Result<SearchOutput> {
        let transformed = self.apply_chain(n as usize, x)?;
        self.inner.search(n, &transformed, k)
    }

    fn remove_ids(&mut self, selector: &dyn IdSelector) -> Result<u64> {
        self.inner.remove_ids(selector)
    }

    fn reset(&mut self) -> Result<()> {
        self.inner.reset()
    }

    fn reserve_memory(&mut self, n: u64) -> Result<()> {
        self.inner.reserve_memory(n)
    }

    fn reclaim_memory(&mut self) -> Result<u64> {
        self.inner.reclaim_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::flat::FlatIndex;

    #[test]
    fn identity_transform_passes_through() {
        let inner = Box::new(FlatIndex::new(2, Metric::L2));
        let mut pt = PreTransformIndex::new(2, inner);
        let mut t = LinearTransform::new(2, 2, false);
        t.update_trained_value(vec![1.0, 0.0, 0.0, 1.0], vec![]).unwrap();
        pt.prepend(t).unwrap();
        assert!(pt.is_trained());
        pt.add(1, &[1.0, 2.0], None).unwrap();
        let out = pt.search(1, &[1.0, 2.0], 1).unwrap();
        assert_eq!(out.labels[0], 0);
        assert_eq!(out.distances[0].to_f32(), 0.0);
    }

    #[test]
    fn prepend_rejects_dimension_mismatch() {
        let inner = Box::new(FlatIndex::new(2, Metric::L2));
        let mut pt = PreTransformIndex::new(2, inner);
        let t = LinearTransform::new(3, 4, false);
        assert!(pt.prepend(t).is_err());
    }
}
