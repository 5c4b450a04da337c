//! NN dim-reduction adapter (§4.4.4): the one external-collaborator kernel
//! in this crate. It wraps a loaded model handle behind a single `infer`
//! entry point; this workspace never inlines accelerator-adjacent neural
//! network inference code, so the model itself is a named trait the
//! binary wires up at startup.

use vsearch_common::{Error, Result};

/// The loaded dimensionality-reduction model. Production code backs this
/// with whatever inference runtime the deployment uses; this crate only
/// needs the batch contract.
pub trait DimReductionModel: Send {
    fn batch_size(&self) -> u32;
    fn in_dim(&self) -> u32;
    fn out_dim(&self) -> u32;

    /// Runs one full batch of `batch_size()` input rows through the
    /// model, writing `batch_size() * out_dim()` output values.
    fn infer_batch(&self, input: &[f32], output: &mut [f32]);
}

/// Host-facing adapter: batches `n` input rows to the model's declared
/// batch size, zero-padding the tail up to one full batch and truncating
/// the unused outputs (§4.4.4).
pub struct NnDimReduction {
    model: Box<dyn DimReductionModel>,
}

impl NnDimReduction {
    pub fn new(model: Box<dyn DimReductionModel>) -> Self {
        Self { model }
    }

    pub fn in_dim(&self) -> u32 {
        self.model.in_dim()
    }

    pub fn out_dim(&self) -> u32 {
        self.model.out_dim()
    }

    pub fn infer(&self, n: u32, input: &[f32]) -> Result<Vec<f32>> {
        let in_dim = self.model.in_dim() as usize;
        let out_dim = self.model.out_dim() as usize;
        let batch = self.model.batch_size() as usize;
        if batch == 0 {
            return Err(Error::precondition("model batch size must be nonzero"));
        }
        let n = n as usize;
        if input.len() != n * in_dim {
            return Err(Error::precondition(format!(
                "expected {} input values for n={n}, got {}",
                n * in_dim,
                input.len()
            )));
        }

        let mut output = vec![0.0f32; n * out_dim];
        let mut start = 0usize;
        while start < n {
            let count = batch.min(n - start);
            let mut in_buf = vec![0.0f32; batch * in_dim];
            in_buf[..count * in_dim].copy_from_slice(&input[start * in_dim..(start + count) * in_dim]);
            let mut out_buf = vec![0.0f32; batch * out_dim];
            self.model.infer_batch(&in_buf, &mut out_buf);
            output[start * out_dim..(start + count) * out_dim]
                .copy_from_slice(&out_buf[..count * out_dim]);
            start += count;
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DoubleModel {
        batch: u32,
        dim: u32,
    }

    impl DimReductionModel for DoubleModel {
        fn batch_size(&self) -> u32 {
            self.batch
        }
        fn in_dim(&self) -> u32 {
            self.dim
        }
        fn out_dim(&self) -> u32 {
            self.dim
        }
        fn infer_batch(&self, input: &[f32], output: &mut [f32]) {
            for (i, o) in input.iter().zip(output.iter_mut()) {
                *o = i * 2.0;
            }
        }
    }

    #[test]
    fn pads_tail_and_truncates_output() {
        let nn = NnDimReduction::new(Box::new(DoubleModel { batch: 4, dim: 2 }));
        // n=5 is not a multiple of batch=4: tail page is padded, then
        // truncated back to 1 row of real output.
        let input: Vec<f32> = (0..10).map(|i| i as f32).collect();
        let out = nn.infer(5, &input).unwrap();
        assert_eq!(out.len(), 10);
        assert_eq!(out, input.iter().map(|v| v * 2.0).collect::<Vec<_>>());
    }
}
