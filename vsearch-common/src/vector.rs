//! Conversions at the host<->wire<->device numeric boundary.
//!
//! The host keeps vectors in `f32`. The wire (and the device) store the
//! float family in half precision, and quantized families as `i8`. All
//! float32 -> float16 conversions go through `half`'s `From<f32>`, which
//! rounds to nearest, ties to even — the direction this workspace documents
//! at every such boundary.

pub use half::f16;

/// The two element families an index family is built over. Flat/IVF-Flat/
/// IVF-PQ/IVF-SQ/SQ/PreTransform operate on `F16`; Int8-Flat/Int8-IVF-Flat
/// operate on `I8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementFamily {
    F16,
    I8,
}

pub fn f32_slice_to_f16(src: &[f32]) -> Vec<f16> {
    src.iter().copied().map(f16::from_f32).collect()
}

pub fn f16_slice_to_f32(src: &[f16]) -> Vec<f32> {
    src.iter().map(|v| v.to_f32()).collect()
}

/// L2-normalizes `v` and quantizes it to signed bytes scaled by
/// `i8::MAX`, the encoding Int8-Flat/Int8-IVF use so that inner product on
/// the codes approximates cosine similarity.
pub fn normalize_and_quantize_i8(v: &[f32]) -> Vec<i8> {
    let norm = l2_norm(v);
    let scale = if norm > 0.0 { i8::MAX as f32 / norm } else { 0.0 };
    v.iter()
        .map(|&x| (x * scale).round().clamp(i8::MIN as f32, i8::MAX as f32) as i8)
        .collect()
}

pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|&x| x * x).sum::<f32>().sqrt()
}

pub fn l2_norm_squared(v: &[f32]) -> f32 {
    v.iter().map(|&x| x * x).sum()
}

/// Squared-L2 distance via `||a||^2 + ||b||^2 - 2 a.b`, the reduction the
/// Flat/IVF-Flat fine-stage kernel uses so distances can be produced from a
/// single matrix multiply plus norm corrections.
pub fn l2_sq_from_dot(norm_a_sq: f32, norm_b_sq: f32, dot: f32) -> f32 {
    (norm_a_sq + norm_b_sq - 2.0 * dot).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f16_roundtrip_is_lossy_but_close() {
        let xs = [0.0f32, 1.0, -1.0, 0.1, 123.456];
        let back = f16_slice_to_f32(&f32_slice_to_f16(&xs));
        for (a, b) in xs.iter().zip(back.iter()) {
            assert!((a - b).abs() < 0.1, "{a} vs {b}");
        }
    }

    #[test]
    fn normalize_self_dot_is_near_max() {
        let v = vec![1.0f32, 2.0, 3.0, -4.0];
        let q = normalize_and_quantize_i8(&v);
        let dot: i32 = q.iter().map(|&x| x as i32 * x as i32).sum();
        let max_possible = (i8::MAX as i32) * (i8::MAX as i32);
        assert!(dot > 0 && dot <= max_possible);
    }
}
