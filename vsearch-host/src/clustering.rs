//! Host-side k-means clustering (§4.6): produces the `nlist x dim` IVF
//! coarse centroid table, with a choice of k-means++ (sequential) or
//! k-means|| (scalable, oversampled) seeding, followed by Lloyd iterations.

use rand::Rng;
use vsearch_common::config::ClusteringParams;

/// Oversample rounds for k-means|| seeding. Bahmani et al. suggest a
/// handful of rounds is enough for the oversampled pool to cover the true
/// cluster structure; five keeps seeding cheap relative to the Lloyd
/// iterations that follow.
const KMEANS_PARALLEL_ROUNDS: usize = 5;

fn l2_sq(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn nearest_dist_sq(point: &[f32], centroids: &[Vec<f32>]) -> f32 {
    centroids
        .iter()
        .map(|c| l2_sq(point, c))
        .fold(f32::MAX, f32::min)
}

/// Index of the closest centroid to `point`, by squared L2. Used by the
/// façade's IVF-PQ/IVF-SQ training to compute residuals against the coarse
/// centroids it just trained, independent of the index's own search metric
/// (FAISS-style coarse assignment is L2 regardless of the fine metric).
pub fn assign_nearest(point: &[f32], centroids: &[Vec<f32>]) -> usize {
    let mut best = f32::MAX;
    let mut best_j = 0usize;
    for (j, c) in centroids.iter().enumerate() {
        let d = l2_sq(point, c);
        if d < best {
            best = d;
            best_j = j;
        }
    }
    best_j
}

/// Per-dimension `(vmin, vdiff)` for SQ 8-bit uniform quantization (§3 "SQ
/// trained range"): `vmin` is the per-dim minimum, `vdiff` scales the
/// `[0,255]` code range across the observed `[min, max]` span. A degenerate
/// (constant) dimension gets `vdiff = 1.0` so `SqEncoder` never divides by
/// zero.
pub fn train_sq_range(points: &[f32], dim: usize) -> (Vec<f32>, Vec<f32>) {
    let n = points.len() / dim.max(1);
    let mut vmin = vec![f32::MAX; dim];
    let mut vmax = vec![f32::MIN; dim];
    for i in 0..n {
        let row = row(points, dim, i);
        for d in 0..dim {
            vmin[d] = vmin[d].min(row[d]);
            vmax[d] = vmax[d].max(row[d]);
        }
    }
    if n == 0 {
        return (vec![0.0; dim], vec![1.0; dim]);
    }
    let vdiff = vmin
        .iter()
        .zip(vmax.iter())
        .map(|(&lo, &hi)| {
            let span = (hi - lo) / 255.0;
            if span.abs() > f32::EPSILON {
                span
            } else {
                1.0
            }
        })
        .collect();
    (vmin, vdiff)
}

/// Trains `m` independent sub-quantizers of `2^bits` centroids each over
/// `dim/m` components (§4.6, §4.4.2 "PQ sub-quantizers"): k-means++ seeding
/// plus `niter` Lloyd iterations per sub-space, run over `residuals` (the
/// vectors already had their assigned coarse centroid subtracted). Returns
/// `m * ksub * (dim/m)` row-major, matching [`PqEncoder`]'s expected layout
/// (sub-quantizer outermost, then code, then sub-dimension).
///
/// [`PqEncoder`]: vsearch_daemon::kernels::ivf::PqEncoder
pub fn train_pq_centroids(
    residuals: &[f32],
    dim: usize,
    m: u32,
    bits: u32,
    niter: u32,
    rng: &mut impl Rng,
) -> Vec<f32> {
    let ksub = 1usize << bits;
    let sub_dim = dim / (m as usize).max(1);
    let n = residuals.len() / dim.max(1);
    let mut out = Vec::with_capacity(m as usize * ksub * sub_dim);
    for sub in 0..m as usize {
        let mut sub_points = Vec::with_capacity(n * sub_dim);
        for i in 0..n {
            let row = row(residuals, dim, i);
            sub_points.extend_from_slice(&row[sub * sub_dim..(sub + 1) * sub_dim]);
        }
        let mut centroids = if n == 0 {
            vec![vec![0.0; sub_dim]; ksub]
        } else {
            kmeans_pp_seed(&sub_points, sub_dim, ksub, rng)
        };
        lloyd_iterate(&sub_points, sub_dim, &mut centroids, niter);
        for c in centroids {
            out.extend(c);
        }
    }
    out
}

fn weighted_pick(weights: &[f32], total: f32, rng: &mut impl Rng) -> usize {
    let target = rng.gen::<f32>() * total;
    let mut acc = 0.0f32;
    for (i, &w) in weights.iter().enumerate() {
        acc += w;
        if acc >= target {
            return i;
        }
    }
    weights.len() - 1
}

fn row(points: &[f32], dim: usize, i: usize) -> &[f32] {
    &points[i * dim..(i + 1) * dim]
}

/// Uniformly subsamples `points` (`n x dim` row-major) down to at most
/// `nlist * max_points_per_centroid` rows, matching the
/// `max_points_per_centroid` knob (§4.6). Returns the input unchanged if it
/// is already within budget.
pub fn subsample(
    points: &[f32],
    dim: usize,
    nlist: usize,
    max_points_per_centroid: usize,
    rng: &mut impl Rng,
) -> Vec<f32> {
    let n = points.len() / dim.max(1);
    let cap = nlist.saturating_mul(max_points_per_centroid);
    if cap == 0 || n <= cap {
        return points.to_vec();
    }
    let mut idx: Vec<usize> = (0..n).collect();
    for i in 0..cap {
        let j = rng.gen_range(i..n);
        idx.swap(i, j);
    }
    idx.truncate(cap);
    let mut out = Vec::with_capacity(cap * dim);
    for &i in &idx {
        out.extend_from_slice(row(points, dim, i));
    }
    out
}

/// k-means++ seeding (§4.6): the first seed is uniform, every subsequent
/// seed is drawn with probability proportional to its squared distance to
/// the nearest seed chosen so far.
pub fn kmeans_pp_seed(points: &[f32], dim: usize, k: usize, rng: &mut impl Rng) -> Vec<Vec<f32>> {
    let n = points.len() / dim.max(1);
    let mut centroids: Vec<Vec<f32>> = Vec::with_capacity(k);
    if n == 0 {
        return vec![vec![0.0; dim]; k];
    }
    centroids.push(row(points, dim, rng.gen_range(0..n)).to_vec());
    while centroids.len() < k {
        let weights: Vec<f32> = (0..n).map(|i| nearest_dist_sq(row(points, dim, i), &centroids)).collect();
        let total: f32 = weights.iter().sum();
        let pick = if total <= 0.0 {
            rng.gen_range(0..n)
        } else {
            weighted_pick(&weights, total, rng)
        };
        centroids.push(row(points, dim, pick).to_vec());
    }
    centroids
}

/// Weighted k-means++ over an already-selected candidate pool: used by
/// [`kmeans_parallel_seed`] to recombine its oversampled pool down to
/// exactly `k` seeds.
fn weighted_kmeans_pp(pool: &[Vec<f32>], weights: &[u32], k: usize, rng: &mut impl Rng) -> Vec<Vec<f32>> {
    let m = pool.len();
    let mut chosen: Vec<Vec<f32>> = Vec::with_capacity(k);
    let w_f32: Vec<f32> = weights.iter().map(|&w| w as f32).collect();
    let total_w: f32 = w_f32.iter().sum();
    let first = if total_w <= 0.0 {
        rng.gen_range(0..m)
    } else {
        weighted_pick(&w_f32, total_w, rng)
    };
    chosen.push(pool[first].clone());
    while chosen.len() < k {
        let scores: Vec<f32> = (0..m)
            .map(|i| w_f32[i] * nearest_dist_sq(&pool[i], &chosen))
            .collect();
        let total: f32 = scores.iter().sum();
        let pick = if total <= 0.0 {
            rng.gen_range(0..m)
        } else {
            weighted_pick(&scores, total, rng)
        };
        chosen.push(pool[pick].clone());
    }
    chosen
}

/// k-means|| (scalable k-means) seeding (§4.6): `KMEANS_PARALLEL_ROUNDS`
/// oversample rounds, each drawing roughly `k` candidates weighted by
/// distance to the nearest seed so far, then a weighted k-means++ pass over
/// the oversampled pool down to exactly `k` seeds.
pub fn kmeans_parallel_seed(points: &[f32], dim: usize, k: usize, rng: &mut impl Rng) -> Vec<Vec<f32>> {
    let n = points.len() / dim.max(1);
    if n == 0 {
        return vec![vec![0.0; dim]; k];
    }
    let mut pool: Vec<Vec<f32>> = vec![row(points, dim, rng.gen_range(0..n)).to_vec()];

    for _ in 0..KMEANS_PARALLEL_ROUNDS {
        let weights: Vec<f32> = (0..n).map(|i| nearest_dist_sq(row(points, dim, i), &pool)).collect();
        let total: f32 = weights.iter().sum();
        if total <= 0.0 {
            break;
        }
        for i in 0..n {
            let p = k as f32 * weights[i] / total;
            if rng.gen::<f32>() < p {
                pool.push(row(points, dim, i).to_vec());
            }
        }
    }

    if pool.len() <= k {
        while pool.len() < k {
            pool.push(row(points, dim, rng.gen_range(0..n)).to_vec());
        }
        return pool;
    }

    let mut assign_count = vec![0u32; pool.len()];
    for i in 0..n {
        let p = row(points, dim, i);
        let mut best = f32::MAX;
        let mut best_j = 0;
        for (j, cand) in pool.iter().enumerate() {
            let d = l2_sq(p, cand);
            if d < best {
                best = d;
                best_j = j;
            }
        }
        assign_count[best_j] += 1;
    }
    weighted_kmeans_pp(&pool, &assign_count, k, rng)
}

/// Lloyd's algorithm: `niter` rounds of assign-to-nearest then
/// recompute-as-mean. A centroid with no assigned points in a round keeps
/// its previous value rather than being reseeded (§4.6 is silent on empty
/// clusters; this is the simplest behavior that keeps `nlist` centroids
/// stable across iterations).
pub fn lloyd_iterate(points: &[f32], dim: usize, centroids: &mut [Vec<f32>], niter: u32) {
    let k = centroids.len();
    let n = points.len() / dim.max(1);
    if n == 0 || k == 0 {
        return;
    }
    for _ in 0..niter {
        let mut sums = vec![vec![0.0f32; dim]; k];
        let mut counts = vec![0u32; k];
        for i in 0..n {
            let p = row(points, dim, i);
            let mut best = f32::MAX;
            let mut best_j = 0;
            for (j, c) in centroids.iter().enumerate() {
                let d = l2_sq(p, c);
                if d < best {
                    best = d;
                    best_j = j;
                }
            }
            counts[best_j] += 1;
            for (s, &v) in sums[best_j].iter_mut().zip(p.iter()) {
                *s += v;
            }
        }
        for j in 0..k {
            if counts[j] > 0 {
                for (c, s) in centroids[j].iter_mut().zip(sums[j].iter()) {
                    *c = s / counts[j] as f32;
                }
            }
        }
    }
}

/// End-to-end IVF coarse centroid training: subsample, seed, iterate.
/// Returns `nlist * dim` row-major centroids, ready for
/// `update_coarse_cent` on every device (§4.5 "Train").
pub fn train_ivf_centroids(
    points: &[f32],
    dim: usize,
    nlist: usize,
    use_kmeans_pp: bool,
    params: ClusteringParams,
    rng: &mut impl Rng,
) -> Vec<f32> {
    if nlist == 0 || dim == 0 {
        return Vec::new();
    }
    if points.is_empty() {
        return vec![0.0; nlist * dim];
    }
    let sampled = subsample(points, dim, nlist, params.max_points_per_centroid as usize, rng);
    let mut centroids = if use_kmeans_pp {
        kmeans_pp_seed(&sampled, dim, nlist, rng)
    } else {
        kmeans_parallel_seed(&sampled, dim, nlist, rng)
    };
    lloyd_iterate(&sampled, dim, &mut centroids, params.niter);
    centroids.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn two_blob_points() -> Vec<f32> {
        // 50 points near (0,0), 50 points near (10,10): a trivially
        // separable two-cluster dataset.
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut pts = Vec::new();
        for _ in 0..50 {
            pts.push(rng.gen::<f32>() * 0.1);
            pts.push(rng.gen::<f32>() * 0.1);
        }
        for _ in 0..50 {
            pts.push(10.0 + rng.gen::<f32>() * 0.1);
            pts.push(10.0 + rng.gen::<f32>() * 0.1);
        }
        pts
    }

    #[test]
    fn kmeans_pp_separates_two_blobs() {
        let points = two_blob_points();
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let params = ClusteringParams {
            niter: 10,
            max_points_per_centroid: 256,
        };
        let centroids = train_ivf_centroids(&points, 2, 2, true, params, &mut rng);
        assert_eq!(centroids.len(), 4);
        let a = &centroids[0..2];
        let b = &centroids[2..4];
        let dist = l2_sq(a, b);
        // The two recovered centroids should land near the two blobs, far
        // apart from each other relative to the blobs' own spread.
        assert!(dist > 50.0, "centroids did not separate: {centroids:?}");
    }

    #[test]
    fn kmeans_parallel_separates_two_blobs() {
        let points = two_blob_points();
        let mut rng = rand::rngs::StdRng::seed_from_u64(99);
        let params = ClusteringParams {
            niter: 10,
            max_points_per_centroid: 256,
        };
        let centroids = train_ivf_centroids(&points, 2, 2, false, params, &mut rng);
        let a = &centroids[0..2];
        let b = &centroids[2..4];
        assert!(l2_sq(a, b) > 50.0, "centroids did not separate: {centroids:?}");
    }

    #[test]
    fn subsample_respects_cap() {
        let points: Vec<f32> = (0..200).map(|i| i as f32).collect();
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let sampled = subsample(&points, 1, 4, 10, &mut rng);
        assert_eq!(sampled.len(), 40);
    }

    #[test]
    fn empty_points_yields_zeroed_centroids() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let params = ClusteringParams::ivf_default();
        let centroids = train_ivf_centroids(&[], 4, 3, true, params, &mut rng);
        assert_eq!(centroids, vec![0.0; 12]);
    }
}
