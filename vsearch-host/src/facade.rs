//! Host index façade (§4.5): the single type applications drive to operate
//! a sharded index across every configured device. Owns one [`DeviceClient`]
//! per device, shards adds round-robin, fans searches out and merges
//! results with [`Metric::cmp_results`], and drives host-side training for
//! IVF/PQ/SQ families (k-means plus PQ/SQ table fitting in
//! [`crate::clustering`]), pushing the result to every device.

use std::sync::atomic::{AtomicU32, Ordering};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, instrument};

use vsearch_common::config::{IndexConfig, IvfConfig};
use vsearch_common::ids::{self, IdxMap};
use vsearch_common::wire::{Command, IvfKind};
use vsearch_common::{Error, Metric, Result, MAX_K_SELECTION};
use vsearch_transport::SessionRegistry;

use crate::client::DeviceClient;
use crate::clustering::{assign_nearest, train_ivf_centroids, train_pq_centroids, train_sq_range};
use crate::parallel::call_parallel;

/// Allocates process-wide unique daemon-side index/transform ids so the
/// same numeric id can be used across every device's independent
/// `DaemonContext` without collision risk (§4.5, §6).
static NEXT_ID: AtomicU32 = AtomicU32::new(1);

fn next_id() -> u32 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Which index family a façade was created as. Mirrors §1's family list;
/// `PreTransform` additionally remembers whether its wrapped inner index
/// addresses rows by position (`Flat`) or by a stable assigned id (every
/// other family) — the two need different remove-by-id strategies (see
/// [`Index::remove_ids`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Flat,
    Int8Flat,
    Sq,
    IvfFlat,
    IvfPq { m: u32, bits: u32 },
    IvfSq,
    Int8IvfFlat,
    PreTransform { inner_is_positional: bool },
}

impl Family {
    /// `Flat` is the only family whose daemon-side "id" is a live storage
    /// position rather than a value the façade assigned (§3 "Flat"); every
    /// other family keeps the id the façade handed it at add time, stable
    /// across later compaction.
    fn is_positional(self) -> bool {
        matches!(
            self,
            Family::Flat | Family::PreTransform { inner_is_positional: true }
        )
    }

    fn create_command(self) -> Command {
        match self {
            Family::Flat => Command::CreateIndexFlat,
            Family::Int8Flat => Command::CreateIndexInt8Flat,
            Family::Sq => Command::CreateIndexSQ,
            Family::IvfFlat => Command::CreateIndexIVFFlat,
            Family::IvfPq { .. } => Command::CreateIndexIVFPQ,
            Family::IvfSq => Command::CreateIndexIVFSQ,
            Family::Int8IvfFlat => Command::CreateIndexInt8IVFFlat,
            Family::PreTransform { .. } => Command::CreateIndexPreTransform,
        }
    }

    fn add_command(self) -> Command {
        match self {
            Family::Flat => Command::IndexFlatAdd,
            Family::Int8Flat => Command::IndexInt8FlatAdd,
            Family::Sq => Command::IndexSQAdd,
            Family::IvfFlat => Command::IndexIVFFlatAdd,
            Family::IvfPq { .. } => Command::IndexIVFPQAdd,
            Family::IvfSq => Command::IndexIVFSQAdd,
            Family::Int8IvfFlat => Command::IndexInt8IVFFlatAdd,
            // The inner index is always the fp16 family on the wire (the
            // daemon decodes by `index_id`, not by the `Command` tag; see
            // `vsearch-daemon::dispatch::IndexHandle::is_int8`), so any
            // plain-float add tag works.
            Family::PreTransform { .. } => Command::IndexFlatAdd,
        }
    }

    fn is_int8(self) -> bool {
        matches!(self, Family::Int8Flat | Family::Int8IvfFlat)
    }

    fn is_ivf(self) -> bool {
        matches!(
            self,
            Family::Sq | Family::IvfFlat | Family::IvfPq { .. } | Family::IvfSq | Family::Int8IvfFlat
        )
    }
}

/// Lifecycle state (§4.8). `Index` never materializes `Unconfigured`: by the
/// time a constructor returns successfully the index is `Configured` (and,
/// for families that need no training, immediately `Trained`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    Configured,
    Trained,
    Populated,
    Closed,
}

/// A sharded index spanning every device in its `IndexConfig`. Cheap to
/// move, not `Clone` (each device session is acquired once, for this
/// index's lifetime, and released on [`Index::destroy`]).
pub struct Index {
    family: Family,
    index_id: u32,
    dim: u32,
    metric: Metric,
    devices: Vec<u32>,
    clients: Vec<DeviceClient>,
    idx_maps: Vec<IdxMap>,
    state: IndexState,
    next_device: usize,
    ivf: Option<IvfConfig>,
}

async fn open_clients(registry: &SessionRegistry, devices: &[u32]) -> Result<Vec<DeviceClient>> {
    let mut clients = Vec::with_capacity(devices.len());
    for &device in devices {
        let session = registry.acquire(device).await?;
        let client = DeviceClient::new(session);
        client.create_context().await?;
        clients.push(client);
    }
    Ok(clients)
}

impl Index {
    /// Flat (fp16), always trained, auto-ids only (§3 "Flat").
    #[instrument(skip(registry), fields(dim, ?metric))]
    pub async fn create_flat(registry: &SessionRegistry, config: IndexConfig, dim: u32, metric: Metric) -> Result<Self> {
        Self::create_simple(registry, config, dim, metric, Family::Flat).await
    }

    /// Int8-Flat, always trained, L2-normalized-at-add for `Cosine` (§3
    /// "Int8-Flat").
    pub async fn create_int8_flat(registry: &SessionRegistry, config: IndexConfig, dim: u32, metric: Metric) -> Result<Self> {
        Self::create_simple(registry, config, dim, metric, Family::Int8Flat).await
    }

    async fn create_simple(registry: &SessionRegistry, config: IndexConfig, dim: u32, metric: Metric, family: Family) -> Result<Self> {
        let devices = config.devices.clone();
        let clients = open_clients(registry, &devices).await?;
        let index_id = next_id();
        call_parallel(clients.clone(), move |c| async move {
            match family {
                Family::Flat => c.create_index_flat(index_id, dim, metric).await,
                Family::Int8Flat => c.create_index_int8_flat(index_id, dim, metric).await,
                _ => unreachable!("create_simple only used for Flat/Int8Flat"),
            }
        })
        .await?;
        Ok(Self {
            family,
            index_id,
            dim,
            metric,
            idx_maps: devices.iter().map(|_| IdxMap::new()).collect(),
            devices,
            clients,
            state: IndexState::Trained,
            next_device: 0,
            ivf: None,
        })
    }

    /// Flat SQ (`nlist = 1`, §3 "SQ"): the daemon pre-sets the coarse
    /// centroid at the origin, so only the per-dimension range needs
    /// training before `add` is allowed.
    pub async fn create_sq(registry: &SessionRegistry, config: IndexConfig, dim: u32, metric: Metric) -> Result<Self> {
        let devices = config.devices.clone();
        let clients = open_clients(registry, &devices).await?;
        let index_id = next_id();
        call_parallel(clients.clone(), move |c| async move {
            c.create_index_sq(index_id, dim, metric).await
        })
        .await?;
        Ok(Self {
            family: Family::Sq,
            index_id,
            dim,
            metric,
            idx_maps: devices.iter().map(|_| IdxMap::new()).collect(),
            devices,
            clients,
            state: IndexState::Configured,
            next_device: 0,
            ivf: None,
        })
    }

    pub async fn create_ivf_flat(registry: &SessionRegistry, ivf: IvfConfig, dim: u32, metric: Metric) -> Result<Self> {
        Self::create_ivf(registry, ivf, dim, metric, Family::IvfFlat, IvfKind::Flat).await
    }

    pub async fn create_ivf_sq(registry: &SessionRegistry, ivf: IvfConfig, dim: u32, metric: Metric) -> Result<Self> {
        Self::create_ivf(registry, ivf, dim, metric, Family::IvfSq, IvfKind::Sq).await
    }

    pub async fn create_int8_ivf_flat(registry: &SessionRegistry, ivf: IvfConfig, dim: u32, metric: Metric) -> Result<Self> {
        Self::create_ivf(registry, ivf, dim, metric, Family::Int8IvfFlat, IvfKind::Flat).await
    }

    pub async fn create_ivf_pq(registry: &SessionRegistry, ivf: IvfConfig, dim: u32, metric: Metric, m: u32, bits: u32) -> Result<Self> {
        Self::create_ivf(
            registry,
            ivf,
            dim,
            metric,
            Family::IvfPq { m, bits },
            IvfKind::Pq { m, bits },
        )
        .await
    }

    async fn create_ivf(registry: &SessionRegistry, ivf: IvfConfig, dim: u32, metric: Metric, family: Family, kind: IvfKind) -> Result<Self> {
        let devices = ivf.base.devices.clone();
        let clients = open_clients(registry, &devices).await?;
        let index_id = next_id();
        let nlist = ivf.nlist;
        let nprobe = ivf.nprobe;
        call_parallel(clients.clone(), move |c| {
            let command = family.create_command();
            async move { c.create_index_ivf(command, index_id, dim, metric, nlist, nprobe, kind).await }
        })
        .await?;
        Ok(Self {
            family,
            index_id,
            dim,
            metric,
            idx_maps: devices.iter().map(|_| IdxMap::new()).collect(),
            devices,
            clients,
            state: IndexState::Configured,
            next_device: 0,
            ivf: Some(ivf),
        })
    }

    /// Wraps `inner` in a `PreTransform` (§3 "PreTransform", §4.4.3).
    /// Consumes `inner`'s daemon-side index — the daemon's own
    /// `CreateIndexPreTransform` removes the inner `index_id` from its
    /// registry and re-parents its storage under the new outer id, so the
    /// inner `Index` handle must not be used again after this call.
    pub async fn wrap_pretransform(inner: Index) -> Result<Self> {
        let inner_is_positional = inner.family.is_positional();
        let index_id = next_id();
        let inner_id = inner.index_id;
        call_parallel(inner.clients.clone(), move |c| async move {
            c.create_pretransform(index_id, inner_id).await
        })
        .await?;
        Ok(Self {
            family: Family::PreTransform { inner_is_positional },
            index_id,
            dim: inner.dim,
            metric: inner.metric,
            devices: inner.devices,
            clients: inner.clients,
            idx_maps: inner.idx_maps,
            state: inner.state,
            next_device: inner.next_device,
            ivf: inner.ivf,
        })
    }

    /// Prepends one linear stage `y = Ax + b` to the transform chain (§3
    /// "PreTransform"). `a` is `d_out * d_in` row-major; `b` is `d_out`
    /// long or empty for no bias. The coefficients are supplied by the
    /// caller (e.g. a PCA fit computed out of band) rather than trained
    /// in-process — the wire protocol only exposes a setter for them.
    pub async fn prepend_linear_transform(&mut self, d_out: u32, has_bias: bool, a: Vec<f32>, b: Vec<f32>) -> Result<()> {
        if !matches!(self.family, Family::PreTransform { .. }) {
            return Err(Error::precondition("prepend_linear_transform is only valid on a PreTransform index"));
        }
        let d_in = self.dim;
        if a.len() as u32 != d_in * d_out {
            return Err(Error::precondition(format!(
                "transform matrix has {} entries, expected {d_in}*{d_out}",
                a.len()
            )));
        }
        let transform_id = next_id();
        let index_id = self.index_id;
        let a2 = a.clone();
        let b2 = b.clone();
        call_parallel(self.clients.clone(), move |c| {
            let a = a2.clone();
            let b = b2.clone();
            async move {
                c.create_linear_transform(transform_id, d_in, d_out, has_bias).await?;
                c.update_linear_transform(transform_id, a, b).await?;
                c.pretransform_prepend(index_id, transform_id).await
            }
        })
        .await?;
        self.dim = d_out;
        Ok(())
    }

    pub fn index_id(&self) -> u32 {
        self.index_id
    }

    pub fn dim(&self) -> u32 {
        self.dim
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn state(&self) -> IndexState {
        self.state
    }

    pub fn devices(&self) -> &[u32] {
        &self.devices
    }

    /// Total vectors currently held across all devices.
    pub fn ntotal(&self) -> u64 {
        self.idx_maps.iter().map(|m| m.len() as u64).sum()
    }

    /// Trains an IVF-family index on the host and pushes the result to
    /// every device (§4.5 "Train"). A no-op for families that need no
    /// training (`Flat`, `Int8Flat`) and an error if called twice.
    #[instrument(skip(self, x), fields(index_id = self.index_id, n))]
    pub async fn train(&mut self, n: u32, x: &[f32]) -> Result<()> {
        if matches!(self.family, Family::Flat | Family::Int8Flat) {
            return Ok(());
        }
        if self.state != IndexState::Configured {
            return Err(Error::precondition("train called outside the Configured state"));
        }
        let dim = self.dim as usize;
        let mut rng = StdRng::seed_from_u64(0xC0FF_EE);

        if self.family.is_ivf() && !matches!(self.family, Family::Sq) {
            let ivf = self
                .ivf
                .as_ref()
                .ok_or_else(|| Error::invariant("IVF family missing its IvfConfig"))?;
            let centroids = train_ivf_centroids(x, dim, ivf.nlist as usize, ivf.use_kmeans_pp, ivf.clustering, &mut rng);
            let coarse: Vec<Vec<f32>> = centroids.chunks(dim).map(|c| c.to_vec()).collect();
            let centroids_for_push = centroids.clone();
            call_parallel(self.clients.clone(), {
                let index_id = self.index_id;
                move |c| {
                    let centroids = centroids_for_push.clone();
                    async move { c.update_coarse_cent(index_id, centroids).await }
                }
            })
            .await?;

            match self.family {
                Family::IvfPq { m, bits } => {
                    let residuals = residuals_against(x, dim, n as usize, &coarse);
                    let niter = ivf.clustering.niter;
                    let pq_centroids = train_pq_centroids(&residuals, dim, m, bits, niter, &mut rng);
                    call_parallel(self.clients.clone(), {
                        let index_id = self.index_id;
                        move |c| {
                            let pq = pq_centroids.clone();
                            async move { c.update_pq_cent(index_id, pq).await }
                        }
                    })
                    .await?;
                }
                Family::IvfSq => {
                    let residuals = residuals_against(x, dim, n as usize, &coarse);
                    let (vmin, vdiff) = train_sq_range(&residuals, dim);
                    call_parallel(self.clients.clone(), {
                        let index_id = self.index_id;
                        move |c| {
                            let vmin = vmin.clone();
                            let vdiff = vdiff.clone();
                            async move { c.update_sq_trained_value(index_id, vmin, vdiff).await }
                        }
                    })
                    .await?;
                }
                _ => {}
            }
        } else if matches!(self.family, Family::Sq) {
            let (vmin, vdiff) = train_sq_range(x, dim);
            call_parallel(self.clients.clone(), {
                let index_id = self.index_id;
                move |c| {
                    let vmin = vmin.clone();
                    let vdiff = vdiff.clone();
                    async move { c.update_sq_trained_value(index_id, vmin, vdiff).await }
                }
            })
            .await?;
        }

        self.state = IndexState::Trained;
        info!(index_id = self.index_id, "index trained");
        Ok(())
    }

    /// Adds `n` vectors, dim-major f32, sharding round-robin across
    /// devices and recording the external id each lands under (§4.5 "Shard
    /// policy"). Returns the assigned external ids in input order.
    #[instrument(skip(self, x), fields(index_id = self.index_id, n))]
    pub async fn add(&mut self, n: u32, x: &[f32]) -> Result<Vec<u64>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        if !matches!(self.state, IndexState::Trained | IndexState::Populated) {
            return Err(Error::precondition("add called before the index is trained"));
        }
        let dim = self.dim as usize;
        let n = n as usize;

        let mut per_device_rows: Vec<Vec<usize>> = vec![Vec::new(); self.devices.len()];
        let mut external_ids = vec![0u64; n];
        for row in 0..n {
            let device_idx = self.next_device;
            self.next_device = (self.next_device + 1) % self.devices.len();
            let local_id = self.idx_maps[device_idx].len() as u64 + per_device_rows[device_idx].len() as u64;
            let external = ids::encode(device_idx, local_id);
            external_ids[row] = external;
            per_device_rows[device_idx].push(row);
        }

        let family = self.family;
        let index_id = self.index_id;
        let is_int8 = family.is_int8();
        let jobs: Vec<(DeviceClient, Vec<usize>, Vec<u64>)> = self
            .clients
            .iter()
            .cloned()
            .zip(per_device_rows.iter().cloned())
            .map(|(client, rows)| {
                let local_ids: Vec<u64> = rows.iter().map(|&row| ids::decode(external_ids[row]).1).collect();
                (client, rows, local_ids)
            })
            .collect();

        let command = family.add_command();
        let x = x.to_vec();
        call_parallel(jobs, move |(client, rows, local_ids)| {
            let x = x.clone();
            async move {
                if rows.is_empty() {
                    return Ok(0u64);
                }
                let mut vectors = Vec::with_capacity(rows.len() * dim);
                for &row in &rows {
                    vectors.extend_from_slice(&x[row * dim..(row + 1) * dim]);
                }
                let ids_payload = if matches!(family, Family::Flat) { None } else { Some(local_ids) };
                if is_int8 {
                    let quantized: Vec<i8> = vectors
                        .chunks(dim)
                        .flat_map(vsearch_common::vector::normalize_and_quantize_i8)
                        .collect();
                    client.add_i8(command, index_id, rows.len() as u32, quantized, ids_payload).await
                } else {
                    client.add_f16(command, index_id, rows.len() as u32, &vectors, ids_payload).await
                }
            }
        })
        .await?;

        for (device_idx, rows) in per_device_rows.iter().enumerate() {
            self.idx_maps[device_idx].extend(rows.iter().map(|&row| external_ids[row]));
        }

        self.state = IndexState::Populated;
        Ok(external_ids)
    }

    /// Broadcasts `queries` to every device, merges each device's top-k
    /// into one top-k per query using [`Metric::cmp_results`] (§4.5
    /// "Fan-out search"), and rewrites device-local labels to external
    /// ids. `k` is capped at [`MAX_K_SELECTION`] regardless of request.
    #[instrument(skip(self, queries), fields(index_id = self.index_id, n, k))]
    pub async fn search(&self, n: u32, k: u32, queries: &[f32], nprobe_override: Option<u32>) -> Result<(Vec<f32>, Vec<u64>)> {
        let k = k.min(MAX_K_SELECTION as u32);
        if n == 0 || k == 0 {
            return Ok((Vec::new(), Vec::new()));
        }
        let dim = self.dim as usize;
        let family = self.family;
        let is_int8 = family.is_int8();
        let index_id = self.index_id;
        let queries = queries.to_vec();

        let jobs: Vec<DeviceClient> = self.clients.clone();
        let per_device = call_parallel(jobs, move |client| {
            let queries = queries.clone();
            async move {
                if is_int8 {
                    let quantized: Vec<i8> = queries
                        .chunks(dim)
                        .flat_map(vsearch_common::vector::normalize_and_quantize_i8)
                        .collect();
                    client.search_i8(index_id, n, k, quantized, nprobe_override).await
                } else {
                    client.search_f16(index_id, n, k, &queries, nprobe_override).await
                }
            }
        })
        .await?;

        let mut out_distances = vec![0f32; n as usize * k as usize];
        let mut out_labels = vec![u64::MAX; n as usize * k as usize];
        for row in 0..n as usize {
            let mut candidates: Vec<(f32, u32, usize)> = Vec::new();
            for (device_idx, (distances, labels)) in per_device.iter().enumerate() {
                for slot in 0..k as usize {
                    let i = row * k as usize + slot;
                    let label = labels[i];
                    if label == u32::MAX {
                        continue;
                    }
                    candidates.push((distances[i], label, device_idx));
                }
            }
            candidates.sort_by(|a, b| self.metric.cmp_results((a.0, a.1), (b.0, b.1)));
            for (slot, (dist, label, device_idx)) in candidates.into_iter().take(k as usize).enumerate() {
                let external = if self.family.is_positional() {
                    self.idx_maps[device_idx]
                        .get(label as usize)
                        .unwrap_or(u64::MAX)
                } else {
                    ids::encode(device_idx, label as u64)
                };
                out_distances[row * k as usize + slot] = dist;
                out_labels[row * k as usize + slot] = external;
            }
        }
        Ok((out_distances, out_labels))
    }

    /// Removes every vector whose external id is in `target_ids` (§4.4
    /// "Remove"). Returns the total removed across all devices.
    #[instrument(skip(self, target_ids), fields(index_id = self.index_id))]
    pub async fn remove_ids(&mut self, target_ids: &[u64]) -> Result<u64> {
        self.remove_where(|id| target_ids.contains(&id)).await
    }

    /// Removes every vector whose external id lies in `[min, max)`.
    pub async fn remove_range(&mut self, min: u64, max: u64) -> Result<u64> {
        self.remove_where(|id| id >= min && id < max).await
    }

    async fn remove_where(&mut self, pred: impl Fn(u64) -> bool + Send + Sync + Clone + 'static) -> Result<u64> {
        let positional = self.family.is_positional();
        let index_id = self.index_id;
        let jobs: Vec<(DeviceClient, Vec<u64>)> = self
            .clients
            .iter()
            .cloned()
            .zip(self.idx_maps.iter())
            .map(|(client, map)| {
                let to_send: Vec<u64> = if positional {
                    map.as_slice()
                        .iter()
                        .enumerate()
                        .filter(|(_, &id)| pred(id))
                        .map(|(pos, _)| pos as u64)
                        .collect()
                } else {
                    map.as_slice()
                        .iter()
                        .filter(|&&id| pred(id))
                        .map(|&id| ids::decode(id).1)
                        .collect()
                };
                (client, to_send)
            })
            .collect();

        let removed = call_parallel(jobs, move |(client, to_send)| async move {
            if to_send.is_empty() {
                return Ok(0u64);
            }
            client.remove_ids(index_id, to_send).await
        })
        .await?;

        for map in &mut self.idx_maps {
            map.retain_not(&pred);
        }

        Ok(removed.iter().sum())
    }

    /// Resets every device's storage to empty, keeping training intact
    /// (§4.8: `reset` returns to `Trained`, not `Configured`).
    pub async fn reset(&mut self) -> Result<()> {
        let index_id = self.index_id;
        call_parallel(self.clients.clone(), move |c| async move { c.reset(index_id).await }).await?;
        for map in &mut self.idx_maps {
            map.clear();
        }
        self.state = IndexState::Trained;
        Ok(())
    }

    /// Pre-reserves device memory for `n` additional vectors, split evenly
    /// across devices.
    pub async fn reserve_mem(&self, n: u64) -> Result<()> {
        let index_id = self.index_id;
        let per_device = n / self.devices.len().max(1) as u64;
        call_parallel(self.clients.clone(), move |c| async move { c.reserve_mem(index_id, None, per_device).await }).await?;
        Ok(())
    }

    /// Reclaims unused device memory, returning the total bytes freed.
    pub async fn reclaim_mem(&self) -> Result<u64> {
        let index_id = self.index_id;
        let bytes = call_parallel(self.clients.clone(), move |c| async move { c.reclaim_mem(index_id, None).await }).await?;
        Ok(bytes.iter().sum())
    }

    /// Exports every device's raw base codes for offline reconstruction
    /// (§6: "An index may be exported via `GetBase` / `GetListCodes` and
    /// rehydrated on a CPU reference index for on-disk serialization").
    /// Valid for `Flat`, `Int8Flat`, and `Sq` — the single-list families.
    /// IVF-backed families (`IvfFlat`, `IvfPq`, `IvfSq`, `Int8IvfFlat`)
    /// export per-list instead, via [`Index::get_list_codes`].
    #[instrument(skip(self), fields(index_id = self.index_id))]
    pub async fn get_base(&self) -> Result<Vec<(u64, Vec<u8>, Option<Vec<u64>>)>> {
        let command = match self.family {
            Family::Flat => Command::IndexFlatGetBase,
            Family::Int8Flat => Command::IndexInt8FlatGetBase,
            Family::Sq => Command::IndexSQGetBase,
            _ => return Err(Error::precondition("get_base is only valid for Flat, Int8Flat, and Sq")),
        };
        let mut out = Vec::with_capacity(self.clients.len());
        for client in &self.clients {
            let resp = client.get_base(command, self.index_id).await?;
            out.push((resp.ntotal, resp.codes, resp.ids));
        }
        Ok(out)
    }

    /// Per-device vector count, the lightweight counterpart to
    /// [`Index::get_base`] that skips shipping the codes themselves.
    pub async fn get_base_size(&self) -> Result<Vec<u64>> {
        let command = match self.family {
            Family::Flat => Command::IndexFlatGetBaseSize,
            Family::Int8Flat => Command::IndexInt8FlatGetBaseSize,
            Family::Sq => Command::IndexSQGetBaseSize,
            _ => return Err(Error::precondition("get_base_size is only valid for Flat, Int8Flat, and Sq")),
        };
        let index_id = self.index_id;
        call_parallel(self.clients.clone(), move |c| async move { c.get_base_size(command, index_id).await }).await
    }

    /// Number of codes currently stored in one coarse list, per device
    /// (§4.4.2 "maintenance RPCs").
    pub async fn get_list_length(&self, list_id: u32) -> Result<Vec<u64>> {
        if !self.family.is_ivf() {
            return Err(Error::precondition("get_list_length is only valid for IVF families"));
        }
        let index_id = self.index_id;
        call_parallel(self.clients.clone(), move |c| async move { c.get_list_length(index_id, list_id).await }).await
    }

    /// Raw `(codes, ids)` of one coarse list, per device, already
    /// canonicalized to row-major order by the daemon
    /// (`materialize_row_major`, §4.4.2).
    pub async fn get_list_codes(&self, list_id: u32) -> Result<Vec<(Vec<u8>, Vec<u32>)>> {
        if !self.family.is_ivf() {
            return Err(Error::precondition("get_list_codes is only valid for IVF families"));
        }
        let index_id = self.index_id;
        call_parallel(self.clients.clone(), move |c| async move { c.get_list_codes(index_id, list_id).await }).await
    }

    /// Updates `nprobe` on every device, clamped the same way
    /// [`crate::autotune::clamp_nprobe`] would.
    pub async fn update_nprobe(&mut self, nprobe: u32) -> Result<()> {
        let ivf = self.ivf.as_ref().ok_or_else(|| Error::precondition("update_nprobe is only valid on IVF families"))?;
        let clamped = crate::autotune::clamp_nprobe(ivf.nlist, nprobe);
        let index_id = self.index_id;
        call_parallel(self.clients.clone(), move |c| async move { c.update_nprobe(index_id, clamped).await }).await?;
        if let Some(ivf) = &mut self.ivf {
            ivf.nprobe = clamped;
        }
        Ok(())
    }

    /// Tears down the index on every device and releases each device's
    /// session (§4.8: `destroy` → `Closed`).
    pub async fn destroy(mut self, registry: &SessionRegistry) -> Result<()> {
        for client in &self.clients {
            client.destroy_context().await?;
        }
        for &device in &self.devices {
            registry.release(device);
        }
        self.state = IndexState::Closed;
        Ok(())
    }
}

/// For each training row, subtracts its nearest coarse centroid, producing
/// the residual matrix PQ/SQ fine-stage training runs over (§4.4.2, §4.6).
fn residuals_against(x: &[f32], dim: usize, n: usize, centroids: &[Vec<f32>]) -> Vec<f32> {
    let mut out = Vec::with_capacity(n * dim);
    for i in 0..n {
        let row = &x[i * dim..(i + 1) * dim];
        let c = assign_nearest(row, centroids);
        for d in 0..dim {
            out.push(row[d] - centroids[c][d]);
        }
    }
    out
}
