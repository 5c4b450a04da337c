//! Daemon-side RPC dispatch: binds incoming wire commands (§6) to the
//! index kernels (§4.4), one [`DaemonContext`] per device.
//!
//! Dynamic dispatch across families is modeled as a tagged enum
//! ([`IndexHandle`]) implementing the shared [`IndexKernel`] capability
//! set, with family-specific RPCs (coarse/PQ/SQ table pushes, nprobe,
//! list export, transform prepend) handled by matching on the concrete
//! variant (§9 "Dynamic dispatch across index families").

use std::collections::HashMap;

use half::f16;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, instrument};
use vsearch_common::selector::{IdSelectorBatch, IdSelectorRange};
use vsearch_common::vector::f16_slice_to_f32;
use vsearch_common::wire::*;
use vsearch_common::{Error, Metric, Result};
use vsearch_transport::framing::{decode_payload, encode_payload, read_frame, write_frame};

use crate::kernels::flat::{FlatIndex, Int8FlatIndex};
use crate::kernels::ivf::{
    FlatIvfEncoder, Int8IvfFlatEncoder, IvfFlatIndex, IvfPqIndex, IvfSqIndex, PqEncoder, SqEncoder,
};
use crate::kernels::nn_reduction::{DimReductionModel, NnDimReduction};
use crate::kernels::pretransform::{LinearTransform, PreTransformIndex};
use crate::kernels::IndexKernel;
use crate::resources::DeviceResources;

/// Tagged union over every daemon index family (§9). Every variant
/// implements [`IndexKernel`]; family-specific maintenance RPCs match on
/// the variant directly.
pub enum IndexHandle {
    Flat(FlatIndex),
    Int8Flat(Int8FlatIndex),
    IvfFlat(IvfFlatIndex),
    IvfPq(IvfPqIndex),
    IvfSq(IvfSqIndex),
    Int8IvfFlat(crate::kernels::ivf::Int8IvfFlatIndex),
    PreTransform(PreTransformIndex),
}

impl IndexHandle {
    fn kernel(&self) -> &dyn IndexKernel {
        match self {
            IndexHandle::Flat(k) => k,
            IndexHandle::Int8Flat(k) => k,
            IndexHandle::IvfFlat(k) => k,
            IndexHandle::IvfPq(k) => k,
            IndexHandle::IvfSq(k) => k,
            IndexHandle::Int8IvfFlat(k) => k,
            IndexHandle::PreTransform(k) => k,
        }
    }

    fn kernel_mut(&mut self) -> &mut dyn IndexKernel {
        match self {
            IndexHandle::Flat(k) => k,
            IndexHandle::Int8Flat(k) => k,
            IndexHandle::IvfFlat(k) => k,
            IndexHandle::IvfPq(k) => k,
            IndexHandle::IvfSq(k) => k,
            IndexHandle::Int8IvfFlat(k) => k,
            IndexHandle::PreTransform(k) => k,
        }
    }

    fn is_int8(&self) -> bool {
        matches!(self, IndexHandle::Int8Flat(_) | IndexHandle::Int8IvfFlat(_))
    }
}

/// Decodes wire element bytes into host f32 at the point of kernel
/// dispatch: fp16 little-endian for the float family, signed bytes for
/// int8 (§9 "Mixed numeric precision").
fn decode_elements(bytes: &[u8], is_int8: bool) -> Vec<f32> {
    if is_int8 {
        bytemuck::cast_slice::<u8, i8>(bytes)
            .iter()
            .map(|&v| v as f32)
            .collect()
    } else {
        let f16s: &[f16] = bytemuck::cast_slice(bytes);
        f16_slice_to_f32(f16s)
    }
}

/// Per-device daemon state: the resources shared by every index on this
/// device, plus the index/transform/model registries keyed by the ids the
/// host assigns on `Create*`.
pub struct DaemonContext {
    pub resources: DeviceResources,
    indexes: HashMap<u32, IndexHandle>,
    transforms: HashMap<u32, LinearTransform>,
    nn_models: HashMap<u32, NnDimReduction>,
}

impl DaemonContext {
    pub fn new(resources: DeviceResources) -> Self {
        Self {
            resources,
            indexes: HashMap::new(),
            transforms: HashMap::new(),
            nn_models: HashMap::new(),
        }
    }

    fn get(&self, id: u32) -> Result<&IndexHandle> {
        self.indexes
            .get(&id)
            .ok_or_else(|| Error::precondition(format!("unknown index id {id}")))
    }

    fn get_mut(&mut self, id: u32) -> Result<&mut IndexHandle> {
        self.indexes
            .get_mut(&id)
            .ok_or_else(|| Error::precondition(format!("unknown index id {id}")))
    }

    /// Handles one already-decoded command. Returns the response payload
    /// bytes (already bincode-encoded) ready to go back on the wire.
    #[instrument(skip(self, payload), fields(device = self.resources.device()))]
    pub fn handle(&mut self, command: Command, payload: &[u8]) -> Result<Vec<u8>> {
        debug!(?command, bytes = payload.len(), "dispatching rpc");
        match command {
            Command::CreateContext => {
                let _req: CreateContextRequest = decode_payload(payload)?;
                encode_payload(&SimpleResponse::ok())
            }
            Command::DestroyContext => {
                let _req: DestroyContextRequest = decode_payload(payload)?;
                encode_payload(&SimpleResponse::ok())
            }
            Command::TestDataIntegrity => {
                let req: TestDataIntegrityRequest = decode_payload(payload)?;
                encode_payload(&TestDataIntegrityResponse {
                    status: StatusHeader::ok(),
                    payload: req.payload,
                })
            }

            Command::CreateIndexFlat => {
                let req: CreateIndexFlatRequest = decode_payload(payload)?;
                self.indexes.insert(
                    req.index_id,
                    IndexHandle::Flat(FlatIndex::new(req.dim, req.metric)),
                );
                encode_payload(&CreateIndexResponse {
                    status: StatusHeader::ok(),
                })
            }
            Command::CreateIndexInt8Flat => {
                let req: CreateIndexFlatRequest = decode_payload(payload)?;
                self.indexes.insert(
                    req.index_id,
                    IndexHandle::Int8Flat(Int8FlatIndex::new(req.dim, req.metric)),
                );
                encode_payload(&CreateIndexResponse {
                    status: StatusHeader::ok(),
                })
            }
            Command::CreateIndexIVFFlat => {
                let req: CreateIndexIvfRequest = decode_payload(payload)?;
                self.indexes.insert(
                    req.index_id,
                    IndexHandle::IvfFlat(IvfFlatIndex::new(
                        req.dim,
                        req.metric,
                        req.nlist,
                        req.nprobe,
                        FlatIvfEncoder::new(req.dim),
                    )),
                );
                encode_payload(&CreateIndexResponse {
                    status: StatusHeader::ok(),
                })
            }
            Command::CreateIndexInt8IVFFlat => {
                let req: CreateIndexIvfRequest = decode_payload(payload)?;
                self.indexes.insert(
                    req.index_id,
                    IndexHandle::Int8IvfFlat(crate::kernels::ivf::IvfIndex::new(
                        req.dim,
                        req.metric,
                        req.nlist,
                        req.nprobe,
                        Int8IvfFlatEncoder::new(req.dim, matches!(req.metric, Metric::Cosine)),
                    )),
                );
                encode_payload(&CreateIndexResponse {
                    status: StatusHeader::ok(),
                })
            }
            Command::CreateIndexIVFPQ => {
                let req: CreateIndexIvfRequest = decode_payload(payload)?;
                let (m, bits) = match req.kind {
                    IvfKind::Pq { m, bits } => (m, bits),
                    _ => return Err(Error::precondition("IVF-PQ create requires Pq kind")),
                };
                self.indexes.insert(
                    req.index_id,
                    IndexHandle::IvfPq(IvfPqIndex::new(
                        req.dim,
                        req.metric,
                        req.nlist,
                        req.nprobe,
                        PqEncoder::new(req.dim, m, bits),
                    )),
                );
                encode_payload(&CreateIndexResponse {
                    status: StatusHeader::ok(),
                })
            }
            Command::CreateIndexIVFSQ => {
                let req: CreateIndexIvfRequest = decode_payload(payload)?;
                self.indexes.insert(
                    req.index_id,
                    IndexHandle::IvfSq(IvfSqIndex::new(
                        req.dim,
                        req.metric,
                        req.nlist,
                        req.nprobe,
                        SqEncoder::new(req.dim, true),
                    )),
                );
                encode_payload(&CreateIndexResponse {
                    status: StatusHeader::ok(),
                })
            }
            Command::CreateIndexSQ => {
                // Flat SQ: an IVF-SQ with a single coarse list at the
                // origin, so the fine-stage scalar quantizer is the only
                // thing that matters (§1 index family list).
                let req: CreateIndexFlatRequest = decode_payload(payload)?;
                let mut idx = IvfSqIndex::new(req.dim, req.metric, 1, 1, SqEncoder::new(req.dim, false));
                idx.update_coarse_cent(vec![0.0; req.dim as usize])?;
                self.indexes.insert(req.index_id, IndexHandle::IvfSq(idx));
                encode_payload(&CreateIndexResponse {
                    status: StatusHeader::ok(),
                })
            }

            Command::IndexFlatAdd
            | Command::IndexInt8FlatAdd
            | Command::IndexIVFFlatAdd
            | Command::IndexInt8IVFFlatAdd
            | Command::IndexIVFPQAdd
            | Command::IndexIVFSQAdd
            | Command::IndexSQAdd => self.handle_add(payload),

            Command::IndexSearch | Command::IndexInt8Search => self.handle_search(payload),

            Command::IndexFlatGetBase
            | Command::IndexInt8FlatGetBase
            | Command::IndexSQGetBase
            | Command::IndexSQFastGetBase => self.handle_get_base(payload),
            Command::IndexFlatGetBaseSize
            | Command::IndexInt8FlatGetBaseSize
            | Command::IndexSQGetBaseSize => {
                let req: GetBaseSizeRequest = decode_payload(payload)?;
                let ntotal = self.get(req.index_id)?.kernel().ntotal();
                encode_payload(&GetBaseSizeResponse {
                    status: StatusHeader::ok(),
                    ntotal,
                })
            }

            Command::IndexReset => {
                let req: ResetRequest = decode_payload(payload)?;
                self.get_mut(req.index_id)?.kernel_mut().reset()?;
                encode_payload(&SimpleResponse::ok())
            }
            Command::IndexRemoveIds => {
                let req: RemoveIdsRequest = decode_payload(payload)?;
                let sel = IdSelectorBatch::new(&req.ids);
                let n_removed = self.get_mut(req.index_id)?.kernel_mut().remove_ids(&sel)?;
                encode_payload(&RemoveResponse {
                    status: StatusHeader::ok(),
                    n_removed,
                })
            }
            Command::IndexRemoveRangeIds => {
                let req: RemoveRangeIdsRequest = decode_payload(payload)?;
                let sel = IdSelectorRange::new(req.min, req.max);
                let n_removed = self.get_mut(req.index_id)?.kernel_mut().remove_ids(&sel)?;
                encode_payload(&RemoveResponse {
                    status: StatusHeader::ok(),
                    n_removed,
                })
            }
            Command::IndexReserveMem => {
                let req: ReserveMemRequest = decode_payload(payload)?;
                self.reserve_mem(req.index_id, req.list_id, req.n)?;
                encode_payload(&SimpleResponse::ok())
            }
            Command::IndexReclaimMem => {
                let req: ReclaimMemRequest = decode_payload(payload)?;
                let bytes_reclaimed = self.reclaim_mem(req.index_id, req.list_id)?;
                encode_payload(&ReclaimMemResponse {
                    status: StatusHeader::ok(),
                    bytes_reclaimed,
                })
            }

            Command::IndexIVFUpdateCoarseCent => {
                let req: UpdateCoarseCentRequest = decode_payload(payload)?;
                self.update_coarse_cent(req.index_id, req.centroids)?;
                encode_payload(&SimpleResponse::ok())
            }
            Command::IndexIVFUpdateNprobe => {
                let req: UpdateNprobeRequest = decode_payload(payload)?;
                self.update_nprobe(req.index_id, req.nprobe)?;
                encode_payload(&SimpleResponse::ok())
            }
            Command::IndexIVFGetListLength => {
                let req: GetListLengthRequest = decode_payload(payload)?;
                let length = self.get_list_length(req.index_id, req.list_id)?;
                encode_payload(&GetListLengthResponse {
                    status: StatusHeader::ok(),
                    length,
                })
            }
            Command::IndexIVFGetListCodes | Command::IndexIVFFastGetListCodes => {
                let req: GetListCodesRequest = decode_payload(payload)?;
                let (codes, ids) = self.get_list_codes(req.index_id, req.list_id)?;
                encode_payload(&GetListCodesResponse {
                    status: StatusHeader::ok(),
                    codes,
                    ids,
                })
            }
            Command::IndexIVFPQUpdatePQCent => {
                let req: UpdatePqCentRequest = decode_payload(payload)?;
                match self.get_mut(req.index_id)? {
                    IndexHandle::IvfPq(idx) => idx.encoder_mut().update_pq_cent(req.centroids)?,
                    _ => return Err(Error::precondition("index is not IVF-PQ")),
                }
                encode_payload(&SimpleResponse::ok())
            }
            Command::IndexSQUpdateTrainedValue => {
                let req: UpdateSqTrainedValueRequest = decode_payload(payload)?;
                match self.get_mut(req.index_id)? {
                    IndexHandle::IvfSq(idx) => {
                        idx.encoder_mut().update_sq_trained_value(req.vmin, req.vdiff)?
                    }
                    _ => return Err(Error::precondition("index is not SQ/IVF-SQ")),
                }
                encode_payload(&SimpleResponse::ok())
            }

            Command::CreateLinearTransform => {
                let req: CreateLinearTransformRequest = decode_payload(payload)?;
                self.transforms.insert(
                    req.transform_id,
                    LinearTransform::new(req.d_in, req.d_out, req.has_bias),
                );
                encode_payload(&SimpleResponse::ok())
            }
            Command::DestroyLinearTransform => {
                let req: DestroyLinearTransformRequest = decode_payload(payload)?;
                self.transforms.remove(&req.transform_id);
                encode_payload(&SimpleResponse::ok())
            }
            Command::LinearTransformUpdateTrainedValue => {
                let req: LinearTransformUpdateTrainedValueRequest = decode_payload(payload)?;
                let t = self
                    .transforms
                    .get_mut(&req.transform_id)
                    .ok_or_else(|| Error::precondition("unknown transform id"))?;
                t.update_trained_value(req.a, req.b)?;
                encode_payload(&SimpleResponse::ok())
            }
            Command::CreateIndexPreTransform => {
                let req: CreateIndexPreTransformRequest = decode_payload(payload)?;
                let inner = self
                    .indexes
                    .remove(&req.inner_index_id)
                    .ok_or_else(|| Error::precondition("unknown inner index id"))?;
                let dim = inner.kernel().dim();
                self.indexes.insert(
                    req.index_id,
                    IndexHandle::PreTransform(PreTransformIndex::new(
                        dim,
                        Box::new(IndexKernelBox(inner)),
                    )),
                );
                encode_payload(&SimpleResponse::ok())
            }
            Command::IndexPreTransformPrepend => {
                let req: IndexPreTransformPrependRequest = decode_payload(payload)?;
                let transform = self
                    .transforms
                    .remove(&req.transform_id)
                    .ok_or_else(|| Error::precondition("unknown transform id"))?;
                match self.get_mut(req.index_id)? {
                    IndexHandle::PreTransform(idx) => idx.prepend(transform)?,
                    _ => return Err(Error::precondition("index is not PreTransform")),
                }
                encode_payload(&SimpleResponse::ok())
            }

            Command::CreateNNDimReduction => {
                let req: CreateNnDimReductionRequest = decode_payload(payload)?;
                let model = TruncateOrPadModel {
                    in_dim: req.in_dim,
                    out_dim: req.out_dim,
                    batch_size: req.batch_size,
                };
                self.nn_models
                    .insert(req.index_id, NnDimReduction::new(Box::new(model)));
                encode_payload(&SimpleResponse::ok())
            }
            Command::InferNNDimReduction => {
                let req: InferNnDimReductionRequest = decode_payload(payload)?;
                let model = self
                    .nn_models
                    .get(&req.index_id)
                    .ok_or_else(|| Error::precondition("unknown NN dim reduction model id"))?;
                let output = model.infer(req.n, &req.input)?;
                encode_payload(&InferNnDimReductionResponse {
                    status: StatusHeader::ok(),
                    output,
                })
            }
            Command::DestroyNNDimReduction => {
                let req: DestroyNnDimReductionRequest = decode_payload(payload)?;
                self.nn_models.remove(&req.index_id);
                encode_payload(&SimpleResponse::ok())
            }
        }
    }

    fn handle_add(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let req: AddRequest = decode_payload(payload)?;
        let handle = self.get_mut(req.index_id)?;
        let is_int8 = handle.is_int8();
        let x = decode_elements(&req.vectors, is_int8);
        let ntotal = handle.kernel_mut().add(req.n, &x, req.ids.as_deref())?;
        encode_payload(&AddResponse {
            status: StatusHeader::ok(),
            ntotal,
        })
    }

    fn handle_search(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let req: SearchRequest = decode_payload(payload)?;
        let handle = self.get_mut(req.index_id)?;
        if let Some(nprobe) = req.nprobe_override {
            Self::set_nprobe(handle, nprobe);
        }
        let is_int8 = handle.is_int8();
        let x = decode_elements(&req.queries, is_int8);
        let out = handle.kernel().search(req.n, &x, req.k)?;
        encode_payload(&SearchResponse {
            status: StatusHeader::ok(),
            distances: out.distances.iter().map(|v| v.to_bits()).collect(),
            labels: out.labels,
        })
    }

    fn set_nprobe(handle: &mut IndexHandle, nprobe: u32) {
        match handle {
            IndexHandle::IvfFlat(i) => i.update_nprobe(nprobe),
            IndexHandle::IvfPq(i) => i.update_nprobe(nprobe),
            IndexHandle::IvfSq(i) => i.update_nprobe(nprobe),
            IndexHandle::Int8IvfFlat(i) => i.update_nprobe(nprobe),
            _ => {}
        }
    }

    fn handle_get_base(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let req: GetBaseRequest = decode_payload(payload)?;
        let handle = self.get(req.index_id)?;
        let (codes, ids) = match handle {
            IndexHandle::Flat(idx) => (bytemuck::cast_slice(idx.base_codes()).to_vec(), None),
            IndexHandle::Int8Flat(idx) => {
                let (c, i) = idx.base_codes_and_ids();
                (bytemuck::cast_slice(c).to_vec(), Some(i.to_vec()))
            }
            IndexHandle::IvfSq(idx) if idx.nlist() == 1 => {
                let (codes, ids) = idx.get_list_codes(0)?;
                (
                    codes.to_vec(),
                    Some(ids.iter().map(|&i| i as u64).collect()),
                )
            }
            _ => return Err(Error::precondition("GetBase unsupported for this family")),
        };
        encode_payload(&GetBaseResponse {
            status: StatusHeader::ok(),
            dim: handle.kernel().dim(),
            ntotal: handle.kernel().ntotal(),
            codes,
            ids,
        })
    }

    fn reserve_mem(&mut self, index_id: u32, list_id: Option<u32>, n: u64) -> Result<()> {
        match (self.get_mut(index_id)?, list_id) {
            (IndexHandle::IvfFlat(idx), Some(l)) => idx.reserve_list(l, n),
            (IndexHandle::IvfPq(idx), Some(l)) => idx.reserve_list(l, n),
            (IndexHandle::IvfSq(idx), Some(l)) => idx.reserve_list(l, n),
            (IndexHandle::Int8IvfFlat(idx), Some(l)) => idx.reserve_list(l, n),
            (handle, _) => handle.kernel_mut().reserve_memory(n),
        }
    }

    fn reclaim_mem(&mut self, index_id: u32, list_id: Option<u32>) -> Result<u64> {
        match (self.get_mut(index_id)?, list_id) {
            (IndexHandle::IvfFlat(idx), Some(l)) => idx.reclaim_list(l),
            (IndexHandle::IvfPq(idx), Some(l)) => idx.reclaim_list(l),
            (IndexHandle::IvfSq(idx), Some(l)) => idx.reclaim_list(l),
            (IndexHandle::Int8IvfFlat(idx), Some(l)) => idx.reclaim_list(l),
            (handle, _) => handle.kernel_mut().reclaim_memory(),
        }
    }

    fn update_coarse_cent(&mut self, index_id: u32, centroids: Vec<f32>) -> Result<()> {
        match self.get_mut(index_id)? {
            IndexHandle::IvfFlat(idx) => idx.update_coarse_cent(centroids),
            IndexHandle::IvfPq(idx) => idx.update_coarse_cent(centroids),
            IndexHandle::IvfSq(idx) => idx.update_coarse_cent(centroids),
            IndexHandle::Int8IvfFlat(idx) => idx.update_coarse_cent(centroids),
            _ => Err(Error::precondition("index is not IVF")),
        }
    }

    fn update_nprobe(&mut self, index_id: u32, nprobe: u32) -> Result<()> {
        Self::set_nprobe(self.get_mut(index_id)?, nprobe);
        Ok(())
    }

    fn get_list_length(&self, index_id: u32, list_id: u32) -> Result<u64> {
        match self.get(index_id)? {
            IndexHandle::IvfFlat(idx) => idx.get_list_length(list_id),
            IndexHandle::IvfPq(idx) => idx.get_list_length(list_id),
            IndexHandle::IvfSq(idx) => idx.get_list_length(list_id),
            IndexHandle::Int8IvfFlat(idx) => idx.get_list_length(list_id),
            _ => Err(Error::precondition("index is not IVF")),
        }
    }

    fn get_list_codes(&self, index_id: u32, list_id: u32) -> Result<(Vec<u8>, Vec<u32>)> {
        match self.get(index_id)? {
            IndexHandle::IvfFlat(idx) => {
                let (c, i) = idx.get_list_codes(list_id)?;
                Ok((c.to_vec(), i.to_vec()))
            }
            IndexHandle::IvfPq(idx) => {
                let (c, i) = idx.get_list_codes(list_id)?;
                Ok((c.to_vec(), i.to_vec()))
            }
            IndexHandle::IvfSq(idx) => {
                let (c, i) = idx.get_list_codes(list_id)?;
                Ok((c.to_vec(), i.to_vec()))
            }
            IndexHandle::Int8IvfFlat(idx) => {
                let (c, i) = idx.get_list_codes(list_id)?;
                Ok((c.to_vec(), i.to_vec()))
            }
            _ => Err(Error::precondition("index is not IVF")),
        }
    }
}

/// Stand-in dim-reduction model for the generic dispatcher: the wire
/// protocol only carries `in_dim`/`out_dim`/`batch_size`, never trained
/// weights, so there is no way to reconstruct the real model from an RPC
/// alone (§4.4.4 names this the one external-collaborator kernel). This
/// copies the leading `min(in_dim, out_dim)` components and zero-pads or
/// truncates the rest, which at least exercises the batching/padding
/// contract end to end; a deployment wires in its own
/// [`DimReductionModel`] in place of this one.
struct TruncateOrPadModel {
    in_dim: u32,
    out_dim: u32,
    batch_size: u32,
}

impl DimReductionModel for TruncateOrPadModel {
    fn batch_size(&self) -> u32 {
        self.batch_size
    }
    fn in_dim(&self) -> u32 {
        self.in_dim
    }
    fn out_dim(&self) -> u32 {
        self.out_dim
    }
    fn infer_batch(&self, input: &[f32], output: &mut [f32]) {
        let di = self.in_dim as usize;
        let do_ = self.out_dim as usize;
        let copy = di.min(do_);
        for row in 0..self.batch_size as usize {
            output[row * do_..row * do_ + copy].copy_from_slice(&input[row * di..row * di + copy]);
        }
    }
}

/// Adapts an owned [`IndexHandle`] into a `Box<dyn IndexKernel>` so it can
/// become the inner index of a [`PreTransformIndex`].
struct IndexKernelBox(IndexHandle);

impl IndexKernel for IndexKernelBox {
    fn dim(&self) -> u32 {
        self.0.kernel().dim()
    }
    fn metric(&self) -> Metric {
        self.0.kernel().metric()
    }
    fn ntotal(&self) -> u64 {
        self.0.kernel().ntotal()
    }
    fn is_trained(&self) -> bool {
        self.0.kernel().is_trained()
    }
    fn train(&mut self, n: u32, x: &[f32]) -> Result<()> {
        self.0.kernel_mut().train(n, x)
    }
    fn add(&mut self, n: u32, x: &[f32], ids: Option<&[u64]>) -> Result<u64> {
        self.0.kernel_mut().add(n, x, ids)
    }
    fn search(&self, n: u32, x: &[f32], k: u32) -> Result<crate::kernels::SearchOutput> {
        self.0.kernel().search(n, x, k)
    }
    fn remove_ids(&mut self, selector: &dyn vsearch_common::selector::IdSelector) -> Result<u64> {
        self.0.kernel_mut().remove_ids(selector)
    }
    fn reset(&mut self) -> Result<()> {
        self.0.kernel_mut().reset()
    }
    fn reserve_memory(&mut self, n: u64) -> Result<()> {
        self.0.kernel_mut().reserve_memory(n)
    }
    fn reclaim_memory(&mut self) -> Result<u64> {
        self.0.kernel_mut().reclaim_memory()
    }
}

/// Serves one session's peer side: reads frames, dispatches, writes the
/// response, until the stream closes. Used by daemon binaries and by
/// loopback-transport tests to stand in for a real daemon process.
pub async fn serve_session<S: AsyncRead + AsyncWrite + Unpin>(
    ctx: &mut DaemonContext,
    stream: &mut S,
) -> Result<()> {
    loop {
        let (command_tag, payload) = match read_frame(stream).await {
            Ok(v) => v,
            Err(_) => return Ok(()), // peer closed the connection
        };
        let command = Command::from_u32(command_tag)
            .ok_or_else(|| Error::transport(format!("unknown command tag {command_tag}")))?;
        let response = match ctx.handle(command, &payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, ?command, "rpc handler failed");
                encode_payload(&SimpleResponse {
                    status: StatusHeader::error(e.to_string()),
                })?
            }
        };
        write_frame(stream, command_tag, &response).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::DeviceResources;
    use tokio::io::duplex;
    use vsearch_transport::framing::{decode_payload as dp, encode_payload as ep};

    fn ctx() -> DaemonContext {
        DaemonContext::new(DeviceResources::new(0, 1 << 20, 2))
    }

    #[tokio::test]
    async fn flat_create_add_search_roundtrips_over_frames() {
        let (mut client, mut daemon) = duplex(1 << 20);
        let mut context = ctx();
        let server = tokio::spawn(async move {
            serve_session(&mut context, &mut daemon).await.unwrap();
        });

        let create = CreateIndexFlatRequest {
            index_id: 1,
            dim: 4,
            metric: Metric::L2,
        };
        write_frame(&mut client, Command::CreateIndexFlat.to_u32(), &ep(&create).unwrap())
            .await
            .unwrap();
        let (_, resp) = read_frame(&mut client).await.unwrap();
        let _resp: CreateIndexResponse = dp(&resp).unwrap();

        let vectors: Vec<f16> = [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0]
            .iter()
            .map(|&v| f16::from_f32(v))
            .collect();
        let add = AddRequest {
            index_id: 1,
            n: 2,
            vectors: bytemuck::cast_slice(&vectors).to_vec(),
            ids: None,
        };
        write_frame(&mut client, Command::IndexFlatAdd.to_u32(), &ep(&add).unwrap())
            .await
            .unwrap();
        let (_, resp) = read_frame(&mut client).await.unwrap();
        let add_resp: AddResponse = dp(&resp).unwrap();
        assert_eq!(add_resp.ntotal, 2);

        let q: Vec<f16> = [1.0, 0.0, 0.0, 0.0].iter().map(|&v| f16::from_f32(v)).collect();
        let search = SearchRequest {
            index_id: 1,
            n: 1,
            k: 1,
            queries: bytemuck::cast_slice(&q).to_vec(),
            nprobe_override: None,
        };
        write_frame(&mut client, Command::IndexSearch.to_u32(), &ep(&search).unwrap())
            .await
            .unwrap();
        let (_, resp) = read_frame(&mut client).await.unwrap();
        let search_resp: SearchResponse = dp(&resp).unwrap();
        assert_eq!(search_resp.labels[0], 0);

        drop(client);
        server.await.unwrap();
    }
}
