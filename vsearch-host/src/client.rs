//! Typed RPC surface over one device session (§6 "External Interfaces").
//! `facade.rs` fans a logical call out over one [`DeviceClient`] per
//! configured device; this module just knows how to shape each request and
//! unwrap each response's [`StatusHeader`].

use std::sync::Arc;

use vsearch_common::vector::{f16, f32_slice_to_f16};
use vsearch_common::wire::*;
use vsearch_common::{Error, Result};
use vsearch_transport::session::Session;

/// Turns a non-`ok` [`StatusHeader`] into an [`Error::Device`], carrying the
/// daemon's own message through unchanged.
fn check(status: StatusHeader) -> Result<()> {
    if status.ok {
        Ok(())
    } else {
        Err(Error::device(status.message.unwrap_or_default()))
    }
}

/// One device's RPC surface, bound to its session. Cheap to clone (the
/// session itself is reference counted); every method borrows `&self`.
#[derive(Clone)]
pub struct DeviceClient {
    session: Arc<Session>,
}

impl DeviceClient {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    pub fn device(&self) -> u32 {
        self.session.device()
    }

    pub async fn create_context(&self) -> Result<()> {
        let req = CreateContextRequest {
            device: self.device(),
        };
        let resp: SimpleResponse = self.session.send_and_receive(Command::CreateContext, &req).await?;
        check(resp.status)
    }

    pub async fn destroy_context(&self) -> Result<()> {
        let resp: SimpleResponse = self
            .session
            .send_and_receive(Command::DestroyContext, &DestroyContextRequest {})
            .await?;
        check(resp.status)
    }

    pub async fn test_data_integrity(&self, payload: Vec<u8>) -> Result<Vec<u8>> {
        let resp: TestDataIntegrityResponse = self
            .session
            .send_and_receive(Command::TestDataIntegrity, &TestDataIntegrityRequest { payload })
            .await?;
        check(resp.status.clone())?;
        Ok(resp.payload)
    }

    pub async fn create_index_flat(&self, index_id: u32, dim: u32, metric: vsearch_common::Metric) -> Result<()> {
        let req = CreateIndexFlatRequest { index_id, dim, metric };
        let resp: CreateIndexResponse = self.session.send_and_receive(Command::CreateIndexFlat, &req).await?;
        check(resp.status)
    }

    pub async fn create_index_int8_flat(&self, index_id: u32, dim: u32, metric: vsearch_common::Metric) -> Result<()> {
        let req = CreateIndexFlatRequest { index_id, dim, metric };
        let resp: CreateIndexResponse = self
            .session
            .send_and_receive(Command::CreateIndexInt8Flat, &req)
            .await?;
        check(resp.status)
    }

    pub async fn create_index_sq(&self, index_id: u32, dim: u32, metric: vsearch_common::Metric) -> Result<()> {
        let req = CreateIndexFlatRequest { index_id, dim, metric };
        let resp: CreateIndexResponse = self.session.send_and_receive(Command::CreateIndexSQ, &req).await?;
        check(resp.status)
    }

    /// Shared by IVF-Flat, IVF-PQ, IVF-SQ, and Int8-IVF-Flat; `command`
    /// picks the family's create tag and `kind` its `IvfKind` payload.
    pub async fn create_index_ivf(
        &self,
        command: Command,
        index_id: u32,
        dim: u32,
        metric: vsearch_common::Metric,
        nlist: u32,
        nprobe: u32,
        kind: IvfKind,
    ) -> Result<()> {
        let req = CreateIndexIvfRequest {
            index_id,
            dim,
            metric,
            nlist,
            nprobe,
            kind,
        };
        let resp: CreateIndexResponse = self.session.send_and_receive(command, &req).await?;
        check(resp.status)
    }

    pub async fn create_pretransform(&self, index_id: u32, inner_index_id: u32) -> Result<()> {
        let req = CreateIndexPreTransformRequest {
            index_id,
            inner_index_id,
        };
        let resp: CreateIndexResponse = self
            .session
            .send_and_receive(Command::CreateIndexPreTransform, &req)
            .await?;
        check(resp.status)
    }

    pub async fn create_linear_transform(&self, transform_id: u32, d_in: u32, d_out: u32, has_bias: bool) -> Result<()> {
        let req = CreateLinearTransformRequest {
            transform_id,
            d_in,
            d_out,
            has_bias,
        };
        let resp: SimpleResponse = self.session.send_and_receive(Command::CreateLinearTransform, &req).await?;
        check(resp.status)
    }

    pub async fn destroy_linear_transform(&self, transform_id: u32) -> Result<()> {
        let resp: SimpleResponse = self
            .session
            .send_and_receive(
                Command::DestroyLinearTransform,
                &DestroyLinearTransformRequest { transform_id },
            )
            .await?;
        check(resp.status)
    }

    pub async fn update_linear_transform(&self, transform_id: u32, a: Vec<f32>, b: Vec<f32>) -> Result<()> {
        let req = LinearTransformUpdateTrainedValueRequest { transform_id, a, b };
        let resp: SimpleResponse = self
            .session
            .send_and_receive(Command::LinearTransformUpdateTrainedValue, &req)
            .await?;
        check(resp.status)
    }

    pub async fn pretransform_prepend(&self, index_id: u32, transform_id: u32) -> Result<()> {
        let req = IndexPreTransformPrependRequest { index_id, transform_id };
        let resp: SimpleResponse = self.session.send_and_receive(Command::IndexPreTransformPrepend, &req).await?;
        check(resp.status)
    }

    pub async fn create_nn_dim_reduction(&self, index_id: u32, in_dim: u32, out_dim: u32, batch_size: u32) -> Result<()> {
        let req = CreateNnDimReductionRequest {
            index_id,
            in_dim,
            out_dim,
            batch_size,
        };
        let resp: SimpleResponse = self.session.send_and_receive(Command::CreateNNDimReduction, &req).await?;
        check(resp.status)
    }

    pub async fn infer_nn_dim_reduction(&self, index_id: u32, n: u32, input: Vec<f32>) -> Result<Vec<f32>> {
        let req = InferNnDimReductionRequest { index_id, n, input };
        let resp: InferNnDimReductionResponse = self.session.send_and_receive(Command::InferNNDimReduction, &req).await?;
        check(resp.status.clone())?;
        Ok(resp.output)
    }

    pub async fn destroy_nn_dim_reduction(&self, index_id: u32) -> Result<()> {
        let resp: SimpleResponse = self
            .session
            .send_and_receive(
                Command::DestroyNNDimReduction,
                &DestroyNnDimReductionRequest { index_id },
            )
            .await?;
        check(resp.status)
    }

    /// Adds `n` vectors of `dim` elements, f32 on the host, encoded to fp16
    /// wire bytes before the request is sent. `command` picks the family's
    /// add tag; `ids` is `Some` for IVF families, `None` for Flat (which
    /// assigns ids implicitly by position).
    pub async fn add_f16(&self, command: Command, index_id: u32, n: u32, vectors: &[f32], ids: Option<Vec<u64>>) -> Result<u64> {
        let encoded = f32_slice_to_f16(vectors);
        let bytes = bytemuck::cast_slice::<f16, u8>(&encoded).to_vec();
        let req = AddRequest {
            index_id,
            n,
            vectors: bytes,
            ids,
        };
        let resp: AddResponse = self.session.send_and_receive(command, &req).await?;
        check(resp.status)?;
        Ok(resp.ntotal)
    }

    /// Int8-family add: `vectors` are already-quantized signed bytes,
    /// `n * dim` wide.
    pub async fn add_i8(&self, command: Command, index_id: u32, n: u32, vectors: Vec<i8>, ids: Option<Vec<u64>>) -> Result<u64> {
        let bytes = bytemuck::cast_slice::<i8, u8>(&vectors).to_vec();
        let req = AddRequest {
            index_id,
            n,
            vectors: bytes,
            ids,
        };
        let resp: AddResponse = self.session.send_and_receive(command, &req).await?;
        check(resp.status)?;
        Ok(resp.ntotal)
    }

    /// Issues a search with f32 queries (encoded to fp16 wire bytes) and
    /// returns `(distances, labels)`, each `n * k` row-major, distances
    /// already decoded back to f32.
    pub async fn search_f16(
        &self,
        index_id: u32,
        n: u32,
        k: u32,
        queries: &[f32],
        nprobe_override: Option<u32>,
    ) -> Result<(Vec<f32>, Vec<u32>)> {
        let encoded = f32_slice_to_f16(queries);
        let bytes = bytemuck::cast_slice::<f16, u8>(&encoded).to_vec();
        let req = SearchRequest {
            index_id,
            n,
            k,
            queries: bytes,
            nprobe_override,
        };
        let resp: SearchResponse = self.session.send_and_receive(Command::IndexSearch, &req).await?;
        check(resp.status)?;
        let distances = resp.distances.iter().map(|&bits| f16::from_bits(bits).to_f32()).collect();
        Ok((distances, resp.labels))
    }

    /// Int8-family search: queries are already-quantized signed bytes.
    pub async fn search_i8(
        &self,
        index_id: u32,
        n: u32,
        k: u32,
        queries: Vec<i8>,
        nprobe_override: Option<u32>,
    ) -> Result<(Vec<f32>, Vec<u32>)> {
        let bytes = bytemuck::cast_slice::<i8, u8>(&queries).to_vec();
        let req = SearchRequest {
            index_id,
            n,
            k,
            queries: bytes,
            nprobe_override,
        };
        let resp: SearchResponse = self.session.send_and_receive(Command::IndexInt8Search, &req).await?;
        check(resp.status)?;
        let distances = resp.distances.iter().map(|&bits| f16::from_bits(bits).to_f32()).collect();
        Ok((distances, resp.labels))
    }

    pub async fn get_base(&self, command: Command, index_id: u32) -> Result<GetBaseResponse> {
        let resp: GetBaseResponse = self
            .session
            .send_and_receive(command, &GetBaseRequest { index_id })
            .await?;
        check(resp.status.clone())?;
        Ok(resp)
    }

    pub async fn get_base_size(&self, command: Command, index_id: u32) -> Result<u64> {
        let resp: GetBaseSizeResponse = self
            .session
            .send_and_receive(command, &GetBaseSizeRequest { index_id })
            .await?;
        check(resp.status.clone())?;
        Ok(resp.ntotal)
    }

    pub async fn reset(&self, index_id: u32) -> Result<()> {
        let resp: SimpleResponse = self
            .session
            .send_and_receive(Command::IndexReset, &ResetRequest { index_id })
            .await?;
        check(resp.status)
    }

    pub async fn remove_ids(&self, index_id: u32, ids: Vec<u64>) -> Result<u64> {
        let resp: RemoveResponse = self
            .session
            .send_and_receive(Command::IndexRemoveIds, &RemoveIdsRequest { index_id, ids })
            .await?;
        check(resp.status)?;
        Ok(resp.n_removed)
    }

    pub async fn remove_range_ids(&self, index_id: u32, min: u64, max: u64) -> Result<u64> {
        let req = RemoveRangeIdsRequest { index_id, min, max };
        let resp: RemoveResponse = self.session.send_and_receive(Command::IndexRemoveRangeIds, &req).await?;
        check(resp.status)?;
        Ok(resp.n_removed)
    }

    pub async fn reserve_mem(&self, index_id: u32, list_id: Option<u32>, n: u64) -> Result<()> {
        let req = ReserveMemRequest { index_id, list_id, n };
        let resp: SimpleResponse = self.session.send_and_receive(Command::IndexReserveMem, &req).await?;
        check(resp.status)
    }

    pub async fn reclaim_mem(&self, index_id: u32, list_id: Option<u32>) -> Result<u64> {
        let req = ReclaimMemRequest { index_id, list_id };
        let resp: ReclaimMemResponse = self.session.send_and_receive(Command::IndexReclaimMem, &req).await?;
        check(resp.status)?;
        Ok(resp.bytes_reclaimed)
    }

    pub async fn update_coarse_cent(&self, index_id: u32, centroids: Vec<f32>) -> Result<()> {
        let req = UpdateCoarseCentRequest { index_id, centroids };
        let resp: SimpleResponse = self.session.send_and_receive(Command::IndexIVFUpdateCoarseCent, &req).await?;
        check(resp.status)
    }

    pub async fn update_pq_cent(&self, index_id: u32, centroids: Vec<f32>) -> Result<()> {
        let req = UpdatePqCentRequest { index_id, centroids };
        let resp: SimpleResponse = self.session.send_and_receive(Command::IndexIVFPQUpdatePQCent, &req).await?;
        check(resp.status)
    }

    pub async fn update_sq_trained_value(&self, index_id: u32, vmin: Vec<f32>, vdiff: Vec<f32>) -> Result<()> {
        let req = UpdateSqTrainedValueRequest { index_id, vmin, vdiff };
        let resp: SimpleResponse = self.session.send_and_receive(Command::IndexSQUpdateTrainedValue, &req).await?;
        check(resp.status)
    }

    pub async fn update_nprobe(&self, index_id: u32, nprobe: u32) -> Result<()> {
        let req = UpdateNprobeRequest { index_id, nprobe };
        let resp: SimpleResponse = self.session.send_and_receive(Command::IndexIVFUpdateNprobe, &req).await?;
        check(resp.status)
    }

    pub async fn get_list_length(&self, index_id: u32, list_id: u32) -> Result<u64> {
        let req = GetListLengthRequest { index_id, list_id };
        let resp: GetListLengthResponse = self.session.send_and_receive(Command::IndexIVFGetListLength, &req).await?;
        check(resp.status.clone())?;
        Ok(resp.length)
    }

    pub async fn get_list_codes(&self, index_id: u32, list_id: u32) -> Result<(Vec<u8>, Vec<u32>)> {
        let req = GetListCodesRequest { index_id, list_id };
        let resp: GetListCodesResponse = self.session.send_and_receive(Command::IndexIVFGetListCodes, &req).await?;
        check(resp.status.clone())?;
        Ok((resp.codes, resp.ids))
    }
}
