//! Typed request/response payloads for the host<->daemon RPC protocol
//! (§6). Every message on the wire is `[u32 length | u32 command |
//! payload]`; `payload` is one of the structs below, bincode-encoded.
//! `vsearch-transport` owns the framing; this module owns the schema.

use serde::{Deserialize, Serialize};

use crate::metric::Metric;

/// The command tag that precedes every payload. Numeric values are part of
/// the wire format and must not be reordered once a daemon/host pair is
/// deployed against each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum Command {
    CreateContext = 0,
    DestroyContext = 1,
    TestDataIntegrity = 2,

    CreateIndexFlat = 10,
    IndexFlatAdd = 11,
    IndexFlatGetBase = 12,
    IndexFlatGetBaseSize = 13,

    CreateIndexInt8Flat = 20,
    IndexInt8FlatAdd = 21,
    IndexInt8FlatGetBase = 22,
    IndexInt8FlatGetBaseSize = 23,

    CreateIndexSQ = 30,
    IndexSQAdd = 31,
    IndexSQGetBase = 32,
    IndexSQFastGetBase = 33,
    IndexSQGetBaseSize = 34,

    IndexIVFUpdateCoarseCent = 40,
    IndexIVFGetListCodes = 41,
    IndexIVFFastGetListCodes = 42,
    IndexIVFGetListLength = 43,
    IndexIVFUpdateNprobe = 44,

    CreateIndexIVFPQ = 50,
    IndexIVFPQUpdatePQCent = 51,
    IndexIVFPQAdd = 52,

    CreateIndexIVFSQ = 60,
    IndexSQUpdateTrainedValue = 61,
    IndexIVFSQAdd = 62,

    CreateIndexIVFFlat = 70,
    IndexIVFFlatAdd = 71,

    CreateIndexInt8IVFFlat = 80,
    IndexInt8IVFFlatAdd = 81,

    CreateIndexPreTransform = 90,
    CreateLinearTransform = 91,
    DestroyLinearTransform = 92,
    LinearTransformUpdateTrainedValue = 93,
    IndexPreTransformPrepend = 94,

    CreateNNDimReduction = 100,
    InferNNDimReduction = 101,
    DestroyNNDimReduction = 102,

    IndexSearch = 110,
    IndexInt8Search = 111,
    IndexReset = 112,
    IndexRemoveIds = 113,
    IndexRemoveRangeIds = 114,
    IndexReserveMem = 115,
    IndexReclaimMem = 116,
}

impl Command {
    pub fn to_u32(self) -> u32 {
        self as u32
    }

    /// Decodes a command tag read off the wire. Unknown tags are a
    /// transport-level error, not a panic: a peer running a different
    /// protocol revision must fail cleanly.
    pub fn from_u32(tag: u32) -> Option<Command> {
        use Command::*;
        Some(match tag {
            0 => CreateContext,
            1 => DestroyContext,
            2 => TestDataIntegrity,
            10 => CreateIndexFlat,
            11 => IndexFlatAdd,
            12 => IndexFlatGetBase,
            13 => IndexFlatGetBaseSize,
            20 => CreateIndexInt8Flat,
            21 => IndexInt8FlatAdd,
            22 => IndexInt8FlatGetBase,
            23 => IndexInt8FlatGetBaseSize,
            30 => CreateIndexSQ,
            31 => IndexSQAdd,
            32 => IndexSQGetBase,
            33 => IndexSQFastGetBase,
            34 => IndexSQGetBaseSize,
            40 => IndexIVFUpdateCoarseCent,
            41 => IndexIVFGetListCodes,
            42 => IndexIVFFastGetListCodes,
            43 => IndexIVFGetListLength,
            44 => IndexIVFUpdateNprobe,
            50 => CreateIndexIVFPQ,
            51 => IndexIVFPQUpdatePQCent,
            52 => IndexIVFPQAdd,
            60 => CreateIndexIVFSQ,
            61 => IndexSQUpdateTrainedValue,
            62 => IndexIVFSQAdd,
            70 => CreateIndexIVFFlat,
            71 => IndexIVFFlatAdd,
            80 => CreateIndexInt8IVFFlat,
            81 => IndexInt8IVFFlatAdd,
            90 => CreateIndexPreTransform,
            91 => CreateLinearTransform,
            92 => DestroyLinearTransform,
            93 => LinearTransformUpdateTrainedValue,
            94 => IndexPreTransformPrepend,
            100 => CreateNNDimReduction,
            101 => InferNNDimReduction,
            102 => DestroyNNDimReduction,
            110 => IndexSearch,
            111 => IndexInt8Search,
            112 => IndexReset,
            113 => IndexRemoveIds,
            114 => IndexRemoveRangeIds,
            115 => IndexReserveMem,
            116 => IndexReclaimMem,
            _ => return None,
        })
    }
}

/// Every response carries a status header so the host can distinguish `OK`
/// from a remote-side failure without a separate frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusHeader {
    pub ok: bool,
    pub message: Option<String>,
}

impl StatusHeader {
    pub fn ok() -> Self {
        Self {
            ok: true,
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleResponse {
    pub status: StatusHeader,
}

impl SimpleResponse {
    pub fn ok() -> Self {
        Self {
            status: StatusHeader::ok(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum IvfKind {
    Flat,
    Pq { m: u32, bits: u32 },
    Sq,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateContextRequest {
    pub device: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyContextRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestDataIntegrityRequest {
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestDataIntegrityResponse {
    pub status: StatusHeader,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateIndexFlatRequest {
    pub index_id: u32,
    pub dim: u32,
    pub metric: Metric,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateIndexIvfRequest {
    pub index_id: u32,
    pub dim: u32,
    pub metric: Metric,
    pub nlist: u32,
    pub nprobe: u32,
    pub kind: IvfKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateIndexResponse {
    pub status: StatusHeader,
}

/// `vectors` is the raw little-endian element bytes (fp16 or i8 depending
/// on the index family known server-side from `index_id`), `n * dim`
/// elements wide. `ids` is populated for IVF adds (user ids) and omitted
/// for Flat adds (positions assign ids implicitly).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddRequest {
    pub index_id: u32,
    pub n: u32,
    pub vectors: Vec<u8>,
    pub ids: Option<Vec<u64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddResponse {
    pub status: StatusHeader,
    pub ntotal: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub index_id: u32,
    pub n: u32,
    pub k: u32,
    pub queries: Vec<u8>,
    pub nprobe_override: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub status: StatusHeader,
    /// `n * k` entries, fp16, row-major per query.
    pub distances: Vec<u16>,
    /// `n * k` entries, row-major per query. A label of `u32::MAX` marks a
    /// padding slot when fewer than `k` results exist.
    pub labels: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetBaseRequest {
    pub index_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetBaseResponse {
    pub status: StatusHeader,
    pub dim: u32,
    pub ntotal: u64,
    pub codes: Vec<u8>,
    pub ids: Option<Vec<u64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetBaseSizeRequest {
    pub index_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetBaseSizeResponse {
    pub status: StatusHeader,
    pub ntotal: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetRequest {
    pub index_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveIdsRequest {
    pub index_id: u32,
    pub ids: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveRangeIdsRequest {
    pub index_id: u32,
    pub min: u64,
    pub max: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveResponse {
    pub status: StatusHeader,
    pub n_removed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveMemRequest {
    pub index_id: u32,
    pub list_id: Option<u32>,
    pub n: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReclaimMemRequest {
    pub index_id: u32,
    pub list_id: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReclaimMemResponse {
    pub status: StatusHeader,
    pub bytes_reclaimed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateCoarseCentRequest {
    pub index_id: u32,
    /// `nlist * dim` row-major f32, converted to fp16 on the daemon.
    pub centroids: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePqCentRequest {
    pub index_id: u32,
    /// `m * ksub * (dim/m)` row-major f32.
    pub centroids: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateSqTrainedValueRequest {
    pub index_id: u32,
    pub vmin: Vec<f32>,
    pub vdiff: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateNprobeRequest {
    pub index_id: u32,
    pub nprobe: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetListCodesRequest {
    pub index_id: u32,
    pub list_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetListCodesResponse {
    pub status: StatusHeader,
    pub codes: Vec<u8>,
    pub ids: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetListLengthRequest {
    pub index_id: u32,
    pub list_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetListLengthResponse {
    pub status: StatusHeader,
    pub length: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateIndexPreTransformRequest {
    pub index_id: u32,
    pub inner_index_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateLinearTransformRequest {
    pub transform_id: u32,
    pub d_in: u32,
    pub d_out: u32,
    pub has_bias: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyLinearTransformRequest {
    pub transform_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearTransformUpdateTrainedValueRequest {
    pub transform_id: u32,
    /// `d_out * d_in` row-major.
    pub a: Vec<f32>,
    /// `d_out`, empty when `has_bias` is false.
    pub b: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexPreTransformPrependRequest {
    pub index_id: u32,
    pub transform_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateNnDimReductionRequest {
    pub index_id: u32,
    pub in_dim: u32,
    pub out_dim: u32,
    pub batch_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferNnDimReductionRequest {
    pub index_id: u32,
    pub n: u32,
    pub input: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferNnDimReductionResponse {
    pub status: StatusHeader,
    pub output: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyNnDimReductionRequest {
    pub index_id: u32,
}

/// Control record sent ahead of each buffer on the fast-receive side
/// channel (§4.1). `channel_last` asks the host to round-trip a signal
/// before the daemon sends more; `list_last` ends the stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FastRecvCtrl {
    pub list_size: u32,
    pub list_last: bool,
    pub channel_last: bool,
}

/// One buffer on the fast-receive side channel: its control header plus the
/// raw element bytes it describes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FastRecvChunk {
    pub ctrl: FastRecvCtrl,
    pub data: Vec<u8>,
}

/// Host -> daemon round-trip acknowledgement required after a chunk whose
/// `ctrl.channel_last` was set, before the daemon sends more.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FastRecvSignal;
