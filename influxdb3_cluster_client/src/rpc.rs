//! The RPC surface of a storage node.
//!
//! [`NodeConnector`] establishes connections to a [`Host`] and [`NodeClient`] is a single
//! connection. The wire transport is supplied by the embedder; the client only relies on the
//! request and response shapes defined here.

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use influxdb3_cluster_topology::Host;

use crate::{
    datapoint::TimeUnit,
    query::{AggregateQueryType, Query},
};

/// Error returned by a storage node or the transport in front of it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RpcError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("rpc deadline exceeded")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    /// Some elements of a write batch failed, the rest succeeded.
    #[error("{} elements of write batch failed", .0.len())]
    WriteBatchErrors(Vec<WriteBatchRawError>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteBatchRawError {
    /// Position of the failed element in the request.
    pub index: usize,
    pub error: RpcError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RpcDatapoint {
    pub timestamp: i64,
    pub timestamp_unit: TimeUnit,
    pub value: f64,
    pub annotation: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteBatchRawRequest {
    pub namespace: Bytes,
    pub elements: Vec<WriteBatchRawRequestElement>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteBatchRawRequestElement {
    pub id: Bytes,
    pub datapoint: RpcDatapoint,
}

/// A write batch spanning namespaces; elements index into `namespaces`.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteBatchRawV2Request {
    pub namespaces: Vec<Bytes>,
    pub elements: Vec<WriteBatchRawV2RequestElement>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteBatchRawV2RequestElement {
    pub namespace: usize,
    pub id: Bytes,
    pub datapoint: RpcDatapoint,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteTaggedBatchRawRequest {
    pub namespace: Bytes,
    pub elements: Vec<WriteTaggedBatchRawRequestElement>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteTaggedBatchRawRequestElement {
    pub id: Bytes,
    pub encoded_tags: Bytes,
    pub datapoint: RpcDatapoint,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteTaggedBatchRawV2Request {
    pub namespaces: Vec<Bytes>,
    pub elements: Vec<WriteTaggedBatchRawV2RequestElement>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteTaggedBatchRawV2RequestElement {
    pub namespace: usize,
    pub id: Bytes,
    pub encoded_tags: Bytes,
    pub datapoint: RpcDatapoint,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchBatchRawRequest {
    pub namespace: Bytes,
    pub range_start: i64,
    pub range_end: i64,
    pub ids: Vec<Bytes>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchBatchRawV2Request {
    pub namespaces: Vec<Bytes>,
    pub elements: Vec<FetchBatchRawV2RequestElement>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchBatchRawV2RequestElement {
    pub namespace: usize,
    pub id: Bytes,
    pub range_start: i64,
    pub range_end: i64,
}

/// Result of a batch fetch, one element per requested id in request order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchBatchRawResult {
    pub elements: Vec<FetchRawResult>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchRawResult {
    pub segments: Vec<Segments>,
    pub error: Option<RpcError>,
}

/// The encoded data of one block of a series.
///
/// A block is either a single merged segment or several unmerged segments that overlap in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Segments {
    pub merged: Option<Segment>,
    pub unmerged: Vec<Segment>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Segment {
    pub head: Bytes,
    pub tail: Bytes,
    pub start_time: i64,
    pub block_size: i64,
    pub checksum: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchTaggedRequest {
    pub namespace: Bytes,
    pub query: Query,
    pub range_start: i64,
    pub range_end: i64,
    /// Return series data in addition to ids and tags.
    pub fetch_data: bool,
    pub series_limit: Option<usize>,
    pub docs_limit: Option<usize>,
    pub require_exhaustive: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchTaggedResult {
    pub elements: Vec<FetchTaggedIdResult>,
    pub exhaustive: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchTaggedIdResult {
    pub id: Bytes,
    pub namespace: Bytes,
    pub encoded_tags: Bytes,
    pub segments: Vec<Segments>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateQueryRawRequest {
    pub namespace: Bytes,
    pub query: Query,
    pub range_start: i64,
    pub range_end: i64,
    pub tag_name_filter: Vec<Bytes>,
    pub aggregate_query_type: AggregateQueryType,
    pub series_limit: Option<usize>,
    pub docs_limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateQueryRawResult {
    pub results: Vec<AggregateTagNameElement>,
    pub exhaustive: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateTagNameElement {
    pub tag_name: Bytes,
    /// Sorted, distinct values.
    pub tag_values: Vec<Bytes>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TruncateRequest {
    pub namespace: Bytes,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TruncateResult {
    pub num_series: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeHealth {
    pub ok: bool,
    pub status: String,
    pub bootstrapped: bool,
}

/// A single connection to a storage node.
#[async_trait]
pub trait NodeClient: Send + Sync + Debug + 'static {
    async fn health(&self) -> Result<NodeHealth, RpcError>;

    async fn write_batch_raw(&self, req: WriteBatchRawRequest) -> Result<(), RpcError>;

    async fn write_batch_raw_v2(&self, req: WriteBatchRawV2Request) -> Result<(), RpcError>;

    async fn write_tagged_batch_raw(&self, req: WriteTaggedBatchRawRequest)
    -> Result<(), RpcError>;

    async fn write_tagged_batch_raw_v2(
        &self,
        req: WriteTaggedBatchRawV2Request,
    ) -> Result<(), RpcError>;

    async fn fetch_batch_raw(
        &self,
        req: FetchBatchRawRequest,
    ) -> Result<FetchBatchRawResult, RpcError>;

    async fn fetch_batch_raw_v2(
        &self,
        req: FetchBatchRawV2Request,
    ) -> Result<FetchBatchRawResult, RpcError>;

    async fn fetch_tagged(&self, req: FetchTaggedRequest) -> Result<FetchTaggedResult, RpcError>;

    async fn aggregate_raw(
        &self,
        req: AggregateQueryRawRequest,
    ) -> Result<AggregateQueryRawResult, RpcError>;

    async fn truncate(&self, req: TruncateRequest) -> Result<TruncateResult, RpcError>;

    /// Release the underlying transport. Called once the connection leaves its pool.
    fn close(&self);
}

/// Opens connections to storage nodes.
#[async_trait]
pub trait NodeConnector: Send + Sync + Debug + 'static {
    async fn connect(&self, host: &Host) -> Result<Arc<dyn NodeClient>, RpcError>;
}
