//! Operations queued on a host queue.
//!
//! An op is shared between the caller and every host queue it was enqueued on through an
//! [`Arc`]; each host queue completes its reference exactly once.

use std::{fmt, sync::Arc};

use bytes::Bytes;
use influxdb3_cluster_topology::Host;

use crate::{
    Error, Result,
    rpc::{
        AggregateQueryRawRequest, AggregateQueryRawResult, FetchTaggedRequest, FetchTaggedResult,
        RpcDatapoint, Segments, TruncateRequest, TruncateResult,
    },
};

pub(crate) type WriteCompletionFn = Arc<dyn Fn(&Host, Result<()>) + Send + Sync>;
pub(crate) type FetchCompletionFn = Arc<dyn Fn(Result<Vec<Segments>>) + Send + Sync>;
pub(crate) type FetchTaggedCompletionFn =
    Arc<dyn Fn(&Host, Result<FetchTaggedResult>) + Send + Sync>;
pub(crate) type AggregateCompletionFn =
    Arc<dyn Fn(&Host, Result<AggregateQueryRawResult>) + Send + Sync>;
pub(crate) type TruncateCompletionFn = Arc<dyn Fn(Result<TruncateResult>) + Send + Sync>;

#[derive(Debug, Clone)]
pub(crate) enum Op {
    Write(Arc<WriteOp>),
    WriteTagged(Arc<WriteOp>),
    FetchBatch(Arc<FetchBatchOp>),
    FetchTagged(Arc<FetchTaggedOp>),
    Aggregate(Arc<AggregateOp>),
    Truncate(Arc<TruncateOp>),
}

impl Op {
    /// Units of work this op counts for towards a host queue flush.
    pub(crate) fn size(&self) -> usize {
        match self {
            Self::FetchBatch(op) => op.ids.len(),
            _ => 1,
        }
    }

    /// Complete every callback of the op with `err`.
    pub(crate) fn complete_with_error(&self, host: &Host, err: Error) {
        match self {
            Self::Write(op) | Self::WriteTagged(op) => (op.completion)(host, Err(err)),
            Self::FetchBatch(op) => {
                for completion in &op.completions {
                    completion(Err(err.clone()));
                }
            }
            Self::FetchTagged(op) => (op.completion)(host, Err(err)),
            Self::Aggregate(op) => (op.completion)(host, Err(err)),
            Self::Truncate(op) => (op.completion)(Err(err)),
        }
    }
}

/// A single datapoint written to one series. Tags are empty for untagged writes.
pub(crate) struct WriteOp {
    pub(crate) namespace: Bytes,
    pub(crate) shard: u32,
    pub(crate) id: Bytes,
    pub(crate) encoded_tags: Bytes,
    pub(crate) datapoint: RpcDatapoint,
    pub(crate) completion: WriteCompletionFn,
}

impl fmt::Debug for WriteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteOp")
            .field("namespace", &self.namespace)
            .field("shard", &self.shard)
            .field("id", &self.id)
            .field("datapoint", &self.datapoint)
            .finish_non_exhaustive()
    }
}

/// Ids of one namespace fetched from a single host, each with its own completion.
pub(crate) struct FetchBatchOp {
    pub(crate) namespace: Bytes,
    pub(crate) range_start: i64,
    pub(crate) range_end: i64,
    pub(crate) ids: Vec<Bytes>,
    pub(crate) completions: Vec<FetchCompletionFn>,
}

impl FetchBatchOp {
    pub(crate) fn new(namespace: Bytes, range_start: i64, range_end: i64) -> Self {
        Self {
            namespace,
            range_start,
            range_end,
            ids: vec![],
            completions: vec![],
        }
    }

    pub(crate) fn append(&mut self, id: Bytes, completion: FetchCompletionFn) {
        self.ids.push(id);
        self.completions.push(completion);
    }

    pub(crate) fn len(&self) -> usize {
        self.ids.len()
    }
}

impl fmt::Debug for FetchBatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchBatchOp")
            .field("namespace", &self.namespace)
            .field("range_start", &self.range_start)
            .field("range_end", &self.range_end)
            .field("ids", &self.ids)
            .finish_non_exhaustive()
    }
}

pub(crate) struct FetchTaggedOp {
    pub(crate) request: FetchTaggedRequest,
    pub(crate) completion: FetchTaggedCompletionFn,
}

impl fmt::Debug for FetchTaggedOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchTaggedOp")
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

pub(crate) struct AggregateOp {
    pub(crate) request: AggregateQueryRawRequest,
    pub(crate) completion: AggregateCompletionFn,
}

impl fmt::Debug for AggregateOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateOp")
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

pub(crate) struct TruncateOp {
    pub(crate) request: TruncateRequest,
    pub(crate) completion: TruncateCompletionFn,
}

impl fmt::Debug for TruncateOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TruncateOp")
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[test]
    fn fetch_batch_completes_every_id() {
        let seen = Arc::new(Mutex::new(vec![]));
        let mut op = FetchBatchOp::new(Bytes::from_static(b"ns"), 0, 10);
        for i in 0..3 {
            let seen = Arc::clone(&seen);
            op.append(
                Bytes::from(format!("id{i}")),
                Arc::new(move |res: Result<Vec<Segments>>| {
                    seen.lock().push((i, res.is_err()))
                }),
            );
        }
        let op = Op::FetchBatch(Arc::new(op));
        assert_eq!(op.size(), 3);

        op.complete_with_error(&Host::new("h0", "h0:1"), Error::Timeout);
        assert_eq!(*seen.lock(), vec![(0, true), (1, true), (2, true)]);
    }
}
