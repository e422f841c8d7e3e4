//! Per-host pipeline that batches ops into RPCs.
//!
//! Enqueued ops collect in a pending array. Once the array holds `host_queue_ops_flush_size`
//! units of work, or the flush interval elapses without a rotation, the array is rotated out and
//! sent to the drain task, which groups its ops into batch requests and dispatches each one on a
//! worker. Dispatches hold a permit from the session wide worker pool and one from the queue's
//! own concurrency limit.

use std::{future::Future, sync::Arc};

use bytes::Bytes;
use futures::future::BoxFuture;
use hashbrown::HashMap;
use indexmap::{IndexMap, IndexSet};
use influxdb3_cluster_topology::Host;
use iox_time::{Time, TimeProvider};
use metric::U64Gauge;
use observability_deps::tracing::{debug, error};
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio_util::task::TaskTracker;

use crate::{
    Error, Result, Status,
    config::Options,
    connection_pool::ConnectionPool,
    op::{AggregateOp, FetchBatchOp, FetchCompletionFn, FetchTaggedOp, Op, TruncateOp, WriteOp},
    rpc::{
        FetchBatchRawRequest, FetchBatchRawV2Request, FetchBatchRawV2RequestElement, FetchRawResult,
        NodeClient, NodeConnector, RpcError, WriteBatchRawRequest, WriteBatchRawRequestElement,
        WriteBatchRawV2Request, WriteBatchRawV2RequestElement, WriteTaggedBatchRawRequest,
        WriteTaggedBatchRawRequestElement, WriteTaggedBatchRawV2Request,
        WriteTaggedBatchRawV2RequestElement,
    },
};

#[derive(Debug)]
pub(crate) struct HostQueue {
    host: Host,
    opts: Arc<Options>,
    pool: ConnectionPool,
    state: Mutex<QueueState>,
    /// Outstanding dispatches and borrowed connections.
    tracker: TaskTracker,
    workers: Arc<Semaphore>,
    concurrency: Arc<Semaphore>,
    time_provider: Arc<dyn TimeProvider>,
}

#[derive(Debug)]
struct QueueState {
    status: Status,
    ops: Vec<Op>,
    ops_sum_size: usize,
    last_rotated_at: Time,
    drain_tx: Option<mpsc::Sender<Vec<Op>>>,
}

impl HostQueue {
    pub(crate) fn new(
        host: Host,
        connector: Arc<dyn NodeConnector>,
        opts: Arc<Options>,
        workers: Arc<Semaphore>,
        time_provider: Arc<dyn TimeProvider>,
        health: Option<U64Gauge>,
    ) -> Arc<Self> {
        let pool = ConnectionPool::new(host.clone(), connector, Arc::clone(&opts), health);
        Arc::new(Self {
            pool,
            state: Mutex::new(QueueState {
                status: Status::NotOpen,
                ops: Vec::with_capacity(opts.host_queue_ops_flush_size),
                ops_sum_size: 0,
                last_rotated_at: time_provider.now(),
                drain_tx: None,
            }),
            tracker: TaskTracker::new(),
            workers,
            concurrency: Arc::new(Semaphore::new(opts.host_queue_max_concurrent_dispatches)),
            host,
            opts,
            time_provider,
        })
    }

    pub(crate) fn host(&self) -> &Host {
        &self.host
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.pool.connection_count()
    }

    /// Open the connection pool and start draining. Does nothing unless the queue was never
    /// opened.
    pub(crate) async fn open(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        if state.status != Status::NotOpen {
            return;
        }
        state.status = Status::Open;
        let (tx, rx) = mpsc::channel(self.opts.host_queue_ops_array_pool_size);
        state.drain_tx = Some(tx);
        drop(state);

        self.pool.open();
        tokio::spawn(Arc::clone(self).drain(rx));
        if !self.opts.host_queue_ops_flush_interval.is_zero() {
            tokio::spawn(Arc::clone(self).flush_every());
        }
    }

    pub(crate) async fn enqueue(&self, op: Op) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.status != Status::Open {
            return Err(Error::QueueNotOpen {
                host: self.host.id().to_string(),
            });
        }
        state.ops_sum_size += op.size();
        state.ops.push(op);
        if state.ops_sum_size >= self.opts.host_queue_ops_flush_size {
            self.rotate(&mut state).await;
        }
        Ok(())
    }

    /// Run `f` with a connection from the pool. The queue does not finish closing while `f`
    /// runs.
    pub(crate) async fn borrow_connection<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn NodeClient>) -> Fut + Send,
        Fut: Future<Output = T> + Send,
    {
        let _pin = {
            let state = self.state.lock().await;
            if state.status != Status::Open {
                return Err(Error::QueueNotOpen {
                    host: self.host.id().to_string(),
                });
            }
            self.tracker.token()
        };
        let client = self.pool.next_client()?;
        Ok(f(client).await)
    }

    /// Stop accepting ops. Pending ops are still drained and the connection pool closes once
    /// every dispatch has finished.
    pub(crate) async fn close(&self) {
        let mut state = self.state.lock().await;
        let was_open = state.status == Status::Open;
        state.status = Status::Closed;
        if was_open {
            self.rotate(&mut state).await;
            // dropping the sender ends the drain task
            state.drain_tx = None;
        }
    }

    /// Hand the pending ops to the drain task. Runs with the state lock held so a concurrent
    /// close cannot drop the channel underneath the send.
    async fn rotate(&self, state: &mut QueueState) {
        let ops = std::mem::replace(
            &mut state.ops,
            Vec::with_capacity(self.opts.host_queue_ops_flush_size),
        );
        state.ops_sum_size = 0;
        state.last_rotated_at = self.time_provider.now();
        if ops.is_empty() {
            return;
        }

        let Some(tx) = &state.drain_tx else {
            error!(host = %self.host, "[invariant violated] rotating ops without a drain channel");
            self.fail_all(ops);
            return;
        };
        if let Err(mpsc::error::SendError(ops)) = tx.send(ops).await {
            error!(host = %self.host, "[invariant violated] drain task gone while queue open");
            self.fail_all(ops);
        }
    }

    fn fail_all(&self, ops: Vec<Op>) {
        for op in ops {
            op.complete_with_error(
                &self.host,
                Error::QueueNotOpen {
                    host: self.host.id().to_string(),
                },
            );
        }
    }

    async fn flush_every(self: Arc<Self>) {
        let interval = self.opts.host_queue_ops_flush_interval;
        loop {
            tokio::time::sleep(interval).await;
            let mut state = self.state.lock().await;
            if state.status != Status::Open {
                return;
            }
            let since = self
                .time_provider
                .now()
                .checked_duration_since(state.last_rotated_at)
                .unwrap_or_default();
            if since >= interval && !state.ops.is_empty() {
                self.rotate(&mut state).await;
            }
        }
    }

    async fn drain(self: Arc<Self>, mut rx: mpsc::Receiver<Vec<Op>>) {
        while let Some(ops) = rx.recv().await {
            self.drain_ops(ops).await;
        }
        self.tracker.close();
        self.tracker.wait().await;
        self.pool.close();
        debug!(host = %self.host, "host queue drained");
    }

    async fn drain_ops(self: &Arc<Self>, ops: Vec<Op>) {
        let v2 = self.opts.use_v2_batch_apis;
        let mut writes = WriteGroups::new(v2, self.opts.write_batch_size);
        let mut fetches = vec![];
        let mut fetches_size = 0;

        for op in ops {
            match op {
                Op::Write(op) => {
                    if let Some(batch) = writes.push(WriteKind::Untagged, op) {
                        self.dispatch_writes(batch).await;
                    }
                }
                Op::WriteTagged(op) => {
                    if let Some(batch) = writes.push(WriteKind::Tagged, op) {
                        self.dispatch_writes(batch).await;
                    }
                }
                Op::FetchBatch(op) if v2 => {
                    fetches_size += op.len();
                    fetches.push(op);
                    // soft cap, the op that crosses the limit is still included
                    if fetches_size >= self.opts.fetch_batch_size {
                        fetches_size = 0;
                        self.dispatch_fetches(std::mem::take(&mut fetches)).await;
                    }
                }
                Op::FetchBatch(op) => self.dispatch_fetches(vec![op]).await,
                Op::FetchTagged(op) => self.dispatch_fetch_tagged(op).await,
                Op::Aggregate(op) => self.dispatch_aggregate(op).await,
                Op::Truncate(op) => self.dispatch_truncate(op).await,
            }
        }

        for batch in writes.finish() {
            self.dispatch_writes(batch).await;
        }
        if !fetches.is_empty() {
            self.dispatch_fetches(fetches).await;
        }
    }

    /// Run `fut` on a worker once both the shared and the per-queue limits allow it.
    async fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let worker = Arc::clone(&self.workers).acquire_owned().await.ok();
        let local = Arc::clone(&self.concurrency).acquire_owned().await.ok();
        self.tracker.spawn(async move {
            fut.await;
            drop((worker, local));
        });
    }

    async fn dispatch_writes(self: &Arc<Self>, batch: WriteBatch) {
        let queue = Arc::clone(self);
        self.spawn(async move { queue.write(batch).await }).await;
    }

    async fn write(&self, batch: WriteBatch) {
        let client = match self.pool.next_client() {
            Ok(client) => client,
            Err(e) => {
                for op in &batch.ops {
                    (op.completion)(&self.host, Err(e.clone()));
                }
                return;
            }
        };

        let request = batch.request();
        let result = tokio::time::timeout(
            self.opts.write_request_timeout,
            request.send(client.as_ref()),
        )
        .await
        .unwrap_or(Err(RpcError::Timeout));

        match result {
            Ok(()) => {
                for op in &batch.ops {
                    (op.completion)(&self.host, Ok(()));
                }
            }
            Err(RpcError::WriteBatchErrors(errors)) => {
                let mut by_index: HashMap<usize, RpcError> =
                    errors.into_iter().map(|e| (e.index, e.error)).collect();
                for (idx, op) in batch.ops.iter().enumerate() {
                    let result = match by_index.remove(&idx) {
                        Some(e) => Err(e.into()),
                        None => Ok(()),
                    };
                    (op.completion)(&self.host, result);
                }
            }
            Err(e) => {
                let err = Error::from(e);
                for op in &batch.ops {
                    (op.completion)(&self.host, Err(err.clone()));
                }
            }
        }
    }

    async fn dispatch_fetches(self: &Arc<Self>, ops: Vec<Arc<FetchBatchOp>>) {
        let queue = Arc::clone(self);
        self.spawn(async move { queue.fetch(ops).await }).await;
    }

    async fn fetch(&self, ops: Vec<Arc<FetchBatchOp>>) {
        let completions: Vec<&FetchCompletionFn> =
            ops.iter().flat_map(|op| op.completions.iter()).collect();
        let client = match self.pool.next_client() {
            Ok(client) => client,
            Err(e) => {
                for completion in completions {
                    completion(Err(e.clone()));
                }
                return;
            }
        };

        let fetch: BoxFuture<'_, _> = match ops.as_slice() {
            [op] if !self.opts.use_v2_batch_apis => {
                client.fetch_batch_raw(FetchBatchRawRequest {
                    namespace: op.namespace.clone(),
                    range_start: op.range_start,
                    range_end: op.range_end,
                    ids: op.ids.clone(),
                })
            }
            _ => {
                let (namespaces, indices) = namespace_table(ops.iter().map(|op| &op.namespace));
                let elements = ops
                    .iter()
                    .zip(indices)
                    .flat_map(|(op, namespace)| {
                        op.ids.iter().map(move |id| FetchBatchRawV2RequestElement {
                            namespace,
                            id: id.clone(),
                            range_start: op.range_start,
                            range_end: op.range_end,
                        })
                    })
                    .collect();
                client.fetch_batch_raw_v2(FetchBatchRawV2Request {
                    namespaces,
                    elements,
                })
            }
        };
        let result = tokio::time::timeout(self.opts.fetch_request_timeout, fetch)
            .await
            .unwrap_or(Err(RpcError::Timeout));

        match result {
            Ok(result) => {
                let mut elements = result.elements.into_iter();
                for completion in completions {
                    match elements.next() {
                        Some(FetchRawResult {
                            error: Some(e), ..
                        }) => completion(Err(e.into())),
                        Some(FetchRawResult { segments, .. }) => completion(Ok(segments)),
                        None => completion(Err(Error::QueueFetchNoResponse {
                            host: self.host.id().to_string(),
                        })),
                    }
                }
            }
            Err(e) => {
                let err = Error::from(e);
                for completion in completions {
                    completion(Err(err.clone()));
                }
            }
        }
    }

    async fn dispatch_fetch_tagged(self: &Arc<Self>, op: Arc<FetchTaggedOp>) {
        let queue = Arc::clone(self);
        self.spawn(async move {
            let result = match queue.pool.next_client() {
                Ok(client) => tokio::time::timeout(
                    queue.opts.fetch_request_timeout,
                    client.fetch_tagged(op.request.clone()),
                )
                .await
                .unwrap_or(Err(RpcError::Timeout))
                .map_err(Error::from),
                Err(e) => Err(e),
            };
            (op.completion)(&queue.host, result);
        })
        .await;
    }

    async fn dispatch_aggregate(self: &Arc<Self>, op: Arc<AggregateOp>) {
        let queue = Arc::clone(self);
        self.spawn(async move {
            let result = match queue.pool.next_client() {
                Ok(client) => tokio::time::timeout(
                    queue.opts.fetch_request_timeout,
                    client.aggregate_raw(op.request.clone()),
                )
                .await
                .unwrap_or(Err(RpcError::Timeout))
                .map_err(Error::from),
                Err(e) => Err(e),
            };
            (op.completion)(&queue.host, result);
        })
        .await;
    }

    async fn dispatch_truncate(self: &Arc<Self>, op: Arc<TruncateOp>) {
        let queue = Arc::clone(self);
        self.spawn(async move {
            let result = match queue.pool.next_client() {
                Ok(client) => tokio::time::timeout(
                    queue.opts.truncate_request_timeout,
                    client.truncate(op.request.clone()),
                )
                .await
                .unwrap_or(Err(RpcError::Timeout))
                .map_err(Error::from),
                Err(e) => Err(e),
            };
            (op.completion)(result);
        })
        .await;
    }
}

/// Deduplicate namespaces into a table, returning the table and each input's index into it.
fn namespace_table<'a>(namespaces: impl Iterator<Item = &'a Bytes>) -> (Vec<Bytes>, Vec<usize>) {
    let mut table = IndexSet::new();
    let indices = namespaces
        .map(|ns| table.insert_full(ns.clone()).0)
        .collect();
    (table.into_iter().collect(), indices)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum WriteKind {
    Untagged,
    Tagged,
}

#[derive(Debug)]
struct WriteBatch {
    kind: WriteKind,
    /// `None` for multi-namespace batches.
    namespace: Option<Bytes>,
    ops: Vec<Arc<WriteOp>>,
}

#[derive(Debug)]
enum WriteRequest {
    Raw(WriteBatchRawRequest),
    RawV2(WriteBatchRawV2Request),
    Tagged(WriteTaggedBatchRawRequest),
    TaggedV2(WriteTaggedBatchRawV2Request),
}

impl WriteRequest {
    async fn send(self, client: &dyn NodeClient) -> Result<(), RpcError> {
        match self {
            Self::Raw(req) => client.write_batch_raw(req).await,
            Self::RawV2(req) => client.write_batch_raw_v2(req).await,
            Self::Tagged(req) => client.write_tagged_batch_raw(req).await,
            Self::TaggedV2(req) => client.write_tagged_batch_raw_v2(req).await,
        }
    }
}

impl WriteBatch {
    fn request(&self) -> WriteRequest {
        match (self.kind, &self.namespace) {
            (WriteKind::Untagged, Some(namespace)) => WriteRequest::Raw(WriteBatchRawRequest {
                namespace: namespace.clone(),
                elements: self
                    .ops
                    .iter()
                    .map(|op| WriteBatchRawRequestElement {
                        id: op.id.clone(),
                        datapoint: op.datapoint.clone(),
                    })
                    .collect(),
            }),
            (WriteKind::Tagged, Some(namespace)) => {
                WriteRequest::Tagged(WriteTaggedBatchRawRequest {
                    namespace: namespace.clone(),
                    elements: self
                        .ops
                        .iter()
                        .map(|op| WriteTaggedBatchRawRequestElement {
                            id: op.id.clone(),
                            encoded_tags: op.encoded_tags.clone(),
                            datapoint: op.datapoint.clone(),
                        })
                        .collect(),
                })
            }
            (WriteKind::Untagged, None) => {
                let (namespaces, indices) =
                    namespace_table(self.ops.iter().map(|op| &op.namespace));
                WriteRequest::RawV2(WriteBatchRawV2Request {
                    namespaces,
                    elements: self
                        .ops
                        .iter()
                        .zip(indices)
                        .map(|(op, namespace)| WriteBatchRawV2RequestElement {
                            namespace,
                            id: op.id.clone(),
                            datapoint: op.datapoint.clone(),
                        })
                        .collect(),
                })
            }
            (WriteKind::Tagged, None) => {
                let (namespaces, indices) =
                    namespace_table(self.ops.iter().map(|op| &op.namespace));
                WriteRequest::TaggedV2(WriteTaggedBatchRawV2Request {
                    namespaces,
                    elements: self
                        .ops
                        .iter()
                        .zip(indices)
                        .map(|(op, namespace)| WriteTaggedBatchRawV2RequestElement {
                            namespace,
                            id: op.id.clone(),
                            encoded_tags: op.encoded_tags.clone(),
                            datapoint: op.datapoint.clone(),
                        })
                        .collect(),
                })
            }
        }
    }
}

/// Write ops of one drained array, grouped by kind and, for the v1 APIs, namespace.
#[derive(Debug)]
struct WriteGroups {
    v2: bool,
    batch_size: usize,
    groups: IndexMap<(WriteKind, Option<Bytes>), Vec<Arc<WriteOp>>>,
}

impl WriteGroups {
    fn new(v2: bool, batch_size: usize) -> Self {
        Self {
            v2,
            batch_size,
            groups: IndexMap::new(),
        }
    }

    /// Add `op`, returning its group as a batch once the group is full.
    fn push(&mut self, kind: WriteKind, op: Arc<WriteOp>) -> Option<WriteBatch> {
        let namespace = (!self.v2).then(|| op.namespace.clone());
        let key = (kind, namespace);
        let group = self.groups.entry(key.clone()).or_default();
        group.push(op);
        if group.len() < self.batch_size {
            return None;
        }
        let ops = std::mem::take(group);
        Some(WriteBatch {
            kind: key.0,
            namespace: key.1,
            ops,
        })
    }

    fn finish(self) -> impl Iterator<Item = WriteBatch> {
        self.groups
            .into_iter()
            .filter(|(_, ops)| !ops.is_empty())
            .map(|((kind, namespace), ops)| WriteBatch {
                kind,
                namespace,
                ops,
            })
    }
}
