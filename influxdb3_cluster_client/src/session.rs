//! The session: the caller facing entry point of the client.
//!
//! A session keeps one [`HostQueue`] per host of the current topology snapshot. Writes are
//! routed to the replicas of the series' shard, reads by id to the same replicas and index
//! queries to every host. Each attempt captures the snapshot it was routed with, so topology
//! changes only affect attempts that start after the change was applied.

use std::{future::Future, sync::Arc, time::Duration};

use bytes::Bytes;
use hashbrown::HashMap;
use influxdb3_cluster_topology::{
    ConnectConsistencyLevel, Host, ShardState, Topology, TopologyMap, TopologyWatch,
    consistency::num_desired_for_read_consistency,
};
use iox_time::{Time, TimeProvider};
use metric::Registry;
use observability_deps::tracing::{error, info, warn};
use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    Error, Result, Status,
    config::Options,
    datapoint::Datapoint,
    fetch_state::{FetchKind, FetchState, IdFetchState},
    host_queue::HostQueue,
    iterator::{
        AggregatedTagsIterator, IteratorPools, PlainSegmentCodec, SegmentReaderFactory,
        SeriesIterator, TaggedIdsIterator,
    },
    metrics::{SessionMetrics, host_queue_health},
    op::{AggregateOp, FetchBatchOp, FetchTaggedOp, Op, TruncateOp, WriteOp},
    peers::Peers,
    query::{AggregateOptions, FetchResponseMetadata, Query, QueryOptions},
    retry::Retrier,
    rpc::{
        AggregateQueryRawRequest, FetchTaggedRequest, NodeClient, NodeConnector, RpcDatapoint,
        TruncateRequest, TruncateResult,
    },
    tags::{Tag, encode_tags},
    write_state::WriteState,
};

/// How often the connections of new host queues are checked while connecting to a cluster.
const CLUSTER_CONNECT_WAIT_INTERVAL: Duration = Duration::from_millis(10);

/// A connection to a sharded, replicated cluster of storage nodes.
#[derive(Debug, Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

#[derive(Debug)]
struct SessionInner {
    opts: Arc<Options>,
    topology: Arc<dyn Topology>,
    connector: Arc<dyn NodeConnector>,
    time_provider: Arc<dyn TimeProvider>,
    registry: Arc<Registry>,
    pools: IteratorPools,
    /// Dispatches in flight across every host queue.
    workers: Arc<Semaphore>,
    write_retrier: Retrier,
    fetch_retrier: Retrier,
    metrics: SessionMetrics,
    state: RwLock<SessionState>,
    /// Serializes open and close.
    lifecycle: Mutex<()>,
    shutdown: CancellationToken,
}

#[derive(Debug)]
struct SessionState {
    status: Status,
    current: Option<Arc<QueueSet>>,
}

/// A topology snapshot and the host queues lined up with its hosts.
#[derive(Debug)]
struct QueueSet {
    topology: Arc<TopologyMap>,
    queues: Vec<Arc<HostQueue>>,
    by_host: HashMap<String, usize>,
}

impl QueueSet {
    fn new(topology: Arc<TopologyMap>, queues: Vec<Arc<HostQueue>>) -> Self {
        let by_host = queues
            .iter()
            .enumerate()
            .map(|(idx, q)| (q.host().id().to_string(), idx))
            .collect();
        Self {
            topology,
            queues,
            by_host,
        }
    }

    fn queue(&self, host_id: &str) -> Option<&Arc<HostQueue>> {
        self.by_host.get(host_id).map(|idx| &self.queues[*idx])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteKind {
    Untagged,
    Tagged,
}

impl Session {
    pub fn new(
        opts: Options,
        topology: Arc<dyn Topology>,
        connector: Arc<dyn NodeConnector>,
        time_provider: Arc<dyn TimeProvider>,
        registry: Arc<Registry>,
    ) -> Result<Self> {
        opts.validate()?;
        let pools = IteratorPools::new(Arc::new(PlainSegmentCodec), opts.equal_timestamp_strategy);
        let inner = SessionInner {
            workers: Arc::new(Semaphore::new(opts.host_queue_dispatch_pool_size)),
            write_retrier: Retrier::new(opts.write_retry, "write", &registry),
            fetch_retrier: Retrier::new(opts.fetch_retry, "fetch", &registry),
            metrics: SessionMetrics::new(&registry),
            opts: Arc::new(opts),
            topology,
            connector,
            time_provider,
            registry,
            pools,
            state: RwLock::new(SessionState {
                status: Status::NotOpen,
                current: None,
            }),
            lifecycle: Mutex::new(()),
            shutdown: CancellationToken::new(),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Decode replica segments with `factory` instead of the plain segment codec.
    pub fn with_reader_factory(self, factory: Arc<dyn SegmentReaderFactory>) -> Result<Self> {
        let inner = Arc::try_unwrap(self.inner).map_err(|_| {
            Error::InvalidOptions("reader factory must be set before the session is shared".into())
        })?;
        let strategy = inner.pools.equal_timestamp_strategy();
        Ok(Self {
            inner: Arc::new(SessionInner {
                pools: IteratorPools::new(factory, strategy),
                ..inner
            }),
        })
    }

    /// Connect to the hosts of the current topology and start following topology changes.
    ///
    /// Waits until the cluster connect consistency level is met. A session can only be opened
    /// once.
    pub async fn open(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.inner.state.read().status != Status::NotOpen {
            return Err(Error::SessionNotInitial);
        }

        let watch = self.inner.topology.watch();
        let set = self.inner.queue_set(watch.get(), None).await?;
        let num_hosts = set.queues.len();
        {
            let mut state = self.inner.state.write();
            state.status = Status::Open;
            state.current = Some(Arc::new(set));
        }
        tokio::spawn(Arc::clone(&self.inner).follow_topology(watch));

        info!(hosts = num_hosts, "session opened");
        Ok(())
    }

    /// Close every host queue. Ops already enqueued are still sent.
    pub async fn close(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let current = {
            let mut state = self.inner.state.write();
            if state.status != Status::Open {
                return Err(Error::SessionNotOpen);
            }
            state.status = Status::Closed;
            state.current.take()
        };
        self.inner.shutdown.cancel();

        if let Some(set) = current {
            for queue in &set.queues {
                queue.close().await;
            }
        }
        info!("session closed");
        Ok(())
    }

    pub async fn write(&self, namespace: Bytes, id: Bytes, datapoint: Datapoint) -> Result<()> {
        let datapoint = self.inner.rpc_datapoint(datapoint)?;
        self.inner
            .write_retrier
            .attempt(|| {
                self.inner.write_attempt(
                    WriteKind::Untagged,
                    namespace.clone(),
                    id.clone(),
                    Bytes::new(),
                    datapoint.clone(),
                )
            })
            .await
    }

    /// Write a datapoint to a series with tags. The tags are encoded once and shared by every
    /// replica.
    pub async fn write_tagged(
        &self,
        namespace: Bytes,
        id: Bytes,
        tags: &[Tag],
        datapoint: Datapoint,
    ) -> Result<()> {
        let encoded_tags = encode_tags(tags).map_err(Error::non_retryable)?;
        let datapoint = self.inner.rpc_datapoint(datapoint)?;
        self.inner
            .write_retrier
            .attempt(|| {
                self.inner.write_attempt(
                    WriteKind::Tagged,
                    namespace.clone(),
                    id.clone(),
                    encoded_tags.clone(),
                    datapoint.clone(),
                )
            })
            .await
    }

    /// The datapoints of one series in `[start, end)`.
    pub async fn fetch(
        &self,
        namespace: Bytes,
        id: Bytes,
        start: Time,
        end: Time,
    ) -> Result<SeriesIterator> {
        self.fetch_ids(namespace, vec![id], start, end)
            .await?
            .pop()
            .ok_or_else(|| Error::Invariant("fetch returned no series".to_string()))
    }

    /// The datapoints of each series in `[start, end)`, in the order of `ids`.
    pub async fn fetch_ids(
        &self,
        namespace: Bytes,
        ids: Vec<Bytes>,
        start: Time,
        end: Time,
    ) -> Result<Vec<SeriesIterator>> {
        if start > end {
            return Err(Error::non_retryable(Error::InvalidQuery(format!(
                "fetch start {start:?} is after end {end:?}"
            ))));
        }
        self.inner
            .fetch_retrier
            .attempt(|| self.inner.fetch_ids_attempt(&namespace, &ids, start, end))
            .await
    }

    /// The series matching `query` with their datapoints.
    pub async fn fetch_tagged(
        &self,
        namespace: Bytes,
        query: Query,
        opts: QueryOptions,
    ) -> Result<(Vec<SeriesIterator>, FetchResponseMetadata)> {
        validate_query(&query, &opts)?;
        self.inner
            .fetch_retrier
            .attempt(|| async {
                let state = self
                    .inner
                    .fetch_state_attempt(FetchKind::FetchTagged, &opts, |state| {
                        Op::FetchTagged(Arc::new(FetchTaggedOp {
                            request: fetch_tagged_request(&namespace, &query, &opts, true),
                            completion: state.fetch_tagged_completion(),
                        }))
                    })
                    .await?;
                let (iters, meta) = state.as_series_iterators(&self.inner.pools)?;
                check_exhaustive(&opts, iters.len(), &meta)?;
                Ok((iters, meta))
            })
            .await
    }

    /// The ids and tags of the series matching `query`, without their datapoints.
    pub async fn fetch_tagged_ids(
        &self,
        namespace: Bytes,
        query: Query,
        opts: QueryOptions,
    ) -> Result<(TaggedIdsIterator, FetchResponseMetadata)> {
        validate_query(&query, &opts)?;
        self.inner
            .fetch_retrier
            .attempt(|| async {
                let state = self
                    .inner
                    .fetch_state_attempt(FetchKind::FetchTagged, &opts, |state| {
                        Op::FetchTagged(Arc::new(FetchTaggedOp {
                            request: fetch_tagged_request(&namespace, &query, &opts, false),
                            completion: state.fetch_tagged_completion(),
                        }))
                    })
                    .await?;
                let (iter, meta) = state.as_tagged_ids_iterator()?;
                check_exhaustive(&opts, iter.remaining(), &meta)?;
                Ok((iter, meta))
            })
            .await
    }

    /// The tag names, and optionally values, of the series matching `query`.
    pub async fn aggregate(
        &self,
        namespace: Bytes,
        query: Query,
        opts: AggregateOptions,
    ) -> Result<(AggregatedTagsIterator, FetchResponseMetadata)> {
        let query_opts = &opts.query_options;
        validate_query(&query, query_opts)?;
        self.inner
            .fetch_retrier
            .attempt(|| async {
                let state = self
                    .inner
                    .fetch_state_attempt(FetchKind::Aggregate, query_opts, |state| {
                        Op::Aggregate(Arc::new(AggregateOp {
                            request: AggregateQueryRawRequest {
                                namespace: namespace.clone(),
                                query: query.clone(),
                                range_start: query_opts.start.timestamp_nanos(),
                                range_end: query_opts.end.timestamp_nanos(),
                                tag_name_filter: opts.field_filter.clone(),
                                aggregate_query_type: opts.aggregate_type,
                                series_limit: query_opts.series_limit,
                                docs_limit: query_opts.docs_limit,
                            },
                            completion: state.aggregate_completion(),
                        }))
                    })
                    .await?;
                let (iter, meta) = state.as_aggregated_tags_iterator()?;
                check_exhaustive(query_opts, iter.remaining(), &meta)?;
                Ok((iter, meta))
            })
            .await
    }

    /// The shard owning `id`.
    pub fn shard_id(&self, id: &[u8]) -> Result<u32> {
        let set = self.inner.current()?;
        Ok(set.topology.shard_set().lookup(id)?)
    }

    /// Drop every series of `namespace` on every host, returning the number of series removed.
    pub async fn truncate(&self, namespace: Bytes) -> Result<u64> {
        let set = self.inner.current()?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let op = Arc::new(TruncateOp {
            request: TruncateRequest { namespace },
            completion: Arc::new(move |result: Result<TruncateResult>| {
                let _ = tx.send(result);
            }),
        });

        let mut enqueued = 0;
        let mut enqueue_errors = vec![];
        for queue in &set.queues {
            match queue.enqueue(Op::Truncate(Arc::clone(&op))).await {
                Ok(()) => enqueued += 1,
                Err(e) => enqueue_errors.push(e),
            }
        }
        drop(op);
        if !enqueue_errors.is_empty() {
            let err = combine(enqueue_errors);
            error!(error = %err, "failed to enqueue truncate");
            return Err(err);
        }

        let mut truncated = 0;
        let mut errors = vec![];
        for _ in 0..enqueued {
            match rx.recv().await {
                Some(Ok(res)) => truncated += res.num_series,
                Some(Err(e)) => errors.push(e),
                None => break,
            }
        }
        if errors.is_empty() {
            Ok(truncated)
        } else {
            Err(combine(errors))
        }
    }

    /// Run `f` with a connection to `host_id` taken from its host queue.
    pub async fn borrow_connection<F, Fut, T>(&self, host_id: &str, f: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn NodeClient>) -> Fut + Send,
        Fut: Future<Output = T> + Send,
    {
        let queue = {
            let set = self.inner.current()?;
            set.queue(host_id).map(Arc::clone).ok_or_else(|| {
                Error::HostNotAvailable(Box::new(Error::NoHostQueueForHost {
                    host: host_id.to_string(),
                }))
            })?
        };
        queue.borrow_connection(f).await
    }

    /// The iterator builders used for results, available while the session is open.
    pub fn iterator_pools(&self) -> Result<IteratorPools> {
        self.inner.current()?;
        Ok(self.inner.pools.clone())
    }

    /// The topology snapshot new operations are routed with.
    pub fn topology_map(&self) -> Result<Arc<TopologyMap>> {
        Ok(Arc::clone(&self.inner.current()?.topology))
    }

    /// The replicas of `shard` other than the origin host.
    pub fn peers_for_shard(&self, shard: u32) -> Result<Peers> {
        let set = self.inner.current()?;
        Peers::for_shard(&set.topology, shard, self.inner.opts.origin.as_ref())
    }

    pub fn origin(&self) -> Option<&Host> {
        self.inner.opts.origin.as_ref()
    }

    pub fn options(&self) -> &Options {
        &self.inner.opts
    }
}

impl SessionInner {
    fn current(&self) -> Result<Arc<QueueSet>> {
        let state = self.state.read();
        match (&state.status, &state.current) {
            (Status::Open, Some(set)) => Ok(Arc::clone(set)),
            _ => Err(Error::SessionNotOpen),
        }
    }

    fn now(&self) -> Time {
        self.time_provider.now()
    }

    fn elapsed_since(&self, start: Time) -> Duration {
        self.now().checked_duration_since(start).unwrap_or_default()
    }

    /// Build the queues for `topology`, reusing the queues of `existing` for hosts that are
    /// still part of it, and wait for the cluster connect consistency level.
    async fn queue_set(
        &self,
        topology: Arc<TopologyMap>,
        existing: Option<&QueueSet>,
    ) -> Result<QueueSet> {
        let mut queues = Vec::with_capacity(topology.hosts().len());
        let mut new_queues = vec![];
        for host in topology.hosts() {
            if let Some(queue) = existing.and_then(|set| set.queue(host.id())) {
                queues.push(Arc::clone(queue));
                continue;
            }
            let health = self
                .opts
                .host_queue_emits_health_status
                .then(|| host_queue_health(&self.registry, host));
            let queue = HostQueue::new(
                host.clone(),
                Arc::clone(&self.connector),
                Arc::clone(&self.opts),
                Arc::clone(&self.workers),
                Arc::clone(&self.time_provider),
                health,
            );
            queue.open().await;
            queues.push(Arc::clone(&queue));
            new_queues.push(queue);
        }

        if let Err(e) = self.wait_for_connections(&topology, &queues).await {
            for queue in new_queues {
                queue.close().await;
            }
            return Err(e);
        }
        Ok(QueueSet::new(topology, queues))
    }

    async fn wait_for_connections(
        &self,
        topology: &TopologyMap,
        queues: &[Arc<HostQueue>],
    ) -> Result<()> {
        let first = self.opts.cluster_connect_consistency_level;
        let mut level = match first {
            ConnectConsistencyLevel::None => return Ok(()),
            ConnectConsistencyLevel::Any => ConnectConsistencyLevel::All,
            level => level,
        };

        let mut start = tokio::time::Instant::now();
        loop {
            let now = tokio::time::Instant::now();
            if now.duration_since(start) >= self.opts.cluster_connect_timeout {
                if first != ConnectConsistencyLevel::Any {
                    return Err(Error::ClusterConnectTimeout);
                }
                start = now;
                level = level.lower();
                if level == ConnectConsistencyLevel::None {
                    warn!(
                        error = %Error::ClusterConnectTimeout,
                        "cluster connect with consistency any, returning success"
                    );
                    return Ok(());
                }
            }

            if self.cluster_available(topology, queues, level)? {
                return Ok(());
            }
            tokio::time::sleep(CLUSTER_CONNECT_WAIT_INTERVAL).await;
        }
    }

    /// Whether every shard has enough replicas with the minimum number of connections.
    fn cluster_available(
        &self,
        topology: &TopologyMap,
        queues: &[Arc<HostQueue>],
        level: ConnectConsistencyLevel,
    ) -> Result<bool> {
        let min = self.opts.min_connection_count;
        for shard in topology.shard_set().all_ids() {
            let mut available = 0;
            topology.route_shard_for_each(shard, |idx, _, _| {
                if queues[idx].connection_count() >= min {
                    available += 1;
                }
            })?;
            let ok = match level {
                ConnectConsistencyLevel::All => available == topology.replicas(),
                ConnectConsistencyLevel::Majority => available >= topology.majority(),
                ConnectConsistencyLevel::One => available > 0,
                ConnectConsistencyLevel::None | ConnectConsistencyLevel::Any => true,
            };
            if !ok {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn follow_topology(self: Arc<Self>, mut watch: TopologyWatch) {
        loop {
            let topology = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                topology = watch.changed() => match topology {
                    Some(topology) => topology,
                    None => return,
                },
            };
            info!("received update for topology");

            let existing = self.state.read().current.clone();
            match self.queue_set(topology, existing.as_deref()).await {
                Ok(set) => self.set_topology(set).await,
                Err(e) => error!(error = %e, "could not update topology map"),
            }
        }
    }

    /// Swap in `set` and close the queues it no longer uses.
    async fn set_topology(&self, set: QueueSet) {
        let num_hosts = set.queues.len();
        let set = Arc::new(set);
        let (retired, applied) = {
            let mut state = self.state.write();
            if state.status == Status::Open {
                let prev = state.current.replace(Arc::clone(&set));
                let retired: Vec<_> = prev
                    .map(|prev| {
                        prev.queues
                            .iter()
                            .filter(|q| {
                                set.queue(q.host().id())
                                    .is_none_or(|new| !Arc::ptr_eq(new, q))
                            })
                            .map(Arc::clone)
                            .collect()
                    })
                    .unwrap_or_default();
                (retired, true)
            } else {
                // closed while the new queues were connecting
                (set.queues.clone(), false)
            }
        };

        if !retired.is_empty() {
            tokio::spawn(async move {
                for queue in retired {
                    queue.close().await;
                }
            });
        }
        if applied {
            info!(hosts = num_hosts, "successfully updated topology");
        }
    }

    fn rpc_datapoint(&self, datapoint: Datapoint) -> Result<RpcDatapoint> {
        let timestamp = datapoint
            .timestamp
            .checked_add(self.opts.write_timestamp_offset)
            .ok_or_else(|| {
                Error::non_retryable(Error::InvalidParams(Box::new(Error::BadRequest(format!(
                    "write timestamp {:?} is out of range",
                    datapoint.timestamp
                )))))
            })?;
        Ok(RpcDatapoint {
            timestamp: timestamp.timestamp_nanos() / datapoint.unit.nanos(),
            timestamp_unit: datapoint.unit,
            value: datapoint.value,
            annotation: (!datapoint.annotation.is_empty()).then_some(datapoint.annotation),
        })
    }

    async fn write_attempt(
        &self,
        kind: WriteKind,
        namespace: Bytes,
        id: Bytes,
        encoded_tags: Bytes,
        datapoint: RpcDatapoint,
    ) -> Result<()> {
        let start = self.now();
        let set = self.current()?;
        let topology = &set.topology;
        let shard = topology.shard_set().lookup(&id)?;

        let mut targets = Vec::with_capacity(topology.replicas());
        topology.route_shard_for_each(shard, |idx, host_shard, _| {
            if !self.opts.write_shards_initializing
                && host_shard.state() == ShardState::Initializing
            {
                return;
            }
            targets.push(idx);
        })?;

        let (state, done) = WriteState::new(
            self.opts.write_consistency_level,
            Arc::clone(topology),
            shard,
            self.opts.shards_leaving_count_towards_consistency,
        );
        state.set_enqueued(targets.len());
        let op = Arc::new(WriteOp {
            namespace,
            shard,
            id,
            encoded_tags,
            datapoint,
            completion: state.completion(),
        });
        for idx in &targets {
            let op = match kind {
                WriteKind::Untagged => Op::Write(Arc::clone(&op)),
                WriteKind::Tagged => Op::WriteTagged(Arc::clone(&op)),
            };
            if let Err(e) = set.queues[*idx].enqueue(op).await {
                error!(error = %e, "[invariant violated] failed to enqueue write");
                return Err(e);
            }
        }
        drop(op);

        if !targets.is_empty() {
            // every enqueued op completes, so the sender outlives this wait
            let _ = done.await;
        }
        let result = state.outcome();
        self.metrics.write.record(
            result.as_ref().map(|_| ()),
            topology.replicas(),
            self.elapsed_since(start),
        );
        if let Err(e) = &result {
            self.log_sampled("write", e);
        }
        result
    }

    async fn fetch_ids_attempt(
        &self,
        namespace: &Bytes,
        ids: &[Bytes],
        start: Time,
        end: Time,
    ) -> Result<Vec<SeriesIterator>> {
        let started = self.now();
        let set = self.current()?;
        let topology = &set.topology;
        let level = self.opts.read_consistency_level;
        let majority = topology.majority();
        let num_desired = num_desired_for_read_consistency(level, topology.replicas(), majority);
        let (range_start, range_end) = (start.timestamp_nanos(), end.timestamp_nanos());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut ops_by_host: Vec<Vec<FetchBatchOp>> =
            (0..set.queues.len()).map(|_| vec![]).collect();
        for (idx, id) in ids.iter().enumerate() {
            let mut hosts = Vec::with_capacity(topology.replicas());
            topology.route_for_each(id, |host_idx, _, _| hosts.push(host_idx))?;

            let state = IdFetchState::new(
                idx,
                level,
                majority,
                hosts.len(),
                num_desired,
                tx.clone(),
            );
            for host_idx in hosts {
                let ops = &mut ops_by_host[host_idx];
                if ops
                    .last()
                    .is_none_or(|op| op.len() >= self.opts.fetch_batch_size)
                {
                    ops.push(FetchBatchOp::new(namespace.clone(), range_start, range_end));
                }
                if let Some(op) = ops.last_mut() {
                    op.append(id.clone(), state.completion());
                }
            }
        }
        drop(tx);

        for (host_idx, ops) in ops_by_host.into_iter().enumerate() {
            for op in ops {
                if let Err(e) = set.queues[host_idx]
                    .enqueue(Op::FetchBatch(Arc::new(op)))
                    .await
                {
                    error!(error = %e, "failed to enqueue fetch");
                    return Err(e);
                }
            }
        }

        let mut replicas_by_id: Vec<Option<_>> = (0..ids.len()).map(|_| None).collect();
        let mut first_err = None;
        for _ in 0..ids.len() {
            let Some((idx, result)) = rx.recv().await else {
                break;
            };
            match result {
                Ok(replicas) => replicas_by_id[idx] = Some(replicas),
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        self.metrics.fetch.record(
            first_err.as_ref().map_or(Ok(()), Err),
            topology.replicas(),
            self.elapsed_since(started),
        );
        if let Some(e) = first_err {
            self.log_sampled("fetch", &e);
            return Err(e);
        }

        ids.iter()
            .zip(replicas_by_id)
            .map(|(id, replicas)| {
                let replicas = replicas.ok_or_else(|| {
                    Error::Invariant("fetch completed without a result for every id".to_string())
                })?;
                Ok(self.pools.series_iterator_from_segments(
                    namespace.clone(),
                    id.clone(),
                    vec![],
                    (start, end),
                    replicas,
                ))
            })
            .collect()
    }

    /// Enqueue the op built by `make_op` on every host and wait until its fetch state is done.
    async fn fetch_state_attempt(
        &self,
        kind: FetchKind,
        opts: &QueryOptions,
        make_op: impl FnOnce(&Arc<FetchState>) -> Op + Send,
    ) -> Result<Arc<FetchState>> {
        let started = self.now();
        let set = self.current()?;
        let (state, done) = FetchState::new(
            kind,
            self.opts.read_consistency_level,
            Arc::clone(&set.topology),
            (opts.start, opts.end),
            opts.series_limit,
        );
        let op = make_op(&state);
        for queue in &set.queues {
            if let Err(e) = queue.enqueue(op.clone()).await {
                let err = Error::non_retryable(Error::Invariant(format!(
                    "failed to enqueue in fetch state: {e}"
                )));
                error!(error = %err, "failed to enqueue fetch");
                return Err(err);
            }
        }
        drop(op);

        // topologies always have a host, so every fetch state has a completion to wait for
        let _ = done.await;
        let outcome = state.outcome();
        self.metrics.fetch.record(
            outcome.as_ref().map(|_| ()),
            set.topology.replicas(),
            self.elapsed_since(started),
        );
        if let Err(e) = &outcome {
            self.log_sampled("fetch", e);
        }
        outcome?;
        Ok(state)
    }

    fn log_sampled(&self, op: &'static str, err: &Error) {
        let rate = self.opts.log_error_sample_rate;
        if rate > 0.0 && rand::thread_rng().gen_bool(rate) {
            error!(op, error = %err, "session operation failed");
        }
    }
}

fn validate_query(query: &Query, opts: &QueryOptions) -> Result<()> {
    query.validate().map_err(Error::non_retryable)?;
    opts.validate().map_err(Error::non_retryable)
}

fn fetch_tagged_request(
    namespace: &Bytes,
    query: &Query,
    opts: &QueryOptions,
    fetch_data: bool,
) -> FetchTaggedRequest {
    FetchTaggedRequest {
        namespace: namespace.clone(),
        query: query.clone(),
        range_start: opts.start.timestamp_nanos(),
        range_end: opts.end.timestamp_nanos(),
        fetch_data,
        series_limit: opts.series_limit,
        docs_limit: opts.docs_limit,
        require_exhaustive: opts.require_exhaustive,
    }
}

fn check_exhaustive(
    opts: &QueryOptions,
    returned: usize,
    meta: &FetchResponseMetadata,
) -> Result<()> {
    if opts.require_exhaustive && !meta.exhaustive {
        return Err(Error::non_retryable(Error::ResourceExhausted {
            limit: opts.series_limit.unwrap_or(returned),
            returned,
        }));
    }
    Ok(())
}

/// A single error as is, several as [`Error::Multi`].
fn combine(mut errors: Vec<Error>) -> Error {
    if errors.len() == 1 {
        if let Some(err) = errors.pop() {
            return err;
        }
    }
    Error::Multi(errors)
}

#[cfg(test)]
mod tests {
    use iox_time::MockProvider;
    use metric::{Attributes, Metric, U64Counter};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        iterator::{AggregatedTag, EqualTimestampStrategy},
        retry::RetryOptions,
        rpc::{
            AggregateQueryRawResult, AggregateTagNameElement, FetchTaggedIdResult,
            FetchTaggedResult, RpcError, Segments, WriteTaggedBatchRawRequest,
            WriteTaggedBatchRawRequestElement,
            mock::{Call, MockConnector, MockNodeClient},
        },
        test_util::{ring, ring_with_states, wait_until},
    };
    use influxdb3_cluster_topology::{
        ConsistencyLevel, DynamicTopology, HostShardSet, ReadConsistencyLevel, Shard, ShardSet,
    };

    fn opts() -> Options {
        let retry = RetryOptions {
            initial_backoff: Duration::from_millis(10),
            max_retries: 2,
            ..Default::default()
        };
        Options {
            min_connection_count: 1,
            max_connection_count: 1,
            background_connect_interval: Duration::from_secs(60),
            background_health_check_interval: Duration::from_secs(60),
            host_queue_ops_flush_size: 1,
            host_queue_ops_flush_interval: Duration::ZERO,
            cluster_connect_consistency_level: ConnectConsistencyLevel::All,
            cluster_connect_timeout: Duration::from_secs(1),
            write_retry: retry,
            fetch_retry: retry,
            ..Default::default()
        }
    }

    fn session_with(
        opts: Options,
        topology: Arc<dyn Topology>,
        connector: &Arc<MockConnector>,
    ) -> (Session, Arc<Registry>) {
        let registry = Arc::new(Registry::new());
        let session = Session::new(
            opts,
            topology,
            Arc::clone(connector) as _,
            Arc::new(MockProvider::new(Time::from_timestamp_nanos(0))),
            Arc::clone(&registry),
        )
        .unwrap();
        (session, registry)
    }

    async fn open_session(
        opts: Options,
        topology: TopologyMap,
        connector: &Arc<MockConnector>,
    ) -> Session {
        let (session, _) = session_with(opts, Arc::new(Arc::new(topology)), connector);
        session.open().await.unwrap();
        session
    }

    fn datapoint(nanos: i64, value: f64) -> Datapoint {
        Datapoint::new(Time::from_timestamp_nanos(nanos), value)
    }

    fn writes(client: &MockNodeClient) -> usize {
        client
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::WriteBatchRaw(_) | Call::WriteTaggedBatchRaw(_)))
            .count()
    }

    fn range() -> QueryOptions {
        QueryOptions::new(Time::from_timestamp_nanos(0), Time::from_timestamp_nanos(100))
    }

    #[tokio::test(start_paused = true)]
    async fn lifecycle() {
        let connector = Arc::new(MockConnector::new());
        let (session, _) = session_with(opts(), Arc::new(Arc::new(ring(3, 4, 3))), &connector);

        assert!(matches!(session.iterator_pools(), Err(Error::SessionNotOpen)));
        assert!(matches!(session.close().await, Err(Error::SessionNotOpen)));

        session.open().await.unwrap();
        assert!(matches!(session.open().await, Err(Error::SessionNotInitial)));
        assert!(session.iterator_pools().is_ok());
        assert_eq!(session.topology_map().unwrap().hosts().len(), 3);

        session.close().await.unwrap();
        assert!(matches!(session.close().await, Err(Error::SessionNotOpen)));
        let err = session
            .write(Bytes::from("ns"), Bytes::from("a"), datapoint(1, 1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionNotOpen));
        for host in ["h0", "h1", "h2"] {
            wait_until(|| connector.client(host).closes() == 1).await;
        }
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn write_meets_majority_with_a_failed_replica() {
        let connector = Arc::new(
            MockConnector::new()
                .with_client("h2", MockNodeClient::new().with_write_ret([Err(RpcError::Timeout)])),
        );
        let session = open_session(opts(), ring(3, 4, 3), &connector).await;

        session
            .write(Bytes::from("ns"), Bytes::from("cpu"), datapoint(5, 1.5))
            .await
            .unwrap();
        for host in ["h0", "h1", "h2"] {
            let client = connector.client(host);
            wait_until(|| writes(&client) == 1).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn write_with_bad_request_is_not_retried() {
        let connector = Arc::new(MockConnector::new().with_client(
            "h1",
            MockNodeClient::new()
                .with_write_ret([Err(RpcError::BadRequest("invalid timestamp".to_string()))]),
        ));
        let session = open_session(
            Options {
                write_consistency_level: ConsistencyLevel::All,
                ..opts()
            },
            ring(3, 4, 3),
            &connector,
        )
        .await;

        let err = session
            .write(Bytes::from("ns"), Bytes::from("cpu"), datapoint(5, 1.5))
            .await
            .unwrap_err();
        assert!(err.is_consistency_result_error());
        assert!(err.is_non_retryable());
        assert_eq!(err.num_success(), 2);
        assert_eq!(err.num_responded(), 3);
        assert_eq!(writes(&connector.client("h1")), 1);
        assert_eq!(writes(&connector.client("h0")), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_writes_are_retried() {
        let fail = || Err(RpcError::Internal("overloaded".to_string()));
        let connector = Arc::new(
            MockConnector::new()
                .with_client("h0", MockNodeClient::new().with_write_ret([fail()]))
                .with_client("h1", MockNodeClient::new().with_write_ret([fail()])),
        );
        let (session, registry) = session_with(
            opts(),
            Arc::new(Arc::new(ring(3, 4, 3))),
            &connector,
        );
        session.open().await.unwrap();

        session
            .write(Bytes::from("ns"), Bytes::from("cpu"), datapoint(5, 1.5))
            .await
            .unwrap();
        let h0 = connector.client("h0");
        wait_until(|| writes(&h0) == 2).await;

        let errors = registry
            .get_instrument::<Metric<U64Counter>>("cluster_client_write_errors")
            .unwrap()
            .get_observer(&Attributes::from(&[("kind", "internal")]))
            .unwrap()
            .fetch();
        assert_eq!(errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn write_tagged_encodes_tags_once() {
        let connector = Arc::new(MockConnector::new());
        let session = open_session(
            Options {
                write_consistency_level: ConsistencyLevel::All,
                write_timestamp_offset: Duration::from_secs(1),
                ..opts()
            },
            ring(2, 2, 2),
            &connector,
        )
        .await;
        let tags = [Tag::new("host", "a"), Tag::new("region", "eu")];
        session
            .write_tagged(
                Bytes::from("ns"),
                Bytes::from("cpu"),
                &tags,
                datapoint(2_000_000, 1.0)
                    .with_unit(crate::datapoint::TimeUnit::Millisecond)
                    .with_annotation("note"),
            )
            .await
            .unwrap();

        let expected = Call::WriteTaggedBatchRaw(WriteTaggedBatchRawRequest {
            namespace: Bytes::from("ns"),
            elements: vec![WriteTaggedBatchRawRequestElement {
                id: Bytes::from("cpu"),
                encoded_tags: encode_tags(&tags).unwrap(),
                datapoint: RpcDatapoint {
                    timestamp: 1_002,
                    timestamp_unit: crate::datapoint::TimeUnit::Millisecond,
                    value: 1.0,
                    annotation: Some(Bytes::from("note")),
                },
            }],
        });
        assert_eq!(connector.client("h0").calls(), vec![expected.clone()]);
        assert_eq!(connector.client("h1").calls(), vec![expected]);
    }

    #[tokio::test(start_paused = true)]
    async fn initializing_replicas_are_skipped() {
        let connector = Arc::new(MockConnector::new());
        let topology = ring_with_states(3, 1, 3, |host, _| {
            if host == 0 {
                ShardState::Initializing
            } else {
                ShardState::Available
            }
        });
        let session = open_session(
            Options {
                write_shards_initializing: false,
                ..opts()
            },
            topology,
            &connector,
        )
        .await;

        session
            .write(Bytes::from("ns"), Bytes::from("cpu"), datapoint(5, 1.5))
            .await
            .unwrap();
        wait_until(|| writes(&connector.client("h2")) == 1).await;
        assert_eq!(writes(&connector.client("h0")), 0);
    }

    fn series(points: &[(i64, f64)]) -> Vec<Segments> {
        let dps: Vec<_> = points.iter().map(|(t, v)| datapoint(*t, *v)).collect();
        vec![Segments {
            merged: Some(PlainSegmentCodec.encode(&dps)),
            unmerged: vec![],
        }]
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_merges_replicas() {
        let connector = Arc::new(
            MockConnector::new()
                .with_client("h0", MockNodeClient::new().with_series("cpu", series(&[(10, 1.0)])))
                .with_client("h1", MockNodeClient::new().with_series("cpu", series(&[(10, 2.5)])))
                .with_client("h2", MockNodeClient::new().with_series("cpu", series(&[(10, 9.0)]))),
        );
        let session = open_session(
            Options {
                read_consistency_level: ReadConsistencyLevel::All,
                equal_timestamp_strategy: EqualTimestampStrategy::HighestValue,
                ..opts()
            },
            ring(3, 1, 3),
            &connector,
        )
        .await;

        let iter = session
            .fetch(
                Bytes::from("ns"),
                Bytes::from("cpu"),
                Time::from_timestamp_nanos(0),
                Time::from_timestamp_nanos(100),
            )
            .await
            .unwrap();
        assert_eq!(iter.id(), &Bytes::from("cpu"));
        assert_eq!(iter.replicas(), 3);
        let values: Vec<_> = iter.map(|dp| dp.unwrap().value).collect();
        assert_eq!(values, vec![9.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_ids_batches_per_host() {
        let connector = Arc::new(MockConnector::new());
        let (session, registry) = session_with(
            Options {
                fetch_batch_size: 2,
                read_consistency_level: ReadConsistencyLevel::One,
                ..opts()
            },
            Arc::new(Arc::new(ring(1, 1, 1))),
            &connector,
        );
        session.open().await.unwrap();

        let ids: Vec<_> = ["a", "b", "c"].into_iter().map(Bytes::from).collect();
        let iters = session
            .fetch_ids(
                Bytes::from("ns"),
                ids.clone(),
                Time::from_timestamp_nanos(0),
                Time::from_timestamp_nanos(100),
            )
            .await
            .unwrap();
        let got: Vec<_> = iters.iter().map(|it| it.id().clone()).collect();
        assert_eq!(got, ids);
        let fetches: Vec<_> = connector
            .client("h0")
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::FetchBatchRaw(req) => Some(req.ids.len()),
                _ => None,
            })
            .collect();
        assert_eq!(fetches, vec![2, 1]);

        // one call, one outcome
        let success = registry
            .get_instrument::<Metric<U64Counter>>("cluster_client_fetch_success")
            .unwrap()
            .get_observer(&Attributes::from([]))
            .unwrap()
            .fetch();
        assert_eq!(success, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_ids_fails_without_quorum() {
        let fail = || Err(RpcError::Internal("boom".to_string()));
        let connector = Arc::new(
            MockConnector::new()
                .with_client("h0", MockNodeClient::new().with_fetch_ret([fail(), fail(), fail()]))
                .with_client("h1", MockNodeClient::new().with_fetch_ret([fail(), fail(), fail()])),
        );
        let session = open_session(opts(), ring(3, 1, 3), &connector).await;

        let err = session
            .fetch(
                Bytes::from("ns"),
                Bytes::from("cpu"),
                Time::from_timestamp_nanos(0),
                Time::from_timestamp_nanos(100),
            )
            .await
            .unwrap_err();
        assert!(err.is_consistency_result_error());
        assert_eq!(err.num_success(), 1);
        assert_eq!(err.num_error(), 2);
    }

    fn tagged_id(id: &'static str) -> FetchTaggedIdResult {
        FetchTaggedIdResult {
            id: Bytes::from_static(id.as_bytes()),
            namespace: Bytes::from_static(b"ns"),
            encoded_tags: encode_tags(&[Tag::new("city", id)]).unwrap(),
            segments: vec![],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_tagged_from_every_host() {
        let connector = Arc::new(
            MockConnector::new()
                .with_client(
                    "h0",
                    MockNodeClient::new().with_fetch_tagged_ret([Ok(FetchTaggedResult {
                        elements: vec![tagged_id("b"), tagged_id("a")],
                        exhaustive: true,
                    })]),
                )
                .with_client(
                    "h1",
                    MockNodeClient::new().with_fetch_tagged_ret([Ok(FetchTaggedResult {
                        elements: vec![tagged_id("a")],
                        exhaustive: true,
                    })]),
                ),
        );
        let session = open_session(
            Options {
                read_consistency_level: ReadConsistencyLevel::All,
                ..opts()
            },
            ring(2, 2, 2),
            &connector,
        )
        .await;

        let (iters, meta) = session
            .fetch_tagged(Bytes::from("ns"), Query::term("city", "a"), range())
            .await
            .unwrap();
        let ids: Vec<_> = iters.iter().map(|it| it.id().clone()).collect();
        assert_eq!(ids, vec![Bytes::from("a"), Bytes::from("b")]);
        assert_eq!(iters[0].replicas(), 2);
        assert_eq!(iters[0].tags(), &[Tag::new("city", "a")]);
        assert!(meta.exhaustive);
        assert_eq!(meta.responses, 3);

        for host in ["h0", "h1"] {
            let calls = connector.client(host).calls();
            assert!(matches!(
                &calls[..],
                [Call::FetchTagged(FetchTaggedRequest { fetch_data: true, .. })]
            ));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_tagged_ids_require_exhaustive() {
        let partial = || {
            Ok(FetchTaggedResult {
                elements: vec![tagged_id("a")],
                exhaustive: false,
            })
        };
        let connector = Arc::new(
            MockConnector::new()
                .with_client("h0", MockNodeClient::new().with_fetch_tagged_ret([partial(), partial()])),
        );
        let session = open_session(opts(), ring(1, 1, 1), &connector).await;

        let (iter, meta) = session
            .fetch_tagged_ids(Bytes::from("ns"), Query::All, range())
            .await
            .unwrap();
        assert_eq!(iter.remaining(), 1);
        assert!(!meta.exhaustive);

        let err = session
            .fetch_tagged_ids(
                Bytes::from("ns"),
                Query::All,
                QueryOptions {
                    require_exhaustive: true,
                    ..range().with_series_limit(1)
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_non_retryable());
        assert!(matches!(
            err,
            Error::NonRetryable(inner) if matches!(*inner, Error::ResourceExhausted { limit: 1, returned: 1 })
        ));
        // not retried
        assert_eq!(connector.client("h0").calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_query_is_rejected_before_fanning_out() {
        let connector = Arc::new(MockConnector::new());
        let session = open_session(opts(), ring(1, 1, 1), &connector).await;
        let err = session
            .fetch_tagged(Bytes::from("ns"), Query::term("", "a"), range())
            .await
            .unwrap_err();
        assert!(err.is_non_retryable());
        assert!(connector.client("h0").calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn aggregate_unions_host_values() {
        let agg = |values: &[&'static str]| {
            Ok(AggregateQueryRawResult {
                results: vec![AggregateTagNameElement {
                    tag_name: Bytes::from("region"),
                    tag_values: values.iter().map(|v| Bytes::from_static(v.as_bytes())).collect(),
                }],
                exhaustive: true,
            })
        };
        let connector = Arc::new(
            MockConnector::new()
                .with_client("h0", MockNodeClient::new().with_aggregate_ret([agg(&["eu", "us"])]))
                .with_client("h1", MockNodeClient::new().with_aggregate_ret([agg(&["ap", "eu"])])),
        );
        let session = open_session(
            Options {
                read_consistency_level: ReadConsistencyLevel::All,
                ..opts()
            },
            ring(2, 2, 2),
            &connector,
        )
        .await;

        let (iter, meta) = session
            .aggregate(
                Bytes::from("ns"),
                Query::All,
                AggregateOptions::new(range().with_series_limit(10)),
            )
            .await
            .unwrap();
        let tags: Vec<_> = iter.collect();
        assert_eq!(
            tags,
            vec![AggregatedTag {
                name: Bytes::from("region"),
                values: vec![Bytes::from("ap"), Bytes::from("eu"), Bytes::from("us")],
            }]
        );
        assert!(meta.exhaustive);
    }

    #[tokio::test(start_paused = true)]
    async fn truncate_sums_hosts() {
        let connector = Arc::new(
            MockConnector::new()
                .with_client("h0", MockNodeClient::new().with_truncate_ret([Ok(TruncateResult { num_series: 2 })]))
                .with_client("h1", MockNodeClient::new().with_truncate_ret([Ok(TruncateResult { num_series: 3 })])),
        );
        let session = open_session(opts(), ring(2, 2, 2), &connector).await;
        assert_eq!(session.truncate(Bytes::from("ns")).await.unwrap(), 5);

        let failing = Arc::new(MockConnector::new().with_client(
            "h0",
            MockNodeClient::new().with_truncate_ret([Err(RpcError::Internal("disk".to_string()))]),
        ));
        let session = open_session(opts(), ring(2, 2, 2), &failing).await;
        let err = session.truncate(Bytes::from("ns")).await.unwrap_err();
        assert!(matches!(err, Error::InternalServer(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn borrow_connection() {
        let connector = Arc::new(MockConnector::new());
        let session = open_session(opts(), ring(2, 2, 2), &connector).await;

        let health = session
            .borrow_connection("h1", |client| async move { client.health().await })
            .await
            .unwrap()
            .unwrap();
        assert!(health.ok);

        let err = session
            .borrow_connection("h9", |client| async move { client.health().await })
            .await
            .unwrap_err();
        assert!(err.is_host_not_available());
    }

    #[tokio::test(start_paused = true)]
    async fn shard_id_and_peers() {
        let connector = Arc::new(MockConnector::new());
        let topology = ring(3, 6, 3);
        let expected = topology.shard_set().lookup(b"cpu").unwrap();
        let session = open_session(
            Options {
                origin: Some(Host::new("h1", "10.0.0.1:9000")),
                ..opts()
            },
            topology,
            &connector,
        )
        .await;

        assert_eq!(session.shard_id(b"cpu").unwrap(), expected);
        let peers = session.peers_for_shard(expected).unwrap();
        assert_eq!(peers.hosts().len(), 2);
        assert!(peers.origin_excluded());
        assert!(peers.hosts().iter().all(|h| h.id() != "h1"));
    }

    #[tokio::test(start_paused = true)]
    async fn cluster_connect_timeout() {
        let connector = Arc::new(MockConnector::new());
        connector.refuse("h0");
        let (session, _) = session_with(opts(), Arc::new(Arc::new(ring(3, 3, 3))), &connector);
        assert!(matches!(
            session.open().await,
            Err(Error::ClusterConnectTimeout)
        ));
        // the queues built for the failed open are closed
        for host in ["h1", "h2"] {
            wait_until(|| connector.client(host).closes() == 1).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cluster_connect_any_steps_down() {
        let connector = Arc::new(MockConnector::new());
        for host in ["h0", "h1", "h2"] {
            connector.refuse(host);
        }
        let (session, _) = session_with(
            Options {
                cluster_connect_consistency_level: ConnectConsistencyLevel::Any,
                ..opts()
            },
            Arc::new(Arc::new(ring(3, 3, 3))),
            &connector,
        );

        let start = tokio::time::Instant::now();
        session.open().await.unwrap();
        // all, majority and one each get a full timeout
        assert!(start.elapsed() >= Duration::from_secs(3));

        let err = session
            .write(Bytes::from("ns"), Bytes::from("cpu"), datapoint(1, 1.0))
            .await
            .unwrap_err();
        assert!(err.is_consistency_result_error());
        assert_eq!(err.num_success(), 0);
        assert_eq!(err.num_responded(), 3);
    }

    fn topology_of(hosts: &[usize]) -> Arc<TopologyMap> {
        let sets = hosts
            .iter()
            .map(|i| {
                HostShardSet::new(
                    Host::new(format!("h{i}"), format!("10.0.0.{i}:9000")),
                    ShardSet::new([Shard::new(0, ShardState::Available)]).unwrap(),
                )
            })
            .collect();
        Arc::new(TopologyMap::new(sets, hosts.len()).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn topology_changes_replace_queues() {
        let connector = Arc::new(MockConnector::new());
        let topology = Arc::new(DynamicTopology::new(topology_of(&[0, 1])));
        let (session, _) = session_with(opts(), Arc::clone(&topology) as _, &connector);
        session.open().await.unwrap();

        topology.update(topology_of(&[1, 2]));
        wait_until(|| {
            session
                .topology_map()
                .unwrap()
                .lookup_host_shard_set("h2")
                .is_some()
        })
        .await;

        // h0 left and its queue is closed, h1 keeps its connection
        wait_until(|| connector.client("h0").closes() == 1).await;
        assert_eq!(connector.client("h1").closes(), 0);

        session
            .write(Bytes::from("ns"), Bytes::from("cpu"), datapoint(1, 1.0))
            .await
            .unwrap();
        wait_until(|| writes(&connector.client("h2")) == 1).await;
        assert_eq!(writes(&connector.client("h0")), 0);

        session.close().await.unwrap();
    }

    #[test]
    fn combine_errors() {
        assert!(matches!(combine(vec![Error::Timeout]), Error::Timeout));
        assert!(matches!(
            combine(vec![Error::Timeout, Error::Timeout]),
            Error::Multi(errs) if errs.len() == 2
        ));
    }
}
