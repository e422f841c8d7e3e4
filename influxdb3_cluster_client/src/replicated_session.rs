//! Writes to one cluster, replicated in the background to any number of async clusters.

use std::{future::Future, sync::Arc};

use bytes::Bytes;
use influxdb3_cluster_topology::{Host, TopologyMap};
use iox_time::Time;
use metric::Registry;
use observability_deps::tracing::{error, info};
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;

use crate::{
    Result,
    datapoint::Datapoint,
    iterator::{AggregatedTagsIterator, IteratorPools, SeriesIterator, TaggedIdsIterator},
    metrics::ReplicateMetrics,
    peers::Peers,
    query::{AggregateOptions, FetchResponseMetadata, Query, QueryOptions},
    rpc::NodeClient,
    session::Session,
    tags::Tag,
};

/// A primary [`Session`] whose writes are also sent, best effort, to a set of async sessions.
///
/// Reads and every other operation only go to the primary session. A write is replicated to an
/// async cluster only while fewer than `async_write_max_concurrency` replications are in
/// flight, otherwise that cluster misses the write. At most `async_write_worker_pool_size`
/// replications run at once. Both limits are read from the options of the primary session.
///
/// A failed replication is logged and counted; it never fails the write.
#[derive(Debug)]
pub struct ReplicatedSession {
    session: Session,
    async_sessions: Vec<Session>,
    workers: Arc<Semaphore>,
    in_flight: Arc<Semaphore>,
    tasks: TaskTracker,
    metrics: Arc<ReplicateMetrics>,
}

impl ReplicatedSession {
    pub fn new(session: Session, async_sessions: Vec<Session>, registry: &Registry) -> Self {
        let opts = session.options();
        Self {
            workers: Arc::new(Semaphore::new(opts.async_write_worker_pool_size)),
            in_flight: Arc::new(Semaphore::new(opts.async_write_max_concurrency)),
            tasks: TaskTracker::new(),
            metrics: Arc::new(ReplicateMetrics::new(registry)),
            session,
            async_sessions,
        }
    }

    pub fn primary(&self) -> &Session {
        &self.session
    }

    pub fn async_sessions(&self) -> &[Session] {
        &self.async_sessions
    }

    /// Open the primary session, then the async sessions. An async session that fails to open
    /// is logged and its replications fail until it is replaced.
    pub async fn open(&self) -> Result<()> {
        self.session.open().await?;
        for (cluster, session) in self.async_sessions.iter().enumerate() {
            if let Err(e) = session.open().await {
                error!(cluster, error = %e, "could not open session to async cluster");
            }
        }
        info!(
            async_clusters = self.async_sessions.len(),
            "replicated session opened"
        );
        Ok(())
    }

    /// Close the primary session, wait for replications in flight and close the async
    /// sessions. Only the outcome of closing the primary session is returned.
    pub async fn close(&self) -> Result<()> {
        let res = self.session.close().await;
        self.tasks.close();
        self.tasks.wait().await;
        for (cluster, session) in self.async_sessions.iter().enumerate() {
            if let Err(e) = session.close().await {
                error!(cluster, error = %e, "could not close async session");
            }
        }
        res
    }

    pub async fn write(&self, namespace: Bytes, id: Bytes, datapoint: Datapoint) -> Result<()> {
        self.replicate(&namespace, &id, None, &datapoint);
        self.session.write(namespace, id, datapoint).await
    }

    pub async fn write_tagged(
        &self,
        namespace: Bytes,
        id: Bytes,
        tags: &[Tag],
        datapoint: Datapoint,
    ) -> Result<()> {
        if !self.async_sessions.is_empty() {
            let shared: Arc<[Tag]> = tags.into();
            self.replicate(&namespace, &id, Some(&shared), &datapoint);
        }
        self.session
            .write_tagged(namespace, id, tags, datapoint)
            .await
    }

    /// Start a background write of the datapoint to every async session with room for it.
    fn replicate(
        &self,
        namespace: &Bytes,
        id: &Bytes,
        tags: Option<&Arc<[Tag]>>,
        datapoint: &Datapoint,
    ) {
        for (cluster, session) in self.async_sessions.iter().enumerate() {
            let Ok(in_flight) = Arc::clone(&self.in_flight).try_acquire_owned() else {
                self.metrics.not_executed.inc(1);
                continue;
            };

            let session = session.clone();
            let workers = Arc::clone(&self.workers);
            let metrics = Arc::clone(&self.metrics);
            let namespace = namespace.clone();
            let id = id.clone();
            let tags = tags.map(Arc::clone);
            let datapoint = datapoint.clone();
            self.tasks.spawn(async move {
                let _in_flight = in_flight;
                // the worker semaphore is never closed
                let Ok(_worker) = workers.acquire().await else {
                    return;
                };
                let res = match tags {
                    Some(tags) => session.write_tagged(namespace, id, &tags, datapoint).await,
                    None => session.write(namespace, id, datapoint).await,
                };
                match res {
                    Ok(()) => metrics.success.inc(1),
                    Err(e) => {
                        metrics.error.inc(1);
                        error!(cluster, error = %e, "could not replicate write");
                    }
                }
            });
            self.metrics.executed.inc(1);
        }
    }

    pub async fn fetch(
        &self,
        namespace: Bytes,
        id: Bytes,
        start: Time,
        end: Time,
    ) -> Result<SeriesIterator> {
        self.session.fetch(namespace, id, start, end).await
    }

    pub async fn fetch_ids(
        &self,
        namespace: Bytes,
        ids: Vec<Bytes>,
        start: Time,
        end: Time,
    ) -> Result<Vec<SeriesIterator>> {
        self.session.fetch_ids(namespace, ids, start, end).await
    }

    pub async fn fetch_tagged(
        &self,
        namespace: Bytes,
        query: Query,
        opts: QueryOptions,
    ) -> Result<(Vec<SeriesIterator>, FetchResponseMetadata)> {
        self.session.fetch_tagged(namespace, query, opts).await
    }

    pub async fn fetch_tagged_ids(
        &self,
        namespace: Bytes,
        query: Query,
        opts: QueryOptions,
    ) -> Result<(TaggedIdsIterator, FetchResponseMetadata)> {
        self.session.fetch_tagged_ids(namespace, query, opts).await
    }

    pub async fn aggregate(
        &self,
        namespace: Bytes,
        query: Query,
        opts: AggregateOptions,
    ) -> Result<(AggregatedTagsIterator, FetchResponseMetadata)> {
        self.session.aggregate(namespace, query, opts).await
    }

    pub fn shard_id(&self, id: &[u8]) -> Result<u32> {
        self.session.shard_id(id)
    }

    /// Truncate `namespace` on the primary cluster only.
    pub async fn truncate(&self, namespace: Bytes) -> Result<u64> {
        self.session.truncate(namespace).await
    }

    pub async fn borrow_connection<F, Fut, T>(&self, host_id: &str, f: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn NodeClient>) -> Fut + Send,
        Fut: Future<Output = T> + Send,
    {
        self.session.borrow_connection(host_id, f).await
    }

    pub fn iterator_pools(&self) -> Result<IteratorPools> {
        self.session.iterator_pools()
    }

    pub fn topology_map(&self) -> Result<Arc<TopologyMap>> {
        self.session.topology_map()
    }

    pub fn peers_for_shard(&self, shard: u32) -> Result<Peers> {
        self.session.peers_for_shard(shard)
    }

    pub fn origin(&self) -> Option<&Host> {
        self.session.origin()
    }
}
