//! Shared state of reads in flight, completed by the host queues they were enqueued on.
//!
//! An index query is tracked by a single [`FetchState`] fed by every host, while a fetch by id
//! tracks each id separately with an [`IdFetchState`] fed by the id's replicas.

use std::sync::Arc;

use influxdb3_cluster_topology::{
    Host, ReadConsistencyLevel, TopologyMap,
    consistency::{read_consistency_achieved, read_consistency_termination},
};
use iox_time::Time;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::{
    Error, Result,
    accumulator::ResultAccumulator,
    iterator::{AggregatedTagsIterator, IteratorPools, SeriesIterator, TaggedIdsIterator},
    op::{AggregateCompletionFn, FetchCompletionFn, FetchTaggedCompletionFn},
    query::FetchResponseMetadata,
    rpc::{AggregateQueryRawResult, FetchTaggedResult, Segments},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchKind {
    FetchTagged,
    Aggregate,
}

#[derive(Debug)]
pub(crate) struct FetchState {
    kind: FetchKind,
    limit: usize,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    accumulator: ResultAccumulator,
    done: Option<Result<()>>,
    notify: Option<oneshot::Sender<()>>,
}

impl FetchState {
    pub(crate) fn new(
        kind: FetchKind,
        level: ReadConsistencyLevel,
        topology: Arc<TopologyMap>,
        (start, end): (Time, Time),
        limit: Option<usize>,
    ) -> (Arc<Self>, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let state = Arc::new(Self {
            kind,
            limit: limit.unwrap_or(usize::MAX),
            inner: Mutex::new(Inner {
                accumulator: ResultAccumulator::new(level, topology, start, end),
                done: None,
                notify: Some(tx),
            }),
        });
        (state, rx)
    }

    pub(crate) fn fetch_tagged_completion(self: &Arc<Self>) -> FetchTaggedCompletionFn {
        let state = Arc::clone(self);
        Arc::new(move |host: &Host, result: Result<FetchTaggedResult>| {
            let result = result.map_err(Error::classify_bad_request);
            state.complete(|acc| acc.add_fetch_tagged(host, result))
        })
    }

    pub(crate) fn aggregate_completion(self: &Arc<Self>) -> AggregateCompletionFn {
        let state = Arc::clone(self);
        Arc::new(move |host: &Host, result: Result<AggregateQueryRawResult>| {
            let result = result.map_err(Error::classify_bad_request);
            state.complete(|acc| acc.add_aggregate(host, result))
        })
    }

    /// Responses arriving once the outcome is decided are dropped.
    fn complete(&self, f: impl FnOnce(&mut ResultAccumulator) -> Option<Result<()>>) {
        let mut inner = self.inner.lock();
        if inner.done.is_some() {
            return;
        }
        if let Some(outcome) = f(&mut inner.accumulator) {
            inner.done = Some(outcome);
            if let Some(notify) = inner.notify.take() {
                let _ = notify.send(());
            }
        }
    }

    /// The outcome of the query once the completion signal fired.
    pub(crate) fn outcome(&self) -> Result<()> {
        let inner = self.inner.lock();
        self.check(&inner, self.kind)
    }

    fn check(&self, inner: &Inner, kind: FetchKind) -> Result<()> {
        if self.kind != kind {
            return Err(Error::Invariant(format!(
                "fetch state is a {:?} query, not {kind:?}",
                self.kind
            )));
        }
        match &inner.done {
            None => Err(Error::Invariant(
                "fetch state is still processing responses".to_string(),
            )),
            Some(Err(e)) => Err(e.clone()),
            Some(Ok(())) => Ok(()),
        }
    }

    pub(crate) fn as_series_iterators(
        &self,
        pools: &IteratorPools,
    ) -> Result<(Vec<SeriesIterator>, FetchResponseMetadata)> {
        let mut inner = self.inner.lock();
        self.check(&inner, FetchKind::FetchTagged)?;
        inner.accumulator.as_series_iterators(self.limit, pools)
    }

    pub(crate) fn as_tagged_ids_iterator(
        &self,
    ) -> Result<(TaggedIdsIterator, FetchResponseMetadata)> {
        let mut inner = self.inner.lock();
        self.check(&inner, FetchKind::FetchTagged)?;
        Ok(inner.accumulator.as_tagged_ids_iterator(self.limit))
    }

    pub(crate) fn as_aggregated_tags_iterator(
        &self,
    ) -> Result<(AggregatedTagsIterator, FetchResponseMetadata)> {
        let mut inner = self.inner.lock();
        self.check(&inner, FetchKind::Aggregate)?;
        Ok(inner.accumulator.as_aggregated_tags_iterator(self.limit))
    }
}

/// The replica blocks of one id, or the reason the id failed its read consistency.
pub(crate) type IdFetchResult = (usize, Result<Vec<Vec<Segments>>>);

/// Collects the replica responses for the id at `idx` of a fetch by ids.
///
/// The outcome is sent once, as soon as the read consistency level is decided.
#[derive(Debug)]
pub(crate) struct IdFetchState {
    idx: usize,
    level: ReadConsistencyLevel,
    majority: usize,
    enqueued: usize,
    num_desired: usize,
    inner: Mutex<IdFetchInner>,
    tx: mpsc::UnboundedSender<IdFetchResult>,
}

#[derive(Debug)]
struct IdFetchInner {
    pending: usize,
    replicas: Vec<Vec<Segments>>,
    errors: Vec<Error>,
    done: bool,
}

impl IdFetchState {
    pub(crate) fn new(
        idx: usize,
        level: ReadConsistencyLevel,
        majority: usize,
        enqueued: usize,
        num_desired: usize,
        tx: mpsc::UnboundedSender<IdFetchResult>,
    ) -> Arc<Self> {
        let state = Arc::new(Self {
            idx,
            level,
            majority,
            enqueued,
            num_desired,
            inner: Mutex::new(IdFetchInner {
                pending: enqueued,
                replicas: Vec::with_capacity(enqueued),
                errors: vec![],
                done: false,
            }),
            tx,
        });
        if enqueued == 0 {
            let mut inner = state.inner.lock();
            state.finish(&mut inner);
        }
        state
    }

    pub(crate) fn completion(self: &Arc<Self>) -> FetchCompletionFn {
        let state = Arc::clone(self);
        Arc::new(move |result: Result<Vec<Segments>>| state.complete(result))
    }

    fn complete(&self, result: Result<Vec<Segments>>) {
        let mut inner = self.inner.lock();
        match result {
            Ok(segments) => inner.replicas.push(segments),
            Err(e) => inner.errors.push(Error::classify_bad_request(e)),
        }
        inner.pending = inner.pending.saturating_sub(1);

        let terminate = read_consistency_termination(
            self.level,
            self.majority,
            inner.pending,
            inner.replicas.len(),
        );
        if terminate && !inner.done {
            self.finish(&mut inner);
        }
    }

    fn finish(&self, inner: &mut IdFetchInner) {
        inner.done = true;
        let success = inner.replicas.len();
        let outcome = if self.enqueued > 0
            && read_consistency_achieved(self.level, self.majority, self.enqueued, success)
        {
            let mut replicas = std::mem::take(&mut inner.replicas);
            replicas.truncate(self.num_desired);
            Ok(replicas)
        } else {
            Err(Error::consistency_result(
                self.level,
                self.enqueued,
                self.enqueued - inner.pending,
                success,
                inner.errors.clone(),
            ))
        };
        // the caller stops listening once another id failed
        let _ = self.tx.send((self.idx, outcome));
    }
}
