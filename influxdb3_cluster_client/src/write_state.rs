//! Tracks the replica responses of a single write attempt.

use std::sync::Arc;

use influxdb3_cluster_topology::{
    ConsistencyLevel, Host, ShardState, TopologyMap, consistency::write_consistency_achieved,
};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::{Error, Result, op::WriteCompletionFn};

/// Counts replica responses for one write and wakes the writer once the outcome can be decided.
///
/// Host and shard states are resolved against the topology the write was routed with, not the
/// session's current one.
#[derive(Debug)]
pub(crate) struct WriteState {
    level: ConsistencyLevel,
    topology: Arc<TopologyMap>,
    shard: u32,
    shards_leaving_count_towards_consistency: bool,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    enqueued: usize,
    pending: usize,
    success: usize,
    errors: Vec<Error>,
    done: Option<oneshot::Sender<()>>,
}

impl WriteState {
    pub(crate) fn new(
        level: ConsistencyLevel,
        topology: Arc<TopologyMap>,
        shard: u32,
        shards_leaving_count_towards_consistency: bool,
    ) -> (Arc<Self>, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let state = Arc::new(Self {
            level,
            topology,
            shard,
            shards_leaving_count_towards_consistency,
            inner: Mutex::new(Inner {
                enqueued: 0,
                pending: 0,
                success: 0,
                errors: vec![],
                done: Some(tx),
            }),
        });
        (state, rx)
    }

    /// Record the number of replicas the write is about to be enqueued to. Must be called before
    /// the first enqueue.
    pub(crate) fn set_enqueued(&self, n: usize) {
        let mut inner = self.inner.lock();
        inner.enqueued = n;
        inner.pending = n;
    }

    /// The completion attached to the write op.
    pub(crate) fn completion(self: &Arc<Self>) -> WriteCompletionFn {
        let state = Arc::clone(self);
        Arc::new(move |host: &Host, result: Result<()>| state.complete(host, result))
    }

    fn complete(&self, host: &Host, result: Result<()>) {
        let err = match result {
            Err(e) => Some(Error::Host {
                action: "writing to",
                host: host.id().to_string(),
                source: Box::new(Error::classify_bad_request(e)),
            }),
            Ok(()) => self.check_shard_state(host).err(),
        };

        let mut inner = self.inner.lock();
        inner.pending = inner.pending.saturating_sub(1);
        match err {
            Some(e) => inner.errors.push(e),
            None => inner.success += 1,
        }

        let majority = self.topology.majority();
        let decided = match self.level {
            ConsistencyLevel::One => inner.success > 0 || inner.pending == 0,
            ConsistencyLevel::Majority => inner.success >= majority || inner.pending == 0,
            ConsistencyLevel::All => inner.pending == 0,
        };
        if decided {
            if let Some(done) = inner.done.take() {
                let _ = done.send(());
            }
        }
    }

    /// Whether a successful response from `host` counts towards consistency.
    fn check_shard_state(&self, host: &Host) -> Result<()> {
        let state = self
            .topology
            .lookup_host_shard_set(host.id())
            .and_then(|hss| hss.shard_set().get(self.shard))
            .map(|shard| shard.state())
            .ok_or_else(|| {
                Error::Invariant(format!(
                    "missing shard {} in host {} for write",
                    self.shard,
                    host.id()
                ))
            })?;

        match state {
            ShardState::Available => Ok(()),
            ShardState::Leaving if self.shards_leaving_count_towards_consistency => Ok(()),
            state => Err(Error::ShardNotAvailable {
                shard: self.shard,
                host: host.id().to_string(),
                state,
            }),
        }
    }

    /// The outcome of the write once the completion signal fired.
    pub(crate) fn outcome(&self) -> Result<()> {
        let inner = self.inner.lock();
        let achieved = inner.enqueued > 0
            && write_consistency_achieved(
                self.level,
                self.topology.majority(),
                inner.enqueued,
                inner.success,
            );
        if achieved {
            return Ok(());
        }
        Err(Error::consistency_result(
            self.level,
            inner.enqueued,
            inner.enqueued - inner.pending,
            inner.success,
            inner.errors.clone(),
        ))
    }
}
