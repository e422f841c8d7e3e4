use std::{fmt::Debug, sync::Arc};

use observability_deps::tracing::debug;
use tokio::sync::watch;

use crate::TopologyMap;

/// A source of [`TopologyMap`] snapshots.
pub trait Topology: Send + Sync + Debug {
    /// Subscribe to topology snapshots, starting with the current one.
    fn watch(&self) -> TopologyWatch;
}

/// A subscription to topology snapshots.
#[derive(Debug, Clone)]
pub struct TopologyWatch {
    rx: watch::Receiver<Arc<TopologyMap>>,
}

impl TopologyWatch {
    /// The most recent snapshot.
    pub fn get(&self) -> Arc<TopologyMap> {
        Arc::clone(&self.rx.borrow())
    }

    /// Wait for the next snapshot.
    ///
    /// Returns `None` once the source of snapshots has gone away.
    pub async fn changed(&mut self) -> Option<Arc<TopologyMap>> {
        self.rx.changed().await.ok()?;
        Some(Arc::clone(&self.rx.borrow_and_update()))
    }
}

/// A fixed topology that never changes.
impl Topology for Arc<TopologyMap> {
    fn watch(&self) -> TopologyWatch {
        let (_tx, rx) = watch::channel(Arc::clone(self));
        TopologyWatch { rx }
    }
}

/// A topology that is updated by publishing new snapshots.
#[derive(Debug)]
pub struct DynamicTopology {
    tx: watch::Sender<Arc<TopologyMap>>,
}

impl DynamicTopology {
    pub fn new(initial: Arc<TopologyMap>) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Publish a new snapshot to every subscriber.
    pub fn update(&self, map: Arc<TopologyMap>) {
        debug!(
            hosts = map.hosts().len(),
            shards = map.shard_set().len(),
            "publishing topology update"
        );
        self.tx.send_replace(map);
    }

    pub fn current(&self) -> Arc<TopologyMap> {
        Arc::clone(&self.tx.borrow())
    }
}

impl Topology for DynamicTopology {
    fn watch(&self) -> TopologyWatch {
        TopologyWatch {
            rx: self.tx.subscribe(),
        }
    }
}
