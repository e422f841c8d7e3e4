//! Client for a sharded, replicated time series storage cluster
//!
//! A [`Session`] routes every write and read to the replicas that own the series' shard,
//! according to the latest [`TopologyMap`](influxdb3_cluster_topology::TopologyMap), and decides
//! the outcome of each operation by the configured consistency level. Index queries fan out to
//! every host and merge what the hosts return.
//!
//! A [`ReplicatedSession`] wraps a session and replicates its writes, best effort, to further
//! clusters.
//!
//! Requests to a host are batched by its host queue and sent over a pool of connections obtained
//! from a [`NodeConnector`]; the storage node protocol itself is abstracted by [`NodeClient`].

mod accumulator;
pub mod config;
mod connection_pool;
mod datapoint;
mod error;
mod fetch_state;
mod host_queue;
pub mod iterator;
mod metrics;
mod op;
mod peers;
mod query;
mod replicated_session;
mod retry;
pub mod rpc;
mod session;
mod tags;
mod write_state;

#[cfg(test)]
mod test_util;

pub use config::{ClusterClientConfig, Options};
pub use datapoint::{Datapoint, TimeUnit};
pub use error::{ConsistencyResultError, Error, Result};
pub use peers::{BlockMetadata, Peers, ReceivedBlockMetadata, ReceivedBlocks};
pub use query::{
    AggregateOptions, AggregateQueryType, FetchResponseMetadata, Query, QueryOptions,
};
pub use replicated_session::ReplicatedSession;
pub use retry::RetryOptions;
pub use rpc::{NodeClient, NodeConnector};
pub use session::Session;
pub use tags::{Tag, decode_tags, encode_tags};

/// Lifecycle of the session and of the host queues and connection pools it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    NotOpen,
    Open,
    Closed,
}
