//! Cluster topology for the sharded, replicated storage nodes
//!
//! A [`TopologyMap`] is an immutable snapshot of which [`Host`] owns which [`Shard`] and in what
//! [`ShardState`]. Snapshots are delivered through a [`TopologyWatch`], obtained from any
//! [`Topology`] implementation, and are replaced wholesale when the cluster changes.
//!
//! The [`consistency`] module holds the write, read and cluster-connect consistency levels along
//! with the rules that decide when an operation fanned out to replicas has succeeded.

pub mod consistency;
mod map;
mod shard;
mod watch;

pub use consistency::{ConnectConsistencyLevel, ConsistencyLevel, ReadConsistencyLevel};
pub use map::{Host, HostShardSet, TopologyMap};
pub use shard::{Shard, ShardSet, ShardState};
pub use watch::{DynamicTopology, Topology, TopologyWatch};

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("unknown shard: {0}")]
    UnknownShard(u32),

    #[error("shard set is empty")]
    EmptyShardSet,

    #[error("duplicate shard {shard} in shard set")]
    DuplicateShard { shard: u32 },

    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    #[error("invalid {kind} consistency level '{value}', valid levels are: {valid}")]
    InvalidConsistencyLevel {
        kind: &'static str,
        value: String,
        valid: String,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
