//! The replicas a node streams a shard's blocks from, and the grouping of the block metadata
//! they report.

use bytes::Bytes;
use indexmap::IndexMap;
use influxdb3_cluster_topology::{Host, ShardState, TopologyMap};
use iox_time::Time;

use crate::Result;

/// The replicas of one shard, excluding the origin host.
#[derive(Debug, Clone)]
pub struct Peers {
    shard: u32,
    hosts: Vec<Host>,
    majority: usize,
    /// State of the shard on the origin when the origin is one of its replicas.
    origin_shard_state: Option<ShardState>,
}

impl Peers {
    pub(crate) fn for_shard(
        topology: &TopologyMap,
        shard: u32,
        origin: Option<&Host>,
    ) -> Result<Self> {
        let mut hosts = Vec::with_capacity(topology.replicas());
        let mut origin_shard_state = None;
        topology.route_shard_for_each(shard, |_, host_shard, host| {
            if origin.is_some_and(|o| o.id() == host.id()) {
                origin_shard_state = Some(host_shard.state());
            } else {
                hosts.push(host.clone());
            }
        })?;

        Ok(Self {
            shard,
            hosts,
            majority: topology.majority(),
            origin_shard_state,
        })
    }

    pub fn shard(&self) -> u32 {
        self.shard
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn majority(&self) -> usize {
        self.majority
    }

    /// Whether the origin owns the shard and was left out of the peers.
    pub fn origin_excluded(&self) -> bool {
        self.origin_shard_state.is_some()
    }

    /// Whether the origin was excluded and already serves the shard, in which case it counts
    /// towards the read quorum of the peers.
    pub fn origin_excluded_and_has_shard_available(&self) -> bool {
        self.origin_shard_state == Some(ShardState::Available)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMetadata {
    pub start: Time,
    pub size: i64,
    pub checksum: Option<u32>,
    pub last_read: Time,
}

/// Metadata of one block as reported by one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedBlockMetadata {
    pub peer: Host,
    pub id: Bytes,
    pub encoded_tags: Bytes,
    pub block: BlockMetadata,
}

/// Groups block metadata reported by the peers of a shard by series id and block start.
///
/// A group is complete once every peer reported the block; peers reporting the same block
/// twice replace their earlier entry.
#[derive(Debug)]
pub struct ReceivedBlocks {
    num_peers: usize,
    pending: IndexMap<(Bytes, i64), Vec<ReceivedBlockMetadata>>,
}

impl ReceivedBlocks {
    pub fn new(num_peers: usize) -> Self {
        Self {
            num_peers,
            pending: IndexMap::new(),
        }
    }

    /// Add a report, returning the block's group, ordered by peer id, once it is complete.
    pub fn add(&mut self, received: ReceivedBlockMetadata) -> Option<Vec<ReceivedBlockMetadata>> {
        let key = (received.id.clone(), received.block.start.timestamp_nanos());
        let group = self.pending.entry(key.clone()).or_default();
        match group.iter_mut().find(|r| r.peer.id() == received.peer.id()) {
            Some(existing) => *existing = received,
            None => group.push(received),
        }
        if group.len() < self.num_peers {
            return None;
        }
        self.pending.shift_remove(&key).map(sorted_by_peer)
    }

    /// Groups not yet reported by every peer.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// The incomplete groups, in the order their first report arrived.
    pub fn finish(self) -> Vec<Vec<ReceivedBlockMetadata>> {
        self.pending.into_values().map(sorted_by_peer).collect()
    }
}

fn sorted_by_peer(mut group: Vec<ReceivedBlockMetadata>) -> Vec<ReceivedBlockMetadata> {
    group.sort_by(|a, b| a.peer.id().cmp(b.peer.id()));
    group
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::test_util::{ring, ring_with_states};

    fn host(i: usize) -> Host {
        Host::new(format!("h{i}"), format!("10.0.0.{i}:9000"))
    }

    #[test]
    fn origin_is_excluded() {
        let topology = ring(3, 3, 3);
        let peers = Peers::for_shard(&topology, 1, Some(&host(2))).unwrap();
        let ids: Vec<_> = peers.hosts().iter().map(|h| h.id().to_string()).collect();
        assert_eq!(ids, vec!["h0", "h1"]);
        assert_eq!(peers.majority(), 2);
        assert!(peers.origin_excluded());
        assert!(peers.origin_excluded_and_has_shard_available());

        let peers = Peers::for_shard(&topology, 1, None).unwrap();
        assert_eq!(peers.hosts().len(), 3);
        assert!(!peers.origin_excluded());
    }

    #[test]
    fn initializing_origin_is_not_available() {
        let topology = ring_with_states(3, 1, 3, |host, _| {
            if host == 0 {
                ShardState::Initializing
            } else {
                ShardState::Available
            }
        });
        let peers = Peers::for_shard(&topology, 0, Some(&host(0))).unwrap();
        assert!(peers.origin_excluded());
        assert!(!peers.origin_excluded_and_has_shard_available());
    }

    #[test]
    fn unknown_shard() {
        assert!(Peers::for_shard(&ring(3, 3, 3), 7, None).is_err());
    }

    fn received(peer: usize, id: &'static str, start: i64, size: i64) -> ReceivedBlockMetadata {
        ReceivedBlockMetadata {
            peer: host(peer),
            id: Bytes::from_static(id.as_bytes()),
            encoded_tags: Bytes::new(),
            block: BlockMetadata {
                start: Time::from_timestamp_nanos(start),
                size,
                checksum: Some(1),
                last_read: Time::from_timestamp_nanos(0),
            },
        }
    }

    #[test]
    fn groups_complete_when_every_peer_reported() {
        let mut blocks = ReceivedBlocks::new(2);
        assert!(blocks.add(received(1, "a", 0, 10)).is_none());
        assert!(blocks.add(received(0, "a", 10, 10)).is_none());
        // the latest report from a peer wins
        assert!(blocks.add(received(1, "a", 0, 20)).is_none());
        assert_eq!(blocks.pending(), 2);

        let group = blocks.add(received(0, "a", 0, 10)).unwrap();
        assert_eq!(group, vec![received(0, "a", 0, 10), received(1, "a", 0, 20)]);
        assert_eq!(blocks.pending(), 1);

        let rest = blocks.finish();
        assert_eq!(rest, vec![vec![received(0, "a", 10, 10)]]);
    }
}
