use std::fmt;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use twox_hash::XxHash64;

use crate::{Error, Result};

/// Seed used when hashing series identifiers onto shards.
///
/// Changing this value re-distributes every series in the cluster.
const SHARD_HASH_SEED: u64 = 0x5eed_5a4d;

/// The state a shard is in on a given host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardState {
    /// The host is receiving the shard and does not yet hold all of its data.
    Initializing,
    /// The host fully owns the shard.
    Available,
    /// The shard is being handed off to another host.
    Leaving,
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Available => write!(f, "available"),
            Self::Leaving => write!(f, "leaving"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shard {
    id: u32,
    state: ShardState,
}

impl Shard {
    pub fn new(id: u32, state: ShardState) -> Self {
        Self { id, state }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> ShardState {
        self.state
    }
}

/// A set of shards, sorted by id, that can map series identifiers onto one of its members.
#[derive(Debug, Clone, Default)]
pub struct ShardSet {
    shards: Vec<Shard>,
    index_by_id: HashMap<u32, usize>,
}

impl ShardSet {
    /// Create a [`ShardSet`], rejecting duplicate shard ids.
    pub fn new(shards: impl IntoIterator<Item = Shard>) -> Result<Self> {
        let mut shards: Vec<Shard> = shards.into_iter().collect();
        shards.sort_by_key(|s| s.id);

        let mut index_by_id = HashMap::with_capacity(shards.len());
        for (idx, shard) in shards.iter().enumerate() {
            if index_by_id.insert(shard.id, idx).is_some() {
                return Err(Error::DuplicateShard { shard: shard.id });
            }
        }

        Ok(Self {
            shards,
            index_by_id,
        })
    }

    /// Hash `id` onto one of the shards in this set
    pub fn lookup(&self, id: &[u8]) -> Result<u32> {
        if self.shards.is_empty() {
            return Err(Error::EmptyShardSet);
        }
        let hash = XxHash64::oneshot(SHARD_HASH_SEED, id);
        let idx = (hash % self.shards.len() as u64) as usize;
        Ok(self.shards[idx].id)
    }

    pub fn lookup_state_by_id(&self, shard: u32) -> Result<ShardState> {
        self.get(shard)
            .map(|s| s.state)
            .ok_or(Error::UnknownShard(shard))
    }

    pub fn get(&self, shard: u32) -> Option<&Shard> {
        self.index_by_id.get(&shard).map(|idx| &self.shards[*idx])
    }

    pub fn contains(&self, shard: u32) -> bool {
        self.index_by_id.contains_key(&shard)
    }

    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    pub fn all_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.shards.iter().map(|s| s.id)
    }

    /// The largest shard id in the set, if any.
    pub fn max_shard_id(&self) -> Option<u32> {
        self.shards.last().map(|s| s.id)
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}
