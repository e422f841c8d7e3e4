use std::{fmt, sync::Arc};

use hashbrown::HashMap;

use crate::{Error, Result, Shard, ShardSet, ShardState};

/// A storage node in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Host {
    id: Arc<str>,
    address: Arc<str>,
}

impl Host {
    pub fn new(id: impl Into<Arc<str>>, address: impl Into<Arc<str>>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

/// The shards owned by a single [`Host`], with their per-host state.
#[derive(Debug, Clone)]
pub struct HostShardSet {
    host: Host,
    shard_set: ShardSet,
}

impl HostShardSet {
    pub fn new(host: Host, shard_set: ShardSet) -> Self {
        Self { host, shard_set }
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn shard_set(&self) -> &ShardSet {
        &self.shard_set
    }
}

/// An immutable snapshot of the cluster.
///
/// Host indices handed to the routing callbacks are positions in [`TopologyMap::hosts`], which
/// lets callers keep per-host state in a plain vector that lines up with the map.
#[derive(Debug)]
pub struct TopologyMap {
    hosts: Vec<Host>,
    host_shard_sets: Vec<HostShardSet>,
    host_index_by_id: HashMap<Arc<str>, usize>,
    shard_set: ShardSet,
    /// Host indices owning each shard, in replica order.
    routes: HashMap<u32, Vec<usize>>,
    replicas: usize,
    majority: usize,
}

impl TopologyMap {
    /// Build a snapshot from the per-host shard assignments.
    pub fn new(host_shard_sets: Vec<HostShardSet>, replicas: usize) -> Result<Self> {
        if replicas == 0 {
            return Err(Error::InvalidTopology(
                "replica factor must be at least one".to_string(),
            ));
        }
        if host_shard_sets.is_empty() {
            return Err(Error::InvalidTopology("no hosts".to_string()));
        }

        let mut host_index_by_id = HashMap::with_capacity(host_shard_sets.len());
        let mut routes: HashMap<u32, Vec<usize>> = HashMap::new();
        for (idx, hss) in host_shard_sets.iter().enumerate() {
            if host_index_by_id
                .insert(Arc::clone(&hss.host.id), idx)
                .is_some()
            {
                return Err(Error::InvalidTopology(format!(
                    "duplicate host id {}",
                    hss.host.id
                )));
            }
            for shard in hss.shard_set.shards() {
                routes.entry(shard.id()).or_default().push(idx);
            }
        }

        let shard_set = ShardSet::new(
            routes
                .keys()
                .map(|id| Shard::new(*id, ShardState::Available)),
        )?;
        if shard_set.is_empty() {
            return Err(Error::EmptyShardSet);
        }

        Ok(Self {
            hosts: host_shard_sets.iter().map(|h| h.host.clone()).collect(),
            host_shard_sets,
            host_index_by_id,
            shard_set,
            routes,
            replicas,
            majority: replicas / 2 + 1,
        })
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn host_shard_sets(&self) -> &[HostShardSet] {
        &self.host_shard_sets
    }

    /// The union of all shards in the cluster.
    pub fn shard_set(&self) -> &ShardSet {
        &self.shard_set
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }

    pub fn majority(&self) -> usize {
        self.majority
    }

    pub fn lookup_host_shard_set(&self, host_id: &str) -> Option<&HostShardSet> {
        self.host_index_by_id
            .get(host_id)
            .map(|idx| &self.host_shard_sets[*idx])
    }

    pub fn host_index(&self, host_id: &str) -> Option<usize> {
        self.host_index_by_id.get(host_id).copied()
    }

    /// Visit every replica of the shard owning `id`.
    pub fn route_for_each<F>(&self, id: &[u8], f: F) -> Result<()>
    where
        F: FnMut(usize, &Shard, &Host),
    {
        let shard = self.shard_set.lookup(id)?;
        self.route_shard_for_each(shard, f)
    }

    /// Visit `(host index, host shard, host)` for every replica of `shard`, in replica order.
    pub fn route_shard_for_each<F>(&self, shard: u32, mut f: F) -> Result<()>
    where
        F: FnMut(usize, &Shard, &Host),
    {
        let owners = self.routes.get(&shard).ok_or(Error::UnknownShard(shard))?;
        for idx in owners {
            let hss = &self.host_shard_sets[*idx];
            // routes are derived from the host shard sets so the shard is always present
            if let Some(host_shard) = hss.shard_set.get(shard) {
                f(*idx, host_shard, &hss.host);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;

    /// Build a map with `num_hosts` hosts where each shard is owned by `replicas` consecutive
    /// hosts, all shards available.
    pub(crate) fn ring(num_hosts: usize, num_shards: u32, replicas: usize) -> TopologyMap {
        let mut per_host: Vec<Vec<Shard>> = vec![vec![]; num_hosts];
        for shard in 0..num_shards {
            for r in 0..replicas {
                let host = (shard as usize + r) % num_hosts;
                per_host[host].push(Shard::new(shard, ShardState::Available));
            }
        }
        let sets = per_host
            .into_iter()
            .enumerate()
            .map(|(i, shards)| {
                HostShardSet::new(
                    Host::new(format!("h{i}"), format!("10.0.0.{i}:9000")),
                    ShardSet::new(shards).unwrap(),
                )
            })
            .collect();
        TopologyMap::new(sets, replicas).unwrap()
    }
}
