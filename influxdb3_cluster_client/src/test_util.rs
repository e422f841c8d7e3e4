use std::time::Duration;

use influxdb3_cluster_topology::{Host, HostShardSet, Shard, ShardSet, ShardState, TopologyMap};

/// A map of `num_hosts` hosts named `h{i}` where shard `s` is owned by hosts `s..s + replicas`
/// (modulo `num_hosts`), with the state picked by `state(host, shard)`.
pub(crate) fn ring_with_states(
    num_hosts: usize,
    num_shards: u32,
    replicas: usize,
    state: impl Fn(usize, u32) -> ShardState,
) -> TopologyMap {
    let mut per_host: Vec<Vec<Shard>> = vec![vec![]; num_hosts];
    for shard in 0..num_shards {
        for r in 0..replicas {
            let host = (shard as usize + r) % num_hosts;
            per_host[host].push(Shard::new(shard, state(host, shard)));
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

pub(crate) fn ring(num_hosts: usize, num_shards: u32, replicas: usize) -> TopologyMap {
    ring_with_states(num_hosts, num_shards, replicas, |_, _| {
        ShardState::Available
    })
}

/// Poll `f` until it holds, sleeping a millisecond between checks.
pub(crate) async fn wait_until(mut f: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not met after 1000 checks");
}
