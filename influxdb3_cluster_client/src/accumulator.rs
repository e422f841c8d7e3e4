//! Accumulates the per-host responses of an index query fanned out to every host.
//!
//! Consistency is tracked per shard: a host response counts for each shard the host owns, and
//! the query is satisfied once every shard reached the read consistency level. Responses are
//! only turned into iterators once the query is done.

use std::sync::Arc;

use bytes::Bytes;
use influxdb3_cluster_topology::{
    Host, ReadConsistencyLevel, ShardState, TopologyMap,
    consistency::{read_consistency_achieved, read_consistency_termination},
};
use iox_time::Time;

use crate::{
    Error, Result,
    iterator::{
        AggregatedTag, AggregatedTagsIterator, IteratorPools, SeriesIterator, TaggedId,
        TaggedIdsIterator, merge_sorted_values,
    },
    query::FetchResponseMetadata,
    rpc::{
        AggregateQueryRawResult, AggregateTagNameElement, FetchTaggedIdResult, FetchTaggedResult,
        Segment, Segments,
    },
    tags::decode_tags,
};

#[derive(Debug, Default, Clone, Copy)]
struct ShardResult {
    enqueued: usize,
    success: usize,
    errors: usize,
    done: bool,
}

impl ShardResult {
    fn pending(&self) -> usize {
        self.enqueued.saturating_sub(self.success + self.errors)
    }
}

#[derive(Debug)]
pub(crate) struct ResultAccumulator {
    level: ReadConsistencyLevel,
    topology: Arc<TopologyMap>,
    start: Time,
    end: Time,

    /// Indexed by shard id.
    shards: Vec<ShardResult>,
    num_hosts: usize,
    num_hosts_pending: usize,
    num_shards_pending: usize,
    errors: Vec<Error>,

    fetch_responses: Vec<FetchTaggedIdResult>,
    agg_responses: Vec<AggregateTagNameElement>,
    exhaustive: bool,
    estimate_total_bytes: usize,
}

impl ResultAccumulator {
    pub(crate) fn new(
        level: ReadConsistencyLevel,
        topology: Arc<TopologyMap>,
        start: Time,
        end: Time,
    ) -> Self {
        let num_shards = topology
            .shard_set()
            .max_shard_id()
            .map(|max| max as usize + 1)
            .unwrap_or_default();
        let mut shards = vec![ShardResult::default(); num_shards];
        for hss in topology.host_shard_sets() {
            for id in hss.shard_set().all_ids() {
                shards[id as usize].enqueued += 1;
            }
        }

        let num_hosts = topology.hosts().len();
        let num_shards_pending = topology.shard_set().len();
        Self {
            level,
            topology,
            start,
            end,
            shards,
            num_hosts,
            num_hosts_pending: num_hosts,
            num_shards_pending,
            errors: vec![],
            fetch_responses: vec![],
            agg_responses: vec![],
            exhaustive: true,
            estimate_total_bytes: 0,
        }
    }

    /// Record the response of `host` to a fetch tagged request, returning the outcome of the
    /// query once it is decided.
    pub(crate) fn add_fetch_tagged(
        &mut self,
        host: &Host,
        result: Result<FetchTaggedResult>,
    ) -> Option<Result<()>> {
        let err = match result {
            Ok(res) => {
                self.estimate_total_bytes += res
                    .elements
                    .iter()
                    .map(estimate_element_size)
                    .sum::<usize>();
                self.exhaustive &= res.exhaustive;
                self.fetch_responses.extend(res.elements);
                None
            }
            Err(e) => Some(e),
        };
        self.accumulate(host, err)
    }

    /// Record the response of `host` to an aggregate request, returning the outcome of the query
    /// once it is decided.
    pub(crate) fn add_aggregate(
        &mut self,
        host: &Host,
        result: Result<AggregateQueryRawResult>,
    ) -> Option<Result<()>> {
        let err = match result {
            Ok(res) => {
                self.estimate_total_bytes += res
                    .results
                    .iter()
                    .map(|r| r.tag_name.len() + r.tag_values.iter().map(Bytes::len).sum::<usize>())
                    .sum::<usize>();
                self.exhaustive &= res.exhaustive;
                self.agg_responses.extend(res.results);
                None
            }
            Err(e) => Some(e),
        };
        self.accumulate(host, err)
    }

    fn accumulate(&mut self, host: &Host, err: Option<Error>) -> Option<Result<()>> {
        self.num_hosts_pending = self.num_hosts_pending.saturating_sub(1);
        let failed = err.is_some();
        if let Some(e) = err {
            self.errors.push(Error::Host {
                action: "fetching tagged from",
                host: host.id().to_string(),
                source: Box::new(e),
            });
        }

        let Some(hss) = self.topology.lookup_host_shard_set(host.id()) else {
            return Some(Err(Error::non_retryable(Error::Invariant(format!(
                "missing host shard set in fetch tagged response for host {}",
                host.id()
            )))));
        };

        let majority = self.topology.majority();
        for shard in hss.shard_set().shards() {
            let Some(result) = self.shards.get_mut(shard.id() as usize) else {
                continue;
            };
            if result.done {
                continue;
            }

            if failed || shard.state() != ShardState::Available {
                result.errors += 1;
            } else {
                result.success += 1;
            }

            if read_consistency_termination(self.level, majority, result.pending(), result.success)
            {
                result.done = true;
                if read_consistency_achieved(
                    self.level,
                    majority,
                    result.enqueued,
                    result.success,
                ) {
                    self.num_shards_pending -= 1;
                }
            }
        }

        if self.num_shards_pending == 0 {
            return Some(Ok(()));
        }
        if self.num_hosts_pending > 0 {
            return None;
        }

        let bad_request = self.errors.iter().any(Error::is_bad_request);
        let err = Error::UnsatisfiedConsistency {
            shards: self.num_shards_pending,
            hosts_enqueued: self.num_hosts,
            hosts_responded: self.num_hosts - self.num_hosts_pending,
            errors: self.errors.clone(),
        };
        Some(Err(if bad_request {
            Error::non_retryable(Error::InvalidParams(Box::new(err)))
        } else {
            err
        }))
    }

    /// One series iterator per distinct id, merging the replicas that returned it, ordered by
    /// id. At most `limit` series are returned.
    pub(crate) fn as_series_iterators(
        &mut self,
        limit: usize,
        pools: &IteratorPools,
    ) -> Result<(Vec<SeriesIterator>, FetchResponseMetadata)> {
        let responses = self.fetch_responses.len();
        let groups = group_by_id(std::mem::take(&mut self.fetch_responses));
        let more = groups.len() > limit;

        let mut iters = Vec::with_capacity(groups.len().min(limit));
        for group in groups.into_iter().take(limit) {
            let first = &group[0];
            let namespace = first.namespace.clone();
            let id = first.id.clone();
            let tags = decode_tags(&first.encoded_tags)?;
            let replicas = group.into_iter().map(|e| e.segments).collect();
            iters.push(pools.series_iterator_from_segments(
                namespace,
                id,
                tags,
                (self.start, self.end),
                replicas,
            ));
        }

        Ok((iters, self.metadata(more, responses)))
    }

    /// The distinct ids matched, ordered by id. At most `limit` ids are returned.
    pub(crate) fn as_tagged_ids_iterator(
        &mut self,
        limit: usize,
    ) -> (TaggedIdsIterator, FetchResponseMetadata) {
        // counts aggregate responses, which a fetch tagged query never has
        let responses = self.agg_responses.len();
        let groups = group_by_id(std::mem::take(&mut self.fetch_responses));
        let more = groups.len() > limit;

        let ids = groups
            .into_iter()
            .take(limit)
            .filter_map(|group| group.into_iter().next())
            .map(|e| TaggedId {
                namespace: e.namespace,
                id: e.id,
                encoded_tags: e.encoded_tags,
            })
            .collect();
        (TaggedIdsIterator::new(ids), self.metadata(more, responses))
    }

    /// Every tag name seen with the union of its values across hosts, ordered by name. Stops
    /// once `limit` values were collected.
    pub(crate) fn as_aggregated_tags_iterator(
        &mut self,
        limit: usize,
    ) -> (AggregatedTagsIterator, FetchResponseMetadata) {
        let responses = self.agg_responses.len();
        let mut elems = std::mem::take(&mut self.agg_responses);
        elems.sort_by(|a, b| a.tag_name.cmp(&b.tag_name));

        let mut tags: Vec<AggregatedTag> = vec![];
        let mut count = 0;
        let mut more = false;
        let mut elems = elems.into_iter().peekable();
        while let Some(elem) = elems.next() {
            if count >= limit {
                more = true;
                break;
            }

            let mut values = sorted_distinct(elem.tag_values);
            while let Some(same) = elems.next_if(|e| e.tag_name == elem.tag_name) {
                values = merge_sorted_values(values, &sorted_distinct(same.tag_values));
            }
            count += values.len();
            tags.push(AggregatedTag {
                name: elem.tag_name,
                values,
            });
        }

        let mut meta = self.metadata(more, responses);
        meta.exhaustive &= count <= limit;
        (AggregatedTagsIterator::new(tags), meta)
    }

    fn metadata(&self, more: bool, responses: usize) -> FetchResponseMetadata {
        FetchResponseMetadata {
            exhaustive: self.exhaustive && !more,
            responses,
            estimate_total_bytes: self.estimate_total_bytes,
        }
    }
}

/// Sort by id and group runs of the same id, keeping the response order within a group.
fn group_by_id(mut elems: Vec<FetchTaggedIdResult>) -> Vec<Vec<FetchTaggedIdResult>> {
    elems.sort_by(|a, b| a.id.cmp(&b.id));
    let mut groups: Vec<Vec<FetchTaggedIdResult>> = vec![];
    for elem in elems {
        match groups.last_mut() {
            Some(group) if group[0].id == elem.id => group.push(elem),
            _ => groups.push(vec![elem]),
        }
    }
    groups
}

fn sorted_distinct(mut values: Vec<Bytes>) -> Vec<Bytes> {
    values.sort();
    values.dedup();
    values
}

fn estimate_element_size(elem: &FetchTaggedIdResult) -> usize {
    let segment_size = |s: &Segment| s.head.len() + s.tail.len();
    elem.id.len()
        + elem.namespace.len()
        + elem.encoded_tags.len()
        + elem
            .segments
            .iter()
            .map(|s: &Segments| {
                s.merged.as_ref().map(segment_size).unwrap_or_default()
                    + s.unmerged.iter().map(segment_size).sum::<usize>()
            })
            .sum::<usize>()
}
