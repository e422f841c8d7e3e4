//! Lazy iterators over the results of reads.
//!
//! Series data arrives as encoded segments, one list of blocks per replica. A
//! [`MultiReaderIterator`] decodes the blocks of a single replica in time order and a
//! [`SeriesIterator`] merges the replicas of one series into a single ordered stream.

use std::{fmt, fmt::Debug, str::FromStr, sync::Arc};

use bytes::Bytes;
use iox_time::Time;
use serde::{Deserialize, Serialize};

use crate::{Error, Result, datapoint::Datapoint, rpc::Segments, tags::Tag};

mod aggregated_tags;
mod codec;
mod merge;
mod multi_reader;
mod series;
mod tagged_ids;

pub use aggregated_tags::{AggregatedTag, AggregatedTagsIterator};
pub(crate) use aggregated_tags::merge_sorted_values;
pub use codec::{PlainSegmentCodec, SegmentReaderFactory};
pub use multi_reader::MultiReaderIterator;
pub use series::{SeriesIterator, SeriesIteratorOptions};
pub use tagged_ids::{TaggedId, TaggedIdsIterator};

/// A source of datapoints in non-decreasing timestamp order.
pub trait DatapointIterator: Send + Debug {
    /// The next datapoint, `Ok(None)` once exhausted.
    fn next_datapoint(&mut self) -> Result<Option<Datapoint>>;
}

/// How a merge chooses between inputs that report the same timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EqualTimestampStrategy {
    /// The input pushed last wins, so replica order breaks ties.
    #[default]
    LastPushed,
    HighestValue,
    LowestValue,
    /// The value reported by the most inputs wins. Only meaningful when every replica is read.
    HighestFrequencyValue,
}

impl EqualTimestampStrategy {
    const ALL: [Self; 4] = [
        Self::LastPushed,
        Self::HighestValue,
        Self::LowestValue,
        Self::HighestFrequencyValue,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            Self::LastPushed => "last_pushed",
            Self::HighestValue => "highest_value",
            Self::LowestValue => "lowest_value",
            Self::HighestFrequencyValue => "highest_frequency_value",
        }
    }
}

impl fmt::Display for EqualTimestampStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EqualTimestampStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| {
                Error::InvalidOptions(format!("unknown equal timestamp strategy '{s}'"))
            })
    }
}

/// Builds the iterators handed out by a session.
#[derive(Debug, Clone)]
pub struct IteratorPools {
    reader_factory: Arc<dyn SegmentReaderFactory>,
    strategy: EqualTimestampStrategy,
}

impl IteratorPools {
    pub fn new(
        reader_factory: Arc<dyn SegmentReaderFactory>,
        strategy: EqualTimestampStrategy,
    ) -> Self {
        Self {
            reader_factory,
            strategy,
        }
    }

    pub fn reader_factory(&self) -> &Arc<dyn SegmentReaderFactory> {
        &self.reader_factory
    }

    pub fn equal_timestamp_strategy(&self) -> EqualTimestampStrategy {
        self.strategy
    }

    /// An iterator over the blocks of a single replica.
    pub fn multi_reader_iterator(&self, blocks: Vec<Segments>) -> MultiReaderIterator {
        MultiReaderIterator::new(blocks, Arc::clone(&self.reader_factory))
    }

    pub fn series_iterator(&self, opts: SeriesIteratorOptions) -> SeriesIterator {
        SeriesIterator::new(opts, self.strategy)
    }

    /// A series iterator merging `replicas`, each a list of encoded blocks.
    pub(crate) fn series_iterator_from_segments(
        &self,
        namespace: Bytes,
        id: Bytes,
        tags: Vec<Tag>,
        (start, end): (Time, Time),
        replicas: Vec<Vec<Segments>>,
    ) -> SeriesIterator {
        let replicas = replicas
            .into_iter()
            .map(|blocks| Box::new(self.multi_reader_iterator(blocks)) as Box<dyn DatapointIterator>)
            .collect();
        self.series_iterator(SeriesIteratorOptions {
            namespace,
            id,
            tags,
            start,
            end,
            replicas,
        })
    }
}

impl Default for IteratorPools {
    fn default() -> Self {
        Self::new(
            Arc::new(PlainSegmentCodec),
            EqualTimestampStrategy::default(),
        )
    }
}

/// Datapoint iterators over fixed values, for tests.
#[cfg(test)]
pub(crate) mod test_util {
    use std::collections::VecDeque;

    use super::*;

    pub(crate) fn dp(nanos: i64, value: f64) -> Datapoint {
        Datapoint::new(Time::from_timestamp_nanos(nanos), value)
    }

    #[derive(Debug)]
    pub(crate) struct VecIterator {
        values: VecDeque<Result<Datapoint>>,
    }

    impl VecIterator {
        pub(crate) fn boxed(values: &[(i64, f64)]) -> Box<dyn DatapointIterator> {
            Box::new(Self {
                values: values.iter().map(|(t, v)| Ok(dp(*t, *v))).collect(),
            })
        }

        /// Yields `values` then fails.
        pub(crate) fn failing(values: &[(i64, f64)], err: Error) -> Box<dyn DatapointIterator> {
            let mut values: VecDeque<_> = values.iter().map(|(t, v)| Ok(dp(*t, *v))).collect();
            values.push_back(Err(err));
            Box::new(Self { values })
        }
    }

    impl DatapointIterator for VecIterator {
        fn next_datapoint(&mut self) -> Result<Option<Datapoint>> {
            self.values.pop_front().transpose()
        }
    }

    /// Drain an iterator into `(nanos, value)` pairs.
    pub(crate) fn collect(it: &mut dyn DatapointIterator) -> Result<Vec<(i64, f64)>> {
        let mut out = vec![];
        while let Some(dp) = it.next_datapoint()? {
            out.push((dp.timestamp.timestamp_nanos(), dp.value));
        }
        Ok(out)
    }
}
