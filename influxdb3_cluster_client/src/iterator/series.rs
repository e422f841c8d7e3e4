use bytes::Bytes;
use iox_time::Time;

use super::{DatapointIterator, EqualTimestampStrategy, merge::Iterators};
use crate::{Error, Result, datapoint::Datapoint, tags::Tag};

/// Identity, time range and replicas of a series iterator.
#[derive(Debug)]
pub struct SeriesIteratorOptions {
    pub namespace: Bytes,
    pub id: Bytes,
    pub tags: Vec<Tag>,
    pub start: Time,
    pub end: Time,
    pub replicas: Vec<Box<dyn DatapointIterator>>,
}

/// The datapoints of one series in `[start, end)`, merged across its replicas.
///
/// Timestamps are strictly increasing: when replicas report the same timestamp a single value
/// is chosen by the [`EqualTimestampStrategy`]. The first error ends the iteration.
#[derive(Debug)]
pub struct SeriesIterator {
    namespace: Bytes,
    id: Bytes,
    tags: Vec<Tag>,
    start: Time,
    end: Time,
    replicas: usize,
    iters: Iterators,
    positioned: bool,
    done: bool,
    /// Error from positioning a replica, reported by the first call to `next`.
    err: Option<Error>,
}

impl SeriesIterator {
    pub fn new(opts: SeriesIteratorOptions, strategy: EqualTimestampStrategy) -> Self {
        let SeriesIteratorOptions {
            namespace,
            id,
            tags,
            start,
            end,
            replicas,
        } = opts;

        let mut iters = Iterators::new(strategy);
        iters.set_filter(start, end);
        let num_replicas = replicas.len();
        let mut err = None;
        for replica in replicas {
            if let Err(e) = iters.push(replica) {
                err.get_or_insert(e);
            }
        }

        Self {
            namespace,
            id,
            tags,
            start,
            end,
            replicas: num_replicas,
            iters,
            positioned: false,
            done: false,
            err,
        }
    }

    pub fn namespace(&self) -> &Bytes {
        &self.namespace
    }

    pub fn id(&self) -> &Bytes {
        &self.id
    }

    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    pub fn start(&self) -> Time {
        self.start
    }

    pub fn end(&self) -> Time {
        self.end
    }

    /// Replicas this iterator was built from.
    pub fn replicas(&self) -> usize {
        self.replicas
    }

    /// Change how ties are broken, starting with the next datapoint.
    pub fn set_equal_timestamp_strategy(&mut self, strategy: EqualTimestampStrategy) {
        self.iters.set_strategy(strategy);
    }

    fn move_to_next(&mut self) -> Result<()> {
        let prev = self.iters.at();
        while self.iters.move_to_valid_next()? {
            if self.iters.at() != prev {
                break;
            }
        }
        Ok(())
    }
}

impl Iterator for SeriesIterator {
    type Item = Result<Datapoint>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(err) = self.err.take() {
            self.done = true;
            return Some(Err(err));
        }
        if self.positioned {
            if let Err(err) = self.move_to_next() {
                self.done = true;
                return Some(Err(err));
            }
        }
        self.positioned = true;
        match self.iters.current() {
            Some(dp) => Some(Ok(dp)),
            None => {
                self.done = true;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::iterator::test_util::VecIterator;

    fn series(
        replicas: Vec<Box<dyn DatapointIterator>>,
        (start, end): (i64, i64),
        strategy: EqualTimestampStrategy,
    ) -> SeriesIterator {
        SeriesIterator::new(
            SeriesIteratorOptions {
                namespace: Bytes::from_static(b"ns"),
                id: Bytes::from_static(b"cpu"),
                tags: vec![Tag::new("host", "a")],
                start: Time::from_timestamp_nanos(start),
                end: Time::from_timestamp_nanos(end),
                replicas,
            },
            strategy,
        )
    }

    fn values(it: SeriesIterator) -> Result<Vec<(i64, f64)>> {
        it.map(|dp| dp.map(|dp| (dp.timestamp.timestamp_nanos(), dp.value)))
            .collect()
    }

    #[test]
    fn equal_timestamps_highest_value() {
        let it = series(
            vec![
                VecIterator::boxed(&[(10, 1.0)]),
                VecIterator::boxed(&[(10, 2.5)]),
            ],
            (0, 100),
            EqualTimestampStrategy::HighestValue,
        );
        assert_eq!(it.replicas(), 2);
        assert_eq!(values(it).unwrap(), vec![(10, 2.5)]);
    }

    #[test]
    fn merges_and_dedupes_replicas() {
        let it = series(
            vec![
                VecIterator::boxed(&[(1, 1.0), (2, 2.0), (4, 4.0)]),
                VecIterator::boxed(&[(1, 1.0), (3, 3.0), (4, 4.0)]),
                VecIterator::boxed(&[(2, 2.0), (5, 5.0)]),
            ],
            (0, 100),
            EqualTimestampStrategy::LastPushed,
        );
        let got = values(it).unwrap();
        assert_eq!(got, vec![(1, 1.0), (2, 2.0), (3, 3.0), (4, 4.0), (5, 5.0)]);
        assert!(got.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn filter_bounds_every_value() {
        let it = series(
            vec![
                VecIterator::boxed(&[(1, 1.0), (5, 5.0), (9, 9.0)]),
                VecIterator::boxed(&[(4, 4.0), (10, 10.0)]),
            ],
            (4, 10),
            EqualTimestampStrategy::LastPushed,
        );
        assert_eq!(values(it).unwrap(), vec![(4, 4.0), (5, 5.0), (9, 9.0)]);
    }

    #[test]
    fn strategy_change_mid_iteration() {
        let mut it = series(
            vec![
                VecIterator::boxed(&[(1, 5.0), (2, 5.0)]),
                VecIterator::boxed(&[(1, 1.0), (2, 1.0)]),
            ],
            (0, 100),
            EqualTimestampStrategy::LowestValue,
        );
        assert_eq!(it.next().unwrap().unwrap().value, 1.0);
        it.set_equal_timestamp_strategy(EqualTimestampStrategy::HighestValue);
        assert_eq!(it.next().unwrap().unwrap().value, 5.0);
        assert!(it.next().is_none());
    }

    #[test]
    fn errors_end_iteration() {
        let mut it = series(
            vec![VecIterator::boxed(&[(5, 5.0), (3, 3.0)])],
            (0, 100),
            EqualTimestampStrategy::LastPushed,
        );
        assert_eq!(it.next().unwrap().unwrap().value, 5.0);
        assert!(matches!(it.next(), Some(Err(Error::OutOfOrderIterator))));
        assert!(it.next().is_none());

        let mut it = series(
            vec![
                VecIterator::boxed(&[(1, 1.0)]),
                VecIterator::failing(&[], Error::SegmentDecode("bad".to_string())),
            ],
            (0, 100),
            EqualTimestampStrategy::LastPushed,
        );
        assert!(matches!(it.next(), Some(Err(Error::SegmentDecode(_)))));
        assert!(it.next().is_none());
    }

    #[test]
    fn no_replicas() {
        let mut it = series(vec![], (0, 100), EqualTimestampStrategy::LastPushed);
        assert!(it.next().is_none());
        assert_eq!(it.id().as_ref(), b"cpu");
        assert_eq!(it.tags(), &[Tag::new("host", "a")]);
    }
}
