use hashbrown::HashMap;
use iox_time::Time;

use super::{DatapointIterator, EqualTimestampStrategy};
use crate::{Error, Result, datapoint::Datapoint};

#[derive(Debug)]
struct Entry {
    iter: Box<dyn DatapointIterator>,
    current: Datapoint,
}

/// Merges a small set of ordered inputs by timestamp.
///
/// Tracks the inputs positioned at the earliest timestamp; [`Iterators::current`] picks one of
/// them according to the [`EqualTimestampStrategy`] and [`Iterators::move_to_valid_next`]
/// advances all of them together.
#[derive(Debug)]
pub(super) struct Iterators {
    values: Vec<Entry>,
    /// Indices into `values`, in push order.
    earliest: Vec<usize>,
    earliest_at: Option<Time>,
    /// Half open `[start, end)` range of timestamps that are let through.
    filter: Option<(Time, Time)>,
    strategy: EqualTimestampStrategy,
    /// Scratch space for [`EqualTimestampStrategy::HighestFrequencyValue`], keyed by value bits.
    frequencies: HashMap<u64, usize>,
}

impl Iterators {
    pub(super) fn new(strategy: EqualTimestampStrategy) -> Self {
        Self {
            values: vec![],
            earliest: vec![],
            earliest_at: None,
            filter: None,
            strategy,
            frequencies: HashMap::new(),
        }
    }

    pub(super) fn set_filter(&mut self, start: Time, end: Time) {
        self.filter = Some((start, end));
    }

    pub(super) fn set_strategy(&mut self, strategy: EqualTimestampStrategy) {
        self.strategy = strategy;
    }

    pub(super) fn len(&self) -> usize {
        self.values.len()
    }

    pub(super) fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub(super) fn at(&self) -> Option<Time> {
        self.earliest_at
    }

    /// Add an input positioned at its first value inside the filter.
    ///
    /// Returns `false` and drops the input if it has no such value.
    pub(super) fn push(&mut self, mut iter: Box<dyn DatapointIterator>) -> Result<bool> {
        let Some(first) = iter.next_datapoint()? else {
            return Ok(false);
        };
        let Some(current) = filter_next(self.filter, iter.as_mut(), first)? else {
            return Ok(false);
        };
        self.values.push(Entry { iter, current });
        self.try_add_earliest(self.values.len() - 1);
        Ok(true)
    }

    /// The value at the earliest timestamp, chosen by the strategy.
    pub(super) fn current(&mut self) -> Option<Datapoint> {
        let idx = match self.strategy {
            EqualTimestampStrategy::LastPushed => *self.earliest.last()?,
            EqualTimestampStrategy::HighestValue => self.pick(|candidate, best| {
                candidate.value.total_cmp(&best.value).is_ge()
            })?,
            EqualTimestampStrategy::LowestValue => self.pick(|candidate, best| {
                candidate.value.total_cmp(&best.value).is_le()
            })?,
            EqualTimestampStrategy::HighestFrequencyValue => self.most_frequent()?,
        };
        Some(self.values[idx].current.clone())
    }

    /// The last earliest input for which `better(candidate, best)` held against every
    /// previous pick.
    fn pick<F>(&self, better: F) -> Option<usize>
    where
        F: Fn(&Datapoint, &Datapoint) -> bool,
    {
        let mut best = *self.earliest.first()?;
        for idx in &self.earliest[1..] {
            if better(&self.values[*idx].current, &self.values[best].current) {
                best = *idx;
            }
        }
        Some(best)
    }

    fn most_frequent(&mut self) -> Option<usize> {
        self.frequencies.clear();
        for idx in &self.earliest {
            *self
                .frequencies
                .entry(self.values[*idx].current.value.to_bits())
                .or_default() += 1;
        }
        let frequencies = &self.frequencies;
        let freq = |idx: usize| frequencies[&self.values[idx].current.value.to_bits()];
        let mut best = *self.earliest.first()?;
        for idx in &self.earliest[1..] {
            if freq(*idx) >= freq(best) {
                best = *idx;
            }
        }
        Some(best)
    }

    /// Advance every input at the earliest timestamp, dropping exhausted inputs and inputs
    /// that moved past the filter.
    ///
    /// Returns `false` once no inputs remain. An input that moves backwards in time fails the
    /// merge.
    pub(super) fn move_to_valid_next(&mut self) -> Result<bool> {
        let prev = self.earliest_at;
        let earliest = std::mem::take(&mut self.earliest);
        let mut exhausted = vec![];
        for idx in earliest {
            let entry = &mut self.values[idx];
            let next = match entry.iter.next_datapoint()? {
                Some(next) => {
                    if prev.is_some_and(|prev| next.timestamp < prev) {
                        return Err(Error::OutOfOrderIterator);
                    }
                    filter_next(self.filter, entry.iter.as_mut(), next)?
                }
                None => None,
            };
            match next {
                Some(next) => entry.current = next,
                None => exhausted.push(idx),
            }
        }

        // descending so swap_remove never moves an index still to be removed
        exhausted.sort_unstable_by(|a, b| b.cmp(a));
        for idx in exhausted {
            self.values.swap_remove(idx);
        }

        self.earliest_at = None;
        for idx in 0..self.values.len() {
            self.try_add_earliest(idx);
        }
        Ok(!self.values.is_empty())
    }

    fn try_add_earliest(&mut self, idx: usize) {
        let t = self.values[idx].current.timestamp;
        match self.earliest_at {
            Some(at) if t > at => {}
            Some(at) if t == at => self.earliest.push(idx),
            _ => {
                self.earliest_at = Some(t);
                self.earliest.clear();
                self.earliest.push(idx);
            }
        }
    }
}

/// Fast forward `iter` from `current` to its first value inside `filter`.
fn filter_next(
    filter: Option<(Time, Time)>,
    iter: &mut dyn DatapointIterator,
    mut current: Datapoint,
) -> Result<Option<Datapoint>> {
    let Some((start, end)) = filter else {
        return Ok(Some(current));
    };
    loop {
        if current.timestamp >= end {
            return Ok(None);
        }
        if current.timestamp >= start {
            return Ok(Some(current));
        }
        match iter.next_datapoint()? {
            Some(next) => current = next,
            None => return Ok(None),
        }
    }
}
