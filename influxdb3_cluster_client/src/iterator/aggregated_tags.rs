use bytes::Bytes;

/// A tag name and the distinct values seen for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedTag {
    pub name: Bytes,
    /// Sorted and distinct.
    pub values: Vec<Bytes>,
}

/// Tags matched by an aggregate query, ordered by name.
#[derive(Debug)]
pub struct AggregatedTagsIterator {
    inner: std::vec::IntoIter<AggregatedTag>,
}

impl AggregatedTagsIterator {
    pub(crate) fn new(tags: Vec<AggregatedTag>) -> Self {
        Self {
            inner: tags.into_iter(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.inner.len()
    }
}

impl Iterator for AggregatedTagsIterator {
    type Item = AggregatedTag;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for AggregatedTagsIterator {}

/// Merge two sorted, distinct value lists into one sorted, distinct list.
///
/// Values present in both lists are taken from `existing`.
pub(crate) fn merge_sorted_values(existing: Vec<Bytes>, other: &[Bytes]) -> Vec<Bytes> {
    if other.is_empty() {
        return existing;
    }

    let mut merged = Vec::with_capacity(existing.len() + other.len());
    let mut other = other.iter().peekable();
    for value in existing {
        while let Some(next) = other.next_if(|o| **o < value) {
            merged.push(next.clone());
        }
        other.next_if(|o| **o == value);
        merged.push(value);
    }
    merged.extend(other.cloned());
    merged
}
