use bytes::Bytes;

use crate::{
    Result,
    tags::{Tag, decode_tags},
};

/// A series matched by an index query, without its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedId {
    pub namespace: Bytes,
    pub id: Bytes,
    pub encoded_tags: Bytes,
}

impl TaggedId {
    pub fn tags(&self) -> Result<Vec<Tag>> {
        decode_tags(&self.encoded_tags)
    }
}

/// The series matched by an index query, ordered by id.
#[derive(Debug)]
pub struct TaggedIdsIterator {
    inner: std::vec::IntoIter<TaggedId>,
}

impl TaggedIdsIterator {
    pub(crate) fn new(ids: Vec<TaggedId>) -> Self {
        Self {
            inner: ids.into_iter(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.inner.len()
    }
}

impl Iterator for TaggedIdsIterator {
    type Item = TaggedId;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for TaggedIdsIterator {}
