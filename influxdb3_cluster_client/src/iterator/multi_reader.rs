use std::{collections::VecDeque, fmt, sync::Arc};

use super::{DatapointIterator, EqualTimestampStrategy, SegmentReaderFactory, merge::Iterators};
use crate::{Result, datapoint::Datapoint, rpc::Segments};

/// Decodes the blocks of a single replica of a series, in order.
///
/// Unmerged segments of a block overlap in time; they are merged by timestamp and values that
/// share a timestamp are reported once.
pub struct MultiReaderIterator {
    blocks: VecDeque<Segments>,
    factory: Arc<dyn SegmentReaderFactory>,
    iters: Iterators,
    /// A value of the current block has been returned.
    positioned: bool,
}

impl MultiReaderIterator {
    pub fn new(blocks: Vec<Segments>, factory: Arc<dyn SegmentReaderFactory>) -> Self {
        Self {
            blocks: blocks.into(),
            factory,
            iters: Iterators::new(EqualTimestampStrategy::LastPushed),
            positioned: false,
        }
    }

    /// Blocks not yet started.
    pub fn remaining_blocks(&self) -> usize {
        self.blocks.len()
    }

    fn load_next_block(&mut self) -> Result<bool> {
        let Some(block) = self.blocks.pop_front() else {
            return Ok(false);
        };
        match block.merged {
            Some(merged) => {
                self.iters.push(self.factory.reader(&merged)?)?;
            }
            None => {
                for segment in &block.unmerged {
                    self.iters.push(self.factory.reader(segment)?)?;
                }
            }
        }
        Ok(true)
    }

    /// Advance past every value at the current timestamp.
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

impl DatapointIterator for MultiReaderIterator {
    fn next_datapoint(&mut self) -> Result<Option<Datapoint>> {
        if self.positioned {
            self.move_to_next()?;
        }
        while self.iters.is_empty() {
            self.positioned = false;
            if !self.load_next_block()? {
                return Ok(None);
            }
        }
        self.positioned = true;
        Ok(self.iters.current())
    }
}

impl fmt::Debug for MultiReaderIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiReaderIterator")
            .field("remaining_blocks", &self.blocks.len())
            .field("open_readers", &self.iters.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        Error,
        iterator::{
            PlainSegmentCodec,
            test_util::{collect, dp},
        },
        rpc::Segment,
    };

    fn segment(values: &[(i64, f64)]) -> Segment {
        let dps: Vec<_> = values.iter().map(|(t, v)| dp(*t, *v)).collect();
        PlainSegmentCodec.encode(&dps)
    }

    fn merged(values: &[(i64, f64)]) -> Segments {
        Segments {
            merged: Some(segment(values)),
            unmerged: vec![],
        }
    }

    #[test]
    fn reads_blocks_in_order() {
        let blocks = vec![
            merged(&[(1, 1.0), (2, 2.0)]),
            Segments {
                merged: None,
                unmerged: vec![segment(&[(10, 10.0), (12, 12.0)]), segment(&[(11, 11.0)])],
            },
            merged(&[]),
            merged(&[(20, 20.0)]),
        ];
        let mut it = MultiReaderIterator::new(blocks, Arc::new(PlainSegmentCodec));
        assert_eq!(
            collect(&mut it).unwrap(),
            vec![
                (1, 1.0),
                (2, 2.0),
                (10, 10.0),
                (11, 11.0),
                (12, 12.0),
                (20, 20.0)
            ]
        );
        assert_eq!(it.remaining_blocks(), 0);
        assert!(it.next_datapoint().unwrap().is_none());
    }

    #[test]
    fn unmerged_duplicates_reported_once() {
        let blocks = vec![Segments {
            merged: None,
            unmerged: vec![
                segment(&[(1, 1.0), (2, 2.0), (3, 3.0)]),
                segment(&[(2, 2.5), (3, 3.5)]),
            ],
        }];
        let mut it = MultiReaderIterator::new(blocks, Arc::new(PlainSegmentCodec));
        // the segment pushed last wins ties
        assert_eq!(
            collect(&mut it).unwrap(),
            vec![(1, 1.0), (2, 2.5), (3, 3.5)]
        );
    }

    #[test]
    fn corrupt_segment_fails() {
        let mut bad = segment(&[(1, 1.0)]);
        bad.head.truncate(bad.head.len() - 3);
        let blocks = vec![merged(&[(0, 0.0)]), Segments {
            merged: Some(bad),
            unmerged: vec![],
        }];
        let mut it = MultiReaderIterator::new(blocks, Arc::new(PlainSegmentCodec));
        assert_eq!(it.next_datapoint().unwrap().unwrap().value, 0.0);
        assert!(matches!(
            it.next_datapoint().unwrap_err(),
            Error::SegmentDecode(_)
        ));
    }

    #[test]
    fn empty() {
        let mut it = MultiReaderIterator::new(vec![], Arc::new(PlainSegmentCodec));
        assert!(it.next_datapoint().unwrap().is_none());
    }
}
