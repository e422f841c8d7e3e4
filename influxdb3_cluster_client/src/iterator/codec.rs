use std::fmt::Debug;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use iox_time::Time;
use twox_hash::XxHash32;

use super::DatapointIterator;
use crate::{
    Error, Result,
    datapoint::{Datapoint, TimeUnit},
    rpc::Segment,
};

/// Turns an encoded segment into a datapoint iterator.
pub trait SegmentReaderFactory: Send + Sync + Debug {
    fn reader(&self, segment: &Segment) -> Result<Box<dyn DatapointIterator>>;
}

/// timestamp + value + unit + annotation length
const FIXED_WIDTH: usize = 8 + 8 + 1 + 4;

/// An uncompressed segment encoding.
///
/// Each datapoint is its timestamp in nanoseconds as a big-endian `i64`, the value as the
/// big-endian bits of an `f64`, the time unit as a byte and the annotation prefixed by its
/// big-endian `u32` length. The checksum is the xxhash32 of `head` followed by `tail`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainSegmentCodec;

impl PlainSegmentCodec {
    pub fn encode(&self, datapoints: &[Datapoint]) -> Segment {
        let size = datapoints
            .iter()
            .map(|dp| FIXED_WIDTH + dp.annotation.len())
            .sum();
        let mut buf = BytesMut::with_capacity(size);
        for dp in datapoints {
            buf.put_i64(dp.timestamp.timestamp_nanos());
            buf.put_u64(dp.value.to_bits());
            buf.put_u8(dp.unit.as_u8());
            buf.put_u32(dp.annotation.len() as u32);
            buf.put_slice(&dp.annotation);
        }
        let head = buf.freeze();
        let start_time = datapoints
            .first()
            .map(|dp| dp.timestamp.timestamp_nanos())
            .unwrap_or_default();
        let block_size = match (datapoints.first(), datapoints.last()) {
            (Some(first), Some(last)) => {
                last.timestamp.timestamp_nanos() - first.timestamp.timestamp_nanos() + 1
            }
            _ => 0,
        };
        Segment {
            checksum: Some(XxHash32::oneshot(0, &head)),
            head,
            tail: Bytes::new(),
            start_time,
            block_size,
        }
    }
}

impl SegmentReaderFactory for PlainSegmentCodec {
    fn reader(&self, segment: &Segment) -> Result<Box<dyn DatapointIterator>> {
        let buf = if segment.tail.is_empty() {
            segment.head.clone()
        } else {
            let mut buf = BytesMut::with_capacity(segment.head.len() + segment.tail.len());
            buf.put_slice(&segment.head);
            buf.put_slice(&segment.tail);
            buf.freeze()
        };
        if let Some(want) = segment.checksum {
            let got = XxHash32::oneshot(0, &buf);
            if got != want {
                return Err(Error::SegmentDecode(format!(
                    "checksum mismatch, expected {want:#x} got {got:#x}"
                )));
            }
        }
        Ok(Box::new(PlainReaderIterator { buf }))
    }
}

#[derive(Debug)]
struct PlainReaderIterator {
    buf: Bytes,
}

impl DatapointIterator for PlainReaderIterator {
    fn next_datapoint(&mut self) -> Result<Option<Datapoint>> {
        if !self.buf.has_remaining() {
            return Ok(None);
        }
        if self.buf.remaining() < FIXED_WIDTH {
            return Err(Error::SegmentDecode(format!(
                "truncated datapoint, {} bytes remaining",
                self.buf.remaining()
            )));
        }
        let timestamp = Time::from_timestamp_nanos(self.buf.get_i64());
        let value = f64::from_bits(self.buf.get_u64());
        let unit = self.buf.get_u8();
        let unit = TimeUnit::from_u8(unit)
            .ok_or_else(|| Error::SegmentDecode(format!("unknown time unit {unit}")))?;
        let len = self.buf.get_u32() as usize;
        if self.buf.remaining() < len {
            return Err(Error::SegmentDecode(format!(
                "annotation of {len} bytes exceeds remaining {} bytes",
                self.buf.remaining()
            )));
        }
        Ok(Some(Datapoint {
            timestamp,
            value,
            unit,
            annotation: self.buf.split_to(len),
        }))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::iterator::test_util::dp;

    #[test]
    fn encode_decode() {
        let dps = vec![
            dp(1, 1.5),
            dp(2, -3.0).with_unit(TimeUnit::Second).with_annotation("note"),
            dp(7, f64::MAX),
        ];
        let segment = PlainSegmentCodec.encode(&dps);
        assert_eq!(segment.start_time, 1);
        assert_eq!(segment.block_size, 7);

        let mut reader = PlainSegmentCodec.reader(&segment).unwrap();
        let mut got = vec![];
        while let Some(dp) = reader.next_datapoint().unwrap() {
            got.push(dp);
        }
        assert_eq!(got, dps);
    }

    #[test]
    fn head_and_tail_are_concatenated() {
        let segment = PlainSegmentCodec.encode(&[dp(1, 1.0), dp(2, 2.0)]);
        let split = Segment {
            head: segment.head.slice(..10),
            tail: segment.head.slice(10..),
            ..segment.clone()
        };
        let mut reader = PlainSegmentCodec.reader(&split).unwrap();
        assert_eq!(reader.next_datapoint().unwrap().unwrap().value, 1.0);
        assert_eq!(reader.next_datapoint().unwrap().unwrap().value, 2.0);
        assert!(reader.next_datapoint().unwrap().is_none());
    }

    #[test]
    fn checksum_mismatch() {
        let mut segment = PlainSegmentCodec.encode(&[dp(1, 1.0)]);
        segment.checksum = segment.checksum.map(|c| c.wrapping_add(1));
        assert!(matches!(
            PlainSegmentCodec.reader(&segment),
            Err(Error::SegmentDecode(_))
        ));
    }

    #[test]
    fn truncated_without_checksum() {
        let mut segment = PlainSegmentCodec.encode(&[dp(1, 1.0)]);
        segment.checksum = None;
        segment.head.truncate(FIXED_WIDTH - 1);
        let mut reader = PlainSegmentCodec.reader(&segment).unwrap();
        assert!(matches!(
            reader.next_datapoint(),
            Err(Error::SegmentDecode(_))
        ));
    }
}
