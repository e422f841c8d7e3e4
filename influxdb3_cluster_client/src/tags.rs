//! Series tags and their wire encoding.
//!
//! Encoded tags are a little-endian `u16` header magic, a `u16` tag count and then each tag name
//! and value prefixed by its `u16` length. Decoding slices into the encoded buffer instead of
//! copying.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, Result};

const HEADER_MAGIC: u16 = 10101;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag {
    pub name: Bytes,
    pub value: Bytes,
}

impl Tag {
    pub fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

pub fn encode_tags(tags: &[Tag]) -> Result<Bytes> {
    let count = u16::try_from(tags.len())
        .map_err(|_| Error::TagEncode(format!("too many tags: {}", tags.len())))?;

    let size = 4 + tags
        .iter()
        .map(|t| 4 + t.name.len() + t.value.len())
        .sum::<usize>();
    let mut buf = BytesMut::with_capacity(size);
    buf.put_u16_le(HEADER_MAGIC);
    buf.put_u16_le(count);
    for tag in tags {
        if tag.name.is_empty() {
            return Err(Error::TagEncode("tag name cannot be empty".to_string()));
        }
        put_field(&mut buf, &tag.name, "name")?;
        put_field(&mut buf, &tag.value, "value")?;
    }
    Ok(buf.freeze())
}

fn put_field(buf: &mut BytesMut, field: &Bytes, what: &str) -> Result<()> {
    let len = u16::try_from(field.len())
        .map_err(|_| Error::TagEncode(format!("tag {what} too long: {} bytes", field.len())))?;
    buf.put_u16_le(len);
    buf.put_slice(field);
    Ok(())
}

/// Decode tags produced by [`encode_tags`]. An empty buffer decodes to no tags.
pub fn decode_tags(encoded: &Bytes) -> Result<Vec<Tag>> {
    if encoded.is_empty() {
        return Ok(vec![]);
    }

    let mut buf = encoded.clone();
    if buf.remaining() < 4 {
        return Err(Error::TagDecode("missing header".to_string()));
    }
    let magic = buf.get_u16_le();
    if magic != HEADER_MAGIC {
        return Err(Error::TagDecode(format!("invalid header magic {magic}")));
    }
    let count = buf.get_u16_le() as usize;

    let mut tags = Vec::with_capacity(count);
    for _ in 0..count {
        let name = take_field(&mut buf)?;
        let value = take_field(&mut buf)?;
        tags.push(Tag { name, value });
    }
    if buf.has_remaining() {
        return Err(Error::TagDecode(format!(
            "{} trailing bytes after {count} tags",
            buf.remaining()
        )));
    }
    Ok(tags)
}

fn take_field(buf: &mut Bytes) -> Result<Bytes> {
    if buf.remaining() < 2 {
        return Err(Error::TagDecode("truncated length".to_string()));
    }
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        return Err(Error::TagDecode(format!(
            "field of {len} bytes exceeds remaining {} bytes",
            buf.remaining()
        )));
    }
    Ok(buf.split_to(len))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn encode_decode() {
        let tags = vec![Tag::new("host", "a"), Tag::new("dc", ""), Tag::new("region", "us-west")];
        let encoded = encode_tags(&tags).unwrap();
        assert_eq!(&encoded[..2], &10101u16.to_le_bytes());
        assert_eq!(decode_tags(&encoded).unwrap(), tags);
        assert!(decode_tags(&Bytes::new()).unwrap().is_empty());
    }

    #[test]
    fn decode_is_zero_copy() {
        let encoded = encode_tags(&[Tag::new("host", "a")]).unwrap();
        let tags = decode_tags(&encoded).unwrap();
        let start = encoded.as_ptr() as usize;
        let end = start + encoded.len();
        let name = tags[0].name.as_ptr() as usize;
        assert!(name >= start && name < end);
    }

    #[test]
    fn encode_errors() {
        assert!(matches!(
            encode_tags(&[Tag::new("", "a")]),
            Err(Error::TagEncode(_))
        ));
        let long = Bytes::from(vec![b'x'; u16::MAX as usize + 1]);
        assert!(matches!(
            encode_tags(&[Tag::new("host", long)]),
            Err(Error::TagEncode(_))
        ));
    }

    #[test]
    fn decode_errors() {
        let encoded = encode_tags(&[Tag::new("host", "a")]).unwrap();
        for bad in [
            encoded.slice(..3),
            encoded.slice(..encoded.len() - 1),
            Bytes::from_static(&[0, 0, 0, 0]),
            Bytes::from([encoded.as_ref(), b"x"].concat()),
        ] {
            assert!(matches!(decode_tags(&bad), Err(Error::TagDecode(_))), "{bad:?}");
        }
    }
}
