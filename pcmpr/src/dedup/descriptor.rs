//! Dedup descriptor stream.
//!
//! A deduplicated chunk payload replaces the chunk content with a sequence
//! of records, each either a run of literal bytes or a back-reference into
//! the earlier part of the reconstructed stream:
//!
//! | Offset | Size | Description                              |
//! |--------|------|------------------------------------------|
//! |      0 |    8 | Expanded (original) length (u64 be).     |
//! |      8 |    4 | Record count (u32 be).                   |
//! |     12 |    n | Records.                                 |
//!
//! Literal record: tag 0, length (u32 be), bytes.
//! Back-reference: tag 1, stream offset (u64 be), length (u32 be).

use crate::Error;

const DESC_HDR_SIZE: usize = 8 + 4;
const TAG_LITERAL: u8 = 0;
const TAG_BACKREF: u8 = 1;

pub struct DescriptorBuilder {
    out: Vec<u8>,
    count: u32,
    expanded: u64,
    // Offset of the length field of an open literal record.
    open_literal: Option<usize>,
}

impl DescriptorBuilder {
    pub fn new(capacity_hint: usize) -> Self {
        let mut out = Vec::with_capacity(DESC_HDR_SIZE + capacity_hint);
        out.resize(DESC_HDR_SIZE, 0);
        Self {
            out,
            count: 0,
            expanded: 0,
            open_literal: None,
        }
    }

    /// Append literal bytes, merging into the preceding literal record.
    pub fn literal(&mut self, data: &[u8]) {
        self.expanded += data.len() as u64;
        match self.open_literal {
            Some(len_at) => {
                let len = u32::from_be_bytes(
                    self.out[len_at..len_at + 4].try_into().expect("4 bytes"),
                ) + data.len() as u32;
                self.out[len_at..len_at + 4].copy_from_slice(&len.to_be_bytes());
            }
            None => {
                self.out.push(TAG_LITERAL);
                self.open_literal = Some(self.out.len());
                self.out.extend_from_slice(&(data.len() as u32).to_be_bytes());
                self.count += 1;
            }
        }
        self.out.extend_from_slice(data);
    }

    /// Append a back-reference to `len` bytes at stream offset `offset`.
    pub fn backref(&mut self, offset: u64, len: u32) {
        self.expanded += u64::from(len);
        self.open_literal = None;
        self.out.push(TAG_BACKREF);
        self.out.extend_from_slice(&offset.to_be_bytes());
        self.out.extend_from_slice(&len.to_be_bytes());
        self.count += 1;
    }

    /// Number of records appended so far.
    pub fn records(&self) -> u32 {
        self.count
    }

    pub fn len(&self) -> usize {
        self.out.len()
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.out[0..8].copy_from_slice(&self.expanded.to_be_bytes());
        self.out[8..12].copy_from_slice(&self.count.to_be_bytes());
        self.out
    }
}

/// Expand a descriptor stream back into chunk content.
///
/// `stream_pos` is the number of stream bytes reconstructed before this
/// chunk; `read_history` resolves a `(offset, buf)` read against them.
/// References beyond `stream_pos` resolve into the chunk itself. A
/// reference past the end of what exists is an integrity error.
pub fn expand<F>(
    desc: &[u8],
    chunk_id: u64,
    stream_pos: u64,
    mut read_history: F,
) -> Result<Vec<u8>, Error>
where
    F: FnMut(u64, &mut [u8]) -> Result<(), Error>,
{
    if desc.len() < DESC_HDR_SIZE {
        return Err(Error::integrity(chunk_id));
    }
    let expanded_len = u64::from_be_bytes(desc[0..8].try_into().expect("8 bytes"));
    let count = u32::from_be_bytes(desc[8..12].try_into().expect("4 bytes"));
    let mut out: Vec<u8> = Vec::with_capacity(expanded_len as usize);
    let mut at = DESC_HDR_SIZE;

    let take = |at: &mut usize, n: usize| -> Result<std::ops::Range<usize>, Error> {
        if *at + n > desc.len() {
            return Err(Error::integrity(chunk_id));
        }
        let range = *at..*at + n;
        *at += n;
        Ok(range)
    };

    for _ in 0..count {
        let tag = desc[take(&mut at, 1)?][0];
        match tag {
            TAG_LITERAL => {
                let len =
                    u32::from_be_bytes(desc[take(&mut at, 4)?].try_into().expect("4 bytes"))
                        as usize;
                out.extend_from_slice(&desc[take(&mut at, len)?]);
            }
            TAG_BACKREF => {
                let offset =
                    u64::from_be_bytes(desc[take(&mut at, 8)?].try_into().expect("8 bytes"));
                let len =
                    u32::from_be_bytes(desc[take(&mut at, 4)?].try_into().expect("4 bytes"))
                        as usize;
                let end = offset + len as u64;
                if end <= stream_pos {
                    let start = out.len();
                    out.resize(start + len, 0);
                    read_history(offset, &mut out[start..])?;
                } else if offset >= stream_pos && end <= stream_pos + out.len() as u64 {
                    // Reference into this chunk's own already-expanded part.
                    let local = (offset - stream_pos) as usize;
                    out.extend_from_within(local..local + len);
                } else {
                    return Err(Error::integrity(chunk_id));
                }
            }
            _ => return Err(Error::integrity(chunk_id)),
        }
    }
    if at != desc.len() || out.len() as u64 != expanded_len {
        return Err(Error::integrity(chunk_id));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_history(_offset: u64, _buf: &mut [u8]) -> Result<(), Error> {
        panic!("no history reads expected");
    }

    #[test]
    fn literal_only_round_trip() {
        let mut builder = DescriptorBuilder::new(16);
        builder.literal(b"hello ");
        builder.literal(b"world");
        assert_eq!(builder.records(), 1); // merged
        let desc = builder.finish();
        let out = expand(&desc, 0, 0, no_history).unwrap();
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn backref_into_history() {
        let history = b"0123456789".to_vec();
        let mut builder = DescriptorBuilder::new(16);
        builder.backref(2, 4);
        builder.literal(b"x");
        let desc = builder.finish();
        let out = expand(&desc, 1, history.len() as u64, |offset, buf| {
            buf.copy_from_slice(&history[offset as usize..offset as usize + buf.len()]);
            Ok(())
        })
        .unwrap();
        assert_eq!(out, b"2345x");
    }

    #[test]
    fn backref_into_own_chunk() {
        let mut builder = DescriptorBuilder::new(16);
        builder.literal(b"abcd");
        builder.backref(100, 4); // stream_pos is 100; refers to "abcd"
        let desc = builder.finish();
        let out = expand(&desc, 0, 100, no_history).unwrap();
        assert_eq!(out, b"abcdabcd");
    }

    #[test]
    fn out_of_range_reference_is_integrity_error() {
        let mut builder = DescriptorBuilder::new(16);
        builder.backref(50, 100); // crosses the history/chunk border
        let desc = builder.finish();
        let err = expand(&desc, 9, 60, |_, buf| {
            buf.fill(0);
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(err, Error::Integrity { chunk_id: Some(9) }));
    }

    #[test]
    fn truncated_descriptor_is_integrity_error() {
        let mut builder = DescriptorBuilder::new(16);
        builder.literal(b"abcdef");
        let desc = builder.finish();
        assert!(expand(&desc[..desc.len() - 2], 0, 0, no_history).is_err());
    }
}
