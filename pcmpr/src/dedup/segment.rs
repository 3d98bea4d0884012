//! Segment metadata cache for segmented similarity dedup.
//!
//! Block lists of processed segments are appended to a scratch file; the
//! similarity index stores the record offset of each list. Workers read
//! matched records through a per-worker reader that caches the most recent
//! record, so probing the same segment repeatedly costs one read.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crc::Crc;

use super::index::FINGERPRINT_LEN;
use crate::Error;

const CRC64: Crc<u64> = Crc::<u64>::new(&crc::CRC_64_XZ);

/// Record header: block count (u32 be) + base stream offset (u64 be).
pub const SEGCACHE_HDR_SIZE: usize = 4 + 8;
pub const BLOCK_ENTRY_SIZE: usize = 8 + 4 + FINGERPRINT_LEN;

const ONE_TB: u64 = 1 << 40;
const ONE_PB: u64 = 1 << 50;

/// Segment sizing derived from the expected archive size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentGeometry {
    pub segment_sz_bytes: u64,
    pub directory_fanout: u32,
    pub directory_levels: u32,
}

impl SegmentGeometry {
    pub fn for_archive_size(archive_size: u64) -> Self {
        if archive_size < ONE_TB {
            Self {
                segment_sz_bytes: 4 * 1024 * 1024,
                directory_fanout: 128,
                directory_levels: 2,
            }
        } else if archive_size < ONE_PB {
            Self {
                segment_sz_bytes: 8 * 1024 * 1024,
                directory_fanout: 256,
                directory_levels: 2,
            }
        } else {
            Self {
                segment_sz_bytes: 8 * 1024 * 1024,
                directory_fanout: 256,
                directory_levels: 3,
            }
        }
    }

    /// Upper bound on the number of blocks forming one segment.
    pub fn blocks_per_segment(&self, avg_block_size: usize) -> usize {
        std::cmp::max(1, (self.segment_sz_bytes / avg_block_size as u64) as usize)
    }
}

/// A block entry within a segment metadata record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegBlockEntry {
    pub offset: u64,
    pub len: u32,
    pub fingerprint: [u8; FINGERPRINT_LEN],
}

/// Append side of the scratch file. One per stream, guarded by the dedup
/// index mutex.
pub struct SegmentCache {
    file: tempfile::NamedTempFile,
    pos: u64,
}

impl SegmentCache {
    /// Create the scratch file as `.segXXXXXX` under `tmp_dir`. The file is
    /// removed when the cache is dropped, on completion and cancellation
    /// alike.
    pub fn new(tmp_dir: &Path) -> Result<Self, Error> {
        let file = tempfile::Builder::new()
            .prefix(".seg")
            .tempfile_in(tmp_dir)
            .map_err(Error::Io)?;
        log::debug!("segment metadata cache at {}", file.path().display());
        Ok(Self { file, pos: 0 })
    }

    /// Position where the next record will be appended.
    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Open an independent read handle for a worker.
    pub fn reader(&self) -> Result<SegmentReader, Error> {
        Ok(SegmentReader {
            file: self.file.reopen().map_err(Error::Io)?,
            cached: None,
        })
    }

    /// Append a segment's block list; returns the record offset the
    /// similarity index should store.
    pub fn append(&mut self, base_offset: u64, entries: &[SegBlockEntry]) -> Result<u64, Error> {
        let record_offset = self.pos;
        let mut buf = Vec::with_capacity(SEGCACHE_HDR_SIZE + entries.len() * BLOCK_ENTRY_SIZE);
        buf.extend_from_slice(&(entries.len() as u32).to_be_bytes());
        buf.extend_from_slice(&base_offset.to_be_bytes());
        for entry in entries {
            buf.extend_from_slice(&entry.offset.to_be_bytes());
            buf.extend_from_slice(&entry.len.to_be_bytes());
            buf.extend_from_slice(&entry.fingerprint);
        }
        self.file.write_all(&buf).map_err(Error::Io)?;
        self.pos += buf.len() as u64;
        Ok(record_offset)
    }
}

/// Read side of the scratch file, owned by one worker at a time.
pub struct SegmentReader {
    file: std::fs::File,
    cached: Option<(u64, Vec<SegBlockEntry>)>,
}

impl SegmentReader {
    /// Load the record at `record_offset`. `cache_end` is the current
    /// append position; `max_blocks` bounds the entry count of a sane
    /// record. Re-loading the cached offset returns without touching the
    /// file.
    pub fn load(
        &mut self,
        record_offset: u64,
        cache_end: u64,
        max_blocks: usize,
    ) -> Result<&[SegBlockEntry], Error> {
        let cached_hit = matches!(&self.cached, Some((offset, _)) if *offset == record_offset);
        if cached_hit {
            return Ok(&self.cached.as_ref().expect("cached hit checked").1);
        }
        if record_offset + SEGCACHE_HDR_SIZE as u64 > cache_end {
            return Err(Error::Integrity { chunk_id: None });
        }
        self.file
            .seek(SeekFrom::Start(record_offset))
            .map_err(Error::Io)?;
        let mut hdr = [0u8; SEGCACHE_HDR_SIZE];
        self.file.read_exact(&mut hdr).map_err(Error::Io)?;
        let count = u32::from_be_bytes(hdr[0..4].try_into().expect("4 bytes")) as usize;
        if count > max_blocks
            || record_offset + (SEGCACHE_HDR_SIZE + count * BLOCK_ENTRY_SIZE) as u64 > cache_end
        {
            return Err(Error::Integrity { chunk_id: None });
        }
        let mut raw = vec![0u8; count * BLOCK_ENTRY_SIZE];
        self.file.read_exact(&mut raw).map_err(Error::Io)?;
        let entries = raw
            .chunks_exact(BLOCK_ENTRY_SIZE)
            .map(|rec| {
                let mut fingerprint = [0u8; FINGERPRINT_LEN];
                fingerprint.copy_from_slice(&rec[12..]);
                SegBlockEntry {
                    offset: u64::from_be_bytes(rec[0..8].try_into().expect("8 bytes")),
                    len: u32::from_be_bytes(rec[8..12].try_into().expect("4 bytes")),
                    fingerprint,
                }
            })
            .collect();
        self.cached = Some((record_offset, entries));
        Ok(&self.cached.as_ref().expect("just cached").1)
    }
}

/// Sample the similarity fingerprints of a segment, one per interval.
///
/// Block fingerprints are sorted and sampled at even positions; each sample
/// is folded to the 8 bytes the interval tables compare.
pub fn similarity_fingerprints(
    block_fingerprints: &[[u8; FINGERPRINT_LEN]],
    intervals: usize,
) -> Vec<[u8; 8]> {
    let mut sorted: Vec<&[u8; FINGERPRINT_LEN]> = block_fingerprints.iter().collect();
    sorted.sort_unstable();
    (0..intervals)
        .map(|i| {
            let idx = std::cmp::min(i * sorted.len() / intervals, sorted.len() - 1);
            CRC64.checksum(sorted[idx]).to_be_bytes()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HashSum;

    fn entry(byte: u8, offset: u64, len: u32) -> SegBlockEntry {
        let mut fp = [0u8; FINGERPRINT_LEN];
        fp.copy_from_slice(HashSum::fingerprint(&[byte; 64]).slice());
        SegBlockEntry {
            offset,
            len,
            fingerprint: fp,
        }
    }

    #[test]
    fn append_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = SegmentCache::new(dir.path()).unwrap();
        let first = vec![entry(1, 0, 100), entry(2, 100, 200)];
        let second = vec![entry(3, 300, 50)];
        let off1 = cache.append(0, &first).unwrap();
        let off2 = cache.append(300, &second).unwrap();
        assert_eq!(off1, 0);
        assert!(off2 > off1);

        let mut reader = cache.reader().unwrap();
        assert_eq!(reader.load(off1, cache.pos(), 16).unwrap(), &first[..]);
        assert_eq!(reader.load(off2, cache.pos(), 16).unwrap(), &second[..]);
        // Cached re-read.
        assert_eq!(reader.load(off2, cache.pos(), 16).unwrap(), &second[..]);
    }

    #[test]
    fn load_past_append_position_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = SegmentCache::new(dir.path()).unwrap();
        cache.append(0, &[entry(1, 0, 10)]).unwrap();
        let mut reader = cache.reader().unwrap();
        assert!(reader.load(cache.pos() + 1, cache.pos(), 16).is_err());
    }

    #[test]
    fn scratch_file_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let cache = SegmentCache::new(dir.path()).unwrap();
            let path = cache.path().to_path_buf();
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            assert!(name.starts_with(".seg"));
            assert!(path.exists());
            path
        };
        assert!(!path.exists());
    }

    #[test]
    fn similarity_sampling_is_stable() {
        let fps: Vec<[u8; FINGERPRINT_LEN]> = (0..50u8)
            .map(|b| {
                let mut fp = [0u8; FINGERPRINT_LEN];
                fp.copy_from_slice(HashSum::fingerprint(&[b; 32]).slice());
                fp
            })
            .collect();
        let a = similarity_fingerprints(&fps, 10);
        let mut shuffled = fps.clone();
        shuffled.reverse();
        let b = similarity_fingerprints(&shuffled, 10);
        assert_eq!(a, b);
        assert_eq!(a.len(), 10);
    }

    #[test]
    fn geometry_table() {
        let small = SegmentGeometry::for_archive_size(1 << 30);
        assert_eq!(small.segment_sz_bytes, 4 * 1024 * 1024);
        assert_eq!(small.directory_fanout, 128);
        assert_eq!(small.directory_levels, 2);
        let large = SegmentGeometry::for_archive_size(ONE_TB * 2);
        assert_eq!(large.segment_sz_bytes, 8 * 1024 * 1024);
        let huge = SegmentGeometry::for_archive_size(ONE_PB * 2);
        assert_eq!(huge.directory_levels, 3);
        assert_eq!(small.blocks_per_segment(32 * 1024), 128);
    }
}
