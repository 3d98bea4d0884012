//! Content-defined deduplication.
//!
//! Chunks are split into blocks (fixed-size or Rabin) whose fingerprints
//! are tracked in an in-memory index over the whole stream. Duplicate
//! blocks are replaced with back-references into the earlier stream. Two
//! index shapes share the entry format: a simple fingerprint table, and a
//! segmented similarity index used when a full table would not fit in
//! memory.

mod descriptor;
mod index;
mod segment;

pub use descriptor::{expand, DescriptorBuilder};
pub use index::{
    entry_size, mem_per_unit, mem_required, slots_for_mem, Index, MatchRule, FINGERPRINT_LEN,
};
pub use segment::{
    similarity_fingerprints, SegBlockEntry, SegmentCache, SegmentGeometry, SegmentReader,
    BLOCK_ENTRY_SIZE, SEGCACHE_HDR_SIZE,
};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::chunker::{self, Block};
use crate::{Error, HashSum};

/// Similarity interval percentage used when the index auto-upgrades.
pub const DEFAULT_PCT_INTERVAL: u32 = 10;
/// Default memory budget for the dedup index.
pub const DEFAULT_MEM_LIMIT: u64 = 512 * 1024 * 1024;

/// Which index shape the user asked for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexRequest {
    /// Simple index, upgraded to segmented when it would not fit.
    Auto,
    /// Simple index only.
    Simple,
    /// Segmented similarity index.
    Segmented,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexMode {
    Simple,
    Segmented,
}

#[derive(Clone, Debug)]
pub struct DedupConfig {
    /// Block splitting algorithm and bounds.
    pub split: chunker::Config,
    pub index: IndexRequest,
    pub mem_limit: u64,
    /// Similarity interval percentage for the segmented index.
    pub pct_interval: u32,
    /// Directory for the segment metadata scratch file.
    pub tmp_dir: PathBuf,
}

impl DedupConfig {
    pub fn new(split: chunker::Config) -> Self {
        Self {
            split,
            index: IndexRequest::Auto,
            mem_limit: DEFAULT_MEM_LIMIT,
            pct_interval: DEFAULT_PCT_INTERVAL,
            tmp_dir: std::env::temp_dir(),
        }
    }
}

/// Sizing decision for the index, derived from the file size and the memory
/// limit before any data is processed.
#[derive(Debug)]
pub struct IndexPlan {
    pub mode: IndexMode,
    pub hash_slots: u64,
    pub intervals: usize,
    pub mem_required: u64,
    pub geometry: Option<SegmentGeometry>,
}

/// Decide between the simple and the segmented index.
///
/// A simple index is sized from the stream size at 50% target occupancy;
/// when the memory it requires exceeds three times the configured limit the
/// plan upgrades to segmented similarity dedup. In pipe mode (unknown size)
/// the simple index is sized from the limit alone.
pub fn plan_index(config: &DedupConfig, file_size: Option<u64>) -> IndexPlan {
    let ent = entry_size();
    let avg_block = config.split.avg_block_size() as u64;
    match config.index {
        IndexRequest::Simple | IndexRequest::Auto => {
            let mut hash_slots = match file_size {
                Some(size) => size / avg_block + 1,
                None => slots_for_mem(config.mem_limit, ent),
            };
            let mem_reqd = mem_required(hash_slots, ent);
            if config.index == IndexRequest::Auto
                && file_size.is_some()
                && mem_reqd > config.mem_limit * 3
            {
                log::info!(
                    "simple dedup index needs {} MiB, auto-upgrading to segmented similarity dedup",
                    mem_reqd >> 20
                );
                return segmented_plan(config, file_size);
            }
            while mem_required(hash_slots, ent) > config.mem_limit && hash_slots > 1 {
                hash_slots -= std::cmp::max(1, hash_slots / 16);
            }
            IndexPlan {
                mode: IndexMode::Simple,
                hash_slots,
                intervals: 1,
                mem_required: mem_required(hash_slots, ent),
                geometry: None,
            }
        }
        IndexRequest::Segmented => segmented_plan(config, file_size),
    }
}

fn segmented_plan(config: &DedupConfig, file_size: Option<u64>) -> IndexPlan {
    let ent = entry_size();
    let geometry = SegmentGeometry::for_archive_size(file_size.unwrap_or(0));
    let intervals = std::cmp::max(1, 100 / config.pct_interval) as usize;
    let mut hash_slots = match file_size {
        Some(size) => (size / geometry.segment_sz_bytes + 1) * intervals as u64,
        None => slots_for_mem(config.mem_limit, ent),
    };
    while mem_required(hash_slots, ent) > config.mem_limit && hash_slots > intervals as u64 {
        hash_slots -= std::cmp::max(1, hash_slots / 16);
    }
    log::debug!(
        "segmented dedup: segment size {} KiB, fanout {}, {} levels, {} intervals",
        geometry.segment_sz_bytes >> 10,
        geometry.directory_fanout,
        geometry.directory_levels,
        intervals
    );
    IndexPlan {
        mode: IndexMode::Segmented,
        hash_slots,
        intervals,
        mem_required: mem_required(hash_slots, ent),
        geometry: Some(geometry),
    }
}

struct IndexState {
    index: Index,
    cache: Option<SegmentCache>,
}

/// Admits chunks to the index in id order.
///
/// Workers race on the index mutex, but the entries a chunk can match must
/// not depend on which worker got there first: the stream of inserts has to
/// be the same for one worker and for eight. Each chunk therefore waits for
/// its turn before touching the index, and releases the turn when its index
/// pass is done (or failed).
struct Turnstile {
    next: Mutex<u64>,
    turn_done: Condvar,
}

impl Turnstile {
    fn new() -> Self {
        Self {
            next: Mutex::new(0),
            turn_done: Condvar::new(),
        }
    }

    fn enter(&self, chunk_id: u64, cancel: &AtomicBool) -> Result<TurnstileGuard<'_>, Error> {
        let mut next = self.next.lock().expect("turnstile lock");
        while *next != chunk_id {
            if cancel.load(Ordering::Acquire) {
                return Err(Error::Canceled);
            }
            let (guard, _timeout) = self
                .turn_done
                .wait_timeout(next, Duration::from_millis(100))
                .expect("turnstile lock");
            next = guard;
        }
        Ok(TurnstileGuard {
            turnstile: self,
            chunk_id,
        })
    }
}

struct TurnstileGuard<'a> {
    turnstile: &'a Turnstile,
    chunk_id: u64,
}

impl Drop for TurnstileGuard<'_> {
    fn drop(&mut self) {
        let mut next = self.turnstile.next.lock().expect("turnstile lock");
        *next = self.chunk_id + 1;
        self.turnstile.turn_done.notify_all();
    }
}

/// Stream-wide dedup state shared by all workers.
///
/// Lookups and inserts run under one mutex, held across a single chunk's
/// index pass. Segment metadata reads use per-worker readers outside the
/// lock.
pub struct Deduper {
    split: chunker::Config,
    chunk_size: u64,
    mode: IndexMode,
    intervals: usize,
    segment_sz_bytes: u64,
    max_blocks_per_segment: usize,
    state: Mutex<IndexState>,
    turnstile: Turnstile,
    readers: Mutex<Vec<SegmentReader>>,
    saved: AtomicU64,
}

impl Deduper {
    pub fn new(
        config: &DedupConfig,
        chunk_size: u64,
        file_size: Option<u64>,
        num_workers: usize,
    ) -> Result<Self, Error> {
        let plan = plan_index(config, file_size);
        log::debug!(
            "dedup index: {:?}, {} slots, {} MiB",
            plan.mode,
            plan.hash_slots,
            plan.mem_required >> 20
        );
        let (index, cache, readers, segment_sz_bytes, max_blocks) = match plan.mode {
            IndexMode::Simple => (
                Index::new(1, plan.hash_slots, config.mem_limit, MatchRule::FingerprintAndSize),
                None,
                Vec::new(),
                0,
                0,
            ),
            IndexMode::Segmented => {
                let geometry = plan.geometry.expect("segmented plan has geometry");
                let cache = SegmentCache::new(&config.tmp_dir)?;
                let readers = (0..std::cmp::max(1, num_workers))
                    .map(|_| cache.reader())
                    .collect::<Result<Vec<_>, Error>>()?;
                let max_blocks =
                    geometry.blocks_per_segment(config.split.avg_block_size()) * 8;
                (
                    Index::new(
                        plan.intervals,
                        plan.hash_slots,
                        config.mem_limit,
                        MatchRule::FingerprintWord,
                    ),
                    Some(cache),
                    readers,
                    geometry.segment_sz_bytes,
                    max_blocks,
                )
            }
        };
        Ok(Self {
            split: config.split.clone(),
            chunk_size,
            mode: plan.mode,
            intervals: plan.intervals,
            segment_sz_bytes,
            max_blocks_per_segment: max_blocks,
            state: Mutex::new(IndexState { index, cache }),
            turnstile: Turnstile::new(),
            readers: Mutex::new(readers),
            saved: AtomicU64::new(0),
        })
    }

    pub fn mode(&self) -> IndexMode {
        self.mode
    }

    /// Path of the segment metadata scratch file, if one is in use.
    pub fn scratch_path(&self) -> Option<PathBuf> {
        let state = self.state.lock().expect("dedup index lock");
        state.cache.as_ref().map(|c| c.path().to_path_buf())
    }

    /// Total bytes replaced by back-references so far.
    pub fn saved_bytes(&self) -> u64 {
        self.saved.load(Ordering::Relaxed)
    }

    /// Replace duplicate blocks of a chunk with back-references.
    ///
    /// Returns the descriptor stream when it is smaller than the chunk,
    /// None when the chunk should be stored as-is. Index entries are
    /// recorded either way so later chunks can reference this one. Index
    /// access is admitted in chunk id order; fingerprinting and descriptor
    /// assembly stay parallel.
    pub fn dedup_chunk(
        &self,
        chunk_id: u64,
        data: &[u8],
        cancel: &AtomicBool,
    ) -> Result<Option<Vec<u8>>, Error> {
        if data.is_empty() {
            let _turn = self.turnstile.enter(chunk_id, cancel)?;
            return Ok(None);
        }
        let chunk_start = chunk_id * self.chunk_size;
        let blocks: Vec<Block> = self.split.split(data).collect();
        let fingerprints: Vec<[u8; FINGERPRINT_LEN]> = blocks
            .iter()
            .map(|b| {
                let mut fp = [0u8; FINGERPRINT_LEN];
                fp.copy_from_slice(HashSum::fingerprint(&data[b.offset..b.offset + b.len]).slice());
                fp
            })
            .collect();

        let decisions = {
            let _turn = self.turnstile.enter(chunk_id, cancel)?;
            match self.mode {
                IndexMode::Simple => self.match_simple(chunk_start, &blocks, &fingerprints),
                IndexMode::Segmented => {
                    self.match_segmented(chunk_start, &blocks, &fingerprints)?
                }
            }
        };

        let mut matched_bytes: u64 = 0;
        let mut builder = DescriptorBuilder::new(data.len() / 8 + 64);
        for (block, decision) in blocks.iter().zip(decisions.iter()) {
            match decision {
                Some((offset, len)) => {
                    builder.backref(*offset, *len);
                    matched_bytes += u64::from(*len);
                }
                None => builder.literal(&data[block.offset..block.offset + block.len]),
            }
        }
        let desc = builder.finish();
        if matched_bytes > 0 && desc.len() < data.len() {
            self.saved
                .fetch_add(data.len() as u64 - desc.len() as u64, Ordering::Relaxed);
            log::debug!(
                "chunk {}: deduped {} of {} bytes",
                chunk_id,
                matched_bytes,
                data.len()
            );
            Ok(Some(desc))
        } else {
            Ok(None)
        }
    }

    fn match_simple(
        &self,
        chunk_start: u64,
        blocks: &[Block],
        fingerprints: &[[u8; FINGERPRINT_LEN]],
    ) -> Vec<Option<(u64, u32)>> {
        let mut state = self.state.lock().expect("dedup index lock");
        blocks
            .iter()
            .zip(fingerprints.iter())
            .map(|(block, fp)| {
                let abs = chunk_start + block.offset as u64;
                state
                    .index
                    .lookup_insert(0, fp, abs, block.len as u32, Some(abs))
            })
            .collect()
    }

    fn match_segmented(
        &self,
        chunk_start: u64,
        blocks: &[Block],
        fingerprints: &[[u8; FINGERPRINT_LEN]],
    ) -> Result<Vec<Option<(u64, u32)>>, Error> {
        // Group consecutive blocks into segments of roughly the configured
        // byte size and sample their similarity fingerprints up front, so
        // the index lock is only held for the probe and append.
        let mut segments: Vec<std::ops::Range<usize>> = Vec::new();
        let mut seg_start = 0;
        let mut seg_bytes: u64 = 0;
        for (i, block) in blocks.iter().enumerate() {
            seg_bytes += block.len as u64;
            if seg_bytes >= self.segment_sz_bytes {
                segments.push(seg_start..i + 1);
                seg_start = i + 1;
                seg_bytes = 0;
            }
        }
        if seg_start < blocks.len() {
            segments.push(seg_start..blocks.len());
        }

        let sim_fps: Vec<Vec<[u8; 8]>> = segments
            .iter()
            .map(|range| similarity_fingerprints(&fingerprints[range.clone()], self.intervals))
            .collect();

        // Probe and publish each segment under the lock.
        let mut matches: Vec<Option<u64>> = Vec::with_capacity(segments.len());
        let cache_end;
        {
            let mut state = self.state.lock().expect("dedup index lock");
            for (range, fps) in segments.iter().zip(sim_fps.iter()) {
                let mut hit = None;
                let entries: Vec<SegBlockEntry> = range
                    .clone()
                    .map(|i| SegBlockEntry {
                        offset: chunk_start + blocks[i].offset as u64,
                        len: blocks[i].len as u32,
                        fingerprint: fingerprints[i],
                    })
                    .collect();
                let record_offset = state
                    .cache
                    .as_mut()
                    .expect("segmented mode has a cache")
                    .append(chunk_start + blocks[range.start].offset as u64, &entries)?;
                for (interval, fp) in fps.iter().enumerate() {
                    let found = state.index.lookup_insert(
                        interval,
                        fp,
                        record_offset,
                        entries.len() as u32,
                        None,
                    );
                    if hit.is_none() {
                        hit = found.map(|(offset, _)| offset);
                    }
                }
                matches.push(hit);
            }
            cache_end = state
                .cache
                .as_ref()
                .expect("segmented mode has a cache")
                .pos();
        }

        // Resolve block-level matches against the similar segments outside
        // the lock, through this worker's cached reader.
        let mut reader = self
            .readers
            .lock()
            .expect("segment reader pool lock")
            .pop()
            .ok_or_else(|| Error::Resource("segment reader pool exhausted".into()))?;
        let mut decisions: Vec<Option<(u64, u32)>> = vec![None; blocks.len()];
        let result = (|| {
            for (range, hit) in segments.iter().zip(matches.iter()) {
                let record_offset = match hit {
                    Some(offset) => *offset,
                    None => continue,
                };
                let entries =
                    reader.load(record_offset, cache_end, self.max_blocks_per_segment)?;
                let map: std::collections::HashMap<&[u8; FINGERPRINT_LEN], (u64, u32)> = entries
                    .iter()
                    .map(|e| (&e.fingerprint, (e.offset, e.len)))
                    .collect();
                for i in range.clone() {
                    let abs = chunk_start + blocks[i].offset as u64;
                    if let Some(&(offset, len)) = map.get(&fingerprints[i]) {
                        if len == blocks[i].len as u32 && offset + u64::from(len) <= abs {
                            decisions[i] = Some((offset, len));
                        }
                    }
                }
            }
            Ok(decisions)
        })();
        self.readers
            .lock()
            .expect("segment reader pool lock")
            .push(reader);
        result
    }
}
