//! In-memory fingerprint index.
//!
//! One or more chained hash tables over fixed-width fingerprints. The
//! simple mode uses a single table keyed by (fingerprint, block size); the
//! segmented similarity mode uses one table per similarity interval with an
//! 8-byte fast-path compare. Memory use is bounded: once the accounted use
//! reaches the limit, an insert displaces the head of its target chain.

use crate::HashSum;

/// Width of a dedup fingerprint; lookups compare word-wise and exit on the
/// first mismatching word.
pub const FINGERPRINT_LEN: usize = HashSum::FINGERPRINT_LEN;

struct HashEntry {
    fingerprint: [u8; FINGERPRINT_LEN],
    item_offset: u64,
    item_size: u32,
    next: Option<Box<HashEntry>>,
}

/// How a chain entry is matched during lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchRule {
    /// Full fingerprint plus exact item size (simple index).
    FingerprintAndSize,
    /// First fingerprint word only (similarity tables).
    FingerprintWord,
}

fn words_equal(a: &[u8; FINGERPRINT_LEN], b: &[u8]) -> bool {
    for (wa, wb) in a.chunks_exact(8).zip(b.chunks_exact(8)) {
        let va = u64::from_ne_bytes(wa.try_into().expect("8 bytes"));
        let vb = u64::from_ne_bytes(wb.try_into().expect("8 bytes"));
        if va != vb {
            return false;
        }
    }
    true
}

fn first_word(fp: &[u8]) -> u64 {
    u64::from_ne_bytes(fp[..8].try_into().expect("8 bytes"))
}

/// Memory accounted per hash slot at the target 50% occupancy: the entry,
/// chain pointer overhead and the slot pointer itself.
pub fn mem_per_unit(entry_size: usize) -> u64 {
    (entry_size + 8 + 4 + 8) as u64
}

pub fn mem_required(hash_slots: u64, entry_size: usize) -> u64 {
    hash_slots * mem_per_unit(entry_size)
}

pub fn slots_for_mem(mem_limit: u64, entry_size: usize) -> u64 {
    (mem_limit / mem_per_unit(entry_size)).saturating_sub(5)
}

pub fn entry_size() -> usize {
    std::mem::size_of::<HashEntry>()
}

pub struct Index {
    tables: Vec<Vec<Option<Box<HashEntry>>>>,
    slots_per_table: usize,
    match_rule: MatchRule,
    mem_used: u64,
    mem_limit: u64,
    entries: u64,
    displaced: u64,
}

impl Index {
    /// Create an index with `intervals` tables sharing `hash_slots` slots.
    pub fn new(intervals: usize, hash_slots: u64, mem_limit: u64, match_rule: MatchRule) -> Self {
        let slots_per_table = std::cmp::max(1, (hash_slots as usize) / intervals);
        let tables = (0..intervals)
            .map(|_| {
                let mut table = Vec::new();
                table.resize_with(slots_per_table, || None);
                table
            })
            .collect();
        let slot_mem = (intervals * slots_per_table * 8) as u64;
        Self {
            tables,
            slots_per_table,
            match_rule,
            mem_used: slot_mem,
            mem_limit: std::cmp::max(mem_limit, slot_mem + mem_per_unit(entry_size())),
            entries: 0,
            displaced: 0,
        }
    }

    fn slot(&self, fp: &[u8]) -> usize {
        let mut h = xxhash_rust::xxh32::xxh32(fp, 0);
        h ^= h / fp.len() as u32;
        (h as usize) % self.slots_per_table
    }

    /// Look up a fingerprint; insert it when no usable match exists.
    ///
    /// `limit_offset` restricts matches to entries whose item lies entirely
    /// before it, so a reference handed out here always points at data that
    /// precedes the probing block in the stream.
    pub fn lookup_insert(
        &mut self,
        interval: usize,
        fp: &[u8],
        item_offset: u64,
        item_size: u32,
        limit_offset: Option<u64>,
    ) -> Option<(u64, u32)> {
        let slot = self.slot(fp);
        let entry_size = entry_size();
        let mut cursor = self.tables[interval][slot].as_deref();
        while let Some(ent) = cursor {
            let fp_match = match self.match_rule {
                MatchRule::FingerprintAndSize => {
                    words_equal(&ent.fingerprint, fp) && ent.item_size == item_size
                }
                MatchRule::FingerprintWord => first_word(&ent.fingerprint) == first_word(fp),
            };
            if fp_match && ent.item_offset != item_offset {
                let usable = match limit_offset {
                    Some(limit) => ent.item_offset + u64::from(ent.item_size) <= limit,
                    None => true,
                };
                if usable {
                    return Some((ent.item_offset, ent.item_size));
                }
            }
            cursor = ent.next.as_deref();
        }

        // No match; insert. Over budget, the chain head is unlinked and its
        // allocation reused. Entries always go to the chain tail so chains
        // stay ordered oldest first.
        let mut fingerprint = [0u8; FINGERPRINT_LEN];
        fingerprint[..fp.len().min(FINGERPRINT_LEN)]
            .copy_from_slice(&fp[..fp.len().min(FINGERPRINT_LEN)]);
        let head = &mut self.tables[interval][slot];
        let entry = if self.mem_used + entry_size as u64 >= self.mem_limit && head.is_some() {
            let mut displaced = head.take().expect("head checked above");
            *head = displaced.next.take();
            displaced.fingerprint = fingerprint;
            displaced.item_offset = item_offset;
            displaced.item_size = item_size;
            self.displaced += 1;
            displaced
        } else {
            self.mem_used += entry_size as u64;
            self.entries += 1;
            Box::new(HashEntry {
                fingerprint,
                item_offset,
                item_size,
                next: None,
            })
        };
        let mut tail = &mut self.tables[interval][slot];
        while let Some(ent) = tail {
            tail = &mut ent.next;
        }
        *tail = Some(entry);
        None
    }

    pub fn mem_used(&self) -> u64 {
        self.mem_used
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }

    pub fn displaced(&self) -> u64 {
        self.displaced
    }
}
