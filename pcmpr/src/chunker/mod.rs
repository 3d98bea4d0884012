//! Content-defined block splitting used by the dedup layer.
mod config;
mod rabin;

pub use config::{Config, SplitConfig};
pub use rabin::{RabinHash, RollingHash};

/// A block produced while scanning a chunk buffer.
///
/// Offsets are relative to the start of the scanned buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Block {
    pub offset: usize,
    pub len: usize,
}

/// Splits a buffer into variable-size blocks at rolling hash boundaries.
///
/// A boundary is declared at length `p` from the block start when
/// `p >= min_block_size` and the hash sum of the trailing window satisfies
/// the average-size filter, or when `p` reaches `max_block_size`. Boundaries
/// are a pure function of the configuration and the bytes in the window.
pub struct RollingHashChunker<'a, H> {
    data: &'a [u8],
    offset: usize,
    hasher: H,
    min_block_size: usize,
    avg_block_size: u32,
    max_block_size: usize,
    window_size: usize,
}

impl<'a, H> RollingHashChunker<'a, H> {
    pub fn new(hasher: H, config: &SplitConfig, data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 0,
            hasher,
            min_block_size: config.min_block_size,
            avg_block_size: config.avg_block_size as u32,
            max_block_size: config.max_block_size,
            window_size: config.window_size,
        }
    }
}

impl<H> Iterator for RollingHashChunker<'_, H>
where
    H: RollingHash,
{
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        if self.offset >= self.data.len() {
            return None;
        }
        let rem = &self.data[self.offset..];
        let mut len = std::cmp::min(self.min_block_size, rem.len());

        // Only the trailing window of the minimal block contributes to the
        // first boundary check, so skip ahead before hashing.
        self.hasher.reset();
        let hash_from = len.saturating_sub(self.window_size);
        for &val in &rem[hash_from..len] {
            self.hasher.input(val);
        }

        loop {
            if len >= rem.len() {
                len = rem.len();
                break;
            }
            if len >= self.max_block_size {
                break;
            }
            if len >= self.min_block_size
                && self.hasher.sum() % self.avg_block_size == self.avg_block_size - 1
            {
                break;
            }
            self.hasher.input(rem[len]);
            len += 1;
        }

        let block = Block {
            offset: self.offset,
            len,
        };
        self.offset += len;
        Some(block)
    }
}

/// Emits fixed-size blocks, skipping the rolling hash entirely.
pub struct FixedSizeChunker<'a> {
    data: &'a [u8],
    offset: usize,
    block_size: usize,
}

impl<'a> FixedSizeChunker<'a> {
    pub fn new(block_size: usize, data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 0,
            block_size,
        }
    }
}

impl Iterator for FixedSizeChunker<'_> {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        if self.offset >= self.data.len() {
            return None;
        }
        let len = std::cmp::min(self.block_size, self.data.len() - self.offset);
        let block = Block {
            offset: self.offset,
            len,
        };
        self.offset += len;
        Some(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_data(len: usize) -> Vec<u8> {
        let mut seed: u64 = 0x1234_5678_9abc_def0;
        (0..len)
            .map(|_| {
                seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (seed >> 56) as u8
            })
            .collect()
    }

    fn split(config: &SplitConfig, data: &[u8]) -> Vec<Block> {
        RollingHashChunker::new(RabinHash::new(config.window_size), config, data).collect()
    }

    fn small_config() -> SplitConfig {
        SplitConfig {
            min_block_size: 64,
            avg_block_size: 256,
            max_block_size: 1024,
            window_size: 16,
        }
    }

    #[test]
    fn blocks_cover_input_exactly() {
        let config = small_config();
        let data = test_data(100_000);
        let blocks = split(&config, &data);
        let mut expect_offset = 0;
        for block in &blocks {
            assert_eq!(block.offset, expect_offset);
            assert!(block.len <= config.max_block_size);
            expect_offset += block.len;
        }
        assert_eq!(expect_offset, data.len());
        // All blocks but the last respect the minimum size.
        for block in &blocks[..blocks.len() - 1] {
            assert!(block.len >= config.min_block_size);
        }
    }

    #[test]
    fn boundaries_are_deterministic() {
        let config = small_config();
        let data = test_data(50_000);
        assert_eq!(split(&config, &data), split(&config, &data));
    }

    #[test]
    fn edit_only_shifts_nearby_boundaries() {
        // Content-defined splitting re-synchronizes after a local edit: the
        // boundaries well past the edited offset must be identical.
        let config = small_config();
        let original = test_data(64 * 1024);
        let mut edited = original.clone();
        edited.insert(10_000, 0xff);

        let ends = |data: &[u8]| -> Vec<usize> {
            split(&config, data)
                .iter()
                .map(|b| b.offset + b.len)
                .collect()
        };
        let original_ends = ends(&original);
        let edited_ends: Vec<usize> = ends(&edited).iter().map(|&e| e - 1).collect();

        let tail_original: Vec<&usize> =
            original_ends.iter().filter(|&&e| e > 30_000).collect();
        let tail_edited: Vec<&usize> =
            edited_ends.iter().filter(|&&e| e > 30_000).collect();
        assert!(!tail_original.is_empty());
        assert_eq!(tail_original, tail_edited);
    }

    #[test]
    fn short_input_is_a_single_block() {
        let config = small_config();
        let data = test_data(40);
        let blocks = split(&config, &data);
        assert_eq!(blocks, vec![Block { offset: 0, len: 40 }]);
    }

    #[test]
    fn fixed_size_blocks() {
        let data = test_data(1000);
        let blocks: Vec<Block> = FixedSizeChunker::new(256, &data).collect();
        assert_eq!(blocks.len(), 4);
        assert_eq!(blocks[3], Block { offset: 768, len: 232 });
    }

    #[test]
    fn empty_input_yields_no_blocks() {
        assert_eq!(FixedSizeChunker::new(256, &[]).count(), 0);
        let config = small_config();
        assert_eq!(split(&config, &[]).len(), 0);
    }
}
