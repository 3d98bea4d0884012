use super::{Block, FixedSizeChunker, RabinHash, RollingHashChunker};

/// Number of bytes kept in the rolling hash window while scanning.
pub const DEFAULT_WINDOW_SIZE: usize = 48;

/// Size bounds to use while scanning for block boundaries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SplitConfig {
    /// No blocks smaller than `min_block_size`.
    pub min_block_size: usize,
    /// Target average block size; must not exceed `u32::MAX`.
    pub avg_block_size: usize,
    /// No blocks bigger than `max_block_size`.
    pub max_block_size: usize,
    /// Rolling hash window size.
    pub window_size: usize,
}

impl SplitConfig {
    /// Derive bounds from a target average size.
    pub fn from_avg(avg_block_size: usize) -> Self {
        Self {
            min_block_size: std::cmp::max(avg_block_size / 4, 512),
            avg_block_size,
            max_block_size: avg_block_size * 8,
            window_size: DEFAULT_WINDOW_SIZE,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.min_block_size <= self.avg_block_size
            && self.avg_block_size <= self.max_block_size
            && self.avg_block_size <= u32::MAX as usize
            && self.window_size > 0
            && self.avg_block_size > 0
    }
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self::from_avg(32 * 1024)
    }
}

/// Algorithm and configuration to use while scanning for block boundaries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Config {
    Rabin(SplitConfig),
    FixedSize(usize),
}

impl Config {
    /// Average block size of the configuration.
    pub fn avg_block_size(&self) -> usize {
        match self {
            Self::Rabin(c) => c.avg_block_size,
            Self::FixedSize(size) => *size,
        }
    }

    /// Split a buffer into blocks.
    pub fn split<'a>(&self, data: &'a [u8]) -> Box<dyn Iterator<Item = Block> + 'a> {
        match self {
            Self::Rabin(split_config) => Box::new(RollingHashChunker::new(
                RabinHash::new(split_config.window_size),
                split_config,
                data,
            )),
            Self::FixedSize(size) => Box::new(FixedSizeChunker::new(*size, data)),
        }
    }
}

impl std::fmt::Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rabin(c) => write!(f, "Rabin (avg {})", c.avg_block_size),
            Self::FixedSize(size) => write!(f, "Fixed Size ({})", size),
        }
    }
}
