//! Configuration structures for chunkdex.

use crate::error::{ChunkdexError, Result};
use serde::{Deserialize, Serialize};

/// Storage configuration for a backing file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Enable fsync after writes.
    pub fsync_enabled: bool,
    /// Open the file read-only. Writes and allocations fail.
    pub read_only: bool,
    /// Single-writer/multiple-reader write mode. Freed chunk space is not
    /// reused while readers may still see it, and indexes register flush
    /// dependencies on their owning metadata.
    pub swmr_write: bool,
    /// Upper bound on the end of allocated space (None = unbounded).
    pub allocation_limit: Option<u64>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            fsync_enabled: true,
            read_only: false,
            swmr_write: false,
            allocation_limit: None,
        }
    }
}

/// Parameters of the classic balanced chunk tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BTreeConfig {
    /// Half the maximum number of children per node.
    pub k: u16,
    /// Split points for nodes with no left sibling, both siblings, and
    /// no right sibling, as a fraction of 2K children kept on the left.
    pub split_ratios: [f64; 3],
}

impl Default for BTreeConfig {
    fn default() -> Self {
        Self {
            k: 32,
            split_ratios: [0.1, 0.5, 0.9],
        }
    }
}

impl BTreeConfig {
    /// Maximum number of children in one node.
    pub fn two_k(&self) -> usize {
        2 * self.k as usize
    }

    /// Validates the tree parameters.
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 || self.k > i16::MAX as u16 {
            return Err(ChunkdexError::InvalidParameter {
                name: "k".to_string(),
                value: self.k.to_string(),
            });
        }
        for ratio in self.split_ratios {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(ChunkdexError::InvalidParameter {
                    name: "split_ratios".to_string(),
                    value: format!("{:?}", self.split_ratios),
                });
            }
        }
        Ok(())
    }
}

/// Parameters of the generic keyed B-tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bt2Config {
    /// Size of every tree node in bytes.
    pub node_size: u32,
    /// Percent full at which a node splits.
    pub split_percent: u8,
    /// Percent full below which a node merges with a sibling.
    pub merge_percent: u8,
}

impl Default for Bt2Config {
    fn default() -> Self {
        Self {
            node_size: 2048,
            split_percent: 100,
            merge_percent: 40,
        }
    }
}

impl Bt2Config {
    /// Smallest node size accepted.
    pub const MIN_NODE_SIZE: u32 = 64;

    /// Validates the tree parameters.
    pub fn validate(&self) -> Result<()> {
        if self.node_size < Self::MIN_NODE_SIZE {
            return Err(ChunkdexError::InvalidParameter {
                name: "node_size".to_string(),
                value: self.node_size.to_string(),
            });
        }
        if self.split_percent == 0 || self.split_percent > 100 {
            return Err(ChunkdexError::InvalidParameter {
                name: "split_percent".to_string(),
                value: self.split_percent.to_string(),
            });
        }
        if self.merge_percent == 0 || self.merge_percent >= self.split_percent / 2 + 1 {
            return Err(ChunkdexError::ConfigError(format!(
                "merge percent {} must be positive and at most half of split percent {}",
                self.merge_percent, self.split_percent
            )));
        }
        Ok(())
    }
}

/// Index creation parameters for every tree-based strategy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Classic balanced tree parameters.
    pub btree: BTreeConfig,
    /// Generic keyed tree parameters.
    pub bt2: Bt2Config,
}

impl IndexConfig {
    /// Validates both tree configurations.
    pub fn validate(&self) -> Result<()> {
        self.btree.validate()?;
        self.bt2.validate()
    }
}
