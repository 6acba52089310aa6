//! Cache configuration
//!
//! Committed at construction; every input tensor is validated against it.

use crate::error::{Error, Result};
use numr::dtype::DType;

/// Where indexed value chunks live between decode steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValuePlacement {
    /// All value chunks stay on the accelerator. Used for debugging and
    /// correctness baselining of the sparse path.
    Resident,
    /// Indexed value chunks live in (pinned) host memory and are streamed
    /// to a device scratch buffer on demand.
    Offloaded,
}

/// Configuration for a [`crate::cache::ShadowKvCache`].
///
/// `max_length` and `sparse_budget` are position counts and must be divisible
/// by `chunk_size`. `sparse_budget / chunk_size` is the number of chunks
/// retrieved per decode step.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub num_layers: usize,
    pub batch_size: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub max_length: usize,
    pub sparse_budget: usize,
    pub rank: usize,
    pub chunk_size: usize,
    pub local_chunks: usize,
    pub outlier_chunks: usize,
    pub dtype: DType,
    pub placement: ValuePlacement,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            num_layers: 32,
            batch_size: 1,
            num_heads: 32,
            num_kv_heads: 8,
            head_dim: 128,
            max_length: 131072,
            sparse_budget: 2048,
            rank: 160,
            chunk_size: 8,
            local_chunks: 4,
            outlier_chunks: 48,
            dtype: DType::F32,
            placement: ValuePlacement::Offloaded,
        }
    }
}

impl CacheConfig {
    /// Validate every field. Called by the cache constructor.
    pub fn validate(&self) -> Result<()> {
        if self.num_layers == 0 {
            return Err(Error::InvalidArgument {
                arg: "num_layers",
                reason: "must be > 0".into(),
            });
        }
        if self.batch_size == 0 {
            return Err(Error::InvalidArgument {
                arg: "batch_size",
                reason: "must be > 0".into(),
            });
        }
        if self.num_kv_heads == 0 {
            return Err(Error::InvalidArgument {
                arg: "num_kv_heads",
                reason: "must be > 0".into(),
            });
        }
        if self.num_heads == 0 || self.num_heads % self.num_kv_heads != 0 {
            return Err(Error::InvalidArgument {
                arg: "num_heads",
                reason: format!(
                    "num_heads {} must be a positive multiple of num_kv_heads {}",
                    self.num_heads, self.num_kv_heads
                ),
            });
        }
        if self.head_dim == 0 || self.head_dim % 2 != 0 {
            return Err(Error::InvalidArgument {
                arg: "head_dim",
                reason: format!("head_dim {} must be positive and even", self.head_dim),
            });
        }
        if self.chunk_size == 0 {
            return Err(Error::InvalidArgument {
                arg: "chunk_size",
                reason: "must be > 0".into(),
            });
        }
        if self.max_length == 0 || self.max_length % self.chunk_size != 0 {
            return Err(Error::InvalidArgument {
                arg: "max_length",
                reason: format!(
                    "max_length {} must be a positive multiple of chunk_size {}",
                    self.max_length, self.chunk_size
                ),
            });
        }
        if self.sparse_budget == 0 || self.sparse_budget % self.chunk_size != 0 {
            return Err(Error::InvalidArgument {
                arg: "sparse_budget",
                reason: format!(
                    "sparse_budget {} must be a positive multiple of chunk_size {}",
                    self.sparse_budget, self.chunk_size
                ),
            });
        }
        if self.rank == 0 || self.rank > self.head_dim {
            return Err(Error::InvalidArgument {
                arg: "rank",
                reason: format!("rank {} must be in [1, head_dim={}]", self.rank, self.head_dim),
            });
        }
        match self.dtype {
            DType::F32 | DType::F16 | DType::BF16 => {}
            other => {
                return Err(Error::InvalidArgument {
                    arg: "dtype",
                    reason: format!("unsupported cache dtype {:?}", other),
                });
            }
        }
        Ok(())
    }

    /// Grouped-query factor `G = H / H_kv`.
    pub fn group_size(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }

    /// Number of chunks retrieved per decode step (`S`).
    pub fn budget_chunks(&self) -> usize {
        self.sparse_budget / self.chunk_size
    }
}
