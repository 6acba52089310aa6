//! # shadowkv
//!
//! **Sparse KV cache engine built on numr — long-context decoding at bounded
//! accelerator memory.**
//!
//! shadowkv keeps the bulk of a long prompt's key/value state off the
//! accelerator: keys as a rank-`r` factorization (`U`, `SV`) plus one
//! landmark vector per chunk, values as host-resident chunks. Each decode
//! step scores the current query against the landmarks, retrieves only the
//! top-scoring chunks, reconstructs their keys on the fly (gather → matmul →
//! RoPE, fused) and streams their values host-to-device, overlapped on
//! secondary streams.
//!
//! ## Design
//!
//! - **Extension traits**: cache ops (`LandmarkOps`, `ChunkSelectOps`,
//!   `KeyReconstructOps`, `ValueGatherOps`, `KvAppendOps`) implemented on
//!   numr's runtime clients
//! - **impl_generic**: chunk selection and landmark composites built from
//!   numr primitives, same on all backends
//! - **Custom kernels**: fused SV-reconstruct+RoPE, chunk gather and append
//!   (PTX, behind the `cuda` feature), launched on dedicated copy and
//!   reconstruction streams
//!
//! The transformer layers themselves, sampling and tokenization live outside
//! this crate; a decoder layer hands the cache freshly projected q/k/v and
//! receives read-only key/value views for a standard attention kernel.

pub mod cache;
pub mod config;
pub mod error;
pub mod offload;
pub mod ops;
pub mod prefill;
pub mod retrieval;

// Re-export primary shadowkv types
pub use cache::{CachePhase, ShadowKvCache};
pub use config::{CacheConfig, ValuePlacement};
pub use error::{Error, Result};
pub use ops::{ChunkSelectOps, KeyReconstructOps, KvAppendOps, LandmarkOps, ValueGatherOps};

// Re-export numr types that users will commonly need
pub use numr::dtype::DType;
pub use numr::error::{Error as NumrError, Result as NumrResult};
pub use numr::runtime::{Runtime, RuntimeClient};
pub use numr::tensor::Tensor;
