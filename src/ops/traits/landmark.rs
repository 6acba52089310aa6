//! Landmark operations trait
//!
//! Prefill-time reduction of a key tensor into one representative vector per
//! chunk, plus the similarity statistic used for outlier detection.

use crate::error::Result;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Chunk landmark construction and intra-chunk similarity.
///
/// Landmarks are computed on the *pre-RoPE* key tensor and stored unrotated;
/// rotation-freedom is what lets a single landmark stand in for `C` positions.
///
/// # Layout contract
///
/// - `k`: `[B, H_kv, N, D]` — pre-RoPE keys, `N` divisible by `chunk_size`
/// - `chunk_landmarks` output: `[B, H_kv, N / chunk_size, D]` — per-chunk mean
/// - `chunk_min_cosine` output: `[B, H_kv, N / chunk_size]` — minimum over the
///   chunk's members of cosine(landmark, member)
pub trait LandmarkOps<R: Runtime> {
    fn chunk_landmarks(&self, k: &Tensor<R>, chunk_size: usize) -> Result<Tensor<R>>;

    fn chunk_min_cosine(
        &self,
        k: &Tensor<R>,
        landmarks: &Tensor<R>,
        chunk_size: usize,
    ) -> Result<Tensor<R>>;
}
