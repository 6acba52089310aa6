//! Chunk selection operations trait

use crate::error::Result;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Query-to-landmark affinity scoring and top-k chunk selection.
///
/// Scores are softmax-normalised dot products scaled by `1/sqrt(D)`; the
/// grouped-query dimension is reduced by maximum before selection.
///
/// # Layout contract
///
/// - `q`: `[B, H, D]` — current post-RoPE decode query, `H = H_kv * group`
/// - `landmarks`: `[B, H_kv, M, D]` — landmark table (indexed chunks only)
/// - `k`: slots to select per `(batch, kv_head)`, `1 ≤ k ≤ M`
/// - Output: `[B, H_kv, k]` (I64) — selected landmark-table slot indices,
///   ordered by descending affinity
pub trait ChunkSelectOps<R: Runtime> {
    fn select_topk_chunks(
        &self,
        q: &Tensor<R>,
        landmarks: &Tensor<R>,
        group: usize,
        k: usize,
    ) -> Result<Tensor<R>>;
}
