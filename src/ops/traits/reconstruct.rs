//! Fused low-rank key reconstruction trait

use crate::error::Result;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Fused gather → matmul → RoPE key reconstruction.
///
/// For each requested absolute position `p`, reconstructs the pre-RoPE key as
/// `SV[p] · U` and applies split-half rotary embedding at angle index `p`,
/// writing directly into the key scratch at the target offset — no
/// intermediate pre-RoPE tensor is materialised. This fusion is the main
/// performance contract of the sparse path; on CUDA it is a single kernel
/// launched on the reconstruction stream.
///
/// # Layout contract
///
/// - `u`: `[B, H_kv, r, D]` — left factor, shared across positions
/// - `sv`: `[B, H_kv, N_ctx, r]` — per-position right factor
/// - `position_ids`: `[B, H_kv, P]` (I64) — absolute positions, `< N_ctx`
/// - `cos`, `sin`: `[N_max, D/2]` — rotary caches indexed by absolute position
/// - `out`: `[B, H_kv, out_len, D]` — written at
///   `out[:, :, out_offset .. out_offset + P, :]`
pub trait KeyReconstructOps<R: Runtime> {
    #[allow(clippy::too_many_arguments)]
    fn reconstruct_keys(
        &self,
        u: &Tensor<R>,
        sv: &Tensor<R>,
        position_ids: &Tensor<R>,
        cos: &Tensor<R>,
        sin: &Tensor<R>,
        out: &Tensor<R>,
        out_offset: usize,
    ) -> Result<()>;
}
