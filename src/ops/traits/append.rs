//! KV append trait
//!
//! Fused write of a decode step's raw K/V into the resident tail region.

use crate::error::Result;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Fused KV append — writes new K and V tokens into the resident buffers in a
/// single kernel.
///
/// # Layout contract
///
/// - `k_buf`, `v_buf`: `[B, H_kv, cap, D]` — preallocated resident buffers
/// - `new_k`, `new_v`: `[B, H_kv, delta, D]` — new tokens (`delta` is 1
///   during decode)
/// - `position`: starting write position in the sequence dimension
///
/// After this call, `buf[:, :, position:position+delta, :] = new`.
pub trait KvAppendOps<R: Runtime> {
    fn kv_append(
        &self,
        k_buf: &Tensor<R>,
        v_buf: &Tensor<R>,
        new_k: &Tensor<R>,
        new_v: &Tensor<R>,
        position: usize,
    ) -> Result<()>;
}
