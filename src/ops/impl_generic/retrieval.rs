//! Generic chunk selection implementation
//!
//! THE algorithm — same for all backends.
//! Composes numr primitives: matmul, softmax, max, topk.

use crate::error::{Error, Result};
use numr::ops::{ActivationOps, MatmulOps, ReduceOps, ScalarOps, SortingOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;

/// Score the decode query against the landmark table and pick the top-k
/// chunk slots per `(batch, kv_head)`.
///
/// 1. affinity `a = q · Lᵀ` over the grouped-query dim, scaled `1/sqrt(D)`
/// 2. softmax across landmark slots
/// 3. reduce the group dim by maximum
/// 4. top-k slots by reduced affinity
///
/// # Arguments
/// - `q`: `[B, H, D]` post-RoPE decode query, `H = H_kv * group`
/// - `landmarks`: `[B, H_kv, M, D]`
/// - `k`: slots to select, `1 ≤ k ≤ M`
///
/// # Returns
/// `[B, H_kv, k]` (I64) slot indices, descending affinity order.
pub fn select_topk_chunks_impl<R, C>(
    client: &C,
    q: &Tensor<R>,
    landmarks: &Tensor<R>,
    group: usize,
    k: usize,
) -> Result<Tensor<R>>
where
    R: Runtime,
    C: RuntimeClient<R>
        + MatmulOps<R>
        + ActivationOps<R>
        + ReduceOps<R>
        + ScalarOps<R>
        + SortingOps<R>,
{
    let q_shape = q.shape();
    if q_shape.len() != 3 {
        return Err(Error::InvalidArgument {
            arg: "q",
            reason: format!("expected 3D [B, H, D], got {}D", q_shape.len()),
        });
    }
    let lm_shape = landmarks.shape();
    if lm_shape.len() != 4 {
        return Err(Error::InvalidArgument {
            arg: "landmarks",
            reason: format!("expected 4D [B, H_kv, M, D], got {}D", lm_shape.len()),
        });
    }
    let (b, h, d) = (q_shape[0], q_shape[1], q_shape[2]);
    let (h_kv, m) = (lm_shape[1], lm_shape[2]);
    if group == 0 || h != h_kv * group {
        return Err(Error::InvalidArgument {
            arg: "group",
            reason: format!("H {} must equal H_kv {} * group {}", h, h_kv, group),
        });
    }
    if lm_shape[0] != b || lm_shape[3] != d {
        return Err(Error::ShapeMismatch {
            arg: "landmarks",
            reason: format!("expected [{}, {}, M, {}], got {:?}", b, h_kv, d, lm_shape),
        });
    }
    if k == 0 || k > m {
        return Err(Error::InvalidArgument {
            arg: "k",
            reason: format!("k={} must be in [1, M={}]", k, m),
        });
    }

    // [B, H, D] -> [B, H_kv, G, D]; heads are grouped kv-major
    let q_grouped = q
        .contiguous()
        .reshape(&[b, h_kv, group, d])
        .map_err(Error::Numr)?;

    // [B, H_kv, G, M] affinities
    let lm_t = landmarks
        .transpose(-2, -1)
        .map_err(Error::Numr)?
        .contiguous();
    let scores = client.matmul(&q_grouped, &lm_t).map_err(Error::Numr)?;
    let scale = (d as f64).sqrt().recip();
    let scores = client.mul_scalar(&scores, scale).map_err(Error::Numr)?;
    let probs = client.softmax(&scores, -1).map_err(Error::Numr)?;

    // group reduction by max, then top-k over slots
    let reduced = client.max(&probs, &[2], false).map_err(Error::Numr)?;
    let (_values, indices) = client
        .topk(&reduced, k, -1, true, true)
        .map_err(Error::Numr)?;
    Ok(indices)
}
