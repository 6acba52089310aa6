//! Generic low-rank key reconstruction
//!
//! THE algorithm — same for all backends.
//! Composes numr primitives: index_select, matmul, narrow, mul, sub, add, cat.
//!
//! Backends that can fuse the gather, GEMM and rotation into one kernel
//! (CUDA) bypass this composite; it remains the reference semantics.

use crate::error::{Error, Result};
use numr::ops::{BinaryOps, IndexingOps, MatmulOps, ShapeOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;

/// Reconstruct post-RoPE keys for a set of absolute positions.
///
/// `SV[p] · U` recovers the pre-RoPE key of position `p`; split-half rotary
/// embedding is then applied at angle index `p`.
///
/// # Arguments
/// - `u`: `[B, H_kv, r, D]`
/// - `sv`: `[B, H_kv, N_ctx, r]`
/// - `position_ids`: `[B, H_kv, P]` (I64), all `< N_ctx`
/// - `cos`, `sin`: `[N_max, D/2]`
///
/// # Returns
/// `[B, H_kv, P, D]` rotated key slice.
pub fn reconstruct_rotated_keys_impl<R, C>(
    client: &C,
    u: &Tensor<R>,
    sv: &Tensor<R>,
    position_ids: &Tensor<R>,
    cos: &Tensor<R>,
    sin: &Tensor<R>,
) -> Result<Tensor<R>>
where
    R: Runtime,
    C: RuntimeClient<R> + IndexingOps<R> + MatmulOps<R> + BinaryOps<R> + ShapeOps<R>,
{
    let u_shape = u.shape();
    let sv_shape = sv.shape();
    let pos_shape = position_ids.shape();
    if u_shape.len() != 4 || sv_shape.len() != 4 || pos_shape.len() != 3 {
        return Err(Error::InvalidArgument {
            arg: "u",
            reason: format!(
                "expected u [B,H,r,D], sv [B,H,N,r], position_ids [B,H,P]; got {}D/{}D/{}D",
                u_shape.len(),
                sv_shape.len(),
                pos_shape.len()
            ),
        });
    }
    let (b, h, r, d) = (u_shape[0], u_shape[1], u_shape[2], u_shape[3]);
    let n_ctx = sv_shape[2];
    let p = pos_shape[2];
    if sv_shape != [b, h, n_ctx, r] || pos_shape[0] != b || pos_shape[1] != h {
        return Err(Error::ShapeMismatch {
            arg: "sv",
            reason: format!(
                "u {:?} / sv {:?} / position_ids {:?} disagree",
                u_shape, sv_shape, pos_shape
            ),
        });
    }
    if d % 2 != 0 {
        return Err(Error::InvalidArgument {
            arg: "u",
            reason: format!("head dim D={} must be even for RoPE", d),
        });
    }
    let half = d / 2;

    // Flatten the per-head gather into one global index_select over
    // [B*H*N_ctx, r] rows.
    let positions = position_ids.contiguous().to_vec::<i64>();
    let mut global_rows = Vec::with_capacity(b * h * p);
    for bi in 0..b {
        for hi in 0..h {
            for pi in 0..p {
                let pos = positions[(bi * h + hi) * p + pi];
                if pos < 0 || pos as usize >= n_ctx {
                    return Err(Error::InvalidArgument {
                        arg: "position_ids",
                        reason: format!("position {} out of range [0, {})", pos, n_ctx),
                    });
                }
                global_rows.push(((bi * h + hi) * n_ctx) as i64 + pos);
            }
        }
    }
    let device = sv.device();
    let global_idx = Tensor::<R>::from_slice(&global_rows, &[b * h * p], device);

    let sv_flat = sv
        .contiguous()
        .reshape(&[b * h * n_ctx, r])
        .map_err(Error::Numr)?;
    let rows = client
        .index_select(&sv_flat, 0, &global_idx)
        .map_err(Error::Numr)?
        .reshape(&[b, h, p, r])
        .map_err(Error::Numr)?;

    // [B, H, P, r] x [B, H, r, D] -> [B, H, P, D] pre-RoPE keys
    let keys_pre = client.matmul(&rows, u).map_err(Error::Numr)?;

    // Rotation angles gathered by absolute position, broadcast over B and H.
    let pos_flat: Vec<i64> = positions.clone();
    let pos_idx = Tensor::<R>::from_slice(&pos_flat, &[b * h * p], device);
    let cos_sel = client
        .index_select(cos, 0, &pos_idx)
        .map_err(Error::Numr)?
        .reshape(&[b, h, p, half])
        .map_err(Error::Numr)?;
    let sin_sel = client
        .index_select(sin, 0, &pos_idx)
        .map_err(Error::Numr)?
        .reshape(&[b, h, p, half])
        .map_err(Error::Numr)?;

    // Split-half rotation:
    //   out1 = x1 * cos - x2 * sin
    //   out2 = x1 * sin + x2 * cos
    let x1 = keys_pre.narrow(3, 0, half).map_err(Error::Numr)?.contiguous();
    let x2 = keys_pre
        .narrow(3, half, half)
        .map_err(Error::Numr)?
        .contiguous();
    let out1 = client
        .sub(
            &client.mul(&x1, &cos_sel).map_err(Error::Numr)?,
            &client.mul(&x2, &sin_sel).map_err(Error::Numr)?,
        )
        .map_err(Error::Numr)?;
    let out2 = client
        .add(
            &client.mul(&x1, &sin_sel).map_err(Error::Numr)?,
            &client.mul(&x2, &cos_sel).map_err(Error::Numr)?,
        )
        .map_err(Error::Numr)?;

    // Reassemble [out1 | out2] along the head dim.
    client.cat(&[&out1, &out2], 3).map_err(Error::Numr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_setup;
    use numr::runtime::cpu::CpuRuntime;

    fn identity_caches(
        n: usize,
        half: usize,
        device: &numr::runtime::cpu::CpuDevice,
    ) -> (Tensor<CpuRuntime>, Tensor<CpuRuntime>) {
        let cos = Tensor::<CpuRuntime>::from_slice(&vec![1.0f32; n * half], &[n, half], device);
        let sin = Tensor::<CpuRuntime>::from_slice(&vec![0.0f32; n * half], &[n, half], device);
        (cos, sin)
    }

    #[test]
    fn test_reconstruct_identity_factors() {
        let (client, device) = cpu_setup();
        // r = D and U = I, SV = K: reconstruction must return K verbatim
        // (cos=1, sin=0 makes the rotation identity).
        let d = 4;
        let n = 3;
        let mut u_data = vec![0.0f32; d * d];
        for i in 0..d {
            u_data[i * d + i] = 1.0;
        }
        let u = Tensor::<CpuRuntime>::from_slice(&u_data, &[1, 1, d, d], &device);
        let k_data: Vec<f32> = (0..n * d).map(|i| i as f32 * 0.5).collect();
        let sv = Tensor::<CpuRuntime>::from_slice(&k_data, &[1, 1, n, d], &device);
        let pos = Tensor::<CpuRuntime>::from_slice(&[0i64, 2], &[1, 1, 2], &device);
        let (cos, sin) = identity_caches(n, d / 2, &device);

        let out = reconstruct_rotated_keys_impl(&client, &u, &sv, &pos, &cos, &sin).unwrap();
        assert_eq!(out.shape(), &[1, 1, 2, d]);
        let got = out.contiguous().to_vec::<f32>();
        assert_eq!(&got[..d], &k_data[..d]);
        assert_eq!(&got[d..], &k_data[2 * d..3 * d]);
    }

    #[test]
    fn test_reconstruct_applies_rotation() {
        let (client, device) = cpu_setup();
        // cos=0, sin=1 at every position: out = [-x2, x1]
        let d = 4;
        let mut u_data = vec![0.0f32; d * d];
        for i in 0..d {
            u_data[i * d + i] = 1.0;
        }
        let u = Tensor::<CpuRuntime>::from_slice(&u_data, &[1, 1, d, d], &device);
        let sv = Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0, 3.0, 4.0], &[1, 1, 1, d], &device);
        let pos = Tensor::<CpuRuntime>::from_slice(&[0i64], &[1, 1, 1], &device);
        let cos = Tensor::<CpuRuntime>::from_slice(&[0.0f32, 0.0], &[1, 2], &device);
        let sin = Tensor::<CpuRuntime>::from_slice(&[1.0f32, 1.0], &[1, 2], &device);

        let out = reconstruct_rotated_keys_impl(&client, &u, &sv, &pos, &cos, &sin).unwrap();
        let got = out.contiguous().to_vec::<f32>();
        assert_eq!(got, vec![-3.0, -4.0, 1.0, 2.0]);
    }

    #[test]
    fn test_reconstruct_rejects_out_of_range_position() {
        let (client, device) = cpu_setup();
        let u = Tensor::<CpuRuntime>::from_slice(&[1.0f32; 4], &[1, 1, 2, 2], &device);
        let sv = Tensor::<CpuRuntime>::from_slice(&[1.0f32; 4], &[1, 1, 2, 2], &device);
        let pos = Tensor::<CpuRuntime>::from_slice(&[5i64], &[1, 1, 1], &device);
        let (cos, sin) = identity_caches(2, 1, &device);
        assert!(reconstruct_rotated_keys_impl(&client, &u, &sv, &pos, &cos, &sin).is_err());
    }
}
