//! CPU implementation of KeyReconstructOps
//!
//! Runs the generic reconstruction composite, then places the rotated slice
//! into the key scratch at the target offset.

use crate::error::{Error, Result};
use crate::ops::impl_generic::reconstruct_rotated_keys_impl;
use crate::ops::traits::KeyReconstructOps;
use numr::dtype::DType;
use numr::runtime::cpu::{CpuClient, CpuRuntime};
use numr::tensor::Tensor;

impl KeyReconstructOps<CpuRuntime> for CpuClient {
    fn reconstruct_keys(
        &self,
        u: &Tensor<CpuRuntime>,
        sv: &Tensor<CpuRuntime>,
        position_ids: &Tensor<CpuRuntime>,
        cos: &Tensor<CpuRuntime>,
        sin: &Tensor<CpuRuntime>,
        out: &Tensor<CpuRuntime>,
        out_offset: usize,
    ) -> Result<()> {
        let out_shape = out.shape();
        if out_shape.len() != 4 {
            return Err(Error::InvalidArgument {
                arg: "out",
                reason: format!("expected 4D [B, H_kv, L, D], got {}D", out_shape.len()),
            });
        }
        if out.dtype() != DType::F32 {
            return Err(Error::DTypeMismatch {
                expected: DType::F32,
                got: out.dtype(),
            });
        }
        let pos_shape = position_ids.shape();
        let p = pos_shape[pos_shape.len() - 1];
        let (batch, heads, cap, d) = (out_shape[0], out_shape[1], out_shape[2], out_shape[3]);
        if out_offset + p > cap {
            return Err(Error::InvalidArgument {
                arg: "out_offset",
                reason: format!(
                    "offset {} + {} positions exceeds scratch capacity {}",
                    out_offset, p, cap
                ),
            });
        }

        let slice = reconstruct_rotated_keys_impl(self, u, sv, position_ids, cos, sin)?;
        let slice_shape = slice.shape();
        if slice_shape[0] != batch || slice_shape[1] != heads || slice_shape[3] != d {
            return Err(Error::ShapeMismatch {
                arg: "out",
                reason: format!(
                    "reconstructed slice {:?} does not fit scratch {:?}",
                    slice_shape, out_shape
                ),
            });
        }

        let data = slice.contiguous().to_vec::<f32>();
        let out_ptr = out.storage().ptr() as *mut f32;
        for b in 0..batch {
            for h in 0..heads {
                for i in 0..p {
                    let src = ((b * heads + h) * p + i) * d;
                    let dst = ((b * heads + h) * cap + out_offset + i) * d;
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            data.as_ptr().add(src),
                            out_ptr.add(dst),
                            d,
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_setup;

    #[test]
    fn test_reconstruct_writes_at_offset() {
        let (client, device) = cpu_setup();
        let d = 2;
        // U = I, SV = K, identity rotation
        let u = Tensor::<CpuRuntime>::from_slice(&[1.0f32, 0.0, 0.0, 1.0], &[1, 1, d, d], &device);
        let sv = Tensor::<CpuRuntime>::from_slice(&[5.0f32, 6.0, 7.0, 8.0], &[1, 1, 2, d], &device);
        let pos = Tensor::<CpuRuntime>::from_slice(&[1i64], &[1, 1, 1], &device);
        let cos = Tensor::<CpuRuntime>::from_slice(&[1.0f32, 1.0], &[2, 1], &device);
        let sin = Tensor::<CpuRuntime>::from_slice(&[0.0f32, 0.0], &[2, 1], &device);
        let out = Tensor::<CpuRuntime>::from_slice(&vec![0.0f32; 4 * d], &[1, 1, 4, d], &device);

        client
            .reconstruct_keys(&u, &sv, &pos, &cos, &sin, &out, 2)
            .unwrap();
        let got = out.to_vec::<f32>();
        assert_eq!(&got[..2 * d], &[0.0; 4]);
        assert_eq!(&got[2 * d..3 * d], &[7.0, 8.0]);
        assert_eq!(&got[3 * d..], &[0.0, 0.0]);
    }

    #[test]
    fn test_reconstruct_rejects_overflowing_offset() {
        let (client, device) = cpu_setup();
        let d = 2;
        let u = Tensor::<CpuRuntime>::from_slice(&[1.0f32, 0.0, 0.0, 1.0], &[1, 1, d, d], &device);
        let sv = Tensor::<CpuRuntime>::from_slice(&[5.0f32, 6.0], &[1, 1, 1, d], &device);
        let pos = Tensor::<CpuRuntime>::from_slice(&[0i64], &[1, 1, 1], &device);
        let cos = Tensor::<CpuRuntime>::from_slice(&[1.0f32], &[1, 1], &device);
        let sin = Tensor::<CpuRuntime>::from_slice(&[0.0f32], &[1, 1], &device);
        let out = Tensor::<CpuRuntime>::from_slice(&vec![0.0f32; 2 * d], &[1, 1, 2, d], &device);

        assert!(client
            .reconstruct_keys(&u, &sv, &pos, &cos, &sin, &out, 2)
            .is_err());
    }
}
