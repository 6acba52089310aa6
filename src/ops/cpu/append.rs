//! CPU implementation of KvAppendOps
//!
//! Direct memory copies into the resident tail region.

use crate::error::{Error, Result};
use crate::ops::traits::KvAppendOps;
use numr::dtype::DType;
use numr::runtime::cpu::{CpuClient, CpuRuntime};
use numr::tensor::Tensor;

impl KvAppendOps<CpuRuntime> for CpuClient {
    fn kv_append(
        &self,
        k_buf: &Tensor<CpuRuntime>,
        v_buf: &Tensor<CpuRuntime>,
        new_k: &Tensor<CpuRuntime>,
        new_v: &Tensor<CpuRuntime>,
        position: usize,
    ) -> Result<()> {
        let buf_shape = k_buf.shape();
        let new_shape = new_k.shape();

        if buf_shape.len() != 4 || new_shape.len() != 4 {
            return Err(Error::InvalidArgument {
                arg: "shape",
                reason: "expected 4D [B, H_kv, S, D] tensors".into(),
            });
        }
        if k_buf.dtype() != DType::F32 {
            return Err(Error::DTypeMismatch {
                expected: DType::F32,
                got: k_buf.dtype(),
            });
        }

        let batch = buf_shape[0];
        let num_heads = buf_shape[1];
        let cap = buf_shape[2];
        let head_dim = buf_shape[3];
        let delta = new_shape[2];

        if new_shape[0] != batch || new_shape[1] != num_heads || new_shape[3] != head_dim {
            return Err(Error::ShapeMismatch {
                arg: "new_k",
                reason: format!(
                    "expected [{}, {}, delta, {}], got {:?}",
                    batch, num_heads, head_dim, new_shape
                ),
            });
        }
        if position + delta > cap {
            return Err(Error::ContractViolation {
                reason: format!(
                    "append at position {} + {} exceeds buffer capacity {}",
                    position, delta, cap
                ),
            });
        }
        if delta == 0 {
            return Ok(());
        }

        let nk = new_k.contiguous().to_vec::<f32>();
        let nv = new_v.contiguous().to_vec::<f32>();

        let kb_ptr = k_buf.storage().ptr() as *mut f32;
        let vb_ptr = v_buf.storage().ptr() as *mut f32;

        for b in 0..batch {
            for h in 0..num_heads {
                for s in 0..delta {
                    for d in 0..head_dim {
                        let src = ((b * num_heads + h) * delta + s) * head_dim + d;
                        let dst = ((b * num_heads + h) * cap + (position + s)) * head_dim + d;
                        unsafe {
                            *kb_ptr.add(dst) = nk[src];
                            *vb_ptr.add(dst) = nv[src];
                        }
                    }
                }
            }
        }

        Ok(())
    }
}
