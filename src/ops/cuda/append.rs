//! CUDA KV append — fused write of new K/V into the resident tail

use crate::error::{Error, Result};
use crate::ops::traits::KvAppendOps;
use cudarc::driver::safe::LaunchConfig;
use cudarc::driver::PushKernelArg;
use numr::dtype::DType;
use numr::runtime::cuda::{CudaClient, CudaRuntime};
use numr::runtime::Device;
use numr::tensor::Tensor;

use crate::ops::cuda::kernels::{self, KV_APPEND_MODULE};

impl KvAppendOps<CudaRuntime> for CudaClient {
    fn kv_append(
        &self,
        k_buf: &Tensor<CudaRuntime>,
        v_buf: &Tensor<CudaRuntime>,
        new_k: &Tensor<CudaRuntime>,
        new_v: &Tensor<CudaRuntime>,
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

        let cap = buf_shape[2];
        let head_dim = buf_shape[3];
        let delta = new_shape[2];
        let outer_size = buf_shape[0] * buf_shape[1];

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

        let dtype = k_buf.dtype();
        let kernel_name = match dtype {
            DType::F32 => "kv_append_f32",
            DType::F16 => "kv_append_f16",
            DType::BF16 => "kv_append_bf16",
            _ => {
                return Err(Error::InvalidArgument {
                    arg: "dtype",
                    reason: format!("unsupported dtype {:?} for kv_append", dtype),
                });
            }
        };

        let total_elements = outer_size * delta * head_dim;
        let threads = 256;
        let blocks = total_elements.div_ceil(threads);

        let device = k_buf.device();
        let device_index = device.id();
        let module = kernels::cached_module(self.context(), device_index, KV_APPEND_MODULE)?;
        let func = kernels::kernel(&module, kernel_name)?;

        let cfg = LaunchConfig {
            grid_dim: (blocks as u32, 1, 1),
            block_dim: (threads as u32, 1, 1),
            shared_mem_bytes: 0,
        };

        let kb_ptr = k_buf.ptr();
        let vb_ptr = v_buf.ptr();
        let nk_ptr = new_k.ptr();
        let nv_ptr = new_v.ptr();
        let outer_i32 = outer_size as i32;
        let cap_i32 = cap as i32;
        let delta_i32 = delta as i32;
        let hd_i32 = head_dim as i32;
        let pos_i32 = position as i32;
        let total_i32 = total_elements as i32;

        unsafe {
            let mut builder = self.stream().launch_builder(&func);
            builder.arg(&kb_ptr);
            builder.arg(&vb_ptr);
            builder.arg(&nk_ptr);
            builder.arg(&nv_ptr);
            builder.arg(&outer_i32);
            builder.arg(&cap_i32);
            builder.arg(&delta_i32);
            builder.arg(&hd_i32);
            builder.arg(&pos_i32);
            builder.arg(&total_i32);
            builder.launch(cfg).map_err(|e| Error::KernelError {
                reason: format!("kv_append kernel launch failed: {:?}", e),
            })?;
        }

        Ok(())
    }
}
