//! CUDA fused key reconstruction
//!
//! One kernel per step and layer: gathers SV rows by absolute position,
//! multiplies by U and applies the rotation, writing straight into the key
//! scratch at the target offset. Launched on the reconstruction stream.

use crate::error::{Error, Result};
use crate::ops::traits::KeyReconstructOps;
use cudarc::driver::safe::LaunchConfig;
use cudarc::driver::PushKernelArg;
use numr::dtype::DType;
use numr::runtime::cuda::{CudaClient, CudaRuntime};
use numr::runtime::Device;
use numr::tensor::Tensor;

use crate::ops::cuda::kernels::{self, SV_RECONSTRUCT_MODULE};
use crate::ops::cuda::stream::transfer_streams;

impl KeyReconstructOps<CudaRuntime> for CudaClient {
    fn reconstruct_keys(
        &self,
        u: &Tensor<CudaRuntime>,
        sv: &Tensor<CudaRuntime>,
        position_ids: &Tensor<CudaRuntime>,
        cos: &Tensor<CudaRuntime>,
        sin: &Tensor<CudaRuntime>,
        out: &Tensor<CudaRuntime>,
        out_offset: usize,
    ) -> Result<()> {
        let u_shape = u.shape();
        let sv_shape = sv.shape();
        let pos_shape = position_ids.shape();
        let out_shape = out.shape();
        if u_shape.len() != 4 || sv_shape.len() != 4 || pos_shape.len() != 3
            || out_shape.len() != 4
        {
            return Err(Error::InvalidArgument {
                arg: "shape",
                reason: "expected u [B,H,r,D], sv [B,H,N,r], position_ids [B,H,P], out [B,H,L,D]"
                    .into(),
            });
        }

        let heads = u_shape[0] * u_shape[1];
        let rank = u_shape[2];
        let d = u_shape[3];
        let n_ctx = sv_shape[2];
        let p = pos_shape[2];
        let cap = out_shape[2];

        if d % 2 != 0 {
            return Err(Error::InvalidArgument {
                arg: "u",
                reason: format!("head dim D={} must be even for RoPE", d),
            });
        }
        if out_offset + p > cap {
            return Err(Error::InvalidArgument {
                arg: "out_offset",
                reason: format!(
                    "offset {} + {} positions exceeds scratch capacity {}",
                    out_offset, p, cap
                ),
            });
        }
        if u.dtype() != DType::F32 || sv.dtype() != DType::F32 {
            return Err(Error::DTypeMismatch {
                expected: DType::F32,
                got: u.dtype(),
            });
        }

        // Output dtype picks the kernel; factors and angle caches stay F32.
        let kernel_name = match out.dtype() {
            DType::F32 => "sv_reconstruct_f32",
            DType::F16 => "sv_reconstruct_f16",
            DType::BF16 => "sv_reconstruct_bf16",
            other => {
                return Err(Error::InvalidArgument {
                    arg: "out",
                    reason: format!("unsupported dtype {:?} for sv_reconstruct", other),
                });
            }
        };

        let device = out.device();
        let device_index = device.id();
        let module = kernels::cached_module(self.context(), device_index, SV_RECONSTRUCT_MODULE)?;
        let func = kernels::kernel(&module, kernel_name)?;

        // One block per (position, head), one thread per rotation pair.
        let half = d / 2;
        let cfg = LaunchConfig {
            grid_dim: (p as u32, heads as u32, 1),
            block_dim: (half.min(512) as u32, 1, 1),
            shared_mem_bytes: 0,
        };

        let u_ptr = u.ptr();
        let sv_ptr = sv.ptr();
        let pos_ptr = position_ids.ptr();
        let cos_ptr = cos.ptr();
        let sin_ptr = sin.ptr();
        let out_ptr = out.ptr();
        let heads_i32 = heads as i32;
        let rank_i32 = rank as i32;
        let d_i32 = d as i32;
        let n_ctx_i32 = n_ctx as i32;
        let p_i32 = p as i32;
        let cap_i32 = cap as i32;
        let off_i32 = out_offset as i32;

        let streams = transfer_streams(self)?;
        unsafe {
            let mut builder = streams.reconstruct.launch_builder(&func);
            builder.arg(&u_ptr);
            builder.arg(&sv_ptr);
            builder.arg(&pos_ptr);
            builder.arg(&cos_ptr);
            builder.arg(&sin_ptr);
            builder.arg(&out_ptr);
            builder.arg(&heads_i32);
            builder.arg(&rank_i32);
            builder.arg(&d_i32);
            builder.arg(&n_ctx_i32);
            builder.arg(&p_i32);
            builder.arg(&cap_i32);
            builder.arg(&off_i32);
            builder.launch(cfg).map_err(|e| Error::KernelError {
                reason: format!("sv_reconstruct kernel launch failed: {:?}", e),
            })?;
        }

        Ok(())
    }
}
