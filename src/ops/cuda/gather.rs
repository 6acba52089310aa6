//! CUDA value chunk gather
//!
//! Each selected chunk is one contiguous byte range in the store, so the
//! gather is a batch of per-chunk copies enqueued on the copy stream:
//! host-to-device DMA from the page-locked store for the offloaded variant,
//! device-to-device for the resident variant.

use crate::error::{Error, Result};
use crate::offload::ValueStore;
use crate::ops::cuda::pinned::register_host_buffer;
use crate::ops::cuda::stream::transfer_streams;
use crate::ops::traits::ValueGatherOps;
use cudarc::driver::result;
use numr::dtype::DType;
use numr::runtime::cuda::{CudaClient, CudaRuntime};
use numr::tensor::Tensor;

impl ValueGatherOps<CudaRuntime> for CudaClient {
    fn gather_value_chunks(
        &self,
        store: &ValueStore<CudaRuntime>,
        slots: &[i64],
        slots_per_head: usize,
        out: &Tensor<CudaRuntime>,
        out_offset: usize,
    ) -> Result<()> {
        let out_shape = out.shape();
        if out_shape.len() != 4 {
            return Err(Error::InvalidArgument {
                arg: "out",
                reason: format!("expected 4D [B, H_kv, L, D], got {}D", out_shape.len()),
            });
        }
        let heads = out_shape[0] * out_shape[1];
        let cap = out_shape[2];
        let d = out_shape[3];
        let elem = out.dtype().size_in_bytes();
        if slots.len() != heads * slots_per_head {
            return Err(Error::InvalidArgument {
                arg: "slots",
                reason: format!(
                    "expected {} slot ids, got {}",
                    heads * slots_per_head,
                    slots.len()
                ),
            });
        }

        let streams = transfer_streams(self)?;
        let stream = streams.copy.cu_stream();
        let out_base = out.ptr() as u64;

        match store {
            ValueStore::Offloaded {
                buf,
                chunk_size,
                head_dim,
                dtype,
            } => {
                if *dtype != out.dtype() {
                    return Err(Error::DTypeMismatch {
                        expected: *dtype,
                        got: out.dtype(),
                    });
                }
                if *head_dim != d || out_offset + slots_per_head * chunk_size > cap {
                    return Err(Error::ShapeMismatch {
                        arg: "out",
                        reason: format!(
                            "store chunks of {}x{} do not fit scratch {:?} at offset {}",
                            chunk_size, head_dim, out_shape, out_offset
                        ),
                    });
                }
                if *dtype != DType::F32 {
                    return Err(Error::DTypeMismatch {
                        expected: DType::F32,
                        got: *dtype,
                    });
                }
                for head in 0..heads {
                    for j in 0..slots_per_head {
                        let slot = slots[head * slots_per_head + j];
                        if slot < 0 || slot as usize >= buf.slots() {
                            return Err(Error::InvalidArgument {
                                arg: "slots",
                                reason: format!("slot {} out of range [0, {})", slot, buf.slots()),
                            });
                        }
                        let src = buf.chunk(head, slot as usize);
                        let dst = out_base
                            + ((head * cap + out_offset + j * chunk_size) * d * elem) as u64;
                        unsafe {
                            result::memcpy_htod_async(dst, src, stream).map_err(|e| {
                                Error::KernelError {
                                    reason: format!("chunk H2D copy failed: {:?}", e),
                                }
                            })?;
                        }
                    }
                }
                Ok(())
            }
            ValueStore::Resident { chunks } => {
                let c_shape = chunks.shape();
                if c_shape.len() != 5 || c_shape[4] != d {
                    return Err(Error::ShapeMismatch {
                        arg: "store",
                        reason: format!("expected 5D [B, H, slots, C, {}], got {:?}", d, c_shape),
                    });
                }
                let store_slots = c_shape[2];
                let chunk_size = c_shape[3];
                if out_offset + slots_per_head * chunk_size > cap {
                    return Err(Error::InvalidArgument {
                        arg: "out_offset",
                        reason: format!(
                            "offset {} + {} chunks of {} exceeds scratch capacity {}",
                            out_offset, slots_per_head, chunk_size, cap
                        ),
                    });
                }
                let chunk_bytes = chunk_size * d * elem;
                let src_base = chunks.ptr() as u64;
                for head in 0..heads {
                    for j in 0..slots_per_head {
                        let slot = slots[head * slots_per_head + j];
                        if slot < 0 || slot as usize >= store_slots {
                            return Err(Error::InvalidArgument {
                                arg: "slots",
                                reason: format!("slot {} out of range [0, {})", slot, store_slots),
                            });
                        }
                        let src =
                            src_base + ((head * store_slots + slot as usize) * chunk_bytes) as u64;
                        let dst = out_base
                            + ((head * cap + out_offset + j * chunk_size) * d * elem) as u64;
                        unsafe {
                            result::memcpy_dtod_async(dst, src, chunk_bytes, stream).map_err(
                                |e| Error::KernelError {
                                    reason: format!("chunk D2D copy failed: {:?}", e),
                                },
                            )?;
                        }
                    }
                }
                Ok(())
            }
        }
    }

    fn prepare_value_store(&self, store: &mut ValueStore<CudaRuntime>) -> Result<()> {
        if let ValueStore::Offloaded { buf, .. } = store {
            register_host_buffer(buf)?;
        }
        Ok(())
    }
}
