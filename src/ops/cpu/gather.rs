//! CPU implementation of ValueGatherOps
//!
//! Synchronous chunk copies from the host store (or the resident chunk
//! tensor) into the value scratch.

use crate::error::{Error, Result};
use crate::offload::ValueStore;
use crate::ops::traits::ValueGatherOps;
use numr::dtype::DType;
use numr::runtime::cpu::{CpuClient, CpuRuntime};
use numr::tensor::Tensor;

fn validate_out(
    out: &Tensor<CpuRuntime>,
    slots: &[i64],
    slots_per_head: usize,
    out_offset: usize,
    chunk_size: usize,
    head_dim: usize,
) -> Result<(usize, usize, usize)> {
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
    let heads = out_shape[0] * out_shape[1];
    let cap = out_shape[2];
    if out_shape[3] != head_dim {
        return Err(Error::ShapeMismatch {
            arg: "out",
            reason: format!("head dim {} != store head dim {}", out_shape[3], head_dim),
        });
    }
    if slots.len() != heads * slots_per_head {
        return Err(Error::InvalidArgument {
            arg: "slots",
            reason: format!(
                "expected {} slot ids ({} heads x {}), got {}",
                heads * slots_per_head,
                heads,
                slots_per_head,
                slots.len()
            ),
        });
    }
    if out_offset + slots_per_head * chunk_size > cap {
        return Err(Error::InvalidArgument {
            arg: "out_offset",
            reason: format!(
                "offset {} + {} chunks of {} exceeds scratch capacity {}",
                out_offset, slots_per_head, chunk_size, cap
            ),
        });
    }
    Ok((heads, cap, out_shape[3]))
}

impl ValueGatherOps<CpuRuntime> for CpuClient {
    fn gather_value_chunks(
        &self,
        store: &ValueStore<CpuRuntime>,
        slots: &[i64],
        slots_per_head: usize,
        out: &Tensor<CpuRuntime>,
        out_offset: usize,
    ) -> Result<()> {
        match store {
            ValueStore::Offloaded {
                buf,
                chunk_size,
                head_dim,
                dtype,
            } => {
                if *dtype != DType::F32 {
                    return Err(Error::DTypeMismatch {
                        expected: DType::F32,
                        got: *dtype,
                    });
                }
                let (heads, cap, d) =
                    validate_out(out, slots, slots_per_head, out_offset, *chunk_size, *head_dim)?;
                if buf.heads() != heads {
                    return Err(Error::ShapeMismatch {
                        arg: "store",
                        reason: format!("store has {} heads, scratch has {}", buf.heads(), heads),
                    });
                }

                let out_ptr = out.storage().ptr() as *mut f32;
                for head in 0..heads {
                    for j in 0..slots_per_head {
                        let slot = slots[head * slots_per_head + j];
                        if slot < 0 || slot as usize >= buf.slots() {
                            return Err(Error::InvalidArgument {
                                arg: "slots",
                                reason: format!(
                                    "slot {} out of range [0, {})",
                                    slot,
                                    buf.slots()
                                ),
                            });
                        }
                        let src = buf.chunk(head, slot as usize);
                        let base = (head * cap + out_offset + j * chunk_size) * d;
                        for (i, bytes) in src.chunks_exact(4).enumerate() {
                            let v = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                            unsafe {
                                *out_ptr.add(base + i) = v;
                            }
                        }
                    }
                }
                Ok(())
            }
            ValueStore::Resident { chunks } => {
                // chunks: [B, H_kv, slots, C, D]
                let c_shape = chunks.shape();
                if c_shape.len() != 5 {
                    return Err(Error::InvalidArgument {
                        arg: "store",
                        reason: format!("expected 5D chunk tensor, got {}D", c_shape.len()),
                    });
                }
                let store_slots = c_shape[2];
                let chunk_size = c_shape[3];
                let d = c_shape[4];
                let (heads, cap, _) =
                    validate_out(out, slots, slots_per_head, out_offset, chunk_size, d)?;
                if c_shape[0] * c_shape[1] != heads {
                    return Err(Error::ShapeMismatch {
                        arg: "store",
                        reason: format!(
                            "store has {} heads, scratch has {}",
                            c_shape[0] * c_shape[1],
                            heads
                        ),
                    });
                }

                let src_ptr = chunks.storage().ptr() as *const f32;
                let out_ptr = out.storage().ptr() as *mut f32;
                let chunk_elems = chunk_size * d;
                for head in 0..heads {
                    for j in 0..slots_per_head {
                        let slot = slots[head * slots_per_head + j];
                        if slot < 0 || slot as usize >= store_slots {
                            return Err(Error::InvalidArgument {
                                arg: "slots",
                                reason: format!("slot {} out of range [0, {})", slot, store_slots),
                            });
                        }
                        let src_base = (head * store_slots + slot as usize) * chunk_elems;
                        let dst_base = (head * cap + out_offset + j * chunk_size) * d;
                        unsafe {
                            std::ptr::copy_nonoverlapping(
                                src_ptr.add(src_base),
                                out_ptr.add(dst_base),
                                chunk_elems,
                            );
                        }
                    }
                }
                Ok(())
            }
        }
    }
}
