//! Page-locking of host chunk buffers
//!
//! Registers the already-allocated host buffer with the driver
//! (`cuMemHostRegister`) instead of allocating fresh pinned memory — the
//! buffer is filled on the host at prefill and its address never moves
//! afterwards. Registration is what lets the per-chunk copies on the copy
//! stream run as true async DMA.

use crate::error::{Error, Result};
use crate::offload::HostChunkBuffer;
use cudarc::driver::sys;

/// Page-lock the buffer's backing memory. Idempotent per buffer.
pub fn register_host_buffer(buf: &mut HostChunkBuffer) -> Result<()> {
    if buf.is_pinned() || buf.as_slice().is_empty() {
        return Ok(());
    }
    let ptr = buf.as_slice().as_ptr() as *mut std::ffi::c_void;
    let bytes = buf.as_slice().len();
    let status = unsafe { sys::cuMemHostRegister_v2(ptr, bytes, 0) };
    if status != sys::CUresult::CUDA_SUCCESS {
        return Err(Error::ResourceExhausted {
            reason: format!("cuMemHostRegister of {} bytes failed: {:?}", bytes, status),
        });
    }
    buf.set_pinned(true);
    Ok(())
}

/// Undo `register_host_buffer`. Called from the buffer's drop; failures are
/// ignored there (the memory is being freed regardless).
pub fn unregister_host_buffer(buf: &HostChunkBuffer) {
    if !buf.is_pinned() {
        return;
    }
    let ptr = buf.as_slice().as_ptr() as *mut std::ffi::c_void;
    unsafe {
        let _ = sys::cuMemHostUnregister(ptr);
    }
}
