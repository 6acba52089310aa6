//! Secondary transfer streams
//!
//! Two streams per device coexist with numr's primary compute stream: the
//! copy stream carries host-to-device value gathers, the reconstruction
//! stream carries the fused key reconstruction. Both are forked from the
//! primary stream once per device and cached; `join_transfer_streams`
//! establishes the explicit happens-before edge back into the primary stream
//! before attention consumes the scratch buffers.

use cudarc::driver::safe::CudaStream;
use numr::runtime::cuda::CudaClient;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::error::{Error, Result};

pub struct TransferStreams {
    pub copy: Arc<CudaStream>,
    pub reconstruct: Arc<CudaStream>,
}

static STREAM_CACHE: OnceLock<Mutex<HashMap<usize, Arc<TransferStreams>>>> = OnceLock::new();

/// Get (or fork) the transfer streams of the client's device.
pub fn transfer_streams(client: &CudaClient) -> Result<Arc<TransferStreams>> {
    let cache = STREAM_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = cache.lock().map_err(|e| Error::KernelError {
        reason: format!("stream cache mutex poisoned: {e}"),
    })?;

    let device_index = client.context().ordinal();
    if let Some(streams) = guard.get(&device_index) {
        return Ok(streams.clone());
    }

    let primary = client.stream();
    let copy = primary.fork().map_err(|e| Error::KernelError {
        reason: format!("failed to fork copy stream: {:?}", e),
    })?;
    let reconstruct = primary.fork().map_err(|e| Error::KernelError {
        reason: format!("failed to fork reconstruction stream: {:?}", e),
    })?;

    let streams = Arc::new(TransferStreams {
        copy: Arc::new(copy),
        reconstruct: Arc::new(reconstruct),
    });
    guard.insert(device_index, streams.clone());
    Ok(streams)
}

/// Make the primary stream wait for all work enqueued on both transfer
/// streams. No-op if the streams were never forked on this device.
pub fn join_transfer_streams(client: &CudaClient) -> Result<()> {
    let cache = STREAM_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let guard = cache.lock().map_err(|e| Error::KernelError {
        reason: format!("stream cache mutex poisoned: {e}"),
    })?;

    let device_index = client.context().ordinal();
    if let Some(streams) = guard.get(&device_index) {
        let primary = client.stream();
        primary.join(&streams.copy).map_err(|e| Error::KernelError {
            reason: format!("failed to join copy stream: {:?}", e),
        })?;
        primary
            .join(&streams.reconstruct)
            .map_err(|e| Error::KernelError {
                reason: format!("failed to join reconstruction stream: {:?}", e),
            })?;
    }
    Ok(())
}
