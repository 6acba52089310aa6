//! Value offload store
//!
//! Indexed value chunks, laid out so that a single chunk is one contiguous
//! byte range per `(batch, kv_head, slot)`. The offloaded variant keeps the
//! chunks in host memory (page-locked when the CUDA backend owns the device
//! scratch); the resident variant keeps the same layout in a device tensor.

use crate::error::{Error, Result};
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Host-side chunk storage.
///
/// Slot `s` of head `h` (flattened `b * H_kv + h_kv`) occupies the byte range
/// `[(h * slots + s) * chunk_bytes, (h * slots + s + 1) * chunk_bytes)`.
///
/// Backed by heap memory here; the CUDA backend substitutes a page-locked
/// allocation at construction so per-chunk H2D copies run as true async DMA.
pub struct HostChunkBuffer {
    data: Vec<u8>,
    heads: usize,
    slots: usize,
    chunk_bytes: usize,
    pinned: bool,
}

impl HostChunkBuffer {
    /// Allocate a zeroed buffer for `heads * slots` chunks.
    pub fn new(heads: usize, slots: usize, chunk_bytes: usize) -> Result<Self> {
        let total = heads
            .checked_mul(slots)
            .and_then(|n| n.checked_mul(chunk_bytes))
            .ok_or_else(|| Error::ResourceExhausted {
                reason: format!(
                    "host chunk buffer size overflow: {} heads x {} slots x {} bytes",
                    heads, slots, chunk_bytes
                ),
            })?;
        let mut data = Vec::new();
        data.try_reserve_exact(total)
            .map_err(|e| Error::ResourceExhausted {
                reason: format!("host chunk buffer allocation of {} bytes failed: {}", total, e),
            })?;
        data.resize(total, 0);
        Ok(Self {
            data,
            heads,
            slots,
            chunk_bytes,
            pinned: false,
        })
    }

    pub fn heads(&self) -> usize {
        self.heads
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn chunk_bytes(&self) -> usize {
        self.chunk_bytes
    }

    /// Whether the backing memory is page-locked.
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Record that the backing memory was (un)registered with the driver.
    /// The buffer never reallocates after construction, so the address the
    /// driver saw stays valid.
    pub(crate) fn set_pinned(&mut self, pinned: bool) {
        self.pinned = pinned;
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Byte range of one chunk.
    pub fn chunk_range(&self, head: usize, slot: usize) -> std::ops::Range<usize> {
        debug_assert!(head < self.heads && slot < self.slots);
        let start = (head * self.slots + slot) * self.chunk_bytes;
        start..start + self.chunk_bytes
    }

    /// One chunk as a byte slice.
    pub fn chunk(&self, head: usize, slot: usize) -> &[u8] {
        &self.data[self.chunk_range(head, slot)]
    }

    /// Write one chunk from f32 host data.
    pub fn write_chunk_f32(&mut self, head: usize, slot: usize, values: &[f32]) -> Result<()> {
        if values.len() * std::mem::size_of::<f32>() != self.chunk_bytes {
            return Err(Error::InvalidArgument {
                arg: "values",
                reason: format!(
                    "chunk is {} bytes, got {} f32 elements",
                    self.chunk_bytes,
                    values.len()
                ),
            });
        }
        let range = self.chunk_range(head, slot);
        let dst = &mut self.data[range];
        for (d, v) in dst.chunks_exact_mut(4).zip(values.iter()) {
            d.copy_from_slice(&v.to_le_bytes());
        }
        Ok(())
    }

    /// Read one chunk as f32 host data.
    pub fn read_chunk_f32(&self, head: usize, slot: usize) -> Vec<f32> {
        self.chunk(head, slot)
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    }
}

impl Drop for HostChunkBuffer {
    fn drop(&mut self) {
        #[cfg(feature = "cuda")]
        if self.pinned {
            crate::ops::cuda::pinned::unregister_host_buffer(self);
        }
    }
}

/// Chunked value storage for the indexed set of a layer.
pub enum ValueStore<R: Runtime> {
    /// All chunks on device: `[B, H_kv, slots, C, D]`. Debug/baseline variant.
    Resident { chunks: Tensor<R> },
    /// Chunks in host memory, streamed to device scratch on demand.
    Offloaded {
        buf: HostChunkBuffer,
        chunk_size: usize,
        head_dim: usize,
        dtype: DType,
    },
}

impl<R: Runtime> ValueStore<R> {
    /// Number of chunk slots per `(batch, kv_head)`.
    pub fn slots_per_head(&self) -> usize {
        match self {
            ValueStore::Resident { chunks } => chunks.shape()[2],
            ValueStore::Offloaded { buf, .. } => buf.slots(),
        }
    }

    pub fn is_offloaded(&self) -> bool {
        matches!(self, ValueStore::Offloaded { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_ranges_are_disjoint_and_contiguous() {
        let buf = HostChunkBuffer::new(2, 3, 16).unwrap();
        assert_eq!(buf.chunk_range(0, 0), 0..16);
        assert_eq!(buf.chunk_range(0, 2), 32..48);
        assert_eq!(buf.chunk_range(1, 0), 48..64);
        assert_eq!(buf.as_slice().len(), 2 * 3 * 16);
    }

    #[test]
    fn test_write_read_roundtrip() {
        let mut buf = HostChunkBuffer::new(1, 2, 4 * 4).unwrap();
        let vals = [1.0f32, -2.5, 3.25, 0.0];
        buf.write_chunk_f32(0, 1, &vals).unwrap();
        assert_eq!(buf.read_chunk_f32(0, 1), vals);
        // slot 0 untouched
        assert_eq!(buf.read_chunk_f32(0, 0), [0.0; 4]);
    }

    #[test]
    fn test_write_chunk_size_mismatch() {
        let mut buf = HostChunkBuffer::new(1, 1, 16).unwrap();
        assert!(buf.write_chunk_f32(0, 0, &[1.0, 2.0]).is_err());
    }
}
