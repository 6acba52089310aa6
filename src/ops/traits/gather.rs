//! Value chunk gather trait

use crate::error::Result;
use crate::offload::ValueStore;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Gather of selected value chunks into the device value scratch.
///
/// The store keeps one contiguous region per `(batch, kv_head, slot)`; a
/// gather copies whole chunks. For the offloaded store this is a
/// host-to-device transfer (on CUDA: async copies enqueued on the dedicated
/// copy stream); for the resident store it is a device-side indexed copy.
///
/// # Layout contract
///
/// - `slots`: flattened `[B * H_kv * slots_per_head]` (host) — store slot
///   indices, grouped per `(batch, kv_head)` in ascending absolute-position
///   order
/// - `out`: `[B, H_kv, out_len, D]` — chunk `j` of head `(b, h)` lands at
///   `out[b, h, out_offset + j*C .. out_offset + (j+1)*C, :]`
pub trait ValueGatherOps<R: Runtime> {
    fn gather_value_chunks(
        &self,
        store: &ValueStore<R>,
        slots: &[i64],
        slots_per_head: usize,
        out: &Tensor<R>,
        out_offset: usize,
    ) -> Result<()>;

    /// Backend hook run once after the store is filled at prefill — e.g.
    /// page-lock the host buffer so per-chunk copies run as async DMA.
    fn prepare_value_store(&self, _store: &mut ValueStore<R>) -> Result<()> {
        Ok(())
    }
}
