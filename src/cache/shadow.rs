//! The ShadowKV cache
//!
//! Per-model owner of all layer caches, admission control and the lifecycle
//! state machine:
//!
//! ```text
//! Uninitialised -> Prefilling -> Ready <-> Decoding
//!        ^                         |
//!        +---------- clear --------+
//! ```
//!
//! Prefill is exactly-once per layer, in layer order. Decode operations are
//! rejected until every layer is prefilled. `clear` returns to
//! `Uninitialised` while keeping buffer allocations.

use crate::cache::layer::LayerCache;
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::ops::traits::{
    ChunkSelectOps, KeyReconstructOps, KvAppendOps, LandmarkOps, TransferSyncOps, ValueGatherOps,
};
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Lifecycle phase of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePhase {
    Uninitialised,
    Prefilling,
    Ready,
    Decoding,
}

/// Sparse KV cache for one model and one generation session.
///
/// The cache exclusively owns its buffers; decoder layers borrow the
/// key/value views returned by the fetch pair read-only for the duration of
/// one attention call, and must not hold them across steps — the sparse
/// window is overwritten on the next retrieval.
pub struct ShadowKvCache<R: Runtime> {
    config: CacheConfig,
    device: R::Device,
    layers: Vec<LayerCache<R>>,
    phase: CachePhase,
    prefilled: usize,
}

impl<R: Runtime> ShadowKvCache<R>
where
    R::Client: LandmarkOps<R>
        + ChunkSelectOps<R>
        + KeyReconstructOps<R>
        + ValueGatherOps<R>
        + KvAppendOps<R>
        + TransferSyncOps<R>,
{
    /// Validate the configuration and preallocate every layer's buffers.
    pub fn new(config: CacheConfig, device: &R::Device) -> Result<Self> {
        config.validate()?;
        let mut layers = Vec::with_capacity(config.num_layers);
        for _ in 0..config.num_layers {
            layers.push(LayerCache::new(&config, device)?);
        }
        Ok(Self {
            config,
            device: device.clone(),
            layers,
            phase: CachePhase::Uninitialised,
            prefilled: 0,
        })
    }

    fn layer_for_prefill(&mut self, layer_idx: usize) -> Result<()> {
        match self.phase {
            CachePhase::Uninitialised | CachePhase::Prefilling => {}
            _ => {
                return Err(Error::ContractViolation {
                    reason: format!("prefill in phase {:?}", self.phase),
                })
            }
        }
        if layer_idx != self.prefilled {
            return Err(Error::ContractViolation {
                reason: format!(
                    "prefill of layer {} out of order (expected layer {})",
                    layer_idx, self.prefilled
                ),
            });
        }
        self.phase = CachePhase::Prefilling;
        Ok(())
    }

    fn layer_for_decode(&mut self, layer_idx: usize) -> Result<&mut LayerCache<R>> {
        match self.phase {
            CachePhase::Ready | CachePhase::Decoding => {}
            _ => {
                return Err(Error::ContractViolation {
                    reason: format!("decode in phase {:?}", self.phase),
                })
            }
        }
        self.phase = CachePhase::Decoding;
        self.layers
            .get_mut(layer_idx)
            .ok_or_else(|| Error::InvalidArgument {
                arg: "layer_idx",
                reason: format!("layer {} out of range", layer_idx),
            })
    }

    /// Low-rank key factorization for one layer. Called during prefill,
    /// before `prefill_kv_cache` of the same layer.
    pub fn build_low_rank(&mut self, layer_idx: usize, k_pre_rope: &Tensor<R>) -> Result<()> {
        self.layer_for_prefill(layer_idx)?;
        let device = self.device.clone();
        self.layers[layer_idx].build_low_rank(k_pre_rope, &device)
    }

    /// Build all prefill-time structures for one layer. Exactly once per
    /// layer, in order; the last layer moves the cache to `Ready`.
    pub fn prefill_kv_cache(
        &mut self,
        layer_idx: usize,
        k_post_rope: &Tensor<R>,
        k_pre_rope: &Tensor<R>,
        v: &Tensor<R>,
        client: &R::Client,
    ) -> Result<()> {
        self.layer_for_prefill(layer_idx)?;
        if layer_idx > 0 {
            let expected = self.layers[0].prefill_len();
            let got = k_post_rope.shape().get(2).copied().unwrap_or(0);
            if got != expected {
                return Err(Error::ContractViolation {
                    reason: format!(
                        "layer {} prefill length {} differs from layer 0 length {}",
                        layer_idx, got, expected
                    ),
                });
            }
        }
        let device = self.device.clone();
        self.layers[layer_idx].prefill(client, k_post_rope, k_pre_rope, v, &device)?;
        self.prefilled += 1;
        if self.prefilled == self.config.num_layers {
            self.phase = CachePhase::Ready;
            tracing::debug!(
                prefill_len = self.layers[0].prefill_len(),
                layers = self.config.num_layers,
                "prefill complete"
            );
        }
        Ok(())
    }

    /// Landmark scoring and chunk selection for one layer: returns the
    /// absolute positions to reconstruct this step, or `None` when the
    /// layer runs dense and retrieval is bypassed.
    pub fn get_retrieval_position_ids(
        &mut self,
        layer_idx: usize,
        query_post_rope: &Tensor<R>,
        client: &R::Client,
    ) -> Result<Option<Tensor<R>>> {
        let device = self.device.clone();
        self.layer_for_decode(layer_idx)?
            .select(client, query_post_rope, &device)
    }

    /// Gather stage: stream the selected value chunks into the device
    /// scratch. Returns the step's value view
    /// `[B, H_kv, consumed_positions, D]`.
    pub fn fetch_values(
        &mut self,
        layer_idx: usize,
        position_ids: Option<&Tensor<R>>,
        client: &R::Client,
    ) -> Result<Tensor<R>> {
        self.layer_for_decode(layer_idx)?
            .fetch_values(client, position_ids)
    }

    /// Reconstruct + rotate stage: rebuild the selected keys from (U, SV)
    /// into the device scratch. Returns the step's key view.
    pub fn fetch_keys(
        &mut self,
        layer_idx: usize,
        position_ids: Option<&Tensor<R>>,
        cos: &Tensor<R>,
        sin: &Tensor<R>,
        client: &R::Client,
    ) -> Result<Tensor<R>> {
        self.layer_for_decode(layer_idx)?
            .fetch_keys(client, position_ids, cos, sin)
    }

    /// Wait for the copy and reconstruction streams. Must run between the
    /// fetch pair and the attention kernel that consumes their output.
    pub fn sync_transfers(&self, client: &R::Client) -> Result<()> {
        client.sync_transfer_streams()
    }

    /// Append one decode step's raw K/V at the resident tail. The last
    /// layer's append completes the step and returns the cache to `Ready`.
    pub fn update(
        &mut self,
        layer_idx: usize,
        k_new: &Tensor<R>,
        v_new: &Tensor<R>,
        client: &R::Client,
    ) -> Result<()> {
        self.layer_for_decode(layer_idx)?.append(client, k_new, v_new)?;
        if layer_idx + 1 == self.config.num_layers {
            self.phase = CachePhase::Ready;
        }
        Ok(())
    }

    /// Migrate host-staged tables for the offloaded variant. The portable
    /// runtime stages everything at prefill, so this is a fence only: it
    /// fails if called before prefill completed.
    pub fn to_device(&self) -> Result<()> {
        match self.phase {
            CachePhase::Ready | CachePhase::Decoding => Ok(()),
            _ => Err(Error::ContractViolation {
                reason: format!("to_device in phase {:?}", self.phase),
            }),
        }
    }

    /// Return to `Uninitialised`, keeping every buffer allocation.
    pub fn clear(&mut self) {
        for layer in &mut self.layers {
            layer.clear();
        }
        self.prefilled = 0;
        self.phase = CachePhase::Uninitialised;
        tracing::debug!("cache cleared");
    }

    pub fn phase(&self) -> CachePhase {
        self.phase
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layer(&self, layer_idx: usize) -> Option<&LayerCache<R>> {
        self.layers.get(layer_idx)
    }

    /// Prompt length committed at prefill (layer 0's view).
    pub fn prefill_len(&self) -> usize {
        self.layers.first().map(|l| l.prefill_len()).unwrap_or(0)
    }

    /// Positions generated since prefill (layer 0's view).
    pub fn generated_len(&self) -> usize {
        self.layers.first().map(|l| l.generated()).unwrap_or(0)
    }
}
