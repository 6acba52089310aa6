//! Per-layer cache state
//!
//! Owns the device scratch buffers, the landmark table, the low-rank factors
//! and the value store for one decoder layer. The sequence axis of the
//! scratch buffers is carved into fixed regions at prefill:
//!
//! ```text
//! [ outliers | sparse window | local tail | generated tail ]
//! ```
//!
//! Outlier and local-tail regions are written once at prefill; the sparse
//! window is overwritten every decode step; the generated tail grows by the
//! update path. In dense mode (short context or factorization fallback) the
//! buffers hold the full sequence from position 0 instead.

use crate::config::{CacheConfig, ValuePlacement};
use crate::error::{Error, Result};
use crate::offload::{HostChunkBuffer, ValueStore};
use crate::ops::traits::{
    ChunkSelectOps, KeyReconstructOps, KvAppendOps, LandmarkOps, ValueGatherOps,
};
use crate::prefill::{factorize_heads, partition_chunks};
use crate::retrieval::{materialise_selection, SelectedChunks};
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Region offsets of the sparse scratch layout, fixed at prefill.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LayerLayout {
    /// Outlier chunks per head (uniform across heads).
    pub n_outlier: usize,
    /// Chunks fetched per step: `min(budget_chunks, m_idx)`.
    pub sel: usize,
    /// Indexed (landmark-scored) chunks per head.
    pub m_idx: usize,
    /// Positions in the local-tail region (≤ local_chunks * chunk_size).
    pub local_len: usize,
    /// Sequence offset of the sparse window.
    pub sparse_off: usize,
    /// Sequence offset of the local tail.
    pub local_off: usize,
    /// Sequence offset of the generated tail.
    pub gen_off: usize,
}

pub struct LayerCache<R: Runtime> {
    cfg: CacheConfig,
    k_buf: Tensor<R>,
    v_buf: Tensor<R>,

    // built by build_low_rank
    u: Option<Tensor<R>>,
    sv: Option<Tensor<R>>,
    svd_failed: bool,

    // built by prefill
    landmarks: Option<Tensor<R>>,
    landmark_map: Vec<i64>,
    outlier_map: Vec<i64>,
    values: Option<ValueStore<R>>,
    layout: Option<LayerLayout>,
    dense: bool,
    prefill_len: usize,

    // per-step state
    generated: usize,
    selection: Option<SelectedChunks>,
}

impl<R: Runtime> LayerCache<R>
where
    R::Client: LandmarkOps<R>
        + ChunkSelectOps<R>
        + KeyReconstructOps<R>
        + ValueGatherOps<R>
        + KvAppendOps<R>,
{
    /// Allocate scratch buffers sized for the worst case:
    /// all static regions plus a full-length dense sequence.
    pub fn new(cfg: &CacheConfig, device: &R::Device) -> Result<Self> {
        let static_cap =
            (cfg.outlier_chunks + cfg.budget_chunks() + cfg.local_chunks) * cfg.chunk_size;
        let cap = static_cap + cfg.max_length;
        let shape = [cfg.batch_size, cfg.num_kv_heads, cap, cfg.head_dim];
        let k_buf = Tensor::<R>::zeros(&shape, cfg.dtype, device);
        let v_buf = Tensor::<R>::zeros(&shape, cfg.dtype, device);

        Ok(Self {
            cfg: cfg.clone(),
            k_buf,
            v_buf,
            u: None,
            sv: None,
            svd_failed: false,
            landmarks: None,
            landmark_map: Vec::new(),
            outlier_map: Vec::new(),
            values: None,
            layout: None,
            dense: false,
            prefill_len: 0,
            generated: 0,
            selection: None,
        })
    }

    fn validate_kv_input(&self, arg: &'static str, t: &Tensor<R>) -> Result<usize> {
        let shape = t.shape();
        if shape.len() != 4
            || shape[0] != self.cfg.batch_size
            || shape[1] != self.cfg.num_kv_heads
            || shape[3] != self.cfg.head_dim
        {
            return Err(Error::ShapeMismatch {
                arg,
                reason: format!(
                    "expected [{}, {}, N, {}], got {:?}",
                    self.cfg.batch_size, self.cfg.num_kv_heads, self.cfg.head_dim, shape
                ),
            });
        }
        if t.dtype() != DType::F32 {
            return Err(Error::DTypeMismatch {
                expected: DType::F32,
                got: t.dtype(),
            });
        }
        Ok(shape[2])
    }

    /// Factorize the pre-RoPE keys of this layer. Runs before the rest of
    /// prefill. Non-convergence is recoverable: the layer is marked for
    /// dense fallback and the cache stays usable.
    pub fn build_low_rank(&mut self, k_pre: &Tensor<R>, device: &R::Device) -> Result<()> {
        let n = self.validate_kv_input("k_pre_rope", k_pre)?;
        if n == 0 || n > self.cfg.max_length {
            return Err(Error::ContractViolation {
                reason: format!("prefill length {} outside (0, {}]", n, self.cfg.max_length),
            });
        }

        let heads = self.cfg.batch_size * self.cfg.num_kv_heads;
        let d = self.cfg.head_dim;
        let host = k_pre.contiguous().to_vec::<f32>();

        match factorize_heads(&host, heads, n, d, self.cfg.rank) {
            Ok(factors) => {
                let r = self.cfg.rank;
                let mut u_data = vec![0.0f32; heads * r * d];
                let mut sv_data = vec![0.0f32; heads * n * r];
                for (h, f) in factors.iter().enumerate() {
                    u_data[h * r * d..(h + 1) * r * d].copy_from_slice(&f.u);
                    sv_data[h * n * r..(h + 1) * n * r].copy_from_slice(&f.sv);
                }
                self.u = Some(Tensor::<R>::from_slice(
                    &u_data,
                    &[self.cfg.batch_size, self.cfg.num_kv_heads, r, d],
                    device,
                ));
                self.sv = Some(Tensor::<R>::from_slice(
                    &sv_data,
                    &[self.cfg.batch_size, self.cfg.num_kv_heads, n, r],
                    device,
                ));
                self.svd_failed = false;
                Ok(())
            }
            Err(Error::SvdNonConvergence { reason }) => {
                tracing::warn!(%reason, "key factorization failed, layer falls back to dense");
                self.u = None;
                self.sv = None;
                self.svd_failed = true;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Build all prefill-time structures for this layer.
    pub fn prefill(
        &mut self,
        client: &R::Client,
        k_post: &Tensor<R>,
        k_pre: &Tensor<R>,
        v: &Tensor<R>,
        device: &R::Device,
    ) -> Result<()> {
        let n = self.validate_kv_input("k_post_rope", k_post)?;
        let n_pre = self.validate_kv_input("k_pre_rope", k_pre)?;
        let n_v = self.validate_kv_input("v", v)?;
        if n != n_pre || n != n_v {
            return Err(Error::ShapeMismatch {
                arg: "v",
                reason: format!("k_post N={}, k_pre N={}, v N={}", n, n_pre, n_v),
            });
        }
        if n == 0 || n > self.cfg.max_length {
            return Err(Error::ContractViolation {
                reason: format!("prefill length {} outside (0, {}]", n, self.cfg.max_length),
            });
        }

        let c = self.cfg.chunk_size;
        let n_chunks = n.div_ceil(c);
        let local_take = self.cfg.local_chunks.min(n_chunks);
        let m_landmark = n_chunks - local_take;

        let dense_by_size = n <= (self.cfg.local_chunks + self.cfg.outlier_chunks) * c;
        if dense_by_size || m_landmark == 0 || self.svd_failed {
            return self.prefill_dense(client, k_post, v, n);
        }
        match self.sv.as_ref() {
            None => {
                return Err(Error::ContractViolation {
                    reason: "prefill_kv_cache before build_low_rank".into(),
                });
            }
            Some(sv) if sv.shape()[2] != n => {
                return Err(Error::ContractViolation {
                    reason: format!(
                        "prefill length {} differs from factorized length {}",
                        n,
                        sv.shape()[2]
                    ),
                });
            }
            Some(_) => {}
        }

        // Partition the landmark-eligible chunks per head.
        let lm_span = m_landmark * c;
        let k_pre_head = k_pre.narrow(2, 0, lm_span).map_err(Error::Numr)?.contiguous();
        let landmarks_all = client.chunk_landmarks(&k_pre_head, c)?;
        let min_cos = client
            .chunk_min_cosine(&k_pre_head, &landmarks_all, c)?
            .contiguous()
            .to_vec::<f32>();

        let heads = self.cfg.batch_size * self.cfg.num_kv_heads;
        let n_outlier = self.cfg.outlier_chunks.min(m_landmark);
        let m_idx = m_landmark - n_outlier;
        if m_idx == 0 {
            return self.prefill_dense(client, k_post, v, n);
        }
        let sel = self.cfg.budget_chunks().min(m_idx);

        let mut outlier_map = Vec::with_capacity(heads * n_outlier);
        let mut landmark_map = Vec::with_capacity(heads * m_idx);
        for head in 0..heads {
            let scores = &min_cos[head * m_landmark..(head + 1) * m_landmark];
            let part = partition_chunks(scores, n_outlier);
            debug_assert_eq!(part.outliers.len(), n_outlier);
            debug_assert_eq!(part.indexed.len(), m_idx);
            outlier_map.extend_from_slice(&part.outliers);
            landmark_map.extend_from_slice(&part.indexed);
        }

        let local_len = n - lm_span;
        let layout = LayerLayout {
            n_outlier,
            sel,
            m_idx,
            local_len,
            sparse_off: n_outlier * c,
            local_off: n_outlier * c + sel * c,
            gen_off: n_outlier * c + sel * c + local_len,
        };

        let d = self.cfg.head_dim;
        let k_host = k_post.contiguous().to_vec::<f32>();
        let v_host = v.contiguous().to_vec::<f32>();
        let lm_host = landmarks_all.contiguous().to_vec::<f32>();

        // Landmark table for the indexed set only.
        let mut lm_table = vec![0.0f32; heads * m_idx * d];
        for head in 0..heads {
            for (slot, &chunk) in
                landmark_map[head * m_idx..(head + 1) * m_idx].iter().enumerate()
            {
                let src = (head * m_landmark + chunk as usize) * d;
                let dst = (head * m_idx + slot) * d;
                lm_table[dst..dst + d].copy_from_slice(&lm_host[src..src + d]);
            }
        }
        self.landmarks = Some(Tensor::<R>::from_slice(
            &lm_table,
            &[self.cfg.batch_size, self.cfg.num_kv_heads, m_idx, d],
            device,
        ));

        // Static resident regions: outlier chunks, then the (zeroed) sparse
        // window, then the local tail. Written in one append at position 0.
        let static_len = layout.gen_off;
        let mut k_static = vec![0.0f32; heads * static_len * d];
        let mut v_static = vec![0.0f32; heads * static_len * d];
        for head in 0..heads {
            for (o, &chunk) in outlier_map[head * n_outlier..(head + 1) * n_outlier]
                .iter()
                .enumerate()
            {
                let src = (head * n + chunk as usize * c) * d;
                let dst = (head * static_len + o * c) * d;
                k_static[dst..dst + c * d].copy_from_slice(&k_host[src..src + c * d]);
                v_static[dst..dst + c * d].copy_from_slice(&v_host[src..src + c * d]);
            }
            let src = (head * n + lm_span) * d;
            let dst = (head * static_len + layout.local_off) * d;
            k_static[dst..dst + local_len * d]
                .copy_from_slice(&k_host[src..src + local_len * d]);
            v_static[dst..dst + local_len * d]
                .copy_from_slice(&v_host[src..src + local_len * d]);
        }
        let k_static = Tensor::<R>::from_slice(
            &k_static,
            &[self.cfg.batch_size, self.cfg.num_kv_heads, static_len, d],
            device,
        );
        let v_static = Tensor::<R>::from_slice(
            &v_static,
            &[self.cfg.batch_size, self.cfg.num_kv_heads, static_len, d],
            device,
        );
        client.kv_append(&self.k_buf, &self.v_buf, &k_static, &v_static, 0)?;

        // Indexed value chunks move to the store.
        let mut store =
            self.build_value_store(&v_host, &landmark_map, heads, m_idx, n, device)?;
        client.prepare_value_store(&mut store)?;
        self.values = Some(store);

        self.outlier_map = outlier_map;
        self.landmark_map = landmark_map;
        self.layout = Some(layout);
        self.dense = false;
        self.prefill_len = n;
        self.generated = 0;
        self.selection = None;
        Ok(())
    }

    fn prefill_dense(
        &mut self,
        client: &R::Client,
        k_post: &Tensor<R>,
        v: &Tensor<R>,
        n: usize,
    ) -> Result<()> {
        client.kv_append(&self.k_buf, &self.v_buf, k_post, v, 0)?;
        self.landmarks = None;
        self.landmark_map.clear();
        self.outlier_map.clear();
        self.values = None;
        self.layout = None;
        self.dense = true;
        self.prefill_len = n;
        self.generated = 0;
        self.selection = None;
        Ok(())
    }

    fn build_value_store(
        &self,
        v_host: &[f32],
        landmark_map: &[i64],
        heads: usize,
        m_idx: usize,
        n: usize,
        device: &R::Device,
    ) -> Result<ValueStore<R>> {
        let c = self.cfg.chunk_size;
        let d = self.cfg.head_dim;
        match self.cfg.placement {
            ValuePlacement::Offloaded => {
                let chunk_bytes = c * d * std::mem::size_of::<f32>();
                let mut buf = HostChunkBuffer::new(heads, m_idx, chunk_bytes)?;
                for head in 0..heads {
                    for (slot, &chunk) in
                        landmark_map[head * m_idx..(head + 1) * m_idx].iter().enumerate()
                    {
                        let src = (head * n + chunk as usize * c) * d;
                        buf.write_chunk_f32(head, slot, &v_host[src..src + c * d])?;
                    }
                }
                Ok(ValueStore::Offloaded {
                    buf,
                    chunk_size: c,
                    head_dim: d,
                    dtype: DType::F32,
                })
            }
            ValuePlacement::Resident => {
                let mut chunks = vec![0.0f32; heads * m_idx * c * d];
                for head in 0..heads {
                    for (slot, &chunk) in
                        landmark_map[head * m_idx..(head + 1) * m_idx].iter().enumerate()
                    {
                        let src = (head * n + chunk as usize * c) * d;
                        let dst = (head * m_idx + slot) * c * d;
                        chunks[dst..dst + c * d].copy_from_slice(&v_host[src..src + c * d]);
                    }
                }
                Ok(ValueStore::Resident {
                    chunks: Tensor::<R>::from_slice(
                        &chunks,
                        &[self.cfg.batch_size, self.cfg.num_kv_heads, m_idx, c, d],
                        device,
                    ),
                })
            }
        }
    }

    /// Score the query against the landmark table, select the top chunks,
    /// dedup, reorder ascending and materialise their positions.
    ///
    /// Returns `None` when the layer runs dense (retrieval bypassed).
    pub fn select(
        &mut self,
        client: &R::Client,
        q: &Tensor<R>,
        device: &R::Device,
    ) -> Result<Option<Tensor<R>>> {
        if self.dense {
            self.selection = None;
            return Ok(None);
        }
        let layout = self.layout.ok_or_else(|| Error::ContractViolation {
            reason: "decode before prefill".into(),
        })?;
        let landmarks = self.landmarks.as_ref().ok_or_else(|| Error::ContractViolation {
            reason: "decode before prefill".into(),
        })?;

        let q_shape = q.shape();
        if q_shape.len() != 3
            || q_shape[0] != self.cfg.batch_size
            || q_shape[1] != self.cfg.num_heads
            || q_shape[2] != self.cfg.head_dim
        {
            return Err(Error::ShapeMismatch {
                arg: "query_post_rope",
                reason: format!(
                    "expected [{}, {}, {}], got {:?}",
                    self.cfg.batch_size, self.cfg.num_heads, self.cfg.head_dim, q_shape
                ),
            });
        }

        let idx = client.select_topk_chunks(q, landmarks, self.cfg.group_size(), layout.sel)?;
        let raw = idx.contiguous().to_vec::<i64>();
        let heads = self.cfg.batch_size * self.cfg.num_kv_heads;
        let selection = materialise_selection(
            &raw,
            heads,
            layout.sel,
            &self.landmark_map,
            layout.m_idx,
            self.cfg.chunk_size,
        )?;

        let positions = Tensor::<R>::from_slice(
            &selection.positions,
            &[
                self.cfg.batch_size,
                self.cfg.num_kv_heads,
                layout.sel * self.cfg.chunk_size,
            ],
            device,
        );
        self.selection = Some(selection);
        Ok(Some(positions))
    }

    /// Gather the selected value chunks into the sparse window and return the
    /// step's value view.
    pub fn fetch_values(
        &mut self,
        client: &R::Client,
        position_ids: Option<&Tensor<R>>,
    ) -> Result<Tensor<R>> {
        if self.dense {
            return self.dense_view(&self.v_buf);
        }
        let layout = self.require_layout()?;
        self.validate_position_ids(position_ids, layout)?;
        let selection = self.selection.as_ref().ok_or_else(|| Error::ContractViolation {
            reason: "fetch_values before get_retrieval_position_ids".into(),
        })?;
        let store = self.values.as_ref().ok_or_else(|| Error::ContractViolation {
            reason: "decode before prefill".into(),
        })?;

        client.gather_value_chunks(
            store,
            &selection.slots,
            selection.slots_per_head,
            &self.v_buf,
            layout.sparse_off,
        )?;
        self.v_buf
            .narrow(2, 0, self.consumed_len())
            .map_err(Error::Numr)
    }

    /// Reconstruct the selected keys into the sparse window and return the
    /// step's key view.
    pub fn fetch_keys(
        &mut self,
        client: &R::Client,
        position_ids: Option<&Tensor<R>>,
        cos: &Tensor<R>,
        sin: &Tensor<R>,
    ) -> Result<Tensor<R>> {
        if self.dense {
            return self.dense_view(&self.k_buf);
        }
        let layout = self.require_layout()?;
        let positions = self.validate_position_ids(position_ids, layout)?;
        if self.selection.is_none() {
            return Err(Error::ContractViolation {
                reason: "fetch_keys before get_retrieval_position_ids".into(),
            });
        }
        let (u, sv) = match (self.u.as_ref(), self.sv.as_ref()) {
            (Some(u), Some(sv)) => (u, sv),
            _ => {
                return Err(Error::ContractViolation {
                    reason: "decode before prefill".into(),
                })
            }
        };

        client.reconstruct_keys(u, sv, positions, cos, sin, &self.k_buf, layout.sparse_off)?;
        self.k_buf
            .narrow(2, 0, self.consumed_len())
            .map_err(Error::Numr)
    }

    fn require_layout(&self) -> Result<LayerLayout> {
        self.layout.ok_or_else(|| Error::ContractViolation {
            reason: "decode before prefill".into(),
        })
    }

    fn validate_position_ids<'a>(
        &self,
        position_ids: Option<&'a Tensor<R>>,
        layout: LayerLayout,
    ) -> Result<&'a Tensor<R>> {
        let positions = position_ids.ok_or_else(|| Error::InvalidArgument {
            arg: "position_ids",
            reason: "sparse layer requires the position ids from get_retrieval_position_ids"
                .into(),
        })?;
        let expected = [
            self.cfg.batch_size,
            self.cfg.num_kv_heads,
            layout.sel * self.cfg.chunk_size,
        ];
        if positions.shape() != expected {
            return Err(Error::ShapeMismatch {
                arg: "position_ids",
                reason: format!("expected {:?}, got {:?}", expected, positions.shape()),
            });
        }
        Ok(positions)
    }

    fn dense_view(&self, buf: &Tensor<R>) -> Result<Tensor<R>> {
        if self.prefill_len == 0 {
            return Err(Error::ContractViolation {
                reason: "decode before prefill".into(),
            });
        }
        buf.narrow(2, 0, self.consumed_len()).map_err(Error::Numr)
    }

    /// Append a decode step's raw K/V at the tail.
    pub fn append(
        &mut self,
        client: &R::Client,
        k_new: &Tensor<R>,
        v_new: &Tensor<R>,
    ) -> Result<()> {
        let delta = self.validate_kv_input("k_new", k_new)?;
        let delta_v = self.validate_kv_input("v_new", v_new)?;
        if delta != delta_v {
            return Err(Error::ShapeMismatch {
                arg: "v_new",
                reason: format!("k delta {} != v delta {}", delta, delta_v),
            });
        }
        if self.prefill_len == 0 {
            return Err(Error::ContractViolation {
                reason: "update before prefill".into(),
            });
        }
        if self.prefill_len + self.generated + delta > self.cfg.max_length {
            return Err(Error::ContractViolation {
                reason: format!(
                    "append of {} positions exceeds max_length {} ({} prefilled + {} generated)",
                    delta, self.cfg.max_length, self.prefill_len, self.generated
                ),
            });
        }
        if delta == 0 {
            return Ok(());
        }

        let tail_base = match self.layout {
            Some(l) if !self.dense => l.gen_off,
            _ => self.prefill_len,
        };
        client.kv_append(
            &self.k_buf,
            &self.v_buf,
            k_new,
            v_new,
            tail_base + self.generated,
        )?;
        self.generated += delta;
        Ok(())
    }

    /// Positions consumed by attention this step:
    /// `|outliers| + S·C + |local tail| + generated` (sparse) or the full
    /// sequence (dense).
    pub fn consumed_len(&self) -> usize {
        match self.layout {
            Some(l) if !self.dense => l.gen_off + self.generated,
            _ => self.prefill_len + self.generated,
        }
    }

    /// Forget all prefill state, keeping the buffer allocations.
    pub fn clear(&mut self) {
        self.u = None;
        self.sv = None;
        self.svd_failed = false;
        self.landmarks = None;
        self.landmark_map.clear();
        self.outlier_map.clear();
        self.values = None;
        self.layout = None;
        self.dense = false;
        self.prefill_len = 0;
        self.generated = 0;
        self.selection = None;
    }

    pub fn is_dense(&self) -> bool {
        self.dense
    }

    pub fn prefill_len(&self) -> usize {
        self.prefill_len
    }

    pub fn generated(&self) -> usize {
        self.generated
    }

    /// Positions held verbatim in the local-tail region (0 when dense).
    pub fn local_len(&self) -> usize {
        match self.layout {
            Some(l) if !self.dense => l.local_len,
            _ => 0,
        }
    }

    /// Outlier chunk ids of one `(batch, kv_head)` pair, ascending.
    pub fn outlier_chunks(&self, batch: usize, kv_head: usize) -> &[i64] {
        let layout = match self.layout {
            Some(l) => l,
            None => return &[],
        };
        let head = batch * self.cfg.num_kv_heads + kv_head;
        &self.outlier_map[head * layout.n_outlier..(head + 1) * layout.n_outlier]
    }

    /// Indexed chunk ids of one `(batch, kv_head)` pair, ascending.
    pub fn indexed_chunks(&self, batch: usize, kv_head: usize) -> &[i64] {
        let layout = match self.layout {
            Some(l) => l,
            None => return &[],
        };
        let head = batch * self.cfg.num_kv_heads + kv_head;
        &self.landmark_map[head * layout.m_idx..(head + 1) * layout.m_idx]
    }

    /// Chunk ids selected for the current step, per `(batch, kv_head)`.
    pub fn selected_chunks(&self, batch: usize, kv_head: usize) -> Vec<i64> {
        let (layout, selection) = match (self.layout, self.selection.as_ref()) {
            (Some(l), Some(s)) => (l, s),
            _ => return Vec::new(),
        };
        let head = batch * self.cfg.num_kv_heads + kv_head;
        let c = self.cfg.chunk_size as i64;
        selection.positions
            [head * layout.sel * self.cfg.chunk_size..(head + 1) * layout.sel * self.cfg.chunk_size]
            .iter()
            .step_by(self.cfg.chunk_size)
            .map(|&p| p / c)
            .collect()
    }
}
