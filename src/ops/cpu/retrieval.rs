//! CPU implementation of ChunkSelectOps — delegates to impl_generic

use crate::error::Result;
use crate::ops::impl_generic::select_topk_chunks_impl;
use crate::ops::traits::ChunkSelectOps;
use numr::runtime::cpu::{CpuClient, CpuRuntime};
use numr::tensor::Tensor;

impl ChunkSelectOps<CpuRuntime> for CpuClient {
    fn select_topk_chunks(
        &self,
        q: &Tensor<CpuRuntime>,
        landmarks: &Tensor<CpuRuntime>,
        group: usize,
        k: usize,
    ) -> Result<Tensor<CpuRuntime>> {
        select_topk_chunks_impl(self, q, landmarks, group, k)
    }
}
