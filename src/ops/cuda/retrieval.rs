//! CUDA implementation of ChunkSelectOps
//!
//! Delegates to impl_generic — the composite runs on numr's CUDA-native
//! batched matmul, softmax and topk.

use crate::error::Result;
use crate::ops::impl_generic::select_topk_chunks_impl;
use crate::ops::traits::ChunkSelectOps;
use numr::runtime::cuda::{CudaClient, CudaRuntime};
use numr::tensor::Tensor;

impl ChunkSelectOps<CudaRuntime> for CudaClient {
    fn select_topk_chunks(
        &self,
        q: &Tensor<CudaRuntime>,
        landmarks: &Tensor<CudaRuntime>,
        group: usize,
        k: usize,
    ) -> Result<Tensor<CudaRuntime>> {
        select_topk_chunks_impl(self, q, landmarks, group, k)
    }
}
