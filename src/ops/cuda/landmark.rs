//! CUDA implementation of LandmarkOps
//!
//! Delegates to impl_generic — the composite runs on numr's CUDA-native
//! reductions; landmark construction is prefill-time and not latency
//! critical.

use crate::error::Result;
use crate::ops::impl_generic::{chunk_landmarks_impl, chunk_min_cosine_impl};
use crate::ops::traits::LandmarkOps;
use numr::runtime::cuda::{CudaClient, CudaRuntime};
use numr::tensor::Tensor;

impl LandmarkOps<CudaRuntime> for CudaClient {
    fn chunk_landmarks(
        &self,
        k: &Tensor<CudaRuntime>,
        chunk_size: usize,
    ) -> Result<Tensor<CudaRuntime>> {
        chunk_landmarks_impl(self, k, chunk_size)
    }

    fn chunk_min_cosine(
        &self,
        k: &Tensor<CudaRuntime>,
        landmarks: &Tensor<CudaRuntime>,
        chunk_size: usize,
    ) -> Result<Tensor<CudaRuntime>> {
        chunk_min_cosine_impl(self, k, landmarks, chunk_size)
    }
}
