//! CPU implementation of LandmarkOps — delegates to impl_generic

use crate::error::Result;
use crate::ops::impl_generic::{chunk_landmarks_impl, chunk_min_cosine_impl};
use crate::ops::traits::LandmarkOps;
use numr::runtime::cpu::{CpuClient, CpuRuntime};
use numr::tensor::Tensor;

impl LandmarkOps<CpuRuntime> for CpuClient {
    fn chunk_landmarks(
        &self,
        k: &Tensor<CpuRuntime>,
        chunk_size: usize,
    ) -> Result<Tensor<CpuRuntime>> {
        chunk_landmarks_impl(self, k, chunk_size)
    }

    fn chunk_min_cosine(
        &self,
        k: &Tensor<CpuRuntime>,
        landmarks: &Tensor<CpuRuntime>,
        chunk_size: usize,
    ) -> Result<Tensor<CpuRuntime>> {
        chunk_min_cosine_impl(self, k, landmarks, chunk_size)
    }
}
