//! Rotary angle caches
//!
//! Precomputed cos/sin tables indexed by absolute position, shared by the
//! fused key reconstruction. The cache engine never rotates values.

use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Precomputed rotary caches, `[max_len, head_dim/2]` each.
pub struct RopeCaches<R: Runtime> {
    cos: Tensor<R>,
    sin: Tensor<R>,
}

impl<R: Runtime> RopeCaches<R> {
    /// Wrap externally computed caches.
    pub fn new(cos: Tensor<R>, sin: Tensor<R>) -> Self {
        Self { cos, sin }
    }

    /// Compute frequency caches on the host: `cos(pos * freq)`, `sin(pos * freq)`
    /// with `freq_i = 1 / base^(2i/dim)`.
    pub fn precompute(
        max_len: usize,
        head_dim: usize,
        base: f32,
        device: &R::Device,
    ) -> Self
    where
        R: Runtime,
    {
        let half = head_dim / 2;
        let mut cos_data = vec![0.0f32; max_len * half];
        let mut sin_data = vec![0.0f32; max_len * half];

        for pos in 0..max_len {
            for i in 0..half {
                let freq = 1.0 / base.powf(2.0 * i as f32 / head_dim as f32);
                let angle = pos as f32 * freq;
                cos_data[pos * half + i] = angle.cos();
                sin_data[pos * half + i] = angle.sin();
            }
        }

        let cos = Tensor::<R>::from_slice(&cos_data, &[max_len, half], device);
        let sin = Tensor::<R>::from_slice(&sin_data, &[max_len, half], device);
        Self { cos, sin }
    }

    pub fn cos(&self) -> &Tensor<R> {
        &self.cos
    }

    pub fn sin(&self) -> &Tensor<R> {
        &self.sin
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use numr::runtime::cpu::{CpuDevice, CpuRuntime};

    #[test]
    fn test_precompute_shape() {
        let device = CpuDevice::new();
        let caches = RopeCaches::<CpuRuntime>::precompute(64, 8, 10000.0, &device);
        assert_eq!(caches.cos().shape(), &[64, 4]);
        assert_eq!(caches.sin().shape(), &[64, 4]);
    }

    #[test]
    fn test_position_zero_is_identity() {
        let device = CpuDevice::new();
        let caches = RopeCaches::<CpuRuntime>::precompute(4, 8, 10000.0, &device);
        let cos: Vec<f32> = caches.cos().to_vec();
        let sin: Vec<f32> = caches.sin().to_vec();
        for i in 0..4 {
            assert!((cos[i] - 1.0).abs() < 1e-6);
            assert!(sin[i].abs() < 1e-6);
        }
    }
}
