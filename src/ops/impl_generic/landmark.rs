//! Generic landmark implementation
//!
//! THE algorithm — same for all backends.
//! Composes numr primitives: reshape, mean, mul, sum, sqrt, div, min.

use crate::error::{Error, Result};
use numr::ops::{BinaryOps, ReduceOps, ScalarOps, UnaryOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;

fn validate_chunked<R: Runtime>(
    k: &Tensor<R>,
    chunk_size: usize,
) -> Result<(usize, usize, usize, usize)> {
    let shape = k.shape();
    if shape.len() != 4 {
        return Err(Error::InvalidArgument {
            arg: "k",
            reason: format!("expected 4D [B, H_kv, N, D], got {}D", shape.len()),
        });
    }
    if chunk_size == 0 {
        return Err(Error::InvalidArgument {
            arg: "chunk_size",
            reason: "must be > 0".into(),
        });
    }
    let (b, h, n, d) = (shape[0], shape[1], shape[2], shape[3]);
    if n % chunk_size != 0 {
        return Err(Error::InvalidArgument {
            arg: "k",
            reason: format!("sequence length {} not divisible by chunk size {}", n, chunk_size),
        });
    }
    Ok((b, h, n, d))
}

/// Per-chunk arithmetic mean of the key vectors.
///
/// - `k`: `[B, H_kv, N, D]` pre-RoPE keys
/// - Output: `[B, H_kv, N / chunk_size, D]`
pub fn chunk_landmarks_impl<R, C>(
    client: &C,
    k: &Tensor<R>,
    chunk_size: usize,
) -> Result<Tensor<R>>
where
    R: Runtime,
    C: RuntimeClient<R> + ReduceOps<R>,
{
    let (b, h, n, d) = validate_chunked(k, chunk_size)?;
    let m = n / chunk_size;

    let k5 = k
        .contiguous()
        .reshape(&[b, h, m, chunk_size, d])
        .map_err(Error::Numr)?;
    client.mean(&k5, &[3], false).map_err(Error::Numr)
}

/// Minimum member cosine similarity per chunk.
///
/// For each chunk, cosine(landmark, member) over the `chunk_size` members,
/// reduced by minimum. Low values flag chunks whose landmark poorly
/// represents their internal variance.
///
/// - `k`: `[B, H_kv, N, D]`, `landmarks`: `[B, H_kv, N / chunk_size, D]`
/// - Output: `[B, H_kv, N / chunk_size]`
pub fn chunk_min_cosine_impl<R, C>(
    client: &C,
    k: &Tensor<R>,
    landmarks: &Tensor<R>,
    chunk_size: usize,
) -> Result<Tensor<R>>
where
    R: Runtime,
    C: RuntimeClient<R> + BinaryOps<R> + ReduceOps<R> + UnaryOps<R> + ScalarOps<R>,
{
    let (b, h, n, d) = validate_chunked(k, chunk_size)?;
    let m = n / chunk_size;

    let lm_shape = landmarks.shape();
    if lm_shape != [b, h, m, d] {
        return Err(Error::ShapeMismatch {
            arg: "landmarks",
            reason: format!("expected [{}, {}, {}, {}], got {:?}", b, h, m, d, lm_shape),
        });
    }

    let k5 = k
        .contiguous()
        .reshape(&[b, h, m, chunk_size, d])
        .map_err(Error::Numr)?;
    let lm5 = landmarks
        .contiguous()
        .reshape(&[b, h, m, 1, d])
        .map_err(Error::Numr)?;

    // cosine = <k, lm> / (|k| |lm|), member-wise; broadcast over the chunk dim
    let dots = client
        .sum(&client.mul(&k5, &lm5).map_err(Error::Numr)?, &[4], false)
        .map_err(Error::Numr)?;
    let k_sq = client
        .sum(&client.mul(&k5, &k5).map_err(Error::Numr)?, &[4], false)
        .map_err(Error::Numr)?;
    let lm_sq = client
        .sum(&client.mul(&lm5, &lm5).map_err(Error::Numr)?, &[4], false)
        .map_err(Error::Numr)?;
    let denom = client
        .sqrt(&client.mul(&k_sq, &lm_sq).map_err(Error::Numr)?)
        .map_err(Error::Numr)?;
    let denom = client.add_scalar(&denom, 1e-12).map_err(Error::Numr)?;
    let cos = client.div(&dots, &denom).map_err(Error::Numr)?;

    // [B, H, M, C] -> [B, H, M]
    client.min(&cos, &[3], false).map_err(Error::Numr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_setup;
    use numr::runtime::cpu::CpuRuntime;

    #[test]
    fn test_landmarks_are_chunk_means() {
        let (client, device) = cpu_setup();
        // 1 batch, 1 head, 4 positions, 2 dims, chunk 2
        let data = [1.0f32, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0];
        let k = Tensor::<CpuRuntime>::from_slice(&data, &[1, 1, 4, 2], &device);

        let lm = chunk_landmarks_impl(&client, &k, 2).unwrap();
        assert_eq!(lm.shape(), &[1, 1, 2, 2]);
        let got = lm.to_vec::<f32>();
        assert_eq!(got, vec![2.0, 3.0, 20.0, 30.0]);
    }

    #[test]
    fn test_landmarks_reject_ragged_sequence() {
        let (client, device) = cpu_setup();
        let k = Tensor::<CpuRuntime>::from_slice(&[0.0f32; 6], &[1, 1, 3, 2], &device);
        assert!(chunk_landmarks_impl(&client, &k, 2).is_err());
    }

    #[test]
    fn test_min_cosine_uniform_chunk_is_one() {
        let (client, device) = cpu_setup();
        // all members identical -> cosine with mean is exactly 1
        let data = [1.0f32, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0];
        let k = Tensor::<CpuRuntime>::from_slice(&data, &[1, 1, 4, 2], &device);
        let lm = chunk_landmarks_impl(&client, &k, 2).unwrap();
        let mc = chunk_min_cosine_impl(&client, &k, &lm, 2).unwrap();
        for v in mc.to_vec::<f32>() {
            assert!((v - 1.0).abs() < 1e-5, "got {}", v);
        }
    }

    #[test]
    fn test_min_cosine_flags_divergent_chunk() {
        let (client, device) = cpu_setup();
        // chunk 0: aligned members; chunk 1: opposing members (mean near zero,
        // members orthogonal-to-wildly-misaligned with it)
        let data = [
            1.0f32, 0.0, //
            1.0, 0.1, //
            1.0, 0.0, //
            -1.0, 0.001,
        ];
        let k = Tensor::<CpuRuntime>::from_slice(&data, &[1, 1, 4, 2], &device);
        let lm = chunk_landmarks_impl(&client, &k, 2).unwrap();
        let mc = chunk_min_cosine_impl(&client, &k, &lm, 2).unwrap().to_vec::<f32>();
        assert!(mc[0] > 0.9, "aligned chunk min-cos {}", mc[0]);
        assert!(mc[1] < mc[0], "divergent chunk should score lower");
    }
}
