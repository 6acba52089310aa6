//! Backend parity tests for LandmarkOps.

use super::helpers::*;
use shadowkv::ops::traits::LandmarkOps;

#[test]
fn test_chunk_landmarks_parity() {
    let (cpu_client, cpu_device) = setup_cpu();
    let (b, kv_heads, n, d) = (1, 2, 32, 8);
    let chunk = 4;

    let k = det_tensor(&[b, kv_heads, n, d], &cpu_device);
    let cpu_lm = cpu_client.chunk_landmarks(&k, chunk).unwrap();
    assert_eq!(cpu_lm.shape(), &[b, kv_heads, n / chunk, d]);
    let cpu_data = cpu_lm.contiguous().to_vec::<f32>();

    #[cfg(feature = "cuda")]
    with_cuda_backend(|cuda_client, cuda_device| {
        use numr::tensor::Tensor;
        let k_c = Tensor::from_slice(&k.to_vec::<f32>(), &[b, kv_heads, n, d], &cuda_device);
        let lm_c = cuda_client.chunk_landmarks(&k_c, chunk).unwrap();
        assert_parity_f32(
            &lm_c.contiguous().to_vec::<f32>(),
            &cpu_data,
            "chunk_landmarks CUDA vs CPU",
        );
    });
}

#[test]
fn test_chunk_min_cosine_parity() {
    let (cpu_client, cpu_device) = setup_cpu();
    let (b, kv_heads, n, d) = (1, 2, 32, 8);
    let chunk = 4;

    let k = det_tensor(&[b, kv_heads, n, d], &cpu_device);
    let lm = cpu_client.chunk_landmarks(&k, chunk).unwrap();
    let cpu_mc = cpu_client
        .chunk_min_cosine(&k, &lm, chunk)
        .unwrap()
        .contiguous()
        .to_vec::<f32>();
    assert_eq!(cpu_mc.len(), b * kv_heads * n / chunk);
    // cosine similarity is bounded
    for &v in &cpu_mc {
        assert!((-1.0 - 1e-5..=1.0 + 1e-5).contains(&v), "cosine {}", v);
    }

    #[cfg(feature = "cuda")]
    with_cuda_backend(|cuda_client, cuda_device| {
        use numr::tensor::Tensor;
        let k_c = Tensor::from_slice(&k.to_vec::<f32>(), &[b, kv_heads, n, d], &cuda_device);
        let lm_c = cuda_client.chunk_landmarks(&k_c, chunk).unwrap();
        let mc_c = cuda_client
            .chunk_min_cosine(&k_c, &lm_c, chunk)
            .unwrap()
            .contiguous()
            .to_vec::<f32>();
        assert_parity_f32(&mc_c, &cpu_mc, "chunk_min_cosine CUDA vs CPU");
    });
}
