//! Backend parity tests for ChunkSelectOps.

use super::helpers::*;
use shadowkv::ops::traits::ChunkSelectOps;

#[test]
fn test_select_topk_chunks_parity() {
    let (cpu_client, cpu_device) = setup_cpu();
    let (b, h, kv_heads, m, d) = (1, 4, 2, 16, 8);
    let group = h / kv_heads;
    let k = 4;

    let q = det_tensor(&[b, h, d], &cpu_device);
    let landmarks = det_tensor(&[b, kv_heads, m, d], &cpu_device);

    let cpu_idx = cpu_client
        .select_topk_chunks(&q, &landmarks, group, k)
        .unwrap();
    assert_eq!(cpu_idx.shape(), &[b, kv_heads, k]);
    let cpu_slots = cpu_idx.contiguous().to_vec::<i64>();

    // slots are distinct per head and in range
    for head in 0..b * kv_heads {
        let mut seen = std::collections::HashSet::new();
        for &s in &cpu_slots[head * k..(head + 1) * k] {
            assert!((0..m as i64).contains(&s));
            assert!(seen.insert(s), "duplicate slot {}", s);
        }
    }

    #[cfg(feature = "cuda")]
    with_cuda_backend(|cuda_client, cuda_device| {
        use numr::tensor::Tensor;
        let q_c = Tensor::from_slice(&q.to_vec::<f32>(), &[b, h, d], &cuda_device);
        let lm_c = Tensor::from_slice(
            &landmarks.to_vec::<f32>(),
            &[b, kv_heads, m, d],
            &cuda_device,
        );
        let idx_c = cuda_client
            .select_topk_chunks(&q_c, &lm_c, group, k)
            .unwrap();
        let cuda_slots = idx_c.contiguous().to_vec::<i64>();
        assert_eq!(cuda_slots, cpu_slots, "select_topk_chunks CUDA vs CPU");
    });
}
