//! Backend parity tests for KvAppendOps.

use super::helpers::*;
use shadowkv::ops::traits::KvAppendOps;

#[test]
fn test_kv_append_parity() {
    let (cpu_client, cpu_device) = setup_cpu();
    let (b, kv_heads, cap, d) = (1, 2, 16, 8);
    let delta = 3;
    let position = 5;

    let zeros = vec![0.0f32; b * kv_heads * cap * d];
    let k_buf = numr::tensor::Tensor::from_slice(&zeros, &[b, kv_heads, cap, d], &cpu_device);
    let v_buf = numr::tensor::Tensor::from_slice(&zeros, &[b, kv_heads, cap, d], &cpu_device);
    let new_k = det_tensor(&[b, kv_heads, delta, d], &cpu_device);
    let new_v = det_tensor(&[b, kv_heads, delta, d], &cpu_device);

    cpu_client
        .kv_append(&k_buf, &v_buf, &new_k, &new_v, position)
        .unwrap();
    let cpu_k = k_buf.to_vec::<f32>();
    let cpu_v = v_buf.to_vec::<f32>();

    // Untouched region before the write position stays zero.
    assert!(cpu_k[..position * d].iter().all(|&x| x == 0.0));

    #[cfg(feature = "cuda")]
    with_cuda_backend(|cuda_client, cuda_device| {
        use numr::tensor::Tensor;
        let k_c = Tensor::from_slice(
            &vec![0.0f32; b * kv_heads * cap * d],
            &[b, kv_heads, cap, d],
            &cuda_device,
        );
        let v_c = Tensor::from_slice(
            &vec![0.0f32; b * kv_heads * cap * d],
            &[b, kv_heads, cap, d],
            &cuda_device,
        );
        let nk = Tensor::from_slice(&new_k.to_vec::<f32>(), &[b, kv_heads, delta, d], &cuda_device);
        let nv = Tensor::from_slice(&new_v.to_vec::<f32>(), &[b, kv_heads, delta, d], &cuda_device);
        cuda_client
            .kv_append(&k_c, &v_c, &nk, &nv, position)
            .unwrap();
        assert_parity_f32(&k_c.to_vec::<f32>(), &cpu_k, "kv_append K CUDA vs CPU");
        assert_parity_f32(&v_c.to_vec::<f32>(), &cpu_v, "kv_append V CUDA vs CPU");
    });
}

#[test]
fn test_kv_append_sequential_steps_accumulate() {
    let (cpu_client, cpu_device) = setup_cpu();
    let (b, kv_heads, cap, d) = (1, 1, 8, 4);
    let zeros = vec![0.0f32; b * kv_heads * cap * d];
    let k_buf = numr::tensor::Tensor::from_slice(&zeros, &[b, kv_heads, cap, d], &cpu_device);
    let v_buf = numr::tensor::Tensor::from_slice(&zeros, &[b, kv_heads, cap, d], &cpu_device);

    for step in 0..4 {
        let val = step as f32 + 1.0;
        let new_k =
            numr::tensor::Tensor::from_slice(&vec![val; d], &[b, kv_heads, 1, d], &cpu_device);
        let new_v =
            numr::tensor::Tensor::from_slice(&vec![-val; d], &[b, kv_heads, 1, d], &cpu_device);
        cpu_client
            .kv_append(&k_buf, &v_buf, &new_k, &new_v, step)
            .unwrap();
    }

    let k = k_buf.to_vec::<f32>();
    for step in 0..4 {
        assert_eq!(k[step * d], step as f32 + 1.0);
    }
}
