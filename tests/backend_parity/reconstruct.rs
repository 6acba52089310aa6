//! Backend parity tests for KeyReconstructOps (fused gather-GEMM-RoPE).

use super::helpers::*;
use shadowkv::ops::traits::KeyReconstructOps;

fn rope_caches(
    n: usize,
    d: usize,
    device: &numr::runtime::cpu::CpuDevice,
) -> (
    numr::tensor::Tensor<numr::runtime::cpu::CpuRuntime>,
    numr::tensor::Tensor<numr::runtime::cpu::CpuRuntime>,
) {
    let half = d / 2;
    let mut cos = vec![0.0f32; n * half];
    let mut sin = vec![0.0f32; n * half];
    for pos in 0..n {
        for i in 0..half {
            let freq = 1.0 / 10000.0f32.powf(2.0 * i as f32 / d as f32);
            cos[pos * half + i] = (pos as f32 * freq).cos();
            sin[pos * half + i] = (pos as f32 * freq).sin();
        }
    }
    (
        numr::tensor::Tensor::from_slice(&cos, &[n, half], device),
        numr::tensor::Tensor::from_slice(&sin, &[n, half], device),
    )
}

#[test]
fn test_reconstruct_keys_parity() {
    let (cpu_client, cpu_device) = setup_cpu();
    let (b, kv_heads, n_ctx, r, d) = (1, 2, 24, 4, 8);
    let p = 6;
    let cap = 16;
    let out_offset = 3;

    let u = det_tensor(&[b, kv_heads, r, d], &cpu_device);
    let sv = det_tensor(&[b, kv_heads, n_ctx, r], &cpu_device);
    let pos_data: Vec<i64> = vec![0, 3, 7, 11, 19, 23, 1, 2, 5, 8, 13, 21];
    let positions =
        numr::tensor::Tensor::from_slice(&pos_data, &[b, kv_heads, p], &cpu_device);
    let (cos, sin) = rope_caches(n_ctx, d, &cpu_device);

    let out = numr::tensor::Tensor::from_slice(
        &vec![0.0f32; b * kv_heads * cap * d],
        &[b, kv_heads, cap, d],
        &cpu_device,
    );
    cpu_client
        .reconstruct_keys(&u, &sv, &positions, &cos, &sin, &out, out_offset)
        .unwrap();
    let cpu_out = out.to_vec::<f32>();

    // Region before the offset is untouched.
    assert!(cpu_out[..out_offset * d].iter().all(|&x| x == 0.0));

    // Hand-computed reference for head 0, first requested position (pos 0:
    // angle 0, rotation is identity, so out = sv_row · U).
    let u_host = u.to_vec::<f32>();
    let sv_host = sv.to_vec::<f32>();
    for dim in 0..d {
        let mut acc = 0.0f32;
        for j in 0..r {
            acc += sv_host[j] * u_host[j * d + dim];
        }
        let got = cpu_out[out_offset * d + dim];
        assert!((got - acc).abs() < 1e-5, "dim {}: {} vs {}", dim, got, acc);
    }

    #[cfg(feature = "cuda")]
    with_cuda_backend(|cuda_client, cuda_device| {
        use numr::tensor::Tensor;
        use shadowkv::ops::traits::TransferSyncOps;
        let u_c = Tensor::from_slice(&u.to_vec::<f32>(), &[b, kv_heads, r, d], &cuda_device);
        let sv_c = Tensor::from_slice(&sv.to_vec::<f32>(), &[b, kv_heads, n_ctx, r], &cuda_device);
        let pos_c = Tensor::from_slice(&pos_data, &[b, kv_heads, p], &cuda_device);
        let cos_c = Tensor::from_slice(&cos.to_vec::<f32>(), &[n_ctx, d / 2], &cuda_device);
        let sin_c = Tensor::from_slice(&sin.to_vec::<f32>(), &[n_ctx, d / 2], &cuda_device);
        let out_c = Tensor::from_slice(
            &vec![0.0f32; b * kv_heads * cap * d],
            &[b, kv_heads, cap, d],
            &cuda_device,
        );
        cuda_client
            .reconstruct_keys(&u_c, &sv_c, &pos_c, &cos_c, &sin_c, &out_c, out_offset)
            .unwrap();
        // Kernel ran on the reconstruction stream: the edge back to the
        // primary stream must be explicit before reading.
        cuda_client.sync_transfer_streams().unwrap();
        assert_parity_f32(&out_c.to_vec::<f32>(), &cpu_out, "reconstruct_keys CUDA vs CPU");
    });
}
