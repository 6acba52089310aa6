//! Truncated low-rank key factorization
//!
//! Per (batch, kv-head), the pre-RoPE key matrix `K [N, D]` is factorized as
//! `K ≈ SV · U` with `U = V_rᵀ [r, D]` and `SV = K · V_r [N, r]`, where `V_r`
//! holds the top-r eigenvectors of the D×D Gram matrix `KᵀK`. The Gram
//! eigenproblem is solved on the host in f64 by cyclic Jacobi; D is a head
//! dimension (≤ a few hundred), so the solve is cheap next to the `K · V_r`
//! projection.
//!
//! A head that fails to converge surfaces [`crate::error::Error::SvdNonConvergence`];
//! the cache responds by keeping that layer dense.

use crate::error::{Error, Result};
use rayon::prelude::*;

const MAX_SWEEPS: usize = 64;
const OFF_DIAG_TOL: f64 = 1e-12;

/// Rank-r factors of one head's key matrix.
#[derive(Debug, Clone)]
pub struct HeadFactors {
    /// `[r, D]` row-major — left factor, shared across positions.
    pub u: Vec<f32>,
    /// `[N, r]` row-major — per-position right factor.
    pub sv: Vec<f32>,
}

/// Factorize every head of a flattened `[heads, N, D]` key tensor.
///
/// Heads run in parallel; the first non-converging head aborts the batch.
pub fn factorize_heads(
    k: &[f32],
    heads: usize,
    n: usize,
    d: usize,
    rank: usize,
) -> Result<Vec<HeadFactors>> {
    if rank == 0 || rank > d {
        return Err(Error::InvalidArgument {
            arg: "rank",
            reason: format!("rank {} must be in [1, D={}]", rank, d),
        });
    }
    if k.len() != heads * n * d {
        return Err(Error::InvalidArgument {
            arg: "k",
            reason: format!(
                "expected {} elements ({} heads x {} x {}), got {}",
                heads * n * d,
                heads,
                n,
                d,
                k.len()
            ),
        });
    }

    (0..heads)
        .into_par_iter()
        .map(|h| factorize_one(&k[h * n * d..(h + 1) * n * d], n, d, rank))
        .collect()
}

fn factorize_one(k: &[f32], n: usize, d: usize, rank: usize) -> Result<HeadFactors> {
    // Gram matrix G = KᵀK in f64, symmetric D×D
    let mut g = vec![0.0f64; d * d];
    for t in 0..n {
        let row = &k[t * d..(t + 1) * d];
        for i in 0..d {
            let ki = row[i] as f64;
            for j in i..d {
                g[i * d + j] += ki * row[j] as f64;
            }
        }
    }
    for i in 0..d {
        for j in 0..i {
            g[i * d + j] = g[j * d + i];
        }
    }

    let (eigvals, v) = jacobi_eigh(&mut g, d)?;

    // Top-r eigenpairs by descending eigenvalue; ties by lower column index.
    let mut order: Vec<usize> = (0..d).collect();
    order.sort_by(|&a, &b| {
        eigvals[b]
            .partial_cmp(&eigvals[a])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });
    let top = &order[..rank];

    // U = V_rᵀ : [r, D]
    let mut u = vec![0.0f32; rank * d];
    for (j, &col) in top.iter().enumerate() {
        for i in 0..d {
            u[j * d + i] = v[i * d + col] as f32;
        }
    }

    // SV = K · V_r : [N, r]
    let mut sv = vec![0.0f32; n * rank];
    for t in 0..n {
        let row = &k[t * d..(t + 1) * d];
        for (j, &col) in top.iter().enumerate() {
            let mut acc = 0.0f64;
            for i in 0..d {
                acc += row[i] as f64 * v[i * d + col];
            }
            sv[t * rank + j] = acc as f32;
        }
    }

    Ok(HeadFactors { u, sv })
}

/// Cyclic Jacobi eigendecomposition of a symmetric matrix.
///
/// Returns `(eigenvalues, V)` with eigenvector `j` in column `j` of the
/// row-major `V`. Errors if the off-diagonal mass has not vanished after
/// `MAX_SWEEPS` sweeps.
fn jacobi_eigh(a: &mut [f64], d: usize) -> Result<(Vec<f64>, Vec<f64>)> {
    let mut v = vec![0.0f64; d * d];
    for i in 0..d {
        v[i * d + i] = 1.0;
    }
    if d == 1 {
        return Ok((vec![a[0]], v));
    }

    let diag_norm: f64 = (0..d).map(|i| a[i * d + i] * a[i * d + i]).sum::<f64>().max(1.0);

    for _sweep in 0..MAX_SWEEPS {
        let mut off: f64 = 0.0;
        for p in 0..d {
            for q in (p + 1)..d {
                off += a[p * d + q] * a[p * d + q];
            }
        }
        if off <= OFF_DIAG_TOL * diag_norm {
            let eig: Vec<f64> = (0..d).map(|i| a[i * d + i]).collect();
            return Ok((eig, v));
        }

        for p in 0..d {
            for q in (p + 1)..d {
                let apq = a[p * d + q];
                if apq.abs() <= f64::EPSILON * diag_norm.sqrt() {
                    continue;
                }
                let app = a[p * d + p];
                let aqq = a[q * d + q];
                let theta = (aqq - app) / (2.0 * apq);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for i in 0..d {
                    let aip = a[i * d + p];
                    let aiq = a[i * d + q];
                    a[i * d + p] = c * aip - s * aiq;
                    a[i * d + q] = s * aip + c * aiq;
                }
                for i in 0..d {
                    let api = a[p * d + i];
                    let aqi = a[q * d + i];
                    a[p * d + i] = c * api - s * aqi;
                    a[q * d + i] = s * api + c * aqi;
                }
                for i in 0..d {
                    let vip = v[i * d + p];
                    let viq = v[i * d + q];
                    v[i * d + p] = c * vip - s * viq;
                    v[i * d + q] = s * vip + c * viq;
                }
            }
        }
    }

    Err(Error::SvdNonConvergence {
        reason: format!("off-diagonal mass above tolerance after {} sweeps", MAX_SWEEPS),
    })
}
