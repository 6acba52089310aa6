//! Outlier chunk selection
//!
//! Chunks whose landmark poorly represents their members (low minimum member
//! cosine) bypass landmark retrieval and stay resident. Selection is a count
//! cap, not a similarity threshold, and runs per (batch, kv-head).

/// Disjoint split of the landmark-eligible chunks of one head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPartition {
    /// Outlier chunk ids, ascending.
    pub outliers: Vec<i64>,
    /// Indexed (landmark-scored) chunk ids, ascending.
    pub indexed: Vec<i64>,
}

/// Split `[0, min_cos.len())` into outliers and indexed chunks.
///
/// The `outlier_cap` chunks with the smallest minima become outliers.
/// Equal scores break toward the lowest chunk id.
pub fn partition_chunks(min_cos: &[f32], outlier_cap: usize) -> ChunkPartition {
    let m = min_cos.len();
    let n_outlier = outlier_cap.min(m);

    let mut order: Vec<usize> = (0..m).collect();
    order.sort_by(|&a, &b| {
        min_cos[a]
            .partial_cmp(&min_cos[b])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });

    let mut outliers: Vec<i64> = order[..n_outlier].iter().map(|&i| i as i64).collect();
    outliers.sort_unstable();

    let mut is_outlier = vec![false; m];
    for &o in &outliers {
        is_outlier[o as usize] = true;
    }
    let indexed: Vec<i64> = (0..m as i64).filter(|&i| !is_outlier[i as usize]).collect();

    ChunkPartition { outliers, indexed }
}
