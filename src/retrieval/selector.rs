//! Selection materialisation
//!
//! Maps the landmark-table slots picked by affinity scoring to store slots
//! in host-read order and to the absolute positions reconstruction needs.

use crate::error::{Error, Result};

/// One decode step's materialised selection, flattened per head.
#[derive(Debug, Clone)]
pub struct SelectedChunks {
    /// Store/landmark slots, `[heads * slots_per_head]`, grouped per head in
    /// ascending absolute-chunk order (maximises host read locality).
    pub slots: Vec<i64>,
    /// Absolute positions, `[heads * slots_per_head * chunk_size]`, same
    /// grouping and order.
    pub positions: Vec<i64>,
    pub slots_per_head: usize,
}

/// Turn raw top-k slot picks into gather-ready slots and position ids.
///
/// - `raw_slots`: `[heads * sel]` slot indices in descending-affinity order
/// - `landmark_map`: `[heads * m_idx]` absolute chunk id per slot
///
/// Slots are deduplicated by chunk id and reordered ascending; a duplicate
/// pick (which top-k never produces) is a caller error.
pub fn materialise_selection(
    raw_slots: &[i64],
    heads: usize,
    sel: usize,
    landmark_map: &[i64],
    m_idx: usize,
    chunk_size: usize,
) -> Result<SelectedChunks> {
    if raw_slots.len() != heads * sel {
        return Err(Error::InvalidArgument {
            arg: "raw_slots",
            reason: format!("expected {} slots, got {}", heads * sel, raw_slots.len()),
        });
    }
    if landmark_map.len() != heads * m_idx {
        return Err(Error::InvalidArgument {
            arg: "landmark_map",
            reason: format!(
                "expected {} entries, got {}",
                heads * m_idx,
                landmark_map.len()
            ),
        });
    }

    let mut slots = Vec::with_capacity(heads * sel);
    let mut positions = Vec::with_capacity(heads * sel * chunk_size);

    for head in 0..heads {
        let head_map = &landmark_map[head * m_idx..(head + 1) * m_idx];
        let mut picked: Vec<(i64, i64)> = Vec::with_capacity(sel); // (chunk_id, slot)
        for &slot in &raw_slots[head * sel..(head + 1) * sel] {
            if slot < 0 || slot as usize >= m_idx {
                return Err(Error::InvalidArgument {
                    arg: "raw_slots",
                    reason: format!("slot {} out of range [0, {})", slot, m_idx),
                });
            }
            picked.push((head_map[slot as usize], slot));
        }
        picked.sort_unstable();
        picked.dedup_by_key(|(chunk, _)| *chunk);
        if picked.len() != sel {
            return Err(Error::InvalidArgument {
                arg: "raw_slots",
                reason: format!(
                    "{} distinct chunks after dedup, expected {}",
                    picked.len(),
                    sel
                ),
            });
        }

        for &(chunk, slot) in &picked {
            slots.push(slot);
            let base = chunk * chunk_size as i64;
            for o in 0..chunk_size as i64 {
                positions.push(base + o);
            }
        }
    }

    Ok(SelectedChunks {
        slots,
        positions,
        slots_per_head: sel,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_sorted_by_absolute_position() {
        // slots 0..3 map to chunks 7, 2, 5; affinity picked 0 then 2 then 1
        let map = [7i64, 2, 5];
        let sel = materialise_selection(&[0, 2, 1], 1, 3, &map, 3, 2).unwrap();
        // ascending chunk order: 2 (slot 1), 5 (slot 2), 7 (slot 0)
        assert_eq!(sel.slots, vec![1, 2, 0]);
        assert_eq!(sel.positions, vec![4, 5, 10, 11, 14, 15]);
    }

    #[test]
    fn test_selection_per_head_maps() {
        // two heads with different chunk maps
        let map = [3i64, 0, /* head 1: */ 1, 4];
        let sel = materialise_selection(&[0, 1, 1, 0], 2, 2, &map, 2, 1).unwrap();
        assert_eq!(sel.slots, vec![1, 0, 0, 1]);
        assert_eq!(sel.positions, vec![0, 3, 1, 4]);
    }

    #[test]
    fn test_out_of_range_slot_rejected() {
        let map = [0i64, 1];
        assert!(materialise_selection(&[2], 1, 1, &map, 2, 4).is_err());
    }

    #[test]
    fn test_duplicate_picks_rejected() {
        let map = [0i64, 1];
        assert!(materialise_selection(&[1, 1], 1, 2, &map, 2, 4).is_err());
    }
}
