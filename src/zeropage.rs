//! Zero-page windows: a bump allocator for carving them and the
//! translation of a program's zero-page footprint into one.

use crate::error::{AnalysisError, RelocationErrorKind};
use crate::image::RamZpRange;
use bitvec::prelude::*;
use indexmap::{IndexMap, IndexSet};
use log::debug;

/// Hands out consecutive sub-windows of a zero-page range
#[derive(Debug, Clone)]
pub struct ZpAllocator {
    range: RamZpRange,
    next: u16,
}

impl ZpAllocator {
    pub fn new(range: RamZpRange) -> Self {
        ZpAllocator {
            range,
            next: range.base as u16,
        }
    }

    /// Reserve `length` bytes, or `None` when the range is exhausted
    pub fn alloc(&mut self, length: u8) -> Option<RamZpRange> {
        if length > self.remaining() {
            return None;
        }
        let window = RamZpRange::new(self.next as u8, length);
        self.next += length as u16;
        Some(window)
    }

    pub fn remaining(&self) -> u8 {
        let end = self.range.base as u16 + self.range.length as u16;
        end.saturating_sub(self.next) as u8
    }
}

/// The zero-page addresses a program references, in order of first appearance.
/// Pointer operands link `z` and `z+1`, which must stay adjacent.
#[derive(Debug, Clone)]
pub struct ZeroPageFootprint {
    members: IndexSet<u8>,
    linked: BitVec,
}

impl Default for ZeroPageFootprint {
    fn default() -> Self {
        Self::new()
    }
}

impl ZeroPageFootprint {
    pub fn new() -> Self {
        ZeroPageFootprint {
            members: IndexSet::new(),
            linked: bitvec![0; 256],
        }
    }

    pub fn add(&mut self, zp: u8) {
        self.members.insert(zp);
    }

    /// A two-byte pointer at `zp`
    pub fn add_pointer(&mut self, zp: u8) {
        self.members.insert(zp);
        self.members.insert(zp.wrapping_add(1));
        self.linked.set(zp as usize, true);
    }

    /// Every address of `start..=end`, kept contiguous
    pub fn add_span(&mut self, start: u8, end: u8) {
        for zp in start..=end {
            self.members.insert(zp);
            if zp < end {
                self.linked.set(zp as usize, true);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, zp: u8) -> bool {
        self.members.contains(&zp)
    }

    pub fn members(&self) -> impl Iterator<Item = u8> + '_ {
        self.members.iter().copied()
    }

    /// Runs of linked addresses, ordered by their first-appearing member
    pub fn clusters(&self) -> Vec<Vec<u8>> {
        let mut seen = bitvec![0; 256];
        let mut clusters = Vec::new();

        for &member in &self.members {
            if seen[member as usize] {
                continue;
            }

            let mut start = member;
            for _ in 0..255 {
                let previous = start.wrapping_sub(1);
                if !self.linked[previous as usize] || previous == member {
                    break;
                }
                start = previous;
            }

            let mut cluster = vec![start];
            let mut current = start;
            while self.linked[current as usize] && cluster.len() < 256 {
                current = current.wrapping_add(1);
                if current == start {
                    break;
                }
                cluster.push(current);
            }

            for &zp in &cluster {
                seen.set(zp as usize, true);
            }
            clusters.push(cluster);
        }
        clusters
    }
}

/// Assign every footprint member a distinct address inside `window`.
///
/// Clusters already wholly inside the window keep their addresses; the rest
/// take the lowest free run of slots, in order of first appearance. The
/// returned map iterates in first-appearance order.
pub fn build_zp_map(
    footprint: &ZeroPageFootprint,
    window: RamZpRange,
) -> Result<IndexMap<u8, u8>, AnalysisError> {
    if !window.is_valid() {
        return Err(AnalysisError::new(
            RelocationErrorKind::InvalidTarget,
            None,
            format!("zero-page window {} leaves page zero", window),
        ));
    }

    let required = footprint.len();
    let available = window.length as usize;
    if required > available {
        return Err(AnalysisError::new(
            RelocationErrorKind::ZeroPageWindowTooSmall,
            None,
            format!(
                "zero-page footprint requires {} bytes, window {} provides {}",
                required, window, available
            ),
        ));
    }

    let mut used = bitvec![0; 256];
    let mut assigned: IndexMap<u8, u8> = IndexMap::new();
    let clusters = footprint.clusters();
    let mut pending = Vec::new();

    for cluster in &clusters {
        let contiguous = cluster.windows(2).all(|pair| pair[1] > pair[0]);
        let fits_in_place = contiguous && cluster.iter().all(|&zp| window.contains(zp));
        if fits_in_place {
            for &zp in cluster {
                used.set(zp as usize, true);
                assigned.insert(zp, zp);
            }
        } else {
            pending.push(cluster);
        }
    }

    for cluster in pending {
        let slot = window
            .addresses()
            .find(|&start| {
                let end = start as usize + cluster.len();
                end <= window.base as usize + available
                    && (start as usize..end).all(|zp| !used[zp])
            })
            .ok_or_else(|| {
                AnalysisError::new(
                    RelocationErrorKind::ZeroPageWindowTooSmall,
                    None,
                    format!(
                        "no run of {} adjacent bytes left in window {} for pointer at ${:02X} (footprint requires {}, window provides {})",
                        cluster.len(),
                        window,
                        cluster[0],
                        required,
                        available
                    ),
                )
            })?;

        for (i, &zp) in cluster.iter().enumerate() {
            let new = slot + i as u8;
            used.set(new as usize, true);
            assigned.insert(zp, new);
        }
    }

    let map: IndexMap<u8, u8> = footprint
        .members()
        .filter_map(|zp| assigned.get(&zp).map(|&new| (zp, new)))
        .collect();
    debug!("zero-page map: {} entries into {}", map.len(), window);
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_bumps_until_exhausted() {
        let mut alloc = ZpAllocator::new(RamZpRange::new(0x80, 0x10));
        assert_eq!(alloc.alloc(4), Some(RamZpRange::new(0x80, 4)));
        assert_eq!(alloc.alloc(8), Some(RamZpRange::new(0x84, 8)));
        assert_eq!(alloc.remaining(), 4);
        assert_eq!(alloc.alloc(5), None);
        assert_eq!(alloc.alloc(4), Some(RamZpRange::new(0x8C, 4)));
        assert_eq!(alloc.remaining(), 0);
    }

    #[test]
    fn members_inside_window_keep_their_address() {
        let mut footprint = ZeroPageFootprint::new();
        footprint.add(0x82);
        footprint.add(0x10);
        footprint.add(0x80);
        let map = build_zp_map(&footprint, RamZpRange::new(0x80, 4)).unwrap();
        assert_eq!(
            map.into_iter().collect::<Vec<_>>(),
            vec![(0x82, 0x82), (0x10, 0x81), (0x80, 0x80)]
        );
    }

    #[test]
    fn outside_members_fill_lowest_slots_in_order() {
        let mut footprint = ZeroPageFootprint::new();
        footprint.add(0x20);
        footprint.add(0x05);
        footprint.add(0x30);
        let map = build_zp_map(&footprint, RamZpRange::new(0x80, 0x10)).unwrap();
        assert_eq!(map[&0x20], 0x80);
        assert_eq!(map[&0x05], 0x81);
        assert_eq!(map[&0x30], 0x82);
    }

    #[test]
    fn pointer_pairs_stay_adjacent() {
        let mut footprint = ZeroPageFootprint::new();
        footprint.add(0x10);
        footprint.add_pointer(0x40);
        footprint.add_pointer(0x41);
        assert_eq!(footprint.clusters(), vec![vec![0x10], vec![0x40, 0x41, 0x42]]);

        let map = build_zp_map(&footprint, RamZpRange::new(0xF0, 0x08)).unwrap();
        assert_eq!(map[&0x10], 0xF0);
        assert_eq!(map[&0x40], 0xF1);
        assert_eq!(map[&0x41], 0xF2);
        assert_eq!(map[&0x42], 0xF3);
    }

    #[test]
    fn wrapping_pointer_is_one_cluster() {
        let mut footprint = ZeroPageFootprint::new();
        footprint.add_pointer(0xFF);
        assert_eq!(footprint.clusters(), vec![vec![0xFF, 0x00]]);

        let mut table = ZeroPageFootprint::new();
        table.add(0x50);
        table.add_span(0x50, 0x53);
        assert_eq!(table.clusters(), vec![vec![0x50, 0x51, 0x52, 0x53]]);
        let map = build_zp_map(&footprint, RamZpRange::new(0x80, 2)).unwrap();
        assert_eq!(map[&0xFF], 0x80);
        assert_eq!(map[&0x00], 0x81);
    }

    #[test]
    fn footprint_larger_than_window_fails() {
        let mut footprint = ZeroPageFootprint::new();
        for zp in 0x10..0x1B {
            footprint.add(zp);
        }
        let err = build_zp_map(&footprint, RamZpRange::new(0x80, 2)).unwrap_err();
        assert_eq!(err.kind, RelocationErrorKind::ZeroPageWindowTooSmall);
        assert!(err.message.contains("requires 11"));
        assert!(err.message.contains("provides 2"));
    }

    #[test]
    fn fragmented_window_fails_for_pointer() {
        // $81 keeps its slot, leaving no two adjacent free bytes in $80-$82
        let mut footprint = ZeroPageFootprint::new();
        footprint.add(0x81);
        footprint.add_pointer(0x10);
        let err = build_zp_map(&footprint, RamZpRange::new(0x80, 3)).unwrap_err();
        assert_eq!(err.kind, RelocationErrorKind::ZeroPageWindowTooSmall);
    }

    #[test]
    fn window_outside_page_zero_is_invalid() {
        let footprint = ZeroPageFootprint::new();
        let err = build_zp_map(&footprint, RamZpRange::new(0xF8, 0x10)).unwrap_err();
        assert_eq!(err.kind, RelocationErrorKind::InvalidTarget);
    }
}
