use super::grid::ChunkRange;
use crate::engine::{PieceBitfield, SwarmStatus};

/// Read-only view over a snapshotted completion bitmap.
#[derive(Debug, Clone, Copy)]
pub struct Availability<'a> {
    pieces: Option<&'a PieceBitfield>,
}

impl<'a> Availability<'a> {
    pub fn new(pieces: &'a PieceBitfield) -> Self {
        Self {
            pieces: Some(pieces),
        }
    }

    /// Before metadata arrives every chunk reads as absent.
    pub fn from_status(status: Option<&'a SwarmStatus>) -> Self {
        Self {
            pieces: status.filter(|s| s.has_metadata()).map(|s| &s.pieces),
        }
    }

    pub fn is_present(&self, chunk: u32) -> bool {
        self.pieces
            .and_then(|p| p.get(chunk as usize).map(|bit| *bit))
            .unwrap_or(false)
    }

    pub fn all_present(&self, first: u32, last: u32) -> bool {
        (first..=last).all(|c| self.is_present(c))
    }

    /// First absent chunk in `[first, last]`, or `last + 1` when none is missing.
    ///
    /// Linear on purpose: with sequential fetch enabled chunks complete roughly in index order,
    /// so this approximates how far the entry is readable from its start.
    pub fn first_missing(&self, range: ChunkRange) -> u32 {
        (range.first..=range.last)
            .find(|&c| !self.is_present(c))
            .unwrap_or(range.last + 1)
    }

    /// Progress counter for an entry: chunks before the first gap, capped at the entry's total.
    pub fn completed_pieces(&self, range: ChunkRange) -> u32 {
        (self.first_missing(range) - range.first).min(range.total_pieces())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::prelude::{BitVec, Msb0};

    fn bits(pattern: &[u8]) -> PieceBitfield {
        pattern.iter().map(|&b| b == 1).collect::<BitVec<u8, Msb0>>()
    }

    #[test]
    fn first_missing_over_present_range_is_sentinel() {
        let pieces = bits(&[1, 1, 1, 1, 1]);
        let av = Availability::new(&pieces);
        assert_eq!(av.first_missing(ChunkRange { first: 1, last: 3 }), 4);
    }

    #[test]
    fn first_missing_over_absent_range_is_first() {
        let pieces = bits(&[1, 0, 0, 0, 1]);
        let av = Availability::new(&pieces);
        assert_eq!(av.first_missing(ChunkRange { first: 1, last: 3 }), 1);
    }

    #[test]
    fn out_of_range_and_pre_metadata_chunks_are_absent() {
        let pieces = bits(&[1, 1]);
        let av = Availability::new(&pieces);
        assert!(av.is_present(1));
        assert!(!av.is_present(2));
        assert!(!Availability::from_status(None).is_present(0));
    }

    #[test]
    fn completed_pieces_counts_up_to_first_gap() {
        let pieces = bits(&[1, 1, 0, 1]);
        let av = Availability::new(&pieces);
        assert_eq!(av.completed_pieces(ChunkRange { first: 0, last: 4 }), 2);
        // Fully present entry whose range overlaps a present neighbour chunk stays capped.
        let pieces = bits(&[1, 1, 1, 1]);
        let av = Availability::new(&pieces);
        assert_eq!(av.completed_pieces(ChunkRange { first: 0, last: 3 }), 3);
    }
}
