use crate::engine::FileEntry;

/// Chunk span of one file entry: `first = offset / chunk`, `last = first + ceil(size / chunk)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub first: u32,
    pub last: u32,
}

impl ChunkRange {
    /// Chunk count reported for the entry; a zero-size entry still counts as one.
    pub fn total_pieces(&self) -> u32 {
        (self.last - self.first).max(1)
    }
}

/// Maps a file-relative byte offset to `(chunk index, offset inside that chunk)`.
pub fn chunk_of(entry_offset: u64, byte_offset: u64, chunk_size: u64) -> (u32, u64) {
    let absolute = entry_offset + byte_offset;
    ((absolute / chunk_size) as u32, absolute % chunk_size)
}

pub fn range_of(entry: &FileEntry, chunk_size: u64) -> ChunkRange {
    let first = (entry.offset / chunk_size) as u32;
    let last = first + entry.size.div_ceil(chunk_size) as u32;
    ChunkRange { first, last }
}

/// Inclusive chunk span holding bytes `[start, start + len)` of the entry. `len` must be > 0.
pub fn chunks_for_bytes(entry_offset: u64, start: u64, len: u64, chunk_size: u64) -> (u32, u32) {
    let (first, _) = chunk_of(entry_offset, start, chunk_size);
    let (last, _) = chunk_of(entry_offset, start + len - 1, chunk_size);
    (first, last)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(offset: u64, size: u64) -> FileEntry {
        FileEntry {
            path: "f".to_string(),
            size,
            offset,
            mtime: 0,
        }
    }

    #[test]
    fn chunk_of_reconstructs_original_offset() {
        for chunk in [1u64, 7, 16_384, 262_144] {
            for entry_offset in [0u64, 3, 16_383, 1_000_000] {
                for offset in [0u64, 1, 99, 16_384, 5_000_001] {
                    let (idx, local) = chunk_of(entry_offset, offset, chunk);
                    assert!(local < chunk);
                    assert_eq!(idx as u64 * chunk + local, entry_offset + offset);
                }
            }
        }
    }

    #[test]
    fn range_of_rounds_size_up_to_whole_chunks() {
        assert_eq!(
            range_of(&entry(0, 40_000), 16_384),
            ChunkRange { first: 0, last: 3 }
        );
        assert_eq!(
            range_of(&entry(16_384, 16_384), 16_384),
            ChunkRange { first: 1, last: 2 }
        );
        assert_eq!(
            range_of(&entry(20_000, 100), 16_384),
            ChunkRange { first: 1, last: 2 }
        );
    }

    #[test]
    fn zero_size_entry_collapses_but_counts_one_piece() {
        let range = range_of(&entry(50_000, 0), 16_384);
        assert_eq!(range.first, range.last);
        assert_eq!(range.total_pieces(), 1);
    }

    #[test]
    fn byte_span_can_straddle_a_chunk_boundary() {
        assert_eq!(chunks_for_bytes(0, 0, 100, 16_384), (0, 0));
        assert_eq!(chunks_for_bytes(0, 16_300, 100, 16_384), (0, 1));
        assert_eq!(chunks_for_bytes(1_000, 15_384, 1, 16_384), (1, 1));
    }
}
