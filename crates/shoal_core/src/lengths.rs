use anyhow::Context;

use crate::constants::CHUNK_SIZE;

pub fn last_element_size(total_length: u64, chunk_length: u64) -> u64 {
    let rem = total_length % chunk_length;
    if rem == 0 {
        return chunk_length;
    }
    rem
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValidChunkIndex(u32);

impl std::fmt::Display for ValidChunkIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::fmt::Debug for ValidChunkIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl ValidChunkIndex {
    pub const fn get(&self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    pub index: ValidChunkIndex,
    pub size: u32,

    // Offset of the chunk in bytes within the file.
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lengths {
    // The total length of the file in bytes.
    file_size: u64,

    // The id and length of the last chunk (which may be truncated).
    last_chunk_id: u32,
    last_chunk_size: u32,
}

impl Lengths {
    pub fn new(file_size: u64) -> anyhow::Result<Self> {
        if file_size == 0 {
            anyhow::bail!("file with 0 length is useless")
        }
        let total_chunks = file_size.div_ceil(CHUNK_SIZE as u64) as u32;
        Ok(Self {
            file_size,
            last_chunk_id: total_chunks - 1,
            last_chunk_size: last_element_size(file_size, CHUNK_SIZE as u64) as u32,
        })
    }

    pub const fn file_size(&self) -> u64 {
        self.file_size
    }

    pub const fn total_chunks(&self) -> u32 {
        self.last_chunk_id + 1
    }

    pub const fn last_chunk_id(&self) -> ValidChunkIndex {
        ValidChunkIndex(self.last_chunk_id)
    }

    pub const fn default_chunk_size(&self) -> u32 {
        CHUNK_SIZE
    }

    pub const fn validate_chunk_index(&self, index: u32) -> Option<ValidChunkIndex> {
        if index > self.last_chunk_id {
            return None;
        }
        Some(ValidChunkIndex(index))
    }

    pub fn try_validate_chunk_index(&self, index: u32) -> anyhow::Result<ValidChunkIndex> {
        self.validate_chunk_index(index)
            .with_context(|| format!("invalid chunk index {index}"))
    }

    pub const fn chunk_size(&self, index: ValidChunkIndex) -> u32 {
        if index.0 == self.last_chunk_id {
            return self.last_chunk_size;
        }
        CHUNK_SIZE
    }

    pub const fn chunk_offset(&self, index: ValidChunkIndex) -> u64 {
        index.0 as u64 * CHUNK_SIZE as u64
    }

    pub fn iter_chunk_infos(&self) -> impl Iterator<Item = ChunkInfo> + '_ {
        (0..self.total_chunks()).map(move |idx| {
            let index = ValidChunkIndex(idx);
            ChunkInfo {
                index,
                size: self.chunk_size(index),
                offset: self.chunk_offset(index),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_length_rejected() {
        assert!(Lengths::new(0).is_err());
    }

    #[test]
    fn test_single_short_chunk() {
        let l = Lengths::new(1).unwrap();
        assert_eq!(l.total_chunks(), 1);
        assert_eq!(l.chunk_size(l.last_chunk_id()), 1);
    }

    #[test]
    fn test_exact_multiple() {
        let l = Lengths::new(CHUNK_SIZE as u64 * 3).unwrap();
        assert_eq!(l.total_chunks(), 3);
        assert_eq!(l.chunk_size(l.last_chunk_id()), CHUNK_SIZE);
        assert_eq!(l.validate_chunk_index(3), None);
    }

    #[test]
    fn test_truncated_last_chunk() {
        // 2,500,000 bytes: two full chunks plus a remainder.
        let l = Lengths::new(2_500_000).unwrap();
        assert_eq!(l.total_chunks(), 3);
        assert_eq!(l.chunk_size(l.validate_chunk_index(0).unwrap()), CHUNK_SIZE);
        assert_eq!(l.chunk_size(l.validate_chunk_index(1).unwrap()), CHUNK_SIZE);
        assert_eq!(
            l.chunk_size(l.last_chunk_id()),
            2_500_000 - 2 * CHUNK_SIZE
        );
    }

    #[test]
    fn test_chunk_infos() {
        let l = Lengths::new(CHUNK_SIZE as u64 + 1).unwrap();
        let infos = l.iter_chunk_infos().collect::<Vec<_>>();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].size, CHUNK_SIZE);
        assert_eq!(infos[0].offset, 0);
        assert_eq!(infos[1].size, 1);
        assert_eq!(infos[1].offset, CHUNK_SIZE as u64);
    }

    #[test]
    fn test_offsets_cover_file() {
        for size in [1u64, 999, CHUNK_SIZE as u64, CHUNK_SIZE as u64 * 2 + 12345] {
            let l = Lengths::new(size).unwrap();
            let covered: u64 = l.iter_chunk_infos().map(|c| c.size as u64).sum();
            assert_eq!(covered, size);
        }
    }
}
