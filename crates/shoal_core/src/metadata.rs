use crate::clock::now_ms;
use crate::lengths::Lengths;

/// Marker hash for metadata derived from on-disk chunks alone. Replaced by
/// the real digest when the file is first assembled and verified.
pub const HASH_PENDING: &str = "pending-verification";

/// Everything a peer knows about one shared file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub file_name: String,
    pub file_size: u64,
    pub total_chunks: u32,
    /// Hex-encoded SHA-256 of the original byte stream.
    pub file_hash: String,
    pub created_at: u64,
}

impl FileMetadata {
    pub fn new(file_name: String, file_size: u64, file_hash: String) -> anyhow::Result<Self> {
        let lengths = Lengths::new(file_size)?;
        Ok(Self {
            file_name,
            file_size,
            total_chunks: lengths.total_chunks(),
            file_hash,
            created_at: now_ms(),
        })
    }

    pub fn lengths(&self) -> anyhow::Result<Lengths> {
        Lengths::new(self.file_size)
    }

    pub fn hash_is_pending(&self) -> bool {
        self.file_hash == HASH_PENDING
    }
}

/// On-disk stem for a shared file name: anything that is not alphanumeric,
/// `.` or `-` becomes `_`. Distinct names may collide; the store rejects the
/// second one.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::CHUNK_SIZE;

    #[test]
    fn test_total_chunks_derived() {
        let m = FileMetadata::new("a.bin".into(), CHUNK_SIZE as u64 * 2 + 1, "00".into()).unwrap();
        assert_eq!(m.total_chunks, 3);
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize_file_name("doc.txt"), "doc.txt");
        assert_eq!(sanitize_file_name("a b.txt"), "a_b.txt");
        assert_eq!(sanitize_file_name("x/y\\z:1?.bin"), "x_y_z_1_.bin");
        assert_eq!(sanitize_file_name("ünïcode.txt"), "_n_code.txt");
    }
}
