use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use shoal_core::FileMetadata;
use shoal_core::constants::CHUNK_SIZE;
use shoal_core::metadata::{HASH_PENDING, sanitize_file_name};
use shoal_tracker_comms::{FileSet, InventorySource};
use tracing::{debug, info, warn};

const CHUNKS_DIR: &str = "chunks";
const METADATA_DIR: &str = "metadata";
const CHUNK_SUFFIX: &str = ".chunks";
const META_SUFFIX: &str = ".meta";

/// The local source of truth for shared content. Owns the on-disk chunk and
/// metadata files exclusively; every other component goes through these
/// operations, never raw file handles.
///
/// Layout under the shared folder:
///   `<shared>/<file>`                       completed, user-visible files
///   `<shared>/chunks/<safe>_<index>.chunks` binary chunks
///   `<shared>/metadata/<safe>.meta`         key=value metadata
pub struct ChunkStore {
    shared_dir: PathBuf,
    chunks_dir: PathBuf,
    metadata_dir: PathBuf,

    metadata: DashMap<String, FileMetadata>,
    available: DashMap<String, BTreeSet<u32>>,

    // Sanitized stem -> owning file name. Two distinct names that sanitize
    // the same way would share chunk files; the second one is rejected.
    stems: DashMap<String, String>,

    // One assembly at a time per file; two completing writers must not
    // interleave on the same temporary.
    assembly_locks: DashMap<String, Arc<parking_lot::Mutex<()>>>,
}

#[derive(Debug, Clone)]
pub struct FileStatus {
    pub file_name: String,
    pub metadata: Option<FileMetadata>,
    pub available: BTreeSet<u32>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StoreTotals {
    pub files: u32,
    pub chunks: u32,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct PartialReport {
    pub partial_path: PathBuf,
    pub info_path: PathBuf,
    pub total_chunks: u32,
    pub available_chunks: u32,
    pub missing: Vec<u32>,
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

// Readers never observe a torn file: write the whole thing next to the
// target, then rename.
fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let tmp = tmp_path(path);
    std::fs::write(&tmp, data).with_context(|| format!("error writing {tmp:?}"))?;
    std::fs::rename(&tmp, path).with_context(|| format!("error renaming {tmp:?} to {path:?}"))?;
    Ok(())
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Parses `<stem>_<index>.chunks` back into its parts.
fn parse_chunk_file_name(name: &str) -> Option<(&str, u32)> {
    let name = name.strip_suffix(CHUNK_SUFFIX)?;
    let (stem, index) = name.rsplit_once('_')?;
    Some((stem, index.parse().ok()?))
}

impl ChunkStore {
    /// Opens (and creates if needed) the shared folder, then rebuilds the
    /// in-memory indices from whatever is on disk.
    pub fn new(shared_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let shared_dir = shared_dir.into();
        std::fs::create_dir_all(&shared_dir)
            .with_context(|| format!("unable to create shared folder {shared_dir:?}"))?;
        let store = Self {
            chunks_dir: shared_dir.join(CHUNKS_DIR),
            metadata_dir: shared_dir.join(METADATA_DIR),
            shared_dir,
            metadata: Default::default(),
            available: Default::default(),
            stems: Default::default(),
            assembly_locks: Default::default(),
        };
        store.load()?;
        Ok(store)
    }

    pub fn shared_dir(&self) -> &Path {
        &self.shared_dir
    }

    fn chunk_path(&self, stem: &str, index: u32) -> PathBuf {
        self.chunks_dir.join(format!("{stem}_{index}{CHUNK_SUFFIX}"))
    }

    fn meta_path(&self, stem: &str) -> PathBuf {
        self.metadata_dir.join(format!("{stem}{META_SUFFIX}"))
    }

    fn stem_for(&self, file_name: &str) -> String {
        sanitize_file_name(file_name)
    }

    /// Registers the stem for `file_name`, refusing a sanitization collision
    /// with a different file.
    fn claim_stem(&self, file_name: &str) -> anyhow::Result<String> {
        let stem = self.stem_for(file_name);
        let owner = self
            .stems
            .entry(stem.clone())
            .or_insert_with(|| file_name.to_string());
        if owner.value() != file_name {
            bail!(
                "file name {file_name:?} collides with {:?} on disk (both sanitize to {stem:?})",
                owner.value()
            );
        }
        Ok(stem)
    }

    // Metadata dir first, then the chunk dir to rebuild availability.
    fn load(&self) -> anyhow::Result<()> {
        if let Ok(entries) = std::fs::read_dir(&self.metadata_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("meta") {
                    continue;
                }
                match parse_metadata_file(&path) {
                    Ok(meta) => {
                        self.stems
                            .insert(self.stem_for(&meta.file_name), meta.file_name.clone());
                        self.available.entry(meta.file_name.clone()).or_default();
                        self.metadata.insert(meta.file_name.clone(), meta);
                    }
                    Err(e) => warn!(?path, "skipping unreadable metadata: {e:#}"),
                }
            }
        }

        if let Ok(entries) = std::fs::read_dir(&self.chunks_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                let Some((stem, index)) = parse_chunk_file_name(name) else {
                    continue;
                };
                // A stem with no metadata is a download interrupted before
                // its metadata arrived; track it under the stem itself.
                let file_name = self
                    .stems
                    .entry(stem.to_string())
                    .or_insert_with(|| stem.to_string())
                    .clone();
                if let Some(meta) = self.metadata.get(&file_name) {
                    if index >= meta.total_chunks {
                        warn!(%file_name, index, "ignoring out-of-range chunk file");
                        continue;
                    }
                }
                self.available.entry(file_name).or_default().insert(index);
            }
        }

        let files = self.metadata.len();
        if files > 0 {
            info!(files, "loaded chunk store state");
        }
        Ok(())
    }

    /// Splits a local file into chunks and registers it for sharing.
    /// Returns `None` when the file is already ingested at this size.
    pub fn ingest(&self, path: &Path) -> anyhow::Result<Option<FileMetadata>> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("file name of {path:?} is not valid utf-8"))?
            .to_string();

        let file = std::fs::File::open(path).with_context(|| format!("error opening {path:?}"))?;
        let attr = file
            .metadata()
            .with_context(|| format!("error reading attributes of {path:?}"))?;
        if !attr.is_file() {
            bail!("{path:?} is not a regular file");
        }
        if attr.len() == 0 {
            debug!(?path, "skipping empty file");
            return Ok(None);
        }
        if let Some(existing) = self.metadata.get(&file_name) {
            if existing.file_size == attr.len() {
                debug!(%file_name, "already ingested at this size");
                return Ok(None);
            }
        }

        let stem = self.claim_stem(&file_name)?;
        std::fs::create_dir_all(&self.chunks_dir)
            .with_context(|| format!("unable to create {:?}", self.chunks_dir))?;
        self.remove_chunk_files(&stem);

        let mut reader = std::io::BufReader::new(file);
        let mut buf = vec![0u8; CHUNK_SIZE as usize];
        let mut hasher = Sha256::new();
        let mut total_bytes = 0u64;
        let mut index = 0u32;
        let mut chunks = BTreeSet::new();
        loop {
            let n = read_full(&mut reader, &mut buf)
                .with_context(|| format!("error reading {path:?}"))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            write_atomic(&self.chunk_path(&stem, index), &buf[..n])?;
            chunks.insert(index);
            total_bytes += n as u64;
            index += 1;
        }
        if total_bytes == 0 {
            return Ok(None);
        }

        let meta = FileMetadata::new(file_name.clone(), total_bytes, hex::encode(hasher.finalize()))?;
        self.persist_metadata(&meta)?;
        self.available.insert(file_name.clone(), chunks);
        self.metadata.insert(file_name.clone(), meta.clone());
        info!(
            %file_name,
            size = total_bytes,
            chunks = meta.total_chunks,
            "ingested file"
        );
        Ok(Some(meta))
    }

    /// Adopts metadata learned from elsewhere (FILE_INFO from a source peer,
    /// or derived from chunks).
    pub fn put_metadata(&self, meta: FileMetadata) -> anyhow::Result<()> {
        self.claim_stem(&meta.file_name)?;
        self.persist_metadata(&meta)?;
        self.available.entry(meta.file_name.clone()).or_default();
        self.metadata.insert(meta.file_name.clone(), meta);
        Ok(())
    }

    /// Writes one chunk (last writer wins) and returns whether the file is
    /// now complete. A completing write triggers reconstruction.
    pub fn save_chunk(&self, file_name: &str, index: u32, data: &[u8]) -> anyhow::Result<bool> {
        if let Some(meta) = self.metadata.get(file_name) {
            let lengths = meta.lengths()?;
            let valid = lengths.try_validate_chunk_index(index)?;
            if data.len() as u32 != lengths.chunk_size(valid) {
                bail!(
                    "chunk {index} of {file_name:?} has {} bytes, expected {}",
                    data.len(),
                    lengths.chunk_size(valid)
                );
            }
        }
        let stem = self.claim_stem(file_name)?;
        std::fs::create_dir_all(&self.chunks_dir)
            .with_context(|| format!("unable to create {:?}", self.chunks_dir))?;
        write_atomic(&self.chunk_path(&stem, index), data)?;

        let completed = {
            let mut set = self.available.entry(file_name.to_string()).or_default();
            set.insert(index);
            match self.metadata.get(file_name) {
                Some(meta) => set.len() as u32 == meta.total_chunks,
                None => false,
            }
        };
        if completed {
            self.reconstruct(file_name)?;
        }
        Ok(completed)
    }

    /// Reads one chunk. Absent means "don't have it", including read errors.
    pub fn load_chunk(&self, file_name: &str, index: u32) -> Option<Vec<u8>> {
        if !self.has_chunk(file_name, index) {
            return None;
        }
        let stem = self.stem_for(file_name);
        match std::fs::read(self.chunk_path(&stem, index)) {
            Ok(data) => Some(data),
            Err(e) => {
                warn!(file_name, index, "error reading chunk: {e:#}");
                None
            }
        }
    }

    pub fn has_chunk(&self, file_name: &str, index: u32) -> bool {
        if let Some(meta) = self.metadata.get(file_name) {
            if index >= meta.total_chunks {
                return false;
            }
        }
        self.available
            .get(file_name)
            .map(|set| set.contains(&index))
            .unwrap_or(false)
    }

    pub fn available(&self, file_name: &str) -> BTreeSet<u32> {
        self.available
            .get(file_name)
            .map(|set| set.clone())
            .unwrap_or_default()
    }

    pub fn metadata(&self, file_name: &str) -> Option<FileMetadata> {
        self.metadata.get(file_name).map(|m| m.clone())
    }

    /// Inventory for tracker announces: every known file with the chunks we
    /// hold right now.
    pub fn all_files(&self) -> BTreeMap<String, BTreeSet<u32>> {
        self.available
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn list(&self) -> Vec<FileStatus> {
        let mut names: BTreeSet<String> = self.available.iter().map(|e| e.key().clone()).collect();
        names.extend(self.metadata.iter().map(|e| e.key().clone()));
        names
            .into_iter()
            .map(|file_name| FileStatus {
                metadata: self.metadata(&file_name),
                available: self.available(&file_name),
                file_name,
            })
            .collect()
    }

    pub fn totals(&self) -> StoreTotals {
        let mut totals = StoreTotals::default();
        for entry in self.available.iter() {
            totals.files += 1;
            totals.chunks += entry.value().len() as u32;
            let lengths = self
                .metadata
                .get(entry.key())
                .and_then(|m| m.lengths().ok());
            for &index in entry.value() {
                totals.bytes += match &lengths {
                    Some(l) => l
                        .validate_chunk_index(index)
                        .map(|i| l.chunk_size(i) as u64)
                        .unwrap_or(0),
                    None => CHUNK_SIZE as u64,
                };
            }
        }
        totals
    }

    /// Assembles the completed file next to its chunks, verifying the hash
    /// on the way. A file that is already assembled is a no-op success; a
    /// digest mismatch removes the temporary and fails.
    pub fn reconstruct(&self, file_name: &str) -> anyhow::Result<PathBuf> {
        let meta = self
            .metadata(file_name)
            .with_context(|| format!("no metadata for {file_name:?}"))?;
        let lock = self
            .assembly_locks
            .entry(file_name.to_string())
            .or_default()
            .clone();
        let _assembly = lock.lock();
        let target = self.shared_dir.join(file_name);
        if target.exists() {
            return Ok(target);
        }
        let missing = meta.total_chunks as usize - self.available(file_name).len();
        if missing > 0 {
            bail!("{file_name:?} is missing {missing} chunks");
        }

        let tmp = tmp_path(&target);
        let computed = match self.assemble(&meta, &tmp) {
            Ok(hash) => hash,
            Err(e) => {
                let _ = std::fs::remove_file(&tmp);
                return Err(e);
            }
        };

        if meta.hash_is_pending() {
            // First assembly of a download that never saw authoritative
            // metadata: adopt the computed digest.
            let mut meta = meta;
            meta.file_hash = computed;
            self.persist_metadata(&meta)?;
            self.metadata.insert(file_name.to_string(), meta);
        } else if computed != meta.file_hash {
            let _ = std::fs::remove_file(&tmp);
            bail!(
                "hash mismatch for {file_name:?}: expected {} got {computed}",
                meta.file_hash
            );
        }

        std::fs::rename(&tmp, &target)
            .with_context(|| format!("error renaming {tmp:?} to {target:?}"))?;
        info!(file_name, "reconstructed file");
        Ok(target)
    }

    fn assemble(&self, meta: &FileMetadata, tmp: &Path) -> anyhow::Result<String> {
        let stem = self.stem_for(&meta.file_name);
        let lengths = meta.lengths()?;
        let file =
            std::fs::File::create(tmp).with_context(|| format!("error creating {tmp:?}"))?;
        let mut writer = std::io::BufWriter::new(file);
        let mut hasher = Sha256::new();
        for info in lengths.iter_chunk_infos() {
            let path = self.chunk_path(&stem, info.index.get());
            let data = std::fs::read(&path).with_context(|| format!("error reading {path:?}"))?;
            if data.len() as u32 != info.size {
                bail!(
                    "chunk {} of {:?} has {} bytes, expected {}",
                    info.index,
                    meta.file_name,
                    data.len(),
                    info.size
                );
            }
            hasher.update(&data);
            writer
                .write_all(&data)
                .with_context(|| format!("error writing {tmp:?}"))?;
        }
        writer.flush().with_context(|| format!("error flushing {tmp:?}"))?;
        Ok(hex::encode(hasher.finalize()))
    }

    /// Derives metadata from on-disk chunks alone when nothing better is
    /// known. The hash stays pending until the file is first assembled.
    pub fn ensure_metadata(&self, file_name: &str) -> anyhow::Result<FileMetadata> {
        if let Some(meta) = self.metadata(file_name) {
            return Ok(meta);
        }
        let chunks = self.available(file_name);
        let last = *chunks
            .iter()
            .next_back()
            .with_context(|| format!("no chunks of {file_name:?} on disk"))?;
        let stem = self.stem_for(file_name);
        // The highest chunk we hold bounds the size; if it isn't the true
        // last chunk the size is an estimate until real metadata arrives.
        let last_len = std::fs::metadata(self.chunk_path(&stem, last))
            .map(|m| m.len())
            .unwrap_or(CHUNK_SIZE as u64);
        let file_size = last as u64 * CHUNK_SIZE as u64 + last_len;
        let meta = FileMetadata::new(file_name.to_string(), file_size, HASH_PENDING.to_string())?;
        self.put_metadata(meta.clone())?;
        Ok(meta)
    }

    /// Renders an incomplete file as `<file>.partial` with missing chunks
    /// zero-filled, plus a `.partial.info` summary.
    pub fn reconstruct_partial(&self, file_name: &str) -> anyhow::Result<PartialReport> {
        let meta = self.ensure_metadata(file_name)?;
        let lengths = meta.lengths()?;
        let stem = self.stem_for(file_name);
        let chunks = self.available(file_name);

        let partial_path = self.shared_dir.join(format!("{file_name}.partial"));
        let info_path = self.shared_dir.join(format!("{file_name}.partial.info"));

        let tmp = tmp_path(&partial_path);
        let mut missing = Vec::new();
        {
            let file =
                std::fs::File::create(&tmp).with_context(|| format!("error creating {tmp:?}"))?;
            let mut writer = std::io::BufWriter::new(file);
            for info in lengths.iter_chunk_infos() {
                let index = info.index.get();
                let data = if chunks.contains(&index) {
                    self.load_chunk(file_name, index)
                } else {
                    None
                };
                match data {
                    Some(data) if data.len() as u32 == info.size => writer.write_all(&data),
                    _ => {
                        missing.push(index);
                        writer.write_all(&vec![0u8; info.size as usize])
                    }
                }
                .with_context(|| format!("error writing {tmp:?}"))?;
            }
            writer.flush().with_context(|| format!("error flushing {tmp:?}"))?;
        }
        std::fs::rename(&tmp, &partial_path)
            .with_context(|| format!("error renaming {tmp:?}"))?;

        let available_chunks = meta.total_chunks - missing.len() as u32;
        let percentage = available_chunks as u64 * 100 / meta.total_chunks as u64;
        let missing_list = missing
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let info = format!(
            "fileName={}\nfileSize={}\ntotalChunks={}\navailableChunks={}\npercentage={}\noriginalHash={}\nmissingChunks={}\n",
            meta.file_name,
            meta.file_size,
            meta.total_chunks,
            available_chunks,
            percentage,
            meta.file_hash,
            missing_list
        );
        write_atomic(&info_path, info.as_bytes())?;
        info!(
            file_name,
            available_chunks,
            total = meta.total_chunks,
            "wrote partial file"
        );
        Ok(PartialReport {
            partial_path,
            info_path,
            total_chunks: meta.total_chunks,
            available_chunks,
            missing,
        })
    }

    /// Forgets a file: chunk files, metadata file, in-memory state.
    pub fn delete(&self, file_name: &str) -> anyhow::Result<()> {
        let stem = self.stem_for(file_name);
        self.remove_chunk_files(&stem);
        let meta_path = self.meta_path(&stem);
        if meta_path.exists() {
            std::fs::remove_file(&meta_path)
                .with_context(|| format!("error removing {meta_path:?}"))?;
        }
        self.metadata.remove(file_name);
        self.available.remove(file_name);
        self.stems.remove(&stem);
        self.assembly_locks.remove(file_name);
        Ok(())
    }

    fn remove_chunk_files(&self, stem: &str) {
        let Ok(entries) = std::fs::read_dir(&self.chunks_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if matches!(parse_chunk_file_name(name), Some((s, _)) if s == stem) {
                if let Err(e) = std::fs::remove_file(entry.path()) {
                    warn!(name, "error removing chunk file: {e:#}");
                }
            }
        }
    }

    fn persist_metadata(&self, meta: &FileMetadata) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.metadata_dir)
            .with_context(|| format!("unable to create {:?}", self.metadata_dir))?;
        let stem = self.stem_for(&meta.file_name);
        let text = format!(
            "fileName={}\nfileSize={}\ntotalChunks={}\nfileHash={}\ncreatedAt={}\n",
            meta.file_name, meta.file_size, meta.total_chunks, meta.file_hash, meta.created_at
        );
        write_atomic(&self.meta_path(&stem), text.as_bytes())
    }
}

fn parse_metadata_file(path: &Path) -> anyhow::Result<FileMetadata> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("error reading {path:?}"))?;
    let mut fields = BTreeMap::new();
    for line in text.lines() {
        if let Some((key, value)) = line.split_once('=') {
            fields.insert(key.trim(), value.trim());
        }
    }
    let get = |key: &str| {
        fields
            .get(key)
            .copied()
            .with_context(|| format!("{path:?} is missing {key}"))
    };
    Ok(FileMetadata {
        file_name: get("fileName")?.to_string(),
        file_size: get("fileSize")?.parse().context("bad fileSize")?,
        total_chunks: get("totalChunks")?.parse().context("bad totalChunks")?,
        file_hash: get("fileHash")?.to_string(),
        created_at: get("createdAt")?.parse().context("bad createdAt")?,
    })
}

impl InventorySource for ChunkStore {
    fn all_files(&self) -> FileSet {
        ChunkStore::all_files(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_core::sha256::{file_sha256_hex, sha256_hex};

    fn make_store() -> (tempfile::TempDir, ChunkStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(dir.path().join("shared")).unwrap();
        (dir, store)
    }

    fn test_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn write_shared_file(store: &ChunkStore, name: &str, data: &[u8]) -> PathBuf {
        let path = store.shared_dir().join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn test_ingest_then_reconstruct_identity() {
        let (_dir, store) = make_store();
        let data = test_bytes(CHUNK_SIZE as usize * 2 + 12345);
        let path = write_shared_file(&store, "doc.bin", &data);

        let meta = store.ingest(&path).unwrap().unwrap();
        assert_eq!(meta.total_chunks, 3);
        assert_eq!(meta.file_hash, sha256_hex(&data));
        assert_eq!(store.available("doc.bin").len(), 3);

        // Remove the visible file; the chunks must be able to bring it back.
        std::fs::remove_file(&path).unwrap();
        let restored = store.reconstruct("doc.bin").unwrap();
        assert_eq!(std::fs::read(restored).unwrap(), data);
    }

    #[test]
    fn test_ingest_duplicate_suppressed() {
        let (_dir, store) = make_store();
        let path = write_shared_file(&store, "a.bin", &test_bytes(1000));
        assert!(store.ingest(&path).unwrap().is_some());
        assert!(store.ingest(&path).unwrap().is_none());
    }

    #[test]
    fn test_sanitize_collision_rejected() {
        let (_dir, store) = make_store();
        let first = write_shared_file(&store, "a b.txt", &test_bytes(100));
        let second = write_shared_file(&store, "a_b.txt", &test_bytes(200));
        assert!(store.ingest(&first).unwrap().is_some());
        assert!(store.ingest(&second).is_err());
    }

    #[test]
    fn test_save_chunk_is_idempotent_and_completes() {
        let (_dir, store) = make_store();
        let data = test_bytes(CHUNK_SIZE as usize + 7);
        let meta =
            FileMetadata::new("dl.bin".to_string(), data.len() as u64, sha256_hex(&data)).unwrap();
        store.put_metadata(meta).unwrap();

        assert!(!store
            .save_chunk("dl.bin", 0, &data[..CHUNK_SIZE as usize])
            .unwrap());
        assert!(!store
            .save_chunk("dl.bin", 0, &data[..CHUNK_SIZE as usize])
            .unwrap());
        assert_eq!(store.available("dl.bin").len(), 1);

        // The completing write assembles the file.
        assert!(store
            .save_chunk("dl.bin", 1, &data[CHUNK_SIZE as usize..])
            .unwrap());
        let target = store.shared_dir().join("dl.bin");
        assert_eq!(std::fs::read(target).unwrap(), data);
    }

    #[test]
    fn test_save_chunk_out_of_range_rejected() {
        let (_dir, store) = make_store();
        let data = test_bytes(100);
        let meta =
            FileMetadata::new("s.bin".to_string(), data.len() as u64, sha256_hex(&data)).unwrap();
        store.put_metadata(meta).unwrap();
        assert!(store.save_chunk("s.bin", 5, &data).is_err());
        assert!(!store.has_chunk("s.bin", 5));
    }

    #[test]
    fn test_reconstruct_is_idempotent() {
        let (_dir, store) = make_store();
        let data = test_bytes(4096);
        let path = write_shared_file(&store, "x.bin", &data);
        store.ingest(&path).unwrap();
        store.reconstruct("x.bin").unwrap();
        store.reconstruct("x.bin").unwrap();
        assert_eq!(std::fs::read(path).unwrap(), data);
    }

    #[test]
    fn test_tampered_chunk_fails_reconstruction() {
        let (_dir, store) = make_store();
        let data = test_bytes(CHUNK_SIZE as usize + 500);
        let path = write_shared_file(&store, "t.bin", &data);
        store.ingest(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        // Corrupt one byte of the second chunk, keeping its length.
        let chunk_path = store.chunk_path("t.bin", 1);
        let mut chunk = std::fs::read(&chunk_path).unwrap();
        chunk[0] ^= 0xff;
        std::fs::write(&chunk_path, &chunk).unwrap();

        assert!(store.reconstruct("t.bin").is_err());
        assert!(!store.shared_dir().join("t.bin").exists());
        assert!(!store.shared_dir().join("t.bin.tmp").exists());
    }

    #[test]
    fn test_partial_reconstruction() {
        let (_dir, store) = make_store();
        let data = test_bytes(CHUNK_SIZE as usize * 2 + 100);
        let meta =
            FileMetadata::new("p.bin".to_string(), data.len() as u64, sha256_hex(&data)).unwrap();
        store.put_metadata(meta).unwrap();
        store
            .save_chunk("p.bin", 0, &data[..CHUNK_SIZE as usize])
            .unwrap();
        store
            .save_chunk("p.bin", 2, &data[2 * CHUNK_SIZE as usize..])
            .unwrap();

        let report = store.reconstruct_partial("p.bin").unwrap();
        assert_eq!(report.missing, vec![1]);
        assert_eq!(report.available_chunks, 2);

        let partial = std::fs::read(&report.partial_path).unwrap();
        assert_eq!(partial.len(), data.len());
        assert_eq!(&partial[..CHUNK_SIZE as usize], &data[..CHUNK_SIZE as usize]);
        // The missing middle chunk is zero-filled.
        assert!(partial[CHUNK_SIZE as usize..2 * CHUNK_SIZE as usize]
            .iter()
            .all(|&b| b == 0));

        let info = std::fs::read_to_string(&report.info_path).unwrap();
        assert!(info.contains("missingChunks=1"));
        assert!(info.contains("totalChunks=3"));
    }

    #[test]
    fn test_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let shared = dir.path().join("shared");
        let data = test_bytes(CHUNK_SIZE as usize + 1);
        let (name, hash) = {
            let store = ChunkStore::new(&shared).unwrap();
            let path = store.shared_dir().join("keep.bin");
            std::fs::write(&path, &data).unwrap();
            let meta = store.ingest(&path).unwrap().unwrap();
            (meta.file_name, meta.file_hash)
        };

        let store = ChunkStore::new(&shared).unwrap();
        let meta = store.metadata(&name).unwrap();
        assert_eq!(meta.file_hash, hash);
        assert_eq!(store.available(&name).len(), 2);
        assert!(store.has_chunk(&name, 0));
        assert!(store.has_chunk(&name, 1));
        assert!(!store.has_chunk(&name, 2));
    }

    #[test]
    fn test_delete_removes_everything() {
        let (_dir, store) = make_store();
        let data = test_bytes(2000);
        let path = write_shared_file(&store, "gone.bin", &data);
        store.ingest(&path).unwrap();
        store.delete("gone.bin").unwrap();
        assert!(store.metadata("gone.bin").is_none());
        assert!(store.available("gone.bin").is_empty());
        assert!(store.load_chunk("gone.bin", 0).is_none());
    }

    #[test]
    fn test_pending_hash_adopted_on_reconstruct() {
        let (_dir, store) = make_store();
        let data = test_bytes(CHUNK_SIZE as usize + 9);
        store
            .save_chunk("mystery.bin", 0, &data[..CHUNK_SIZE as usize])
            .unwrap();
        store
            .save_chunk("mystery.bin", 1, &data[CHUNK_SIZE as usize..])
            .unwrap();
        let meta = store.ensure_metadata("mystery.bin").unwrap();
        assert!(meta.hash_is_pending());

        store.reconstruct("mystery.bin").unwrap();
        let meta = store.metadata("mystery.bin").unwrap();
        assert_eq!(meta.file_hash, sha256_hex(&data));
        assert_eq!(
            file_sha256_hex(&store.shared_dir().join("mystery.bin")).unwrap(),
            meta.file_hash
        );
    }

    #[test]
    fn test_chunk_file_name_parsing() {
        assert_eq!(parse_chunk_file_name("doc.txt_3.chunks"), Some(("doc.txt", 3)));
        assert_eq!(parse_chunk_file_name("a_b_10.chunks"), Some(("a_b", 10)));
        assert_eq!(parse_chunk_file_name("noindex.chunks"), None);
        assert_eq!(parse_chunk_file_name("doc.txt_3.meta"), None);
    }
}
