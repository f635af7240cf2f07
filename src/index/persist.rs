//! On-disk form of the index store.
//!
//! Layout under the index directory:
//!
//! - `manifest.json`: generation, checksums of the four artifacts, encoder signature
//! - `visual.<gen>.bin`, `text.<gen>.bin`: vector files
//! - `metadata.<gen>.json`: one record per video
//! - `keywords.<gen>.json`: the keyword index
//!
//! A save writes a complete new generation next to the old one, then swaps
//! the manifest with a rename. Readers only ever follow the manifest, so
//! they see either the old set or the new one.
//!
//! Vector file header (47 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 of modality name + encoder signature)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Entries (repeated, ascending id):
//! - video_id: u64 (little-endian)
//! - embedding: [f32; dimensions] (little-endian)

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{IndexStore, KeywordIndex, VectorIndex, VideoId, VideoRecord};

/// Current vector file format version
const FORMAT_VERSION: u8 = 1;

/// Current manifest version. 2 added frame timestamps to captions and
/// stemmed keyword terms.
const MANIFEST_VERSION: u32 = 2;

/// Header size in bytes: version(1) + model_id(32) + dimensions(2) + entry_count(8) + checksum(4)
const HEADER_SIZE: usize = 47;

const MANIFEST_FILE: &str = "manifest.json";

const ARTIFACT_PREFIXES: [&str; 4] = ["visual.", "text.", "metadata.", "keywords."];

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index corrupt: {0}")]
    IndexCorrupt(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u32, u32),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArtifactRef {
    file: String,
    crc32: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    version: u32,
    generation: u64,
    encoder_signature: String,
    video_count: usize,
    written_at: DateTime<Utc>,
    visual: ArtifactRef,
    text: ArtifactRef,
    metadata: ArtifactRef,
    keywords: ArtifactRef,
}

/// Reads and writes an [`IndexStore`] as one consistent set of files.
#[derive(Debug, Clone)]
pub struct IndexStorage {
    dir: PathBuf,
}

impl IndexStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Whether a persisted store exists.
    pub fn exists(&self) -> bool {
        self.dir.join(MANIFEST_FILE).is_file()
    }

    /// Load the persisted store, or an empty one when nothing was persisted.
    pub fn load_or_empty(&self, encoder_signature: &str) -> Result<IndexStore, StoreError> {
        if self.exists() {
            self.load()
        } else {
            Ok(IndexStore::new(encoder_signature))
        }
    }

    /// Load the persisted store. Any missing, damaged or mutually
    /// inconsistent artifact fails the whole load.
    pub fn load(&self) -> Result<IndexStore, StoreError> {
        let manifest_bytes = std::fs::read(self.dir.join(MANIFEST_FILE))?;
        let manifest: Manifest = serde_json::from_slice(&manifest_bytes)
            .map_err(|e| StoreError::IndexCorrupt(format!("unreadable manifest: {e}")))?;

        if manifest.version != MANIFEST_VERSION {
            return Err(StoreError::VersionMismatch(manifest.version, MANIFEST_VERSION));
        }

        let visual_bytes = self.read_artifact(&manifest.visual)?;
        let text_bytes = self.read_artifact(&manifest.text)?;
        let metadata_bytes = self.read_artifact(&manifest.metadata)?;
        let keyword_bytes = self.read_artifact(&manifest.keywords)?;

        let visual = decode_vectors(&visual_bytes, &model_id("visual", &manifest.encoder_signature))?;
        let text = decode_vectors(&text_bytes, &model_id("text", &manifest.encoder_signature))?;

        let records: Vec<VideoRecord> = serde_json::from_slice(&metadata_bytes)
            .map_err(|e| StoreError::IndexCorrupt(format!("unreadable metadata: {e}")))?;
        let keywords: KeywordIndex = serde_json::from_slice(&keyword_bytes)
            .map_err(|e| StoreError::IndexCorrupt(format!("unreadable keyword index: {e}")))?;

        let store = IndexStore {
            visual,
            text,
            keywords,
            records: records.into_iter().map(|r| (r.video_id, r)).collect(),
            generation: manifest.generation,
            encoder_signature: manifest.encoder_signature,
        };

        if store.len() != manifest.video_count {
            return Err(StoreError::IndexCorrupt(format!(
                "manifest lists {} videos, metadata has {}",
                manifest.video_count,
                store.len()
            )));
        }

        if let Some(problem) = store.alignment_error() {
            return Err(StoreError::IndexCorrupt(problem));
        }

        if let Some(problem) = store.keywords.frequency_error() {
            return Err(StoreError::IndexCorrupt(problem));
        }

        Ok(store)
    }

    /// Persist the store as the next generation.
    ///
    /// Artifacts are written with temp file -> fsync -> rename, the manifest
    /// last. Files of older generations are removed afterwards.
    pub fn save(&self, store: &mut IndexStore) -> Result<(), StoreError> {
        if let Some(problem) = store.alignment_error() {
            return Err(StoreError::IndexCorrupt(problem));
        }

        std::fs::create_dir_all(&self.dir)?;

        // A fresh store (rebuild) must not reuse names the live manifest points at
        let generation = store.generation.max(self.latest_generation()) + 1;
        let signature = store.encoder_signature.clone();

        let records: Vec<&VideoRecord> = store.records.values().collect();

        let visual = self.write_artifact(
            &format!("visual.{generation}.bin"),
            &encode_vectors(&store.visual, &model_id("visual", &signature))?,
        )?;
        let text = self.write_artifact(
            &format!("text.{generation}.bin"),
            &encode_vectors(&store.text, &model_id("text", &signature))?,
        )?;
        let metadata = self.write_artifact(
            &format!("metadata.{generation}.json"),
            &serde_json::to_vec(&records)?,
        )?;
        let keywords = self.write_artifact(
            &format!("keywords.{generation}.json"),
            &serde_json::to_vec(&store.keywords)?,
        )?;

        let manifest = Manifest {
            version: MANIFEST_VERSION,
            generation,
            encoder_signature: signature,
            video_count: store.len(),
            written_at: Utc::now(),
            visual,
            text,
            metadata,
            keywords,
        };
        self.write_artifact(MANIFEST_FILE, &serde_json::to_vec_pretty(&manifest)?)?;

        store.generation = generation;
        self.remove_stale_generations(generation);

        log::debug!(
            "persisted generation {} ({} videos) to {}",
            generation,
            manifest.video_count,
            self.dir.display()
        );

        Ok(())
    }

    /// Highest generation with files on disk, 0 when there are none.
    pub fn latest_generation(&self) -> u64 {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return 0;
        };

        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| artifact_generation(&e.file_name().to_string_lossy()))
            .max()
            .unwrap_or(0)
    }

    fn read_artifact(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, StoreError> {
        let path = self.dir.join(&artifact.file);
        let data = std::fs::read(&path).map_err(|e| {
            StoreError::IndexCorrupt(format!("cannot read {}: {e}", artifact.file))
        })?;

        if crc32fast::hash(&data) != artifact.crc32 {
            return Err(StoreError::IndexCorrupt(format!(
                "checksum mismatch in {}",
                artifact.file
            )));
        }

        Ok(data)
    }

    fn write_artifact(&self, name: &str, data: &[u8]) -> Result<ArtifactRef, StoreError> {
        let path = self.dir.join(name);
        let temp_path = self.dir.join(format!("{name}.tmp"));

        let result = write_synced(&temp_path, data);
        if result.is_err() {
            let _ = std::fs::remove_file(&temp_path);
            result?;
        }

        std::fs::rename(&temp_path, &path)?;

        Ok(ArtifactRef {
            file: name.to_string(),
            crc32: crc32fast::hash(data),
        })
    }

    fn remove_stale_generations(&self, current: u64) {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return;
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(generation) = artifact_generation(&name) else {
                continue;
            };
            if generation != current {
                if let Err(e) = std::fs::remove_file(entry.path()) {
                    log::warn!("failed to remove stale artifact {name}: {e}");
                }
            }
        }
    }
}

fn write_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(data)?;
    file.sync_all()
}

/// Generation number embedded in an artifact file name.
fn artifact_generation(name: &str) -> Option<u64> {
    let rest = ARTIFACT_PREFIXES
        .iter()
        .find_map(|prefix| name.strip_prefix(prefix))?;
    let (generation, ext) = rest.split_once('.')?;
    if ext != "bin" && ext != "json" {
        return None;
    }
    generation.parse().ok()
}

fn model_id(modality: &str, signature: &str) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(modality.as_bytes());
    hasher.update(b":");
    hasher.update(signature.as_bytes());
    hasher.finalize().into()
}

fn encode_vectors(index: &VectorIndex, model_id: &[u8; 32]) -> Result<Vec<u8>, StoreError> {
    let dimensions = index.dimensions();
    let header_dimensions = u16::try_from(dimensions).map_err(|_| {
        StoreError::Serialize(<serde_json::Error as serde::ser::Error>::custom(format!(
            "{dimensions} dimensions do not fit the vector file header"
        )))
    })?;
    let mut out = Vec::with_capacity(HEADER_SIZE + index.len() * (8 + 4 * dimensions));

    let mut header = [0u8; HEADER_SIZE];
    header[0] = FORMAT_VERSION;
    header[1..33].copy_from_slice(model_id);
    header[33..35].copy_from_slice(&header_dimensions.to_le_bytes());
    header[35..43].copy_from_slice(&(index.len() as u64).to_le_bytes());
    let checksum = crc32fast::hash(&header[0..43]);
    header[43..47].copy_from_slice(&checksum.to_le_bytes());
    out.extend_from_slice(&header);

    // Sorted so the file does not depend on insertion order
    let mut entries: Vec<(VideoId, &[f32])> = index.iter().collect();
    entries.sort_by_key(|(id, _)| *id);

    for (id, embedding) in entries {
        out.extend_from_slice(&id.0.to_le_bytes());
        for value in embedding {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }

    Ok(out)
}

fn decode_vectors(bytes: &[u8], expected_model_id: &[u8; 32]) -> Result<VectorIndex, StoreError> {
    if bytes.len() < HEADER_SIZE {
        return Err(StoreError::IndexCorrupt("vector file shorter than header".to_string()));
    }

    let header = &bytes[..HEADER_SIZE];
    let version = header[0];
    if version > FORMAT_VERSION {
        return Err(StoreError::VersionMismatch(version as u32, FORMAT_VERSION as u32));
    }

    let stored_checksum = u32::from_le_bytes([header[43], header[44], header[45], header[46]]);
    if crc32fast::hash(&header[0..43]) != stored_checksum {
        return Err(StoreError::IndexCorrupt("vector header checksum mismatch".to_string()));
    }

    if header[1..33] != expected_model_id[..] {
        return Err(StoreError::IndexCorrupt(
            "vector file was written for a different encoder".to_string(),
        ));
    }

    let dimensions = u16::from_le_bytes([header[33], header[34]]) as usize;
    let mut count_bytes = [0u8; 8];
    count_bytes.copy_from_slice(&header[35..43]);
    let entry_count = u64::from_le_bytes(count_bytes) as usize;

    let entry_size = 8 + 4 * dimensions;
    let body = &bytes[HEADER_SIZE..];
    if body.len() != entry_count * entry_size {
        return Err(StoreError::IndexCorrupt(format!(
            "vector file holds {} bytes of entries, header promises {}",
            body.len(),
            entry_count * entry_size
        )));
    }

    let mut index = VectorIndex::with_capacity(dimensions, entry_count);
    let mut embedding = Vec::with_capacity(dimensions);

    for entry in body.chunks_exact(entry_size) {
        let mut id_bytes = [0u8; 8];
        id_bytes.copy_from_slice(&entry[..8]);
        let id = VideoId(u64::from_le_bytes(id_bytes));

        embedding.clear();
        embedding.extend(
            entry[8..]
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        );

        if index.contains(id) {
            return Err(StoreError::IndexCorrupt(format!("duplicate vector for video {id}")));
        }
        index
            .insert(id, &embedding)
            .map_err(|e| StoreError::IndexCorrupt(format!("bad vector for video {id}: {e}")))?;
    }

    Ok(index)
}
