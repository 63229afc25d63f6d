//! Content-addressed file store backing both user uploads and execution artifacts.
//!
//! Each record is two sibling files under a root directory: `<id>` (raw bytes) and
//! `<id>.meta.json` (UTF-8 JSON metadata). Identifiers are 128-bit random values, so two
//! concurrent writers can never collide and no key carries any ordering information an attacker
//! could use to infer upload rate.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use sandbox_types::{FileMetadata, StoreError};

const META_SUFFIX: &str = ".meta.json";

/// A durable, content-addressed store of uploaded and generated files.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Opens (creating if absent) a file store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn payload_path(&self, file_id: &str) -> PathBuf {
        self.root.join(file_id)
    }

    fn meta_path(&self, file_id: &str) -> PathBuf {
        self.root.join(format!("{file_id}{META_SUFFIX}"))
    }

    /// Persists `content` under a freshly generated identifier and returns it. Two puts with
    /// identical bytes always yield two distinct identifiers — idempotence is not promised.
    pub async fn put(&self, content: &[u8], filename: &str) -> std::io::Result<String> {
        let file_id = uuid::Uuid::new_v4().to_string();
        let payload_path = self.payload_path(&file_id);
        let meta_path = self.meta_path(&file_id);

        tokio::fs::write(&payload_path, content).await?;

        let metadata = FileMetadata {
            file_id: file_id.clone(),
            filename: filename.to_string(),
            size_bytes: content.len() as u64,
            upload_time: now_secs(),
        };
        let json = serde_json::to_vec(&metadata)
            .expect("FileMetadata serialization is infallible");
        tokio::fs::write(&meta_path, json).await?;

        debug!("stored file {file_id} ({} bytes) as '{filename}'", content.len());
        Ok(file_id)
    }

    /// Retrieves the raw bytes and metadata for `file_id`.
    ///
    /// When bytes exist but the sibling metadata file is missing or unreadable, synthesizes
    /// metadata with `filename = "unknown"`, the actual byte length, and the payload's mtime —
    /// a record is never lost just because its metadata sidecar went missing.
    pub async fn get(&self, file_id: &str) -> Result<(Vec<u8>, FileMetadata), StoreError> {
        let payload_path = self.payload_path(file_id);
        let content = tokio::fs::read(&payload_path)
            .await
            .map_err(|_| StoreError {
                file_id: file_id.to_string(),
            })?;

        let metadata = match self.read_metadata(file_id).await {
            Some(metadata) => metadata,
            None => {
                let mtime = tokio::fs::metadata(&payload_path)
                    .await
                    .and_then(|m| m.modified())
                    .map(system_time_to_secs)
                    .unwrap_or_else(|_| now_secs());
                FileMetadata {
                    file_id: file_id.to_string(),
                    filename: "unknown".to_string(),
                    size_bytes: content.len() as u64,
                    upload_time: mtime,
                }
            }
        };

        Ok((content, metadata))
    }

    /// Removes a record's payload and metadata. Returns `true` if a payload existed.
    pub async fn delete(&self, file_id: &str) -> std::io::Result<bool> {
        let payload_path = self.payload_path(file_id);
        let meta_path = self.meta_path(file_id);

        let existed = tokio::fs::try_exists(&payload_path).await?;

        if existed {
            // Tolerate a concurrent delete racing us between the existence check and the
            // removal itself: disappearing mid-sweep is not an error.
            let _ = tokio::fs::remove_file(&payload_path).await;
        }
        let _ = tokio::fs::remove_file(&meta_path).await;

        Ok(existed)
    }

    /// Lists metadata for every currently stored record. Records whose metadata cannot be
    /// parsed are silently skipped rather than failing the whole listing.
    pub async fn list(&self) -> std::io::Result<Vec<FileMetadata>> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(file_id) = name.strip_suffix(META_SUFFIX) else {
                continue;
            };
            if let Some(metadata) = self.read_metadata(file_id).await {
                out.push(metadata);
            }
        }
        Ok(out)
    }

    /// Removes every record whose upload time is older than `now - max_age_sec`. Records with
    /// corrupt metadata are skipped, not removed — only a record we can positively age out is a
    /// candidate for the sweep. Returns the number of records removed.
    pub async fn sweep(&self, max_age_sec: u64) -> std::io::Result<usize> {
        let now = now_secs();
        let mut removed = 0usize;

        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut candidates = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(file_id) = name.strip_suffix(META_SUFFIX) {
                candidates.push(file_id.to_string());
            }
        }

        for file_id in candidates {
            let Some(metadata) = self.read_metadata(&file_id).await else {
                continue;
            };
            if now - metadata.upload_time > max_age_sec as f64 {
                match self.delete(&file_id).await {
                    Ok(true) => removed += 1,
                    Ok(false) => {} // already gone, tolerated
                    Err(e) => warn!("failed to sweep file {file_id}: {e}"),
                }
            }
        }

        Ok(removed)
    }

    async fn read_metadata(&self, file_id: &str) -> Option<FileMetadata> {
        let meta_path = self.meta_path(file_id);
        let bytes = tokio::fs::read(&meta_path).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

fn now_secs() -> f64 {
    system_time_to_secs(SystemTime::now())
}

fn system_time_to_secs(t: SystemTime) -> f64 {
    t.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Helper exposed for the Archive Builder / Coordinator: a path usable directly as a `FileStore`
/// root from a configured directory string.
pub fn default_root(dir: &str) -> PathBuf {
    Path::new(dir).to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_store() -> (FileStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let (store, _dir) = temp_store().await;
        let id = store.put(b"hello world", "greeting.txt").await.unwrap();
        let (bytes, meta) = store.get(&id).await.unwrap();
        assert_eq!(bytes, b"hello world");
        assert_eq!(meta.filename, "greeting.txt");
        assert_eq!(meta.size_bytes, 11);
    }

    #[tokio::test]
    async fn put_is_not_idempotent() {
        let (store, _dir) = temp_store().await;
        let id_a = store.put(b"same bytes", "a.txt").await.unwrap();
        let id_b = store.put(b"same bytes", "b.txt").await.unwrap();
        assert_ne!(id_a, id_b);
    }

    #[tokio::test]
    async fn get_missing_file_errors() {
        let (store, _dir) = temp_store().await;
        let err = store.get("does-not-exist").await.unwrap_err();
        assert_eq!(err.file_id, "does-not-exist");
    }

    #[tokio::test]
    async fn missing_metadata_synthesizes_unknown() {
        let (store, dir) = temp_store().await;
        tokio::fs::write(dir.path().join("orphan"), b"payload")
            .await
            .unwrap();
        let (bytes, meta) = store.get("orphan").await.unwrap();
        assert_eq!(bytes, b"payload");
        assert_eq!(meta.filename, "unknown");
        assert_eq!(meta.size_bytes, 7);
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let (store, _dir) = temp_store().await;
        let id = store.put(b"x", "x.txt").await.unwrap();
        assert!(store.delete(&id).await.unwrap());
        assert!(!store.delete(&id).await.unwrap());
    }

    #[tokio::test]
    async fn list_skips_corrupt_metadata() {
        let (store, dir) = temp_store().await;
        store.put(b"good", "good.txt").await.unwrap();
        tokio::fs::write(dir.path().join("bad.meta.json"), b"not json")
            .await
            .unwrap();
        let files = store.list().await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].filename, "good.txt");
    }

    #[tokio::test]
    async fn sweep_removes_old_records_only() {
        let (store, dir) = temp_store().await;
        let old_id = store.put(b"old", "old.txt").await.unwrap();
        let new_id = store.put(b"new", "new.txt").await.unwrap();

        // Backdate the "old" record's metadata well past the retention window.
        let (_, mut meta) = store.get(&old_id).await.unwrap();
        meta.upload_time -= 10_000.0;
        let meta_path = dir.path().join(format!("{old_id}.meta.json"));
        tokio::fs::write(&meta_path, serde_json::to_vec(&meta).unwrap())
            .await
            .unwrap();

        let removed = store.sweep(3600).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(&old_id).await.is_err());
        assert!(store.get(&new_id).await.is_ok());
    }
}
