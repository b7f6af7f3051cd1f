//! Object store for per-run snapshots, keyed `label/YYYY-MM-DD.json`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("invalid blob key `{0}`")]
    InvalidKey(String),
    #[error("blob io on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("blob json for `{key}`: {source}")]
    Json {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub key: String,
    pub content_hash: String,
    pub byte_size: usize,
    /// The object already held exactly these bytes; nothing was written.
    pub unchanged: bool,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<StoredBlob, BlobError>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobError>;
    /// Keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, BlobError>;
}

pub fn snapshot_key(label_name: &str, date: NaiveDate) -> String {
    format!("{label_name}/{}.json", date.format("%Y-%m-%d"))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub async fn put_json<T: Serialize + ?Sized>(
    store: &dyn BlobStore,
    key: &str,
    value: &T,
) -> Result<StoredBlob, BlobError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| BlobError::Json {
        key: key.to_string(),
        source,
    })?;
    store.put(key, &bytes).await
}

/// Most recent `.json` object under `prefix`; keys sort by date.
pub async fn latest_json(
    store: &dyn BlobStore,
    prefix: &str,
) -> Result<Option<(String, serde_json::Value)>, BlobError> {
    let Some(key) = store
        .list(prefix)
        .await?
        .into_iter()
        .filter(|k| k.ends_with(".json"))
        .max()
    else {
        return Ok(None);
    };
    let Some(bytes) = store.get(&key).await? else {
        return Ok(None);
    };
    let value = serde_json::from_slice(&bytes).map_err(|source| BlobError::Json {
        key: key.clone(),
        source,
    })?;
    Ok(Some((key, value)))
}

#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, BlobError> {
        let valid = !key.is_empty()
            && !key.starts_with('/')
            && key
                .split('/')
                .all(|seg| !seg.is_empty() && seg != "." && seg != ".." && !seg.contains('\\'));
        if !valid {
            return Err(BlobError::InvalidKey(key.to_string()));
        }
        Ok(key.split('/').fold(self.root.clone(), |p, seg| p.join(seg)))
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> BlobError + '_ {
    move |source| BlobError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    /// Atomic temp-file + rename write; identical content is left untouched.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<StoredBlob, BlobError> {
        let content_hash = sha256_hex(bytes);
        let path = self.path_for(key)?;
        let stored = |unchanged| StoredBlob {
            key: key.to_string(),
            content_hash: content_hash.clone(),
            byte_size: bytes.len(),
            unchanged,
        };

        match fs::read(&path).await {
            Ok(existing) if sha256_hex(&existing) == content_hash => return Ok(stored(true)),
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(io_err(&path)(err)),
        }

        let parent = path
            .parent()
            .ok_or_else(|| BlobError::InvalidKey(key.to_string()))?;
        fs::create_dir_all(parent).await.map_err(io_err(parent))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err(&temp_path))?;
        file.write_all(bytes).await.map_err(io_err(&temp_path))?;
        file.flush().await.map_err(io_err(&temp_path))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err(&path)(err));
        }
        Ok(stored(false))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobError> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_err(&path)(err)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BlobError> {
        let mut keys = Vec::new();
        let mut pending = vec![(self.root.clone(), String::new())];
        while let Some((dir, key_prefix)) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(io_err(&dir)(err)),
            };
            while let Some(entry) = entries.next_entry().await.map_err(io_err(&dir))? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                let key = format!("{key_prefix}{name}");
                let file_type = entry.file_type().await.map_err(io_err(&dir))?;
                if file_type.is_dir() {
                    pending.push((entry.path(), format!("{key}/")));
                } else if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn content_hashing_is_stable() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn snapshot_keys_are_label_slash_date() {
        let date = NaiveDate::from_ymd_opt(2018, 6, 5).unwrap();
        assert_eq!(snapshot_key("New-York-Times", date), "New-York-Times/2018-06-05.json");
    }

    #[tokio::test]
    async fn rewriting_identical_content_is_reported_unchanged() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());

        let first = store.put("Movies/2018-06-15.json", b"[1]").await.expect("first");
        let second = store.put("Movies/2018-06-15.json", b"[1]").await.expect("second");
        let third = store.put("Movies/2018-06-15.json", b"[2]").await.expect("third");

        assert!(!first.unchanged);
        assert!(second.unchanged);
        assert!(!third.unchanged);
        assert_eq!(first.content_hash, second.content_hash);
        let bytes = store.get("Movies/2018-06-15.json").await.expect("get");
        assert_eq!(bytes.as_deref(), Some(&b"[2]"[..]));
        assert!(dir.path().join("Movies").join("2018-06-15.json").exists());
    }

    #[tokio::test]
    async fn latest_json_picks_the_greatest_key_under_a_prefix() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());
        put_json(&store, "Wikipedia/2018-03-05.json", &serde_json::json!(["old"]))
            .await
            .expect("put");
        put_json(&store, "Wikipedia/2018-03-06.json", &serde_json::json!(["new"]))
            .await
            .expect("put");
        put_json(&store, "Movies/2018-03-07.json", &serde_json::json!(["other"]))
            .await
            .expect("put");

        let (key, value) = latest_json(&store, "Wikipedia/")
            .await
            .expect("latest")
            .expect("some");
        assert_eq!(key, "Wikipedia/2018-03-06.json");
        assert_eq!(value, serde_json::json!(["new"]));
        assert!(latest_json(&store, "Billboard/").await.expect("latest").is_none());
    }

    #[tokio::test]
    async fn keys_escaping_the_root_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());
        for key in ["../x.json", "/abs.json", "a//b.json", ""] {
            assert!(matches!(
                store.put(key, b"{}").await,
                Err(BlobError::InvalidKey(_))
            ));
        }
    }
}
