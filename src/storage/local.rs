//! Local filesystem storage backend

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

use crate::{Error, Result};

use super::StorageBackend;

/// In-flight writes live next to their target under this name prefix.
const TMP_PREFIX: &str = ".tmp-";

pub struct LocalStorage {
    root_path: PathBuf,
}

impl LocalStorage {
    pub fn new(root_path: impl Into<PathBuf>) -> Result<Self> {
        let root_path = root_path.into();
        std::fs::create_dir_all(&root_path)?;
        Ok(Self { root_path })
    }

    fn resolve_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::storage(format!("invalid object key: {}", key)));
        }
        Ok(self.root_path.join(relative))
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root_path).ok()?;
        let parts: Option<Vec<&str>> = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect();
        parts.map(|p| p.join("/"))
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn get(&self, key: &str) -> Result<Bytes> {
        let path = self.resolve_path(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, data: Bytes, _content_type: &str) -> Result<()> {
        let path = self.resolve_path(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| Error::storage(format!("invalid object key: {}", key)))?;
        fs::create_dir_all(parent).await?;

        // Readers must never see a partially written object.
        let tmp_path = parent.join(format!("{}{}", TMP_PREFIX, Uuid::new_v4()));
        fs::write(&tmp_path, &data).await?;
        if let Err(e) = fs::rename(&tmp_path, &path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let start = if prefix.is_empty() {
            self.root_path.clone()
        } else {
            self.resolve_path(prefix.trim_end_matches('/'))?
        };
        let mut results = Vec::new();

        if !fs::try_exists(&start).await? {
            return Ok(results);
        }

        let mut pending = vec![start];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if entry.file_name().to_string_lossy().starts_with(TMP_PREFIX) {
                    continue;
                } else if let Some(key) = self.key_for(&path) {
                    results.push(key);
                }
            }
        }

        results.sort();
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_storage() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path()).unwrap();

        let key = "uploads/abc_scan.png";
        let data = Bytes::from_static(b"\x89PNG fake");

        storage.put(key, data.clone(), "image/png").await.unwrap();

        let retrieved = storage.get(key).await.unwrap();
        assert_eq!(retrieved, data);
    }

    #[tokio::test]
    async fn test_put_leaves_no_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path()).unwrap();

        storage
            .put("predictions/a.json", Bytes::from_static(b"{}"), "application/json")
            .await
            .unwrap();
        storage
            .put("predictions/a.json", Bytes::from_static(b"[]"), "application/json")
            .await
            .unwrap();

        let names: Vec<String> = std::fs::read_dir(temp_dir.path().join("predictions"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.json"]);
        assert_eq!(
            storage.get("predictions/a.json").await.unwrap(),
            Bytes::from_static(b"[]")
        );
    }

    #[tokio::test]
    async fn test_list_skips_in_flight_writes() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path()).unwrap();

        let dir = temp_dir.path().join("predictions");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(".tmp-half-written"), b"{\"id\":").unwrap();

        assert!(storage.list("predictions/").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_overwrites_are_never_torn() {
        let temp_dir = TempDir::new().unwrap();
        let storage = std::sync::Arc::new(LocalStorage::new(temp_dir.path()).unwrap());
        let key = "predictions/shared.json";
        let a = Bytes::from(vec![b'a'; 64 * 1024]);
        let b = Bytes::from(vec![b'b'; 64 * 1024]);
        storage.put(key, a.clone(), "application/json").await.unwrap();

        let writer = {
            let storage = storage.clone();
            tokio::spawn(async move {
                for i in 0..100 {
                    let data = if i % 2 == 0 { b.clone() } else { a.clone() };
                    storage.put(key, data, "application/json").await.unwrap();
                }
            })
        };

        let reader = {
            let storage = storage.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    let data = storage.get(key).await.unwrap();
                    assert_eq!(data.len(), 64 * 1024);
                    assert!(data.iter().all(|&c| c == data[0]));
                    assert_eq!(storage.list("predictions/").await.unwrap(), vec![key]);
                }
            })
        };

        writer.await.unwrap();
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn test_list_is_recursive_and_sorted() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path()).unwrap();

        for key in ["predictions/b.json", "predictions/a.json", "uploads/x.jpg"] {
            storage
                .put(key, Bytes::from_static(b"{}"), "application/json")
                .await
                .unwrap();
        }

        let keys = storage.list("predictions/").await.unwrap();
        assert_eq!(keys, vec!["predictions/a.json", "predictions/b.json"]);

        let all = storage.list("").await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_missing_prefix_lists_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path()).unwrap();
        assert!(storage.list("predictions/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_key_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path()).unwrap();
        let err = storage.get("nope.bin").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path()).unwrap();
        let err = storage
            .put("../outside.txt", Bytes::from_static(b"x"), "text/plain")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }
}
