//! Whole-document baseline storage.
//!
//! Baselines are opaque UTF-8 blobs addressed by the canonical key
//! `documents/<document_id>.txt`, content type `text/plain`. The production
//! backend is S3; a local-directory backend serves development and tests
//! through the same contract.
//!
//! A scratch directory acts as a read-through cache: `fetch` returns the
//! cached copy when present, otherwise downloads and populates it. Uploads go
//! straight to the backend and drop the cached copy, so the next read sees
//! the authoritative store.

use std::path::{Path, PathBuf};

use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::primitives::ByteStream;

use super::StorageError;

enum BaselineBackend {
    S3 {
        client: aws_sdk_s3::Client,
        bucket: String,
    },
    Local {
        root: PathBuf,
    },
}

/// Read/write access to document baselines.
pub struct BaselineStore {
    backend: BaselineBackend,
    cache_dir: PathBuf,
}

impl BaselineStore {
    /// S3-backed store. Credentials come from the SDK's default provider
    /// chain; the caller validates their presence at startup.
    pub async fn s3(
        bucket: impl Into<String>,
        region: impl Into<String>,
        cache_dir: impl Into<PathBuf>,
    ) -> Result<Self, StorageError> {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.into()))
            .load()
            .await;
        let cache_dir = cache_dir.into();
        tokio::fs::create_dir_all(&cache_dir).await?;
        Ok(Self {
            backend: BaselineBackend::S3 {
                client: aws_sdk_s3::Client::new(&config),
                bucket: bucket.into(),
            },
            cache_dir,
        })
    }

    /// Local-directory store, objects laid out under `root/<key>`.
    pub async fn local(
        root: impl Into<PathBuf>,
        cache_dir: impl Into<PathBuf>,
    ) -> Result<Self, StorageError> {
        let root = root.into();
        let cache_dir = cache_dir.into();
        tokio::fs::create_dir_all(&root).await?;
        tokio::fs::create_dir_all(&cache_dir).await?;
        Ok(Self {
            backend: BaselineBackend::Local { root },
            cache_dir,
        })
    }

    /// Canonical object key for a document.
    pub fn key_for(document_id: i64) -> String {
        format!("documents/{document_id}.txt")
    }

    /// Baseline content for a document. A missing object collapses to empty
    /// bytes; the scratch cache is consulted first and populated on miss.
    pub async fn fetch(&self, document_id: i64) -> Result<Vec<u8>, StorageError> {
        let cache_path = self.cache_path(document_id);
        match tokio::fs::read(&cache_path).await {
            Ok(bytes) => return Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let bytes = match self.download(&Self::key_for(document_id)).await {
            Ok(bytes) => bytes,
            Err(StorageError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };

        self.populate_cache(&cache_path, &bytes).await?;
        Ok(bytes)
    }

    /// Raw download by key. `NotFound` is surfaced, not collapsed.
    pub async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        match &self.backend {
            BaselineBackend::S3 { client, bucket } => {
                let resp = client.get_object().bucket(bucket).key(key).send().await;
                match resp {
                    Ok(out) => {
                        let data = out
                            .body
                            .collect()
                            .await
                            .map_err(|e| StorageError::ObjectStore(e.to_string()))?;
                        Ok(data.into_bytes().to_vec())
                    }
                    Err(err) => {
                        let service = err.into_service_error();
                        if service.is_no_such_key() {
                            Err(StorageError::NotFound(key.to_string()))
                        } else {
                            Err(StorageError::ObjectStore(service.to_string()))
                        }
                    }
                }
            }
            BaselineBackend::Local { root } => match tokio::fs::read(root.join(key)).await {
                Ok(bytes) => Ok(bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(StorageError::NotFound(key.to_string()))
                }
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Write (or overwrite) a document's baseline. Returns the canonical key.
    /// Bypasses the cache and drops any cached copy for the document.
    pub async fn upload(&self, document_id: i64, content: &[u8]) -> Result<String, StorageError> {
        let key = Self::key_for(document_id);
        match &self.backend {
            BaselineBackend::S3 { client, bucket } => {
                client
                    .put_object()
                    .bucket(bucket)
                    .key(&key)
                    .content_type("text/plain")
                    .body(ByteStream::from(content.to_vec()))
                    .send()
                    .await
                    .map_err(|e| StorageError::ObjectStore(e.into_service_error().to_string()))?;
            }
            BaselineBackend::Local { root } => {
                let path = root.join(&key);
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&path, content).await?;
            }
        }

        match tokio::fs::remove_file(self.cache_path(document_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(key)
    }

    /// Whether an object exists under `key`.
    pub async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match &self.backend {
            BaselineBackend::S3 { client, bucket } => {
                match client.head_object().bucket(bucket).key(key).send().await {
                    Ok(_) => Ok(true),
                    Err(err) => {
                        let service = err.into_service_error();
                        if service.is_not_found() {
                            Ok(false)
                        } else {
                            Err(StorageError::ObjectStore(service.to_string()))
                        }
                    }
                }
            }
            BaselineBackend::Local { root } => {
                Ok(tokio::fs::try_exists(root.join(key)).await?)
            }
        }
    }

    /// Delete the object under `key`. Deleting a missing object succeeds.
    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match &self.backend {
            BaselineBackend::S3 { client, bucket } => {
                client
                    .delete_object()
                    .bucket(bucket)
                    .key(key)
                    .send()
                    .await
                    .map_err(|e| StorageError::ObjectStore(e.into_service_error().to_string()))?;
                Ok(())
            }
            BaselineBackend::Local { root } => {
                match tokio::fs::remove_file(root.join(key)).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    fn cache_path(&self, document_id: i64) -> PathBuf {
        self.cache_dir.join(document_id.to_string())
    }

    // Populate via temp file + rename: concurrent readers of the same
    // document never observe a half-written cache entry.
    async fn populate_cache(&self, cache_path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        let tmp = cache_path.with_extension("part");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, cache_path).await?;
        Ok(())
    }
}
