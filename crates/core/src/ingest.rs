use crate::extractor::{clean_extracted_text, parser_for_key, DocumentParser};
use crate::models::{RelayConfig, SourceDocument};
use crate::traits::ObjectStore;
use crate::IngestError;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn is_relative_and_contained(path: &Path) -> bool {
    path.components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

/// Buckets are directories under `root`; keys are relative paths inside them.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, IngestError> {
        let relative = Path::new(bucket).join(key);
        if !is_relative_and_contained(&relative) {
            return Err(IngestError::InvalidArgument(format!(
                "object path escapes store root: {bucket}/{key}"
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, IngestError> {
        let path = self.object_path(bucket, key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(error) if error.kind() == ErrorKind::NotFound => {
                Err(IngestError::SourceUnavailable {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                })
            }
            Err(error) => Err(IngestError::Io(error)),
        }
    }
}

/// Path-style object storage over HTTP: `GET {endpoint}/{bucket}/{key}`.
#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    endpoint: Url,
    client: Client,
}

impl HttpObjectStore {
    pub fn new(endpoint: &str) -> Result<Self, IngestError> {
        let mut endpoint = Url::parse(endpoint)?;
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }
        Ok(Self {
            endpoint,
            client: Client::new(),
        })
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, IngestError> {
        let url = self.endpoint.join(&format!("{bucket}/{key}"))?;
        debug!(%url, "fetching object");

        let response = self.client.get(url).send().await?;
        match response.status() {
            status if status.is_success() => Ok(response.bytes().await?.to_vec()),
            StatusCode::NOT_FOUND => Err(IngestError::SourceUnavailable {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            status => Err(IngestError::Storage {
                bucket: bucket.to_string(),
                key: key.to_string(),
                status: status.as_u16(),
            }),
        }
    }
}

/// Fetches one source object, stages it on disk and parses it to text.
pub struct DocumentLoader {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    key_prefix: String,
    scratch_dir: PathBuf,
}

impl DocumentLoader {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        key_prefix: impl Into<String>,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            key_prefix: key_prefix.into(),
            scratch_dir: scratch_dir.into(),
        }
    }

    pub fn from_config(store: Arc<dyn ObjectStore>, config: &RelayConfig) -> Self {
        Self::new(
            store,
            config.source_bucket.clone(),
            config.key_prefix.clone(),
            config.scratch_dir.clone(),
        )
    }

    pub fn object_key(&self, source_id: &str) -> String {
        format!("{}{}", self.key_prefix, source_id)
    }

    pub async fn load(&self, source_id: &str) -> Result<SourceDocument, IngestError> {
        if source_id.trim().is_empty() {
            return Err(IngestError::InvalidArgument("empty source id".to_string()));
        }

        let key = self.object_key(source_id);
        let bytes = self.store.get(&self.bucket, &key).await?;
        let checksum = digest_bytes(&bytes);

        let file_name = Path::new(&key)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("source");
        let staged = self
            .scratch_dir
            .join(format!("{}-{file_name}", &checksum[..16]));

        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        tokio::fs::write(&staged, &bytes).await?;

        let parser = parser_for_key(&key);
        let parser_name = parser.name();
        let parsed = parse_staged(parser, staged).await?;

        let text = clean_extracted_text(&parsed)?;
        info!(
            bucket = %self.bucket,
            %key,
            parser = parser_name,
            bytes = bytes.len(),
            chars = text.chars().count(),
            "loaded source document"
        );

        Ok(SourceDocument {
            source_id: source_id.to_string(),
            checksum,
            loaded_at: Utc::now(),
            text,
        })
    }
}

/// Parses a staged object on the blocking pool. The staged file is removed
/// whatever the outcome, a panicking parser included.
async fn parse_staged(
    parser: Box<dyn DocumentParser>,
    staged: PathBuf,
) -> Result<String, IngestError> {
    let parse_path = staged.clone();
    let joined = tokio::task::spawn_blocking(move || parser.parse(&parse_path)).await;

    if let Err(error) = tokio::fs::remove_file(&staged).await {
        debug!(path = %staged.display(), %error, "could not remove staged object");
    }

    joined.map_err(|error| IngestError::ParseFailure(format!("parser task failed: {error}")))?
}
