//! JSON-file persistence for the property registry and the bounded history
//! log, plus the HTTP fetch client used by the page driver.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;
use vacwatch_core::{HistoryEntry, Property};

pub const CRATE_NAME: &str = "vacwatch-storage";

pub const PROPERTIES_FILE_NAME: &str = "properties.json";
pub const HISTORY_FILE_NAME: &str = "property_history.json";

/// Maximum number of runs retained in the history log.
pub const HISTORY_LIMIT: usize = 200;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("serializing {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("writing {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Reads a JSON array. A missing file yields `Ok(None)`.
async fn read_json_array<T: DeserializeOwned>(path: &Path) -> Result<Option<Vec<T>>, StoreError> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

/// Pretty-prints `value` (two-space indent, UTF-8 left unescaped) and replaces
/// `path` through a sibling temp file and rename.
async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let write_err = |source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    };

    let bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).await.map_err(write_err)?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(write_err)?;
    file.write_all(&bytes).await.map_err(write_err)?;
    file.flush().await.map_err(write_err)?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(write_err(err));
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("could not derive a property id from {url}; expected a URL ending in /to_<digits>/")]
    InvalidUrl { url: String },
    #[error("property id '{id}' is already registered")]
    DuplicateId { id: String },
    #[error("no property with id or name '{identifier}' is registered")]
    NotFound { identifier: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Appends a property derived from `url`. Leaves `properties` untouched on
/// rejection.
pub fn add_property(properties: &mut Vec<Property>, name: &str, url: &str) -> Result<Property, RegistryError> {
    let property = Property::from_listing_url(name.trim(), url.trim()).ok_or_else(|| RegistryError::InvalidUrl {
        url: url.to_string(),
    })?;
    if properties.iter().any(|p| p.id == property.id) {
        return Err(RegistryError::DuplicateId { id: property.id });
    }
    properties.push(property.clone());
    Ok(property)
}

/// Removes the first property whose id or name equals `identifier` exactly.
pub fn remove_property(properties: &mut Vec<Property>, identifier: &str) -> Result<Property, RegistryError> {
    let index = properties
        .iter()
        .position(|p| p.id == identifier || p.name == identifier)
        .ok_or_else(|| RegistryError::NotFound {
            identifier: identifier.to_string(),
        })?;
    Ok(properties.remove(index))
}

/// Registry of tracked properties backed by a JSON array file.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    path: PathBuf,
}

impl RegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(data_dir: impl AsRef<Path>) -> Self {
        Self::new(data_dir.as_ref().join(PROPERTIES_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Strict load: a missing file is an empty registry, a corrupt one is an
    /// error.
    pub async fn load(&self) -> Result<Vec<Property>, StoreError> {
        match read_json_array(&self.path).await? {
            Some(properties) => Ok(properties),
            None => {
                warn!(path = %self.path.display(), "registry file not found; treating as empty");
                Ok(Vec::new())
            }
        }
    }

    /// Lenient load for read-only callers.
    pub async fn load_or_empty(&self) -> Vec<Property> {
        match self.load().await {
            Ok(properties) => properties,
            Err(err) => {
                warn!(error = %err, "failed to load registry; treating as empty");
                Vec::new()
            }
        }
    }

    pub async fn save(&self, properties: &[Property]) -> Result<(), StoreError> {
        write_json_atomic(&self.path, properties).await
    }

    pub async fn add(&self, name: &str, url: &str) -> Result<Property, RegistryError> {
        let mut properties = self.load().await?;
        let property = add_property(&mut properties, name, url)?;
        self.save(&properties).await?;
        info!(id = %property.id, name = %property.name, "registered property");
        Ok(property)
    }

    pub async fn remove(&self, identifier: &str) -> Result<Property, RegistryError> {
        let mut properties = self.load().await?;
        let property = remove_property(&mut properties, identifier)?;
        self.save(&properties).await?;
        info!(id = %property.id, name = %property.name, "removed property");
        Ok(property)
    }
}

/// Append-only run log capped at `limit` entries.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
    limit: usize,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            limit: HISTORY_LIMIT,
        }
    }

    pub fn in_dir(data_dir: impl AsRef<Path>) -> Self {
        Self::new(data_dir.as_ref().join(HISTORY_FILE_NAME))
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<Vec<HistoryEntry>, StoreError> {
        Ok(read_json_array(&self.path).await?.unwrap_or_default())
    }

    /// Unreadable or corrupt history is treated as empty.
    pub async fn load_or_empty(&self) -> Vec<HistoryEntry> {
        match self.load().await {
            Ok(history) => history,
            Err(err) => {
                warn!(error = %err, "failed to load history; treating as empty");
                Vec::new()
            }
        }
    }

    /// Appends `entry`, drops the oldest entries beyond the limit, persists,
    /// and returns the resulting length.
    pub async fn append(&self, entry: HistoryEntry) -> Result<usize, StoreError> {
        let mut history = self.load_or_empty().await;
        history.push(entry);
        if history.len() > self.limit {
            let excess = history.len() - self.limit;
            history.drain(..excess);
        }
        write_json_atomic(&self.path, &history).await?;
        Ok(history.len())
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timed out fetching {url}")]
    Timeout { url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Single-attempt HTTP GET client. Failures are reported, never retried.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_text(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let resp = self.client.get(url).send().await.map_err(|err| classify(err, url))?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.text().await.map_err(|err| classify(err, url))?;
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

fn classify(err: reqwest::Error, url: &str) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout { url: url.to_string() }
    } else {
        FetchError::Request(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;
    use vacwatch_core::{jst, PropertySnapshot};

    const GRANDE: &str = "https://suumo.jp/library/tf_27/sc_27107/to_1002461672/";
    const GLANZ: &str = "https://suumo.jp/library/tf_27/sc_27107/to_1002440443/";

    async fn seeded_registry(dir: &Path) -> RegistryStore {
        let store = RegistryStore::in_dir(dir);
        store.add("Grande", GRANDE).await.expect("seed add");
        store
    }

    fn entry(minute: u32) -> HistoryEntry {
        let at = jst().with_ymd_and_hms(2026, 2, 24, 9, minute % 60, 0).unwrap();
        let property = Property::from_listing_url("Grande", GRANDE).unwrap();
        HistoryEntry::new(at, vec![PropertySnapshot::succeeded(&property, minute, Default::default())])
    }

    #[tokio::test]
    async fn add_rejects_url_without_listing_id_and_leaves_file_alone() {
        let dir = tempdir().expect("tempdir");
        let store = seeded_registry(dir.path()).await;
        let before = std::fs::read(store.path()).unwrap();

        let err = store
            .add("Broken", "https://suumo.jp/library/tf_27/sc_27107/")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidUrl { .. }));
        assert_eq!(std::fs::read(store.path()).unwrap(), before);
    }

    #[tokio::test]
    async fn add_rejects_duplicate_id_and_leaves_file_alone() {
        let dir = tempdir().expect("tempdir");
        let store = seeded_registry(dir.path()).await;
        let before = std::fs::read(store.path()).unwrap();

        let err = store.add("Same listing", GRANDE.trim_end_matches('/')).await.unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateId { ref id } if id == "property_1002461672"));
        assert_eq!(std::fs::read(store.path()).unwrap(), before);
    }

    #[tokio::test]
    async fn remove_unknown_identifier_leaves_file_alone() {
        let dir = tempdir().expect("tempdir");
        let store = seeded_registry(dir.path()).await;
        let before = std::fs::read(store.path()).unwrap();

        let err = store.remove("property_0").await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));
        assert_eq!(std::fs::read(store.path()).unwrap(), before);
    }

    #[tokio::test]
    async fn add_then_remove_restores_exact_file_content() {
        let dir = tempdir().expect("tempdir");
        let store = seeded_registry(dir.path()).await;
        let before = std::fs::read(store.path()).unwrap();

        let added = store.add("エスリード弁天町グランツ", GLANZ).await.unwrap();
        assert_eq!(added.id, "property_1002440443");
        assert_eq!(store.load().await.unwrap().len(), 2);

        let removed = store.remove("エスリード弁天町グランツ").await.unwrap();
        assert_eq!(removed, added);
        assert_eq!(std::fs::read(store.path()).unwrap(), before);
    }

    #[tokio::test]
    async fn registry_file_keeps_non_ascii_names_readable() {
        let dir = tempdir().expect("tempdir");
        let store = RegistryStore::in_dir(dir.path());
        store.add("フォーリアライズ弁天町クロス", GLANZ).await.unwrap();
        let text = std::fs::read_to_string(store.path()).unwrap();
        assert!(text.contains("フォーリアライズ弁天町クロス"));
        assert!(text.starts_with("[\n  {"));
    }

    #[tokio::test]
    async fn corrupt_registry_is_an_error_for_mutations() {
        let dir = tempdir().expect("tempdir");
        let store = RegistryStore::in_dir(dir.path());
        std::fs::write(store.path(), "{ not json").unwrap();

        assert!(matches!(
            store.add("Grande", GRANDE).await.unwrap_err(),
            RegistryError::Store(StoreError::Parse { .. })
        ));
        assert!(store.load_or_empty().await.is_empty());
        assert_eq!(std::fs::read_to_string(store.path()).unwrap(), "{ not json");
    }

    #[tokio::test]
    async fn history_never_exceeds_limit() {
        let dir = tempdir().expect("tempdir");
        let store = HistoryStore::in_dir(dir.path().join("nested"));

        let mut len = 0;
        for minute in 0..(HISTORY_LIMIT as u32 + 15) {
            len = store.append(entry(minute)).await.unwrap();
            assert!(len <= HISTORY_LIMIT);
        }
        assert_eq!(len, HISTORY_LIMIT);

        let history = store.load().await.unwrap();
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history.first().unwrap().properties[0].count, 15);
        assert_eq!(history.last().unwrap().properties[0].count, HISTORY_LIMIT as u32 + 14);
    }

    #[tokio::test]
    async fn corrupt_history_falls_back_to_empty_on_append() {
        let dir = tempdir().expect("tempdir");
        let store = HistoryStore::in_dir(dir.path()).with_limit(3);
        std::fs::write(store.path(), "[{").unwrap();

        assert_eq!(store.append(entry(1)).await.unwrap(), 1);
        assert_eq!(store.load().await.unwrap().len(), 1);
    }
}
