//! Content API seam.
//!
//! The content API is the external collaborator that turns a unit identity
//! into something downloadable: a (usually signed, expiring) URL for audio and
//! cover images, or a chapter payload for text units. The scheduler only sees
//! the [`ContentApi`] trait.
//!
//! [`ManifestContentApi`] is an in-memory implementation backed by a JSON
//! manifest. The CLI uses it, and so do the tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::offline::UnitRequest;
use crate::store::{TaskId, TaskKind};

/// A downloadable location for a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSource {
    pub url: String,
    /// Size announced by the API. Progress falls back to unit counts without it.
    pub expected_bytes: Option<u64>,
}

/// Result of fetching a text-bearing chapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChapterPayload {
    /// Content delivered in the API response itself.
    Inline(Vec<u8>),
    /// Content must be fetched from this location as a second stage.
    Remote(ResolvedSource),
}

/// Errors reported by the content API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    /// The API does not know the unit.
    #[error("unknown unit {0}")]
    NotFound(String),

    /// The API could not answer right now.
    #[error("content API unavailable: {0}")]
    Unavailable(String),
}

impl ApiError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Resolves unit identities into downloadable sources.
///
/// This trait uses `async_trait` so the scheduler can hold an
/// `Arc<dyn ContentApi>`.
#[async_trait]
pub trait ContentApi: Send + Sync {
    /// Returns a fresh download URL for audio and cover units.
    async fn resolve_download_url(&self, id: &TaskId) -> Result<ResolvedSource, ApiError>;

    /// Returns the payload of a text unit, inline or as a second-stage URL.
    async fn fetch_chapter_payload(&self, id: &TaskId) -> Result<ChapterPayload, ApiError>;
}

/// Failure to load a manifest file.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid manifest {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Manifest file describing resources and where their units come from.
///
/// ```json
/// {
///   "resources": [{
///     "resource_id": "book_1",
///     "cover": { "url": "https://cdn.example.com/b1/cover.jpg" },
///     "units": [
///       { "unit_id": "ch_1",
///         "audio": { "url": "https://cdn.example.com/b1/1.mp3", "expected_bytes": 1024 },
///         "text": { "inline": "<p>Chapter one</p>" } }
///     ]
///   }]
/// }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub resources: Vec<ManifestResource>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestResource {
    pub resource_id: String,
    #[serde(default)]
    pub cover: Option<ManifestSource>,
    #[serde(default)]
    pub units: Vec<ManifestUnit>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestUnit {
    pub unit_id: String,
    #[serde(default)]
    pub audio: Option<ManifestSource>,
    #[serde(default)]
    pub text: Option<ManifestText>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestSource {
    pub url: String,
    #[serde(default)]
    pub expected_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ManifestText {
    Inline { inline: String },
    Remote(ManifestSource),
}

impl Manifest {
    /// Reads and parses a manifest file.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError`] if the file cannot be read or parsed.
    pub fn from_path(path: &Path) -> Result<Self, ManifestError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ManifestError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    #[must_use]
    pub fn resource(&self, resource_id: &str) -> Option<&ManifestResource> {
        self.resources.iter().find(|r| r.resource_id == resource_id)
    }
}

impl ManifestResource {
    /// Every unit the manifest lists for this resource, in manifest order.
    #[must_use]
    pub fn unit_requests(&self) -> Vec<UnitRequest> {
        let mut requests = Vec::new();
        if self.cover.is_some() {
            requests.push(UnitRequest::cover());
        }
        for unit in &self.units {
            if unit.audio.is_some() {
                requests.push(UnitRequest::audio(&unit.unit_id));
            }
            if unit.text.is_some() {
                requests.push(UnitRequest::text(&unit.unit_id));
            }
        }
        requests
    }
}

#[derive(Debug, Clone)]
enum Entry {
    Source(ResolvedSource),
    InlineText(Vec<u8>),
}

/// In-memory [`ContentApi`] keyed by [`TaskId`].
#[derive(Debug, Default)]
pub struct ManifestContentApi {
    entries: RwLock<HashMap<TaskId, Entry>>,
    calls: AtomicUsize,
}

impl ManifestContentApi {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_manifest(manifest: &Manifest) -> Self {
        let api = Self::new();
        for resource in &manifest.resources {
            let resource_id = &resource.resource_id;
            if let Some(cover) = &resource.cover {
                api.insert(TaskId::cover(resource_id), source_entry(cover));
            }
            for unit in &resource.units {
                if let Some(audio) = &unit.audio {
                    api.insert(
                        TaskId::chapter_audio(resource_id, &unit.unit_id),
                        source_entry(audio),
                    );
                }
                match &unit.text {
                    Some(ManifestText::Inline { inline }) => api.insert(
                        TaskId::chapter_text(resource_id, &unit.unit_id),
                        Entry::InlineText(inline.as_bytes().to_vec()),
                    ),
                    Some(ManifestText::Remote(remote)) => api.insert(
                        TaskId::chapter_text(resource_id, &unit.unit_id),
                        source_entry(remote),
                    ),
                    None => {}
                }
            }
        }
        api
    }

    /// Registers (or replaces) the URL for an audio or cover unit, or a
    /// second-stage URL for a text unit.
    pub fn set_source(&self, id: TaskId, url: impl Into<String>, expected_bytes: Option<u64>) {
        self.insert(
            id,
            Entry::Source(ResolvedSource {
                url: url.into(),
                expected_bytes,
            }),
        );
    }

    /// Registers inline content for a text unit.
    pub fn set_inline_text(&self, id: TaskId, content: impl Into<Vec<u8>>) {
        self.insert(id, Entry::InlineText(content.into()));
    }

    /// Number of resolve/fetch calls served so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn insert(&self, id: TaskId, entry: Entry) {
        self.entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(id, entry);
    }

    fn lookup(&self, id: &TaskId) -> Result<Entry, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(id.to_string()))
    }
}

fn source_entry(source: &ManifestSource) -> Entry {
    Entry::Source(ResolvedSource {
        url: source.url.clone(),
        expected_bytes: source.expected_bytes,
    })
}

#[async_trait]
impl ContentApi for ManifestContentApi {
    async fn resolve_download_url(&self, id: &TaskId) -> Result<ResolvedSource, ApiError> {
        debug!(task = %id, "resolving download url");
        match self.lookup(id)? {
            Entry::Source(source) => Ok(source),
            Entry::InlineText(_) => Err(ApiError::NotFound(id.to_string())),
        }
    }

    async fn fetch_chapter_payload(&self, id: &TaskId) -> Result<ChapterPayload, ApiError> {
        if id.kind != TaskKind::ChapterText {
            return Err(ApiError::NotFound(id.to_string()));
        }
        debug!(task = %id, "fetching chapter payload");
        match self.lookup(id)? {
            Entry::Source(source) => Ok(ChapterPayload::Remote(source)),
            Entry::InlineText(bytes) => Ok(ChapterPayload::Inline(bytes)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"{
        "resources": [{
            "resource_id": "book_1",
            "cover": { "url": "https://cdn.example.com/cover.jpg" },
            "units": [
                { "unit_id": "ch_1",
                  "audio": { "url": "https://cdn.example.com/1.mp3", "expected_bytes": 10 },
                  "text": { "inline": "<p>one</p>" } },
                { "unit_id": "ch_2",
                  "text": { "url": "https://cdn.example.com/2.html" } }
            ]
        }]
    }"#;

    fn manifest() -> Manifest {
        serde_json::from_str(MANIFEST).unwrap()
    }

    #[test]
    fn test_unit_requests_follow_manifest_order() {
        let manifest = manifest();
        let requests = manifest.resource("book_1").unwrap().unit_requests();
        assert_eq!(
            requests,
            vec![
                UnitRequest::cover(),
                UnitRequest::audio("ch_1"),
                UnitRequest::text("ch_1"),
                UnitRequest::text("ch_2"),
            ]
        );
    }

    #[tokio::test]
    async fn test_resolve_audio_url() {
        let api = ManifestContentApi::from_manifest(&manifest());
        let source = api
            .resolve_download_url(&TaskId::chapter_audio("book_1", "ch_1"))
            .await
            .unwrap();
        assert_eq!(source.url, "https://cdn.example.com/1.mp3");
        assert_eq!(source.expected_bytes, Some(10));
        assert_eq!(api.call_count(), 1);
    }

    #[tokio::test]
    async fn test_text_payload_inline_and_remote() {
        let api = ManifestContentApi::from_manifest(&manifest());
        let inline = api
            .fetch_chapter_payload(&TaskId::chapter_text("book_1", "ch_1"))
            .await
            .unwrap();
        assert_eq!(inline, ChapterPayload::Inline(b"<p>one</p>".to_vec()));

        let remote = api
            .fetch_chapter_payload(&TaskId::chapter_text("book_1", "ch_2"))
            .await
            .unwrap();
        assert!(matches!(remote, ChapterPayload::Remote(s) if s.url.ends_with("2.html")));
    }

    #[tokio::test]
    async fn test_unknown_unit_is_not_found() {
        let api = ManifestContentApi::new();
        let err = api
            .resolve_download_url(&TaskId::cover("nope"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_set_source_replaces_url() {
        let api = ManifestContentApi::new();
        let id = TaskId::chapter_audio("b", "1");
        api.set_source(id.clone(), "https://a/old", None);
        api.set_source(id.clone(), "https://a/new", Some(3));
        let source = api.resolve_download_url(&id).await.unwrap();
        assert_eq!(source.url, "https://a/new");
    }
}
