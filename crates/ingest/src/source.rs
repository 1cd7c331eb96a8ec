//! Per-source strategies.
//!
//! A [`SourceStrategy`] knows how to open the archive(s) behind a
//! notification, where each entry is stored in the processed bucket, and
//! how entry names map to canonical keys. Strategies are looked up by the
//! source tag (second path component of the object key) in a
//! [`SourceRegistry`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use cobalt_core::InboundNotification;
use cobalt_storage::ObjectStorage;

use crate::archive::{self, ArchiveEntry, ArchiveError, ArchiveFormat, EntryStream};
use crate::error::IngestError;
use crate::keys::{FixedWidthKey, KeyRule, PageKey, PathSegmentKey, StemKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Meta,
    Content,
    Other,
}

impl EntryKind {
    /// `xml` is metadata, `pdf` is content, everything else is other.
    pub fn from_extension(extension: &str) -> Self {
        match extension {
            "xml" => EntryKind::Meta,
            "pdf" => EntryKind::Content,
            _ => EntryKind::Other,
        }
    }
}

#[async_trait]
pub trait SourceStrategy: Send + Sync {
    fn tag(&self) -> &str;

    /// Whether this notification carries work for the source. Rejected
    /// notifications are acknowledged without processing.
    fn accepts(&self, _notification: &InboundNotification) -> bool {
        true
    }

    async fn open_archive(
        &self,
        storage: &dyn ObjectStorage,
        notification: &InboundNotification,
    ) -> Result<EntryStream, IngestError>;

    fn derive_key(&self, entry_name: &str) -> Option<String>;

    fn classify(&self, entry: &ArchiveEntry) -> EntryKind {
        EntryKind::from_extension(&entry.extension)
    }

    /// Key the entry is stored under in the processed bucket, before any
    /// compression suffix. `None` skips the entry.
    fn output_key(
        &self,
        notification: &InboundNotification,
        entry: &ArchiveEntry,
        canonical: Option<&str>,
    ) -> Option<String>;
}

/// Fetch one object and open it as an archive.
pub async fn fetch_archive(
    storage: &dyn ObjectStorage,
    bucket: &str,
    key: &str,
    format: Option<ArchiveFormat>,
) -> Result<EntryStream, IngestError> {
    let format = format
        .or_else(|| ArchiveFormat::detect(key))
        .ok_or_else(|| IngestError::ArchiveOpen {
            key: key.to_string(),
            source: ArchiveError::UnknownFormat(key.to_string()),
        })?;

    let blob = storage
        .get(bucket, key)
        .await
        .map_err(|source| IngestError::Fetch {
            bucket: bucket.to_string(),
            key: key.to_string(),
            source,
        })?;

    archive::open_blob(blob, format)
        .await
        .map_err(|source| IngestError::ArchiveOpen {
            key: key.to_string(),
            source,
        })
}

// ── Single-archive sources ────────────────────────────────────

/// Where an entry lands under `<tag>/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLayout {
    /// `<tag>/<entry path>`
    EntryPath,
    /// `<tag>/<basename>`
    BaseName,
    /// `<tag>/<archive name without extension>/<basename>`
    ArchiveStem,
    /// Metadata and content at `<tag>/<basename>`, everything else at
    /// `<tag>/<path segment>/<basename>`.
    OthersBySegment(usize),
}

/// A source that ships one archive per notification.
pub struct ArchiveSource {
    tag: String,
    format: Option<ArchiveFormat>,
    key_rule: Box<dyn KeyRule>,
    layout: OutputLayout,
}

impl ArchiveSource {
    /// `format: None` picks the container from the object key suffix.
    pub fn new(
        tag: impl Into<String>,
        format: Option<ArchiveFormat>,
        key_rule: impl KeyRule + 'static,
        layout: OutputLayout,
    ) -> Self {
        Self {
            tag: tag.into(),
            format,
            key_rule: Box::new(key_rule),
            layout,
        }
    }
}

fn archive_stem(file_name: &str) -> &str {
    [".tar.gz", ".tgz", ".tar", ".zip"]
        .iter()
        .find_map(|ext| file_name.strip_suffix(ext))
        .unwrap_or(file_name)
}

#[async_trait]
impl SourceStrategy for ArchiveSource {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn open_archive(
        &self,
        storage: &dyn ObjectStorage,
        notification: &InboundNotification,
    ) -> Result<EntryStream, IngestError> {
        fetch_archive(storage, &notification.bucket, &notification.key, self.format).await
    }

    fn derive_key(&self, entry_name: &str) -> Option<String> {
        self.key_rule.derive(entry_name)
    }

    fn output_key(
        &self,
        notification: &InboundNotification,
        entry: &ArchiveEntry,
        _canonical: Option<&str>,
    ) -> Option<String> {
        let base = entry.base_name();
        let key = match self.layout {
            OutputLayout::EntryPath => format!("{}/{}", self.tag, entry.name.trim_start_matches("./")),
            OutputLayout::BaseName => format!("{}/{}", self.tag, base),
            OutputLayout::ArchiveStem => format!(
                "{}/{}/{}",
                self.tag,
                archive_stem(notification.file_name()),
                base
            ),
            OutputLayout::OthersBySegment(index) => match self.classify(entry) {
                EntryKind::Meta | EntryKind::Content => format!("{}/{}", self.tag, base),
                EntryKind::Other => {
                    let segment = entry.name.split('/').nth(index).filter(|s| !s.is_empty())?;
                    format!("{}/{}/{}", self.tag, segment, base)
                }
            },
        };
        Some(key)
    }
}

// ── Paired-archive source ─────────────────────────────────────

const META_SUFFIX: &str = ".xml.zip";
const CONTENT_SUFFIX: &str = ".pdf.zip";

/// A source that ships metadata and content as two sibling zips,
/// `<prefix>_<volume>_<issue>.xml.zip` and `….pdf.zip`. Only the metadata
/// notification starts work; the content zip is fetched alongside it.
pub struct PairedArchiveSource {
    tag: String,
    key_rule: PageKey,
}

impl PairedArchiveSource {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            key_rule: PageKey,
        }
    }

    /// Volume and issue from `<prefix>_<volume>_..._<issue>.xml.zip`.
    fn volume_issue(file_name: &str) -> Option<(&str, &str)> {
        let stem = file_name
            .strip_suffix(META_SUFFIX)
            .or_else(|| file_name.strip_suffix(CONTENT_SUFFIX))?;
        let parts: Vec<&str> = stem.split('_').collect();
        if parts.len() < 3 {
            return None;
        }
        let (volume, issue) = (parts[1], parts[parts.len() - 1]);
        (!volume.is_empty() && !issue.is_empty()).then_some((volume, issue))
    }
}

#[async_trait]
impl SourceStrategy for PairedArchiveSource {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn accepts(&self, notification: &InboundNotification) -> bool {
        notification.key.ends_with(META_SUFFIX)
            && Self::volume_issue(notification.file_name()).is_some()
    }

    async fn open_archive(
        &self,
        storage: &dyn ObjectStorage,
        notification: &InboundNotification,
    ) -> Result<EntryStream, IngestError> {
        let meta = fetch_archive(
            storage,
            &notification.bucket,
            &notification.key,
            Some(ArchiveFormat::Zip),
        )
        .await?;

        let stem = notification
            .key
            .strip_suffix(META_SUFFIX)
            .unwrap_or(&notification.key);
        let content_key = format!("{stem}{CONTENT_SUFFIX}");
        let content = fetch_archive(
            storage,
            &notification.bucket,
            &content_key,
            Some(ArchiveFormat::Zip),
        )
        .await?;

        Ok(meta.chain(content))
    }

    fn derive_key(&self, entry_name: &str) -> Option<String> {
        self.key_rule.derive(entry_name)
    }

    fn output_key(
        &self,
        notification: &InboundNotification,
        entry: &ArchiveEntry,
        canonical: Option<&str>,
    ) -> Option<String> {
        let page = canonical?;
        let (volume, issue) = Self::volume_issue(notification.file_name())?;
        let ext = match entry.base_name().rsplit_once('.') {
            Some((_, ext)) => format!(".{ext}"),
            None => String::new(),
        };
        Some(format!("{}/pnas_v{volume}_i{issue}_p{page}{ext}", self.tag))
    }
}

// ── Registry ──────────────────────────────────────────────────

#[derive(Default, Clone)]
pub struct SourceRegistry {
    sources: BTreeMap<String, Arc<dyn SourceStrategy>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The production sources.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(ArchiveSource::new(
            "bmj",
            Some(ArchiveFormat::TarGz),
            StemKey::full_path(),
            OutputLayout::EntryPath,
        ));
        registry.register(ArchiveSource::new(
            "oup",
            Some(ArchiveFormat::Tar),
            StemKey::base_name(),
            OutputLayout::BaseName,
        ));
        registry.register(ArchiveSource::new(
            "cup",
            Some(ArchiveFormat::Zip),
            FixedWidthKey { width: 17 },
            OutputLayout::ArchiveStem,
        ));
        registry.register(ArchiveSource::new(
            "tandf",
            Some(ArchiveFormat::Zip),
            PathSegmentKey { index: 1 },
            OutputLayout::OthersBySegment(1),
        ));
        registry.register(PairedArchiveSource::new("pnas"));
        registry
    }

    /// Add a strategy, replacing any existing one with the same tag.
    pub fn register(&mut self, strategy: impl SourceStrategy + 'static) {
        self.sources
            .insert(strategy.tag().to_string(), Arc::new(strategy));
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn SourceStrategy>> {
        self.sources.get(tag).cloned()
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }
}
