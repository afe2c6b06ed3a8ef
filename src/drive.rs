//! Cloud file-storage abstraction
//!
//! Everything the backend persists goes through the [`Drive`] trait: folders,
//! JSON documents, their key/value tags and revision history. Two
//! implementations exist: [`crate::google::GoogleDrive`] talks to the Drive v3
//! REST API and [`crate::memory::MemoryDrive`] keeps everything in process.
//!
//! Queries are expressed with [`FileFilter`] instead of provider query strings
//! so that both implementations agree on their meaning.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// MIME type the provider uses for folders
pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

/// MIME type of every portfolio document
pub const JSON_MIME: &str = "application/json";

/// Reason codes the provider attaches to a 403 when storage is full
const QUOTA_REASONS: [&str; 3] = [
    "storageQuotaExceeded",
    "quotaExceeded",
    "teamDriveFileLimitExceeded",
];

/// Errors returned by a storage backend
#[derive(Error, Debug)]
pub enum DriveError {
    /// The file or folder does not exist (or is invisible to the caller)
    #[error("File not found: {0}")]
    NotFound(String),

    /// The provider rejected our credentials
    #[error("Storage authentication failed: {0}")]
    Unauthorized(String),

    /// Credentials are valid but lack access to the resource
    #[error("Insufficient permissions: {0}")]
    PermissionDenied(String),

    /// The account ran out of storage
    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Any other error status from the provider
    #[error("Storage API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Transport failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The provider answered with something we could not decode
    #[error("Malformed storage response: {0}")]
    Decode(String),
}

impl DriveError {
    /// Classify a provider error from its HTTP status and reason codes
    ///
    /// # Arguments
    /// * `status` - HTTP status code of the failed call
    /// * `message` - Human readable message from the provider
    /// * `reasons` - Machine readable reason codes from the error body
    pub fn from_status(status: u16, message: String, reasons: &[String]) -> Self {
        match status {
            401 => DriveError::Unauthorized(message),
            404 => DriveError::NotFound(message),
            403 if reasons.iter().any(|r| QUOTA_REASONS.contains(&r.as_str())) => {
                DriveError::QuotaExceeded(message)
            }
            403 => DriveError::PermissionDenied(message),
            _ => DriveError::Api { status, message },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DriveError::NotFound(_))
    }
}

/// Metadata of a stored file or folder
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub mime_type: String,

    #[serde(default)]
    pub parents: Vec<String>,

    /// Key/value tags; the only index the backend has
    #[serde(default)]
    pub app_properties: HashMap<String, String>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub created_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub modified_time: Option<DateTime<Utc>>,

    /// Size in bytes; folders have none
    #[serde(default, deserialize_with = "number_or_string")]
    pub size: Option<u64>,

    #[serde(default)]
    pub trashed: bool,
}

impl DriveFile {
    /// Look up a tag value
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.app_properties.get(key).map(String::as_str)
    }
}

/// Metadata for a file being created or updated
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewFile {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub app_properties: HashMap<String, String>,
}

impl NewFile {
    /// A JSON document inside `parent`
    pub fn json(name: impl Into<String>, parent: impl Into<String>) -> Self {
        NewFile {
            name: name.into(),
            mime_type: Some(JSON_MIME.to_string()),
            parents: vec![parent.into()],
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_tags(mut self, tags: HashMap<String, String>) -> Self {
        self.app_properties = tags;
        self
    }
}

/// One stored revision of a file
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    pub id: String,

    #[serde(default)]
    pub modified_time: Option<DateTime<Utc>>,
}

/// Access grant on a file or folder
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    #[serde(default, skip_serializing)]
    pub id: String,

    /// `reader`, `writer`, ...
    pub role: String,

    #[serde(rename = "type")]
    pub grantee_type: String,

    #[serde(default)]
    pub email_address: String,
}

impl Permission {
    /// Write access for a single account
    pub fn writer(email: &str) -> Self {
        Permission {
            id: String::new(),
            role: "writer".to_string(),
            grantee_type: "user".to_string(),
            email_address: email.to_string(),
        }
    }
}

/// Storage quota of the service account
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct StorageQuota {
    /// Total capacity in bytes; absent for unlimited accounts
    #[serde(default, deserialize_with = "number_or_string")]
    pub limit: Option<u64>,

    /// Bytes in use
    #[serde(default, deserialize_with = "number_or_string")]
    pub usage: Option<u64>,
}

/// One page of a listing
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileList {
    #[serde(default)]
    pub files: Vec<DriveFile>,

    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// Which kind of entries a listing should return
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FileKind {
    #[default]
    Any,
    Folder,
    Json,
}

/// Typed listing query
///
/// Built with the chaining helpers:
///
/// ```
/// use portfolio::drive::FileFilter;
///
/// let filter = FileFilter::in_folder("abc").json().tagged("status", "temporary");
/// assert_eq!(filter.parent.as_deref(), Some("abc"));
/// assert!(!filter.trashed);
/// ```
#[derive(Debug, Clone, Default)]
pub struct FileFilter {
    pub parent: Option<String>,
    pub kind: FileKind,
    pub name: Option<String>,
    pub trashed: bool,
    pub created_before: Option<DateTime<Utc>>,
    pub tags: Vec<(String, String)>,
    pub newest_first: bool,
    pub page_size: Option<u32>,
    pub page_token: Option<String>,
    /// Search the caller's hidden application-data space
    pub app_data: bool,
}

impl FileFilter {
    pub fn in_folder(parent: impl Into<String>) -> Self {
        FileFilter {
            parent: Some(parent.into()),
            ..Default::default()
        }
    }

    /// Unscoped query (the whole drive of the caller)
    pub fn anywhere() -> Self {
        FileFilter::default()
    }

    pub fn folders(mut self) -> Self {
        self.kind = FileKind::Folder;
        self
    }

    pub fn json(mut self) -> Self {
        self.kind = FileKind::Json;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn trashed(mut self) -> Self {
        self.trashed = true;
        self
    }

    pub fn created_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.created_before = Some(cutoff);
        self
    }

    pub fn tagged(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    pub fn newest_first(mut self) -> Self {
        self.newest_first = true;
        self
    }

    pub fn page_size(mut self, size: u32) -> Self {
        self.page_size = Some(size);
        self
    }

    pub fn app_data(mut self) -> Self {
        self.app_data = true;
        self
    }

    /// Whether a file satisfies every predicate of the filter
    ///
    /// Ordering and paging are not predicates and are ignored here.
    pub fn matches(&self, file: &DriveFile) -> bool {
        if let Some(parent) = &self.parent {
            if !file.parents.iter().any(|p| p == parent) {
                return false;
            }
        }
        let kind_ok = match self.kind {
            FileKind::Any => true,
            FileKind::Folder => file.mime_type == FOLDER_MIME,
            FileKind::Json => file.mime_type == JSON_MIME,
        };
        if !kind_ok || file.trashed != self.trashed {
            return false;
        }
        if let Some(name) = &self.name {
            if &file.name != name {
                return false;
            }
        }
        if let Some(cutoff) = self.created_before {
            match file.created_time {
                Some(created) if created < cutoff => {}
                _ => return false,
            }
        }
        self.tags
            .iter()
            .all(|(k, v)| file.tag(k) == Some(v.as_str()))
    }
}

/// Storage backend used by the portfolio store
///
/// Deletion is always permanent; trashed files are only ever produced by
/// other clients (the web UI of the provider, for instance).
#[async_trait]
pub trait Drive: Send + Sync {
    /// List one page of files matching the filter
    async fn list(&self, filter: &FileFilter) -> Result<FileList, DriveError>;

    /// List every file matching the filter, following page tokens
    async fn list_all(&self, filter: &FileFilter) -> Result<Vec<DriveFile>, DriveError> {
        let mut filter = filter.clone();
        let mut files = Vec::new();
        loop {
            let page = self.list(&filter).await?;
            files.extend(page.files);
            match page.next_page_token {
                Some(token) if !token.is_empty() => filter.page_token = Some(token),
                _ => break,
            }
        }
        Ok(files)
    }

    /// Fetch metadata of a single file
    async fn get(&self, file_id: &str) -> Result<DriveFile, DriveError>;

    /// Fetch the content of a file
    async fn download(&self, file_id: &str) -> Result<Vec<u8>, DriveError>;

    async fn create_folder(&self, name: &str, parent: Option<&str>)
    -> Result<DriveFile, DriveError>;

    async fn create_file(&self, meta: &NewFile, content: &[u8]) -> Result<DriveFile, DriveError>;

    /// Replace content and metadata of an existing file
    ///
    /// `meta.parents` is ignored: files are never moved by an update.
    async fn update_file(
        &self,
        file_id: &str,
        meta: &NewFile,
        content: &[u8],
    ) -> Result<DriveFile, DriveError>;

    /// Permanently delete a file, bypassing the trash
    async fn delete(&self, file_id: &str) -> Result<(), DriveError>;

    async fn list_revisions(&self, file_id: &str) -> Result<Vec<Revision>, DriveError>;

    async fn delete_revision(&self, file_id: &str, revision_id: &str) -> Result<(), DriveError>;

    async fn storage_quota(&self) -> Result<StorageQuota, DriveError>;

    /// Grant access without notifying the grantee; returns the stored grant
    async fn create_permission(
        &self,
        file_id: &str,
        permission: &Permission,
    ) -> Result<Permission, DriveError>;
}

/// The provider encodes 64-bit integers as JSON strings
fn number_or_string<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Num(u64),
        Str(String),
    }

    match Option::<Repr>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Repr::Num(n)) => Ok(Some(n)),
        Some(Repr::Str(s)) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}
