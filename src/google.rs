//! Google Drive v3 backend
//!
//! Thin REST client over `reqwest`. Credentials come from a [`TokenSource`]:
//! either a fixed bearer token or the metadata server of the runtime the
//! service is deployed on (the default service account).

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, header};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::drive::{
    Drive, DriveError, DriveFile, FOLDER_MIME, FileFilter, FileKind, FileList, JSON_MIME,
    NewFile, Permission, Revision, StorageQuota,
};

/// Fields requested for every file resource
const FILE_FIELDS: &str =
    "id,name,mimeType,parents,appProperties,description,createdTime,modifiedTime,size,trashed";

/// Token endpoint of the runtime metadata server
pub const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Refresh cached tokens this long before they expire
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound for a whole request, uploads included
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// HTTP client shared by the storage and identity clients
pub fn http_client() -> reqwest::Result<Client> {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .build()
}

/// Base URLs of the REST API
#[derive(Debug, Clone)]
struct GoogleEndpoints {
    api_base: String,
    upload_base: String,
}

impl Default for GoogleEndpoints {
    fn default() -> Self {
        GoogleEndpoints {
            api_base: "https://www.googleapis.com/drive/v3".to_string(),
            upload_base: "https://www.googleapis.com/upload/drive/v3".to_string(),
        }
    }
}

/// Where access tokens come from
#[derive(Debug, Clone)]
pub enum TokenSource {
    /// A token supplied by configuration or by an end user
    Static(String),

    /// The runtime metadata server (default service account)
    MetadataServer { url: String },
}

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ErrorItem>,
}

#[derive(Deserialize)]
struct ErrorItem {
    #[serde(default)]
    reason: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RevisionList {
    #[serde(default)]
    revisions: Vec<Revision>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct About {
    #[serde(default)]
    storage_quota: StorageQuota,
}

/// Drive v3 REST client
pub struct GoogleDrive {
    http: Client,
    endpoints: GoogleEndpoints,
    source: TokenSource,
    cached: Mutex<Option<CachedToken>>,
}

impl GoogleDrive {
    pub fn new(http: Client, source: TokenSource) -> Self {
        GoogleDrive {
            http,
            endpoints: GoogleEndpoints::default(),
            source,
            cached: Mutex::new(None),
        }
    }

    /// Client acting as the service account
    ///
    /// Uses `static_token` when configured, the metadata server otherwise.
    pub fn service_account(http: Client, static_token: Option<String>) -> Self {
        let source = match static_token {
            Some(token) if !token.is_empty() => TokenSource::Static(token),
            _ => TokenSource::MetadataServer {
                url: METADATA_TOKEN_URL.to_string(),
            },
        };
        GoogleDrive::new(http, source)
    }

    /// Client acting as an end user holding `access_token`
    pub fn for_user(http: Client, access_token: &str) -> Self {
        GoogleDrive::new(http, TokenSource::Static(access_token.to_string()))
    }

    async fn access_token(&self) -> Result<String, DriveError> {
        let url = match &self.source {
            TokenSource::Static(token) => return Ok(token.clone()),
            TokenSource::MetadataServer { url } => url,
        };

        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.token.clone());
            }
        }

        let response = self
            .http
            .get(url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DriveError::Unauthorized(format!(
                "metadata server returned {}",
                response.status()
            )));
        }
        let fresh: MetadataToken = response.json().await?;
        let lifetime = Duration::from_secs(fresh.expires_in).saturating_sub(TOKEN_REFRESH_MARGIN);
        log::debug!("[Drive] Refreshed service account token, valid for {:?}", lifetime);

        *cached = Some(CachedToken {
            token: fresh.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(fresh.access_token)
    }

    /// Authorize, send and turn error statuses into [`DriveError`]
    async fn send(&self, request: RequestBuilder) -> Result<Response, DriveError> {
        let token = self.access_token().await?;
        let response = request.bearer_auth(token).send().await?;
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let (message, reasons) = match serde_json::from_str::<ErrorEnvelope>(&text) {
            Ok(envelope) => (
                envelope.error.message,
                envelope.error.errors.into_iter().map(|e| e.reason).collect(),
            ),
            Err(_) => (text, Vec::new()),
        };
        Err(DriveError::from_status(status, message, &reasons))
    }

    fn file_url(&self, file_id: &str) -> String {
        format!(
            "{}/files/{}",
            self.endpoints.api_base,
            urlencoding::encode(file_id)
        )
    }
}

#[async_trait]
impl Drive for GoogleDrive {
    async fn list(&self, filter: &FileFilter) -> Result<FileList, DriveError> {
        let mut params = vec![
            ("q".to_string(), render_query(filter)),
            ("fields".to_string(), format!("nextPageToken,files({})", FILE_FIELDS)),
            (
                "spaces".to_string(),
                if filter.app_data { "appDataFolder" } else { "drive" }.to_string(),
            ),
        ];
        if let Some(size) = filter.page_size {
            params.push(("pageSize".to_string(), size.to_string()));
        }
        if let Some(token) = &filter.page_token {
            params.push(("pageToken".to_string(), token.clone()));
        }
        if filter.newest_first {
            params.push(("orderBy".to_string(), "modifiedTime desc".to_string()));
        }

        let url = format!("{}/files", self.endpoints.api_base);
        let response = self.send(self.http.get(url).query(&params)).await?;
        Ok(response.json().await?)
    }

    async fn get(&self, file_id: &str) -> Result<DriveFile, DriveError> {
        let request = self
            .http
            .get(self.file_url(file_id))
            .query(&[("fields", FILE_FIELDS)]);
        Ok(self.send(request).await?.json().await?)
    }

    async fn download(&self, file_id: &str) -> Result<Vec<u8>, DriveError> {
        let request = self
            .http
            .get(self.file_url(file_id))
            .query(&[("alt", "media")]);
        Ok(self.send(request).await?.bytes().await?.to_vec())
    }

    async fn create_folder(
        &self,
        name: &str,
        parent: Option<&str>,
    ) -> Result<DriveFile, DriveError> {
        let meta = NewFile {
            name: name.to_string(),
            mime_type: Some(FOLDER_MIME.to_string()),
            parents: parent.map(|p| vec![p.to_string()]).unwrap_or_default(),
            ..Default::default()
        };
        let request = self
            .http
            .post(format!("{}/files", self.endpoints.api_base))
            .query(&[("fields", FILE_FIELDS)])
            .json(&meta);
        Ok(self.send(request).await?.json().await?)
    }

    async fn create_file(&self, meta: &NewFile, content: &[u8]) -> Result<DriveFile, DriveError> {
        let (content_type, body) = multipart_related(meta, content)?;
        let request = self
            .http
            .post(format!("{}/files", self.endpoints.upload_base))
            .query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS)])
            .header(header::CONTENT_TYPE, content_type)
            .body(body);
        Ok(self.send(request).await?.json().await?)
    }

    async fn update_file(
        &self,
        file_id: &str,
        meta: &NewFile,
        content: &[u8],
    ) -> Result<DriveFile, DriveError> {
        // parents are not writable through update
        let meta = NewFile {
            parents: Vec::new(),
            ..meta.clone()
        };
        let (content_type, body) = multipart_related(&meta, content)?;
        let request = self
            .http
            .patch(format!(
                "{}/files/{}",
                self.endpoints.upload_base,
                urlencoding::encode(file_id)
            ))
            .query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS)])
            .header(header::CONTENT_TYPE, content_type)
            .body(body);
        Ok(self.send(request).await?.json().await?)
    }

    async fn delete(&self, file_id: &str) -> Result<(), DriveError> {
        self.send(self.http.delete(self.file_url(file_id))).await?;
        Ok(())
    }

    async fn list_revisions(&self, file_id: &str) -> Result<Vec<Revision>, DriveError> {
        let url = format!("{}/revisions", self.file_url(file_id));
        let mut revisions = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut params = vec![(
                "fields",
                "nextPageToken,revisions(id,modifiedTime)".to_string(),
            )];
            if let Some(token) = &page_token {
                params.push(("pageToken", token.clone()));
            }
            let page: RevisionList = self
                .send(self.http.get(&url).query(&params))
                .await?
                .json()
                .await?;
            revisions.extend(page.revisions);
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        Ok(revisions)
    }

    async fn delete_revision(&self, file_id: &str, revision_id: &str) -> Result<(), DriveError> {
        let url = format!(
            "{}/revisions/{}",
            self.file_url(file_id),
            urlencoding::encode(revision_id)
        );
        self.send(self.http.delete(url)).await?;
        Ok(())
    }

    async fn storage_quota(&self) -> Result<StorageQuota, DriveError> {
        let request = self
            .http
            .get(format!("{}/about", self.endpoints.api_base))
            .query(&[("fields", "storageQuota")]);
        let about: About = self.send(request).await?.json().await?;
        Ok(about.storage_quota)
    }

    async fn create_permission(
        &self,
        file_id: &str,
        permission: &Permission,
    ) -> Result<Permission, DriveError> {
        let request = self
            .http
            .post(format!("{}/permissions", self.file_url(file_id)))
            .query(&[("sendNotificationEmail", "false")])
            .json(permission);
        Ok(self.send(request).await?.json().await?)
    }
}

/// Quote a literal for the provider's query language
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Render a [`FileFilter`] as a Drive `q` expression
pub fn render_query(filter: &FileFilter) -> String {
    let mut parts = Vec::new();
    if let Some(parent) = &filter.parent {
        parts.push(format!("{} in parents", quote(parent)));
    }
    match filter.kind {
        FileKind::Any => {}
        FileKind::Folder => parts.push(format!("mimeType={}", quote(FOLDER_MIME))),
        FileKind::Json => parts.push(format!("mimeType={}", quote(JSON_MIME))),
    }
    if let Some(name) = &filter.name {
        parts.push(format!("name={}", quote(name)));
    }
    parts.push(format!("trashed={}", filter.trashed));
    if let Some(cutoff) = filter.created_before {
        parts.push(format!("createdTime < {}", quote(&cutoff.to_rfc3339())));
    }
    for (key, value) in &filter.tags {
        parts.push(format!(
            "appProperties has {{ key={} and value={} }}",
            quote(key),
            quote(value)
        ));
    }
    parts.join(" and ")
}

/// Build a `multipart/related` upload body: metadata part, then media part
fn multipart_related(meta: &NewFile, content: &[u8]) -> Result<(String, Vec<u8>), DriveError> {
    let boundary = format!("portfolio-{}", Uuid::new_v4().simple());
    let metadata = serde_json::to_vec(meta).map_err(|e| DriveError::Decode(e.to_string()))?;
    let media_type = meta.mime_type.as_deref().unwrap_or(JSON_MIME);

    let mut body = Vec::with_capacity(metadata.len() + content.len() + 256);
    body.extend_from_slice(
        format!(
            "--{}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n",
            boundary
        )
        .as_bytes(),
    );
    body.extend_from_slice(&metadata);
    body.extend_from_slice(format!("\r\n--{}\r\nContent-Type: {}\r\n\r\n", boundary, media_type).as_bytes());
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());

    Ok((format!("multipart/related; boundary={}", boundary), body))
}
