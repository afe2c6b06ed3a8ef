//! In-process storage backend
//!
//! [`MemoryDrive`] mirrors the semantics the portfolio store relies on:
//! folders, tags, a trash flag, one revision per write, quota accounting and
//! paginated listings. The server uses it with `--in-memory` for local
//! development and the test suite uses it everywhere.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use crate::drive::{
    Drive, DriveError, DriveFile, FOLDER_MIME, FileFilter, FileList, NewFile, Permission,
    Revision, StorageQuota,
};

const DEFAULT_PAGE_SIZE: usize = 100;

/// Operations that can be made to fail on purpose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryOp {
    List,
    Get,
    Download,
    CreateFolder,
    CreateFile,
    UpdateFile,
    Delete,
    ListRevisions,
    DeleteRevision,
    Quota,
    CreatePermission,
}

struct Stored {
    meta: DriveFile,
    content: Vec<u8>,
    revisions: Vec<Revision>,
    permissions: Vec<Permission>,
}

#[derive(Default)]
struct Inner {
    // keyed by zero-padded sequence ids, so iteration follows creation order
    files: BTreeMap<String, Stored>,
    next_id: u64,
    next_revision: u64,
    quota_limit: Option<u64>,
    failing: HashSet<MemoryOp>,
    /// Folders whose listings fail
    failing_folders: HashSet<String>,
}

impl Inner {
    fn allocate_id(&mut self) -> String {
        self.next_id += 1;
        format!("mem-{:06}", self.next_id)
    }

    fn revision(&mut self, at: DateTime<Utc>) -> Revision {
        self.next_revision += 1;
        Revision {
            id: format!("rev-{}", self.next_revision),
            modified_time: Some(at),
        }
    }

    fn usage(&self) -> u64 {
        self.files.values().map(|f| f.content.len() as u64).sum()
    }

    fn check(&self, op: MemoryOp) -> Result<(), DriveError> {
        if self.failing.contains(&op) {
            return Err(DriveError::Api {
                status: 500,
                message: format!("injected failure for {:?}", op),
            });
        }
        Ok(())
    }

    fn ensure_room(&self, released: u64, added: u64) -> Result<(), DriveError> {
        if let Some(limit) = self.quota_limit {
            if self.usage() - released + added > limit {
                return Err(DriveError::QuotaExceeded(
                    "The user's Drive storage quota has been exceeded.".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn stored(&self, file_id: &str) -> Result<&Stored, DriveError> {
        self.files
            .get(file_id)
            .ok_or_else(|| DriveError::NotFound(format!("File not found: {}", file_id)))
    }

    fn stored_mut(&mut self, file_id: &str) -> Result<&mut Stored, DriveError> {
        self.files
            .get_mut(file_id)
            .ok_or_else(|| DriveError::NotFound(format!("File not found: {}", file_id)))
    }
}

/// Storage backend that keeps every file in memory
#[derive(Default)]
pub struct MemoryDrive {
    inner: Mutex<Inner>,
}

impl MemoryDrive {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend whose total content size may not exceed `limit` bytes
    pub fn with_quota(limit: u64) -> Self {
        let drive = Self::default();
        drive.lock().quota_limit = Some(limit);
        drive
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // a panicking test thread must not poison the store for the others
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every subsequent call of `op` fail
    pub fn fail_on(&self, op: MemoryOp) {
        self.lock().failing.insert(op);
    }

    /// Make listings of one folder fail, leaving every other call alone
    pub fn fail_listing_in(&self, folder_id: &str) {
        self.lock().failing_folders.insert(folder_id.to_string());
    }

    pub fn clear_failures(&self) {
        let mut inner = self.lock();
        inner.failing.clear();
        inner.failing_folders.clear();
    }

    /// Grants recorded on a file, empty when it does not exist
    pub fn permissions(&self, file_id: &str) -> Vec<Permission> {
        self.lock()
            .files
            .get(file_id)
            .map(|f| f.permissions.clone())
            .unwrap_or_default()
    }

    /// Store a file with an explicit creation time
    ///
    /// Lets callers seed legacy layouts and aged temporary files.
    pub fn insert_file(&self, meta: NewFile, content: &[u8], created: DateTime<Utc>) -> String {
        let mut inner = self.lock();
        let id = inner.allocate_id();
        let revision = inner.revision(created);
        let file = DriveFile {
            id: id.clone(),
            name: meta.name,
            mime_type: meta.mime_type.unwrap_or_default(),
            parents: meta.parents,
            app_properties: meta.app_properties,
            description: meta.description,
            created_time: Some(created),
            modified_time: Some(created),
            size: Some(content.len() as u64),
            trashed: false,
        };
        inner.files.insert(
            id.clone(),
            Stored {
                meta: file,
                content: content.to_vec(),
                revisions: vec![revision],
                permissions: Vec::new(),
            },
        );
        id
    }

    /// Move a file to the trash
    pub fn trash(&self, file_id: &str) -> Result<(), DriveError> {
        self.lock().stored_mut(file_id)?.meta.trashed = true;
        Ok(())
    }

    /// Number of files and folders, trashed ones included
    pub fn file_count(&self) -> usize {
        self.lock().files.len()
    }

    /// Snapshot of every file matching the filter, in creation order
    pub fn snapshot(&self, filter: &FileFilter) -> Vec<DriveFile> {
        self.lock()
            .files
            .values()
            .filter(|f| filter.matches(&f.meta))
            .map(|f| f.meta.clone())
            .collect()
    }

    pub fn revision_count(&self, file_id: &str) -> usize {
        self.lock()
            .files
            .get(file_id)
            .map(|f| f.revisions.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Drive for MemoryDrive {
    async fn list(&self, filter: &FileFilter) -> Result<FileList, DriveError> {
        let inner = self.lock();
        inner.check(MemoryOp::List)?;
        if let Some(parent) = filter.parent.as_ref().filter(|p| inner.failing_folders.contains(*p)) {
            return Err(DriveError::Api {
                status: 500,
                message: format!("injected listing failure in {}", parent),
            });
        }

        let mut matching: Vec<DriveFile> = inner
            .files
            .values()
            .filter(|f| filter.matches(&f.meta))
            .map(|f| f.meta.clone())
            .collect();

        if filter.newest_first {
            matching.sort_by(|a, b| {
                b.modified_time
                    .cmp(&a.modified_time)
                    .then_with(|| b.id.cmp(&a.id))
            });
        }

        let offset: usize = match &filter.page_token {
            Some(token) => token
                .parse()
                .map_err(|_| DriveError::Decode(format!("invalid page token {}", token)))?,
            None => 0,
        };
        let page_size = filter
            .page_size
            .map(|s| s as usize)
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .max(1);

        let end = (offset + page_size).min(matching.len());
        let files = matching.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        let next_page_token = (end < matching.len()).then(|| end.to_string());

        Ok(FileList {
            files,
            next_page_token,
        })
    }

    async fn get(&self, file_id: &str) -> Result<DriveFile, DriveError> {
        let inner = self.lock();
        inner.check(MemoryOp::Get)?;
        Ok(inner.stored(file_id)?.meta.clone())
    }

    async fn download(&self, file_id: &str) -> Result<Vec<u8>, DriveError> {
        let inner = self.lock();
        inner.check(MemoryOp::Download)?;
        Ok(inner.stored(file_id)?.content.clone())
    }

    async fn create_folder(
        &self,
        name: &str,
        parent: Option<&str>,
    ) -> Result<DriveFile, DriveError> {
        let mut inner = self.lock();
        inner.check(MemoryOp::CreateFolder)?;
        if let Some(parent) = parent {
            inner.stored(parent)?;
        }

        let id = inner.allocate_id();
        let now = Utc::now();
        let folder = DriveFile {
            id: id.clone(),
            name: name.to_string(),
            mime_type: FOLDER_MIME.to_string(),
            parents: parent.map(|p| vec![p.to_string()]).unwrap_or_default(),
            created_time: Some(now),
            modified_time: Some(now),
            ..Default::default()
        };
        inner.files.insert(
            id,
            Stored {
                meta: folder.clone(),
                content: Vec::new(),
                revisions: Vec::new(),
                permissions: Vec::new(),
            },
        );
        Ok(folder)
    }

    async fn create_file(&self, meta: &NewFile, content: &[u8]) -> Result<DriveFile, DriveError> {
        let mut inner = self.lock();
        inner.check(MemoryOp::CreateFile)?;
        inner.ensure_room(0, content.len() as u64)?;
        for parent in &meta.parents {
            inner.stored(parent)?;
        }

        let id = inner.allocate_id();
        let now = Utc::now();
        let revision = inner.revision(now);
        let file = DriveFile {
            id: id.clone(),
            name: meta.name.clone(),
            mime_type: meta.mime_type.clone().unwrap_or_default(),
            parents: meta.parents.clone(),
            app_properties: meta.app_properties.clone(),
            description: meta.description.clone(),
            created_time: Some(now),
            modified_time: Some(now),
            size: Some(content.len() as u64),
            trashed: false,
        };
        inner.files.insert(
            id,
            Stored {
                meta: file.clone(),
                content: content.to_vec(),
                revisions: vec![revision],
                permissions: Vec::new(),
            },
        );
        Ok(file)
    }

    async fn update_file(
        &self,
        file_id: &str,
        meta: &NewFile,
        content: &[u8],
    ) -> Result<DriveFile, DriveError> {
        let mut inner = self.lock();
        inner.check(MemoryOp::UpdateFile)?;
        let released = inner.stored(file_id)?.content.len() as u64;
        inner.ensure_room(released, content.len() as u64)?;

        let now = Utc::now();
        let revision = inner.revision(now);
        let stored = inner.stored_mut(file_id)?;
        stored.meta.name = meta.name.clone();
        if let Some(mime) = &meta.mime_type {
            stored.meta.mime_type = mime.clone();
        }
        if meta.description.is_some() {
            stored.meta.description = meta.description.clone();
        }
        stored.meta.app_properties.extend(meta.app_properties.clone());
        stored.meta.modified_time = Some(now);
        stored.meta.size = Some(content.len() as u64);
        stored.content = content.to_vec();
        stored.revisions.push(revision);
        Ok(stored.meta.clone())
    }

    async fn delete(&self, file_id: &str) -> Result<(), DriveError> {
        let mut inner = self.lock();
        inner.check(MemoryOp::Delete)?;
        inner.stored(file_id)?;

        // deleting a folder removes everything below it
        let mut pending = vec![file_id.to_string()];
        while let Some(id) = pending.pop() {
            inner.files.remove(&id);
            pending.extend(
                inner
                    .files
                    .values()
                    .filter(|f| f.meta.parents.contains(&id))
                    .map(|f| f.meta.id.clone()),
            );
        }
        Ok(())
    }

    async fn list_revisions(&self, file_id: &str) -> Result<Vec<Revision>, DriveError> {
        let inner = self.lock();
        inner.check(MemoryOp::ListRevisions)?;
        Ok(inner.stored(file_id)?.revisions.clone())
    }

    async fn delete_revision(&self, file_id: &str, revision_id: &str) -> Result<(), DriveError> {
        let mut inner = self.lock();
        inner.check(MemoryOp::DeleteRevision)?;
        let stored = inner.stored_mut(file_id)?;
        if stored.revisions.len() <= 1 {
            return Err(DriveError::PermissionDenied(
                "The head revision of a file cannot be deleted".to_string(),
            ));
        }
        let before = stored.revisions.len();
        stored.revisions.retain(|r| r.id != revision_id);
        if stored.revisions.len() == before {
            return Err(DriveError::NotFound(format!(
                "Revision not found: {}",
                revision_id
            )));
        }
        Ok(())
    }

    async fn storage_quota(&self) -> Result<StorageQuota, DriveError> {
        let inner = self.lock();
        inner.check(MemoryOp::Quota)?;
        Ok(StorageQuota {
            limit: inner.quota_limit,
            usage: Some(inner.usage()),
        })
    }

    async fn create_permission(
        &self,
        file_id: &str,
        permission: &Permission,
    ) -> Result<Permission, DriveError> {
        let mut inner = self.lock();
        inner.check(MemoryOp::CreatePermission)?;
        inner.stored(file_id)?;
        let granted = Permission {
            id: format!("perm-{}", inner.allocate_id()),
            ..permission.clone()
        };
        inner.stored_mut(file_id)?.permissions.push(granted.clone());
        Ok(granted)
    }
}
