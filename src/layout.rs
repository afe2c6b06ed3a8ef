//! Storage layout and file tagging
//!
//! ```text
//! <temp folder>/                     {filename}-temp-{millis}.json
//! <parent>/<final folder>/           legacy exports
//! <parent>/<final folder>/user_<x>/  {base}_{roll}.json
//! ```
//!
//! Tags on each file are the only index; nothing else records ownership.

use crate::drive::{Drive, DriveError, DriveFile, FileFilter};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use log::info;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

pub const STATUS_TEMPORARY: &str = "temporary";
pub const STATUS_FINAL: &str = "final";
pub const INITIAL_VERSION: &str = "1.0";

/// Where the backend keeps its folders
#[derive(Debug, Clone, PartialEq)]
pub struct StorageLayout {
    /// Parent of the final folder; `None` means the drive root
    pub parent_folder_id: Option<String>,
    pub temp_folder_name: String,
    pub final_folder_name: String,
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self {
            parent_folder_id: None,
            temp_folder_name: "portfolio-temp-storage".to_string(),
            final_folder_name: "student-portfolios".to_string(),
        }
    }
}

/// Folder name for an owner: `user_` plus the email with every
/// non-alphanumeric character replaced by `_`
///
/// # Examples
/// ```
/// use portfolio::layout::user_folder_name;
///
/// assert_eq!(user_folder_name("jane.doe@uni.edu"), "user_jane_doe_uni_edu");
/// ```
pub fn user_folder_name(email: &str) -> String {
    let mapped: String = email
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("user_{}", mapped)
}

/// Best-effort email for a user folder, for display only
///
/// The mapping is lossy: `@` and `.` both became `_`.
pub fn email_from_user_folder(folder_name: &str) -> String {
    folder_name
        .strip_prefix("user_")
        .unwrap_or(folder_name)
        .replace('_', ".")
}

/// Filename with everything outside `[A-Za-z0-9_-]` replaced by `_`
pub fn sanitize_base(filename: &str) -> String {
    filename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub fn final_file_name(filename: &str, roll: Option<&str>) -> String {
    let roll = roll.map(str::trim).filter(|r| !r.is_empty()).unwrap_or("unknown");
    format!("{}_{}.json", sanitize_base(filename), roll)
}

pub fn temp_file_name(filename: &str, now: DateTime<Utc>) -> String {
    format!("{}-temp-{}.json", filename, now.timestamp_millis())
}

/// Increment a version string by one tenth
///
/// # Examples
/// ```
/// use portfolio::layout::next_version;
///
/// assert_eq!(next_version("1.0"), "1.1");
/// assert_eq!(next_version("1.9"), "2.0");
/// assert_eq!(next_version("draft"), "1.1");
/// ```
pub fn next_version(version: &str) -> String {
    let tenths = version
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(|v| (v * 10.0).round() as u64)
        .unwrap_or(10);
    let next = tenths.saturating_add(1);
    format!("{}.{}", next / 10, next % 10)
}

pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Tags carried by a promoted portfolio
#[derive(Debug, Clone, PartialEq)]
pub struct FinalTags {
    pub roll: String,
    /// Email typed into the portfolio form
    pub portfolio_email: String,
    /// Authenticated owner
    pub email: String,
    pub uploaded_by: String,
    pub original_filename: String,
    pub user_id: String,
    pub created_at: String,
    pub updated_at: String,
    pub version: String,
}

impl FinalTags {
    /// Tags for a first save by `owner`
    pub fn new(
        owner: &str,
        portfolio_email: &str,
        filename: &str,
        roll: Option<&str>,
        now: DateTime<Utc>,
    ) -> Self {
        let stamp = timestamp(now);
        Self {
            roll: roll
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .unwrap_or("unknown")
                .to_string(),
            portfolio_email: portfolio_email.to_string(),
            email: owner.to_string(),
            uploaded_by: owner.to_string(),
            original_filename: filename.to_string(),
            user_id: owner.to_string(),
            created_at: stamp.clone(),
            updated_at: stamp,
            version: INITIAL_VERSION.to_string(),
        }
    }

    /// Carry the history of an earlier save forward
    ///
    /// `createdAt` and `uploadedBy` survive; the version is bumped.
    pub fn succeeding(mut self, previous: &HashMap<String, String>) -> Self {
        if let Some(created) = previous.get("createdAt").filter(|v| !v.is_empty()) {
            self.created_at = created.clone();
        }
        if let Some(uploader) = previous.get("uploadedBy").filter(|v| !v.is_empty()) {
            self.uploaded_by = uploader.clone();
        }
        let prior = previous
            .get("version")
            .map(String::as_str)
            .unwrap_or(INITIAL_VERSION);
        self.version = next_version(prior);
        self
    }

    pub fn from_tags(tags: &HashMap<String, String>) -> Self {
        let get = |key: &str| tags.get(key).cloned().unwrap_or_default();
        Self {
            roll: get("roll"),
            portfolio_email: get("portfolioEmail"),
            email: get("email"),
            uploaded_by: get("uploadedBy"),
            original_filename: get("originalFilename"),
            user_id: get("userId"),
            created_at: get("createdAt"),
            updated_at: get("updatedAt"),
            version: tags
                .get("version")
                .cloned()
                .unwrap_or_else(|| INITIAL_VERSION.to_string()),
        }
    }

    pub fn to_tags(&self) -> HashMap<String, String> {
        HashMap::from([
            ("roll".to_string(), self.roll.clone()),
            ("portfolioEmail".to_string(), self.portfolio_email.clone()),
            ("email".to_string(), self.email.clone()),
            ("uploadedBy".to_string(), self.uploaded_by.clone()),
            ("originalFilename".to_string(), self.original_filename.clone()),
            ("userId".to_string(), self.user_id.clone()),
            ("createdAt".to_string(), self.created_at.clone()),
            ("updatedAt".to_string(), self.updated_at.clone()),
            ("status".to_string(), STATUS_FINAL.to_string()),
            ("version".to_string(), self.version.clone()),
        ])
    }
}

/// Tags carried by a file waiting in temporary storage
#[derive(Debug, Clone, PartialEq)]
pub struct TempTags {
    pub original_filename: String,
    pub user_email: String,
    pub created_at: String,
}

impl TempTags {
    pub fn new(owner: &str, filename: &str, now: DateTime<Utc>) -> Self {
        Self {
            original_filename: filename.to_string(),
            user_email: owner.to_string(),
            created_at: timestamp(now),
        }
    }

    pub fn to_tags(&self) -> HashMap<String, String> {
        HashMap::from([
            ("originalFilename".to_string(), self.original_filename.clone()),
            ("userEmail".to_string(), self.user_email.clone()),
            ("status".to_string(), STATUS_TEMPORARY.to_string()),
            ("createdAt".to_string(), self.created_at.clone()),
        ])
    }
}

/// True when `file` belongs to `owner`: tagged as its `userId` or `email`
pub fn is_owned_by(file: &DriveFile, owner: &str) -> bool {
    if owner.is_empty() {
        return false;
    }
    let tags = FinalTags::from_tags(&file.app_properties);
    tags.user_id == owner || tags.email == owner
}

/// Storage client bound to a layout
///
/// Folder ids are resolved once and cached for the life of the store. The
/// cache lock is held through get-or-create so concurrent saves cannot
/// create the same folder twice.
pub struct PortfolioStore {
    drive: Arc<dyn Drive>,
    layout: StorageLayout,
    temp_max_age: Duration,
    folders: Mutex<HashMap<(Option<String>, String), String>>,
}

impl PortfolioStore {
    pub fn new(drive: Arc<dyn Drive>, layout: StorageLayout) -> Self {
        Self {
            drive,
            layout,
            temp_max_age: Duration::hours(24),
            folders: Mutex::new(HashMap::new()),
        }
    }

    /// Age after which temporary files count as stale
    pub fn with_temp_max_age(mut self, max_age: Duration) -> Self {
        self.temp_max_age = max_age;
        self
    }

    pub fn temp_max_age(&self) -> Duration {
        self.temp_max_age
    }

    pub fn drive(&self) -> &dyn Drive {
        self.drive.as_ref()
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Id of the folder `name` under `parent`, created when missing
    pub async fn folder(&self, name: &str, parent: Option<&str>) -> Result<String, DriveError> {
        let key = (parent.map(str::to_string), name.to_string());
        let mut cache = self.folders.lock().await;
        if let Some(id) = cache.get(&key) {
            return Ok(id.clone());
        }

        let id = match self.lookup(name, parent).await? {
            Some(id) => id,
            None => {
                let created = self.drive.create_folder(name, parent).await?;
                info!("[Folder] Created folder: {} with ID: {}", name, created.id);
                created.id
            }
        };
        cache.insert(key, id.clone());
        Ok(id)
    }

    /// Id of the folder `name` under `parent`, without creating it
    pub async fn find_folder(
        &self,
        name: &str,
        parent: Option<&str>,
    ) -> Result<Option<String>, DriveError> {
        let key = (parent.map(str::to_string), name.to_string());
        if let Some(id) = self.folders.lock().await.get(&key) {
            return Ok(Some(id.clone()));
        }
        self.lookup(name, parent).await
    }

    async fn lookup(&self, name: &str, parent: Option<&str>) -> Result<Option<String>, DriveError> {
        let filter = match parent {
            Some(parent) => FileFilter::in_folder(parent),
            None => FileFilter::anywhere(),
        }
        .folders()
        .named(name)
        .page_size(1);
        let found = self.drive.list(&filter).await?;
        Ok(found.files.into_iter().next().map(|f| f.id))
    }

    /// Drop cached folder ids after one of them turned out to be gone
    pub async fn forget_folders(&self) {
        self.folders.lock().await.clear();
    }

    pub async fn temp_folder(&self) -> Result<String, DriveError> {
        let parent = self.layout.parent_folder_id.clone();
        self.folder(&self.layout.temp_folder_name, parent.as_deref())
            .await
    }

    pub async fn find_temp_folder(&self) -> Result<Option<String>, DriveError> {
        let parent = self.layout.parent_folder_id.clone();
        self.find_folder(&self.layout.temp_folder_name, parent.as_deref())
            .await
    }

    pub async fn final_folder(&self) -> Result<String, DriveError> {
        let parent = self.layout.parent_folder_id.clone();
        self.folder(&self.layout.final_folder_name, parent.as_deref())
            .await
    }

    /// The owner's folder inside final storage
    pub async fn user_folder(&self, owner: &str) -> Result<String, DriveError> {
        let final_folder = self.final_folder().await?;
        self.folder(&user_folder_name(owner), Some(&final_folder))
            .await
    }

    /// The owner's folder if both it and final storage already exist
    pub async fn find_user_folder(&self, owner: &str) -> Result<Option<String>, DriveError> {
        let parent = self.layout.parent_folder_id.clone();
        let Some(final_folder) = self
            .find_folder(&self.layout.final_folder_name, parent.as_deref())
            .await?
        else {
            return Ok(None);
        };
        self.find_folder(&user_folder_name(owner), Some(&final_folder))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDrive;

    #[test]
    fn naming_helpers() {
        assert_eq!(user_folder_name("a+b@x.io"), "user_a_b_x_io");
        assert_eq!(email_from_user_folder("user_jane_x_io"), "jane.x.io");
        assert_eq!(sanitize_base("My Portfolio (v2)"), "My_Portfolio__v2_");
        assert_eq!(final_file_name("my file", Some("12-R52")), "my_file_12-R52.json");
        assert_eq!(final_file_name("p", None), "p_unknown.json");
        assert_eq!(final_file_name("p", Some("  ")), "p_unknown.json");

        let at = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        assert_eq!(temp_file_name("p", at), "p-temp-1700000000123.json");
    }

    #[test]
    fn versions_step_by_tenths() {
        assert_eq!(next_version("1.0"), "1.1");
        assert_eq!(next_version("1.9"), "2.0");
        assert_eq!(next_version("2.35"), "2.5");
        assert_eq!(next_version("legacy"), "1.1");
        assert_eq!(next_version("-3"), "1.1");
    }

    #[test]
    fn huge_versions_do_not_overflow() {
        let expected = format!("{}.{}", u64::MAX / 10, u64::MAX % 10);
        assert_eq!(next_version("1e30"), expected);
        assert_eq!(next_version(&expected), expected);
    }

    #[test]
    fn ownership_reads_either_owner_tag() {
        let mut file = DriveFile::default();
        assert!(!is_owned_by(&file, "a@x.io"));
        assert!(!is_owned_by(&file, ""));

        file.app_properties.insert("email".into(), "a@x.io".into());
        assert!(is_owned_by(&file, "a@x.io"));
        assert!(!is_owned_by(&file, "b@x.io"));

        file.app_properties.clear();
        file.app_properties.insert("userId".into(), "b@x.io".into());
        assert!(is_owned_by(&file, "b@x.io"));
    }

    #[test]
    fn final_tags_round_trip_through_the_tag_map() {
        let now = Utc::now();
        let tags = FinalTags::new("owner@x.io", "form@x.io", "p", Some("1-R52"), now);
        let map = tags.to_tags();
        assert_eq!(map["status"], "final");
        assert_eq!(map["userId"], "owner@x.io");
        assert_eq!(FinalTags::from_tags(&map), tags);
    }

    #[test]
    fn succeeding_tags_keep_history() {
        let previous = HashMap::from([
            ("createdAt".to_string(), "2024-01-01T00:00:00.000Z".to_string()),
            ("uploadedBy".to_string(), "first@x.io".to_string()),
            ("version".to_string(), "1.4".to_string()),
        ]);
        let tags = FinalTags::new("owner@x.io", "", "p", None, Utc::now()).succeeding(&previous);
        assert_eq!(tags.created_at, "2024-01-01T00:00:00.000Z");
        assert_eq!(tags.uploaded_by, "first@x.io");
        assert_eq!(tags.version, "1.5");
        assert_eq!(tags.roll, "unknown");
    }

    #[tokio::test]
    async fn folders_are_created_once() {
        let drive = Arc::new(MemoryDrive::new());
        let store = PortfolioStore::new(drive.clone(), StorageLayout::default());

        let first = store.user_folder("a@x.io").await.unwrap();
        let second = store.user_folder("a@x.io").await.unwrap();
        assert_eq!(first, second);
        // final folder + user folder
        assert_eq!(drive.file_count(), 2);

        // a fresh store finds the existing folders instead of duplicating
        let other = PortfolioStore::new(drive.clone(), StorageLayout::default());
        assert_eq!(other.user_folder("a@x.io").await.unwrap(), first);
        assert_eq!(drive.file_count(), 2);
    }

    #[tokio::test]
    async fn find_does_not_create() {
        let drive = Arc::new(MemoryDrive::new());
        let store = PortfolioStore::new(drive.clone(), StorageLayout::default());
        assert_eq!(store.find_temp_folder().await.unwrap(), None);
        assert_eq!(drive.file_count(), 0);

        let id = store.temp_folder().await.unwrap();
        assert_eq!(store.find_temp_folder().await.unwrap(), Some(id));
    }
}
