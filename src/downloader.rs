//! Reading portfolios back out of storage
//!
//! Owners read and delete their own files; the admin lists everything,
//! downloads raw documents and builds the manifest consumed by the viewer.

use crate::drive::{Drive, DriveFile, FileFilter};
use crate::error::AppError;
use crate::layout::{FinalTags, PortfolioStore, is_owned_by, timestamp};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use log::{info, warn};
use regex::{Captures, Regex};
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;

/// Most files returned for one owner
pub const USER_LIST_LIMIT: u32 = 50;

/// Names looked up in the caller's own app-data space, in order
pub const APP_DATA_NAMES: [&str; 2] = ["portfolio-data.json", "portfolio.json"];

lazy_static! {
    static ref JSON_EXT: Regex = Regex::new(r"(?i)\.json$").unwrap();
    static ref NAME_SUFFIX: Regex = Regex::new(r"(?i)-?(medfolio|portfolio|file)$").unwrap();
    static ref ROLL_SUFFIX: Regex = Regex::new(r"(?i)-?R?\d{2}$").unwrap();
    static ref SEPARATORS: Regex = Regex::new(r"[-_]+").unwrap();
    static ref SPACES: Regex = Regex::new(r"\s+").unwrap();
    static ref WORD_START: Regex = Regex::new(r"\b\w").unwrap();
    static ref ROLL_PATTERNS: Vec<Regex> = [
        r"(?i)(\d{1,3}-R\d{2})",
        r"(\d{3}-\d{2})",
        r"[_-](\d{3})[^\d]",
        r"(?i)[_-]([RS]\d{2})",
        r"(\d{2,3})\s*$",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect();
    static ref DIGITS_ONLY: Regex = Regex::new(r"^\d{2,3}$").unwrap();
}

/// How an owner picks one of their portfolios
#[derive(Debug, Clone, PartialEq)]
pub enum PortfolioSelector {
    Id(String),
    Filename(String),
    Latest,
}

impl PortfolioSelector {
    /// Id wins over filename; neither means the most recent file
    pub fn from_query(id: Option<String>, filename: Option<String>) -> Self {
        match (
            id.filter(|v| !v.is_empty()),
            filename.filter(|v| !v.is_empty()),
        ) {
            (Some(id), _) => PortfolioSelector::Id(id),
            (None, Some(filename)) => PortfolioSelector::Filename(filename),
            (None, None) => PortfolioSelector::Latest,
        }
    }
}

/// Row of the admin listing
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioListItem {
    pub id: String,
    pub file: String,
    pub name: String,
    pub roll: String,
    pub email: String,
    pub updated_at: Option<DateTime<Utc>>,
    pub uploaded_by: String,
    pub created_at: String,
    pub version: String,
    pub size: u64,
    pub user_folder: String,
}

/// Row of an owner's own listing
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPortfolioItem {
    pub id: String,
    pub filename: String,
    pub full_name: String,
    pub roll: String,
    pub created_at: String,
    pub updated_at: Option<DateTime<Utc>>,
    pub version: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub file: String,
    pub name: String,
    pub roll: String,
    pub email: String,
    pub size: u64,
    pub updated_at: Option<DateTime<Utc>>,
    pub drive_id: String,
    pub source: String,
}

fn strip_json(name: &str) -> String {
    JSON_EXT.replace(name, "").into_owned()
}

fn owner_of(file: &DriveFile) -> String {
    file.tag("email")
        .or_else(|| file.tag("userId"))
        .unwrap_or_default()
        .to_string()
}

fn created_or_modified(file: &DriveFile) -> String {
    match file.tag("createdAt") {
        Some(created) => created.to_string(),
        None => file.modified_time.map(timestamp).unwrap_or_default(),
    }
}

impl PortfolioListItem {
    fn new(file: &DriveFile, user_folder: &str, default_version: &str) -> Self {
        let file_label = match (user_folder, file.tag("originalFilename")) {
            ("legacy", _) | (_, None) => strip_json(&file.name),
            (_, Some(original)) => original.to_string(),
        };
        PortfolioListItem {
            id: file.id.clone(),
            file: file_label,
            name: file.name.clone(),
            roll: file.tag("roll").unwrap_or_default().to_string(),
            email: owner_of(file),
            updated_at: file.modified_time,
            uploaded_by: file
                .tag("uploadedBy")
                .or_else(|| file.tag("userId"))
                .unwrap_or_default()
                .to_string(),
            created_at: created_or_modified(file),
            version: file.tag("version").unwrap_or(default_version).to_string(),
            size: file.size.unwrap_or(0),
            user_folder: user_folder.to_string(),
        }
    }
}

impl From<&DriveFile> for UserPortfolioItem {
    fn from(file: &DriveFile) -> Self {
        let tags = FinalTags::from_tags(&file.app_properties);
        UserPortfolioItem {
            id: file.id.clone(),
            filename: if tags.original_filename.is_empty() {
                strip_json(&file.name)
            } else {
                tags.original_filename
            },
            full_name: file.name.clone(),
            roll: tags.roll,
            created_at: if tags.created_at.is_empty() {
                file.modified_time.map(timestamp).unwrap_or_default()
            } else {
                tags.created_at
            },
            updated_at: file.modified_time,
            version: tags.version,
            size: file.size.unwrap_or(0),
        }
    }
}

impl ManifestEntry {
    fn new(file: &DriveFile, source: &str) -> Self {
        let name = extract_student_name(&file.name);
        ManifestEntry {
            file: file.name.clone(),
            name: if name.is_empty() {
                strip_json(&file.name)
            } else {
                name
            },
            roll: file
                .tag("roll")
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| extract_roll(&file.name)),
            email: owner_of(file),
            size: file.size.unwrap_or(0),
            updated_at: file.modified_time,
            drive_id: file.id.clone(),
            source: source.to_string(),
        }
    }
}

/// Human readable name guessed from an export filename
///
/// # Examples
/// ```
/// use portfolio::downloader::extract_student_name;
///
/// assert_eq!(extract_student_name("jane-doe-portfolio.json"), "Jane Doe");
/// assert_eq!(extract_student_name("john_smith-R52.json"), "John Smith");
/// ```
pub fn extract_student_name(filename: &str) -> String {
    let name = strip_json(filename);
    let name = NAME_SUFFIX.replace(&name, "");
    let name = ROLL_SUFFIX.replace(&name, "");
    let name = SEPARATORS.replace_all(&name, " ");
    let name = SPACES.replace_all(&name, " ");
    let lower = name.trim().to_lowercase();
    WORD_START
        .replace_all(&lower, |caps: &Captures| caps[0].to_uppercase())
        .into_owned()
}

/// Roll number guessed from an export filename, or empty
///
/// Bare digit groups are widened to the `NNN-RNN` form.
pub fn extract_roll(filename: &str) -> String {
    for pattern in ROLL_PATTERNS.iter() {
        if let Some(found) = pattern.captures(filename).and_then(|c| c.get(1)) {
            let roll = found.as_str().to_uppercase();
            if DIGITS_ONLY.is_match(&roll) {
                let (head, tail) = roll.split_at(roll.len() - 2);
                return if head.is_empty() {
                    format!("000-R{}", tail)
                } else {
                    format!("{}-R{}", head, tail)
                };
            }
            return roll;
        }
    }
    String::new()
}

fn manifest_order(a: &ManifestEntry, b: &ManifestEntry) -> Ordering {
    match (a.roll.is_empty(), b.roll.is_empty()) {
        (false, false) => a.roll.cmp(&b.roll),
        (false, true) => Ordering::Less,
        (true, false) => Ordering::Greater,
        (true, true) => a.name.cmp(&b.name),
    }
}

fn parse_document(bytes: &[u8]) -> Result<Value, AppError> {
    serde_json::from_slice(bytes).map_err(|err| {
        warn!("[UserPortfolio] Error parsing portfolio JSON: {}", err);
        AppError::Corrupted
    })
}

fn no_portfolio() -> AppError {
    AppError::NotFound {
        message: "No portfolio found".to_string(),
        suggestion: Some(
            "Create your first portfolio by saving one from the portfolio page".to_string(),
        ),
    }
}

impl PortfolioStore {
    /// Every portfolio in final storage, newest first
    ///
    /// Files sitting directly in the final folder predate per-user folders
    /// and are reported with `userFolder: "legacy"`.
    pub async fn list_all_portfolios(&self) -> Result<Vec<PortfolioListItem>, AppError> {
        let final_folder = self.final_folder().await?;
        info!("[List] Scanning user folders in: {}", final_folder);

        let user_folders = self
            .drive()
            .list_all(&FileFilter::in_folder(&final_folder).folders())
            .await?;
        info!("[List] Found {} user folders", user_folders.len());

        let mut items = Vec::new();
        for folder in &user_folders {
            let filter = FileFilter::in_folder(&folder.id).json().newest_first();
            match self.drive().list_all(&filter).await {
                Ok(files) => items.extend(
                    files
                        .iter()
                        .map(|f| PortfolioListItem::new(f, &folder.name, "1.0")),
                ),
                Err(err) => warn!("[List] Error scanning folder {}: {}", folder.name, err),
            }
        }

        match self
            .drive()
            .list_all(&FileFilter::in_folder(&final_folder).json().newest_first())
            .await
        {
            Ok(legacy) => {
                info!("[List] Found {} legacy files", legacy.len());
                items.extend(
                    legacy
                        .iter()
                        .map(|f| PortfolioListItem::new(f, "legacy", "legacy")),
                );
            }
            Err(err) => warn!("[List] Error scanning legacy files: {}", err),
        }

        items.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        info!("[List] Found {} total portfolios across all user folders", items.len());
        Ok(items)
    }

    /// The owner's portfolios, newest first
    pub async fn list_user_portfolios(&self, owner: &str) -> Result<Vec<UserPortfolioItem>, AppError> {
        info!("[UserPortfolios] Fetching portfolios for user: {}", owner);
        let Some(folder) = self.find_user_folder(owner).await? else {
            return Ok(Vec::new());
        };
        let filter = FileFilter::in_folder(folder)
            .json()
            .newest_first()
            .page_size(USER_LIST_LIMIT);
        let files = self.drive().list(&filter).await?.files;
        info!("[UserPortfolios] Found {} portfolios for user: {}", files.len(), owner);
        Ok(files.iter().map(UserPortfolioItem::from).collect())
    }

    /// One of the owner's portfolio documents
    ///
    /// # Errors
    /// * `Forbidden` when the id belongs to someone else
    /// * `NotFound` when nothing matches the selector
    /// * `Corrupted` when the stored content is not JSON
    pub async fn find_user_portfolio(
        &self,
        owner: &str,
        selector: &PortfolioSelector,
    ) -> Result<Value, AppError> {
        info!("[UserPortfolio] Fetching portfolio for user: {}, {:?}", owner, selector);

        let target = match selector {
            PortfolioSelector::Id(id) => {
                let file = self.owned_file(owner, id, "Portfolio not found or access denied").await?;
                Some(file.id)
            }
            PortfolioSelector::Filename(filename) => match self.find_user_folder(owner).await? {
                Some(folder) => self
                    .drive()
                    .list_all(&FileFilter::in_folder(folder).json())
                    .await?
                    .into_iter()
                    .find(|f| f.tag("originalFilename") == Some(filename.as_str()))
                    .map(|f| f.id),
                None => None,
            },
            PortfolioSelector::Latest => match self.find_user_folder(owner).await? {
                Some(folder) => self
                    .drive()
                    .list(&FileFilter::in_folder(folder).json().newest_first().page_size(1))
                    .await?
                    .files
                    .into_iter()
                    .next()
                    .map(|f| f.id),
                None => None,
            },
        };

        let target = target.ok_or_else(no_portfolio)?;
        let bytes = self.drive().download(&target).await?;
        parse_document(&bytes)
    }

    /// Permanently delete one of the owner's portfolios
    pub async fn delete_user_portfolio(&self, owner: &str, file_id: &str) -> Result<(), AppError> {
        info!("[DeletePortfolio] User {} requesting to delete: {}", owner, file_id);
        let file = self.owned_file(owner, file_id, "Portfolio not found").await?;
        self.drive().delete(&file.id).await?;
        info!("[DeletePortfolio] Successfully deleted portfolio: {} for user: {}", file_id, owner);
        Ok(())
    }

    async fn owned_file(&self, owner: &str, file_id: &str, missing: &str) -> Result<DriveFile, AppError> {
        let file = self.drive().get(file_id).await.map_err(|err| {
            if err.is_not_found() {
                AppError::not_found(missing)
            } else {
                err.into()
            }
        })?;
        if !is_owned_by(&file, owner) {
            return Err(AppError::Forbidden(
                "Access denied: This portfolio belongs to another user".to_string(),
            ));
        }
        Ok(file)
    }

    /// Raw content of any file
    pub async fn download(&self, file_id: &str) -> Result<Vec<u8>, AppError> {
        Ok(self.drive().download(file_id).await?)
    }

    /// Manifest of every portfolio for the static viewer
    ///
    /// Covers exports placed directly in the parent folder as well as final
    /// storage. Entries with a roll number come first, ordered by roll, the
    /// rest by name.
    pub async fn generate_manifest(&self) -> Result<Vec<ManifestEntry>, AppError> {
        let mut manifest = Vec::new();

        if let Some(parent) = self.layout().parent_folder_id.clone() {
            let filter = FileFilter::in_folder(parent).json().newest_first();
            for file in self.drive().list_all(&filter).await? {
                manifest.push(ManifestEntry::new(&file, "drive"));
            }
        }

        let final_folder = self.final_folder().await?;
        let user_folders = self
            .drive()
            .list_all(&FileFilter::in_folder(&final_folder).folders())
            .await?;
        let mut folders = vec![final_folder];
        folders.extend(user_folders.into_iter().map(|f| f.id));
        for folder in folders {
            let filter = FileFilter::in_folder(&folder).json();
            match self.drive().list_all(&filter).await {
                Ok(files) => manifest.extend(files.iter().map(|f| ManifestEntry::new(f, "final-storage"))),
                Err(err) => warn!("[manifest] Error scanning folder {}: {}", folder, err),
            }
        }

        manifest.sort_by(manifest_order);
        info!("[manifest] Generated manifest with {} portfolios", manifest.len());
        Ok(manifest)
    }
}

/// Portfolio kept by older editor versions in the caller's own app-data space
///
/// `drive` must be authorized with the caller's own access token.
pub async fn user_drive_portfolio(drive: &dyn Drive) -> Result<Value, AppError> {
    for name in APP_DATA_NAMES {
        let filter = FileFilter::anywhere().app_data().named(name).page_size(1);
        let Some(file) = drive.list(&filter).await?.files.into_iter().next() else {
            continue;
        };
        info!("[user-portfolio] Found portfolio file: {} {}", file.name, file.id);
        let bytes = drive.download(&file.id).await.map_err(|err| {
            if err.is_not_found() {
                AppError::not_found("Portfolio not found in your Google Drive")
            } else {
                err.into()
            }
        })?;
        return parse_document(&bytes);
    }
    Err(AppError::not_found("No portfolio found in your Drive"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn student_names_from_filenames() {
        assert_eq!(extract_student_name("ana-maria_lopez-medfolio.json"), "Ana Maria Lopez");
        assert_eq!(extract_student_name("raj-kumar-12.JSON"), "Raj Kumar");
        assert_eq!(extract_student_name("portfolio.json"), "");
    }

    #[test]
    fn rolls_from_filenames() {
        assert_eq!(extract_roll("jane-123-r52.json"), "123-R52");
        assert_eq!(extract_roll("report-280-52.json"), "280-52");
        assert_eq!(extract_roll("x_221.json"), "2-R21");
        assert_eq!(extract_roll("name-S51.json"), "S51");
        assert_eq!(extract_roll("student 42"), "000-R42");
        assert_eq!(extract_roll("plain.json"), "");
    }

    #[test]
    fn selector_prefers_id() {
        assert_eq!(
            PortfolioSelector::from_query(Some("1".into()), Some("p".into())),
            PortfolioSelector::Id("1".into())
        );
        assert_eq!(
            PortfolioSelector::from_query(Some(String::new()), Some("p".into())),
            PortfolioSelector::Filename("p".into())
        );
        assert_eq!(PortfolioSelector::from_query(None, None), PortfolioSelector::Latest);
    }

    #[test]
    fn manifest_sorts_rolled_entries_first() {
        let entry = |roll: &str, name: &str| ManifestEntry {
            file: String::new(),
            name: name.to_string(),
            roll: roll.to_string(),
            email: String::new(),
            size: 0,
            updated_at: None,
            drive_id: String::new(),
            source: "drive".to_string(),
        };
        let mut entries = vec![entry("", "Zed"), entry("2-R52", "B"), entry("", "Amy"), entry("1-R52", "C")];
        entries.sort_by(manifest_order);
        let order: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(order, vec!["C", "B", "Amy", "Zed"]);
    }
}
