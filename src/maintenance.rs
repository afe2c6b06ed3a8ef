use crate::drive::{DriveError, FileFilter, Permission};
use crate::layout::{PortfolioStore, STATUS_TEMPORARY, email_from_user_folder, timestamp};
use chrono::{Duration, Utc};
use log::{error, info, warn};
use serde::Serialize;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Usage above this percentage is reported as near the limit
pub const NEAR_LIMIT_PERCENT: f64 = 80.0;

/// Outcome of a stale temporary file sweep
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub cleaned_count: usize,
    /// Files a dry run would have deleted
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageReport {
    #[serde(rename = "usedGB")]
    pub used_gb: f64,
    #[serde(rename = "limitGB")]
    pub limit_gb: f64,
    pub usage_percent: f64,
    pub is_near_limit: bool,
}

impl UsageReport {
    fn new(used: u64, limit: u64) -> Self {
        let percent = if limit > 0 {
            used as f64 / limit as f64 * 100.0
        } else {
            0.0
        };
        UsageReport {
            used_gb: round_to(used as f64 / GIB, 2),
            limit_gb: round_to(limit as f64 / GIB, 2),
            usage_percent: round_to(percent, 1),
            is_near_limit: percent > NEAR_LIMIT_PERCENT,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileCounts {
    pub temporary: usize,
    #[serde(rename = "final")]
    pub final_files: usize,
    pub user_portfolios: usize,
    pub legacy_files: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStat {
    pub user_folder: String,
    pub email: String,
    pub portfolio_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub total_users: usize,
    pub active_users: usize,
    pub user_stats: Vec<UserStat>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderIds {
    pub temp_folder_id: String,
    pub final_folder_id: String,
    pub parent_folder_id: Option<String>,
    pub user_folder_count: usize,
}

/// Snapshot served by the storage status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct StorageStatus {
    pub storage: UsageReport,
    pub files: FileCounts,
    pub users: UserSummary,
    pub folders: FolderIds,
    pub timestamp: String,
}

impl PortfolioStore {
    /// Delete temporary files older than `max_age`
    ///
    /// The temp folder is looked up, never created. With `dry_run` nothing is
    /// deleted and the candidates are reported instead.
    ///
    /// # Returns
    /// * `Result<CleanupReport, DriveError>` - Per-file failures are collected
    ///   in the report; only a failing lookup is an error
    pub async fn cleanup_old_temp_files(
        &self,
        max_age: Duration,
        dry_run: bool,
    ) -> Result<CleanupReport, DriveError> {
        info!(
            "[Cleanup] Starting cleanup of temp files older than {} hours...",
            max_age.num_hours()
        );
        let mut report = CleanupReport::default();

        let Some(temp_folder) = self.find_temp_folder().await? else {
            info!("[Cleanup] No temporary folder found. Nothing to clean up.");
            return Ok(report);
        };

        let cutoff = Utc::now() - max_age;
        let stale = self
            .drive()
            .list_all(
                &FileFilter::in_folder(temp_folder)
                    .json()
                    .created_before(cutoff)
                    .tagged("status", STATUS_TEMPORARY),
            )
            .await?;
        info!("[Cleanup] Found {} old temporary files", stale.len());

        for file in stale {
            let created = file.created_time.map(timestamp).unwrap_or_default();
            if dry_run {
                info!("[Cleanup][DRY-RUN] Would delete: {} (created: {})", file.name, created);
                report.candidates.push(file.name);
                continue;
            }
            match self.drive().delete(&file.id).await {
                Ok(()) => {
                    report.cleaned_count += 1;
                    info!("[Cleanup] Deleted: {} (created: {})", file.name, created);
                }
                Err(err) => {
                    let message = format!("Failed to delete {}: {}", file.name, err);
                    error!("[Cleanup] {}", message);
                    report.errors.push(message);
                }
            }
        }

        info!(
            "[Cleanup] Cleanup completed: {} files deleted, {} errors",
            report.cleaned_count,
            report.errors.len()
        );
        Ok(report)
    }

    /// Current quota usage, warning when it is close to the limit
    pub async fn check_storage_usage(&self) -> Result<UsageReport, DriveError> {
        let quota = self.drive().storage_quota().await?;
        let report = UsageReport::new(quota.usage.unwrap_or(0), quota.limit.unwrap_or(0));
        info!(
            "[Monitor] Storage Usage: {:.2}GB / {:.2}GB ({:.1}%)",
            report.used_gb, report.limit_gb, report.usage_percent
        );
        if report.is_near_limit {
            warn!("[Monitor] WARNING: Storage usage above {}%!", NEAR_LIMIT_PERCENT);
        }
        Ok(report)
    }

    /// Quota, file counts and per-user statistics
    pub async fn storage_status(&self) -> Result<StorageStatus, DriveError> {
        let storage = self.check_storage_usage().await?;

        let temp_folder = self.temp_folder().await?;
        let temporary = self
            .drive()
            .list_all(&FileFilter::in_folder(&temp_folder))
            .await?
            .len();

        let final_folder = self.final_folder().await?;
        let user_folders = self
            .drive()
            .list_all(&FileFilter::in_folder(&final_folder).folders())
            .await?;

        let mut user_stats = Vec::with_capacity(user_folders.len());
        for folder in &user_folders {
            match self
                .drive()
                .list_all(&FileFilter::in_folder(&folder.id).json())
                .await
            {
                Ok(files) => user_stats.push(UserStat {
                    user_folder: folder.name.clone(),
                    email: email_from_user_folder(&folder.name),
                    portfolio_count: files.len(),
                }),
                Err(err) => warn!(
                    "[Storage] Error counting portfolios for {}: {}",
                    folder.name, err
                ),
            }
        }
        user_stats.sort_by(|a, b| b.portfolio_count.cmp(&a.portfolio_count));

        let legacy_files = self
            .drive()
            .list_all(&FileFilter::in_folder(&final_folder).json())
            .await?
            .len();
        let user_portfolios: usize = user_stats.iter().map(|u| u.portfolio_count).sum();
        let final_files = user_portfolios + legacy_files;

        Ok(StorageStatus {
            storage,
            files: FileCounts {
                temporary,
                final_files,
                user_portfolios,
                legacy_files,
                total: temporary + final_files,
            },
            users: UserSummary {
                total_users: user_folders.len(),
                active_users: user_stats.iter().filter(|u| u.portfolio_count > 0).count(),
                user_stats,
            },
            folders: FolderIds {
                temp_folder_id: temp_folder,
                final_folder_id: final_folder,
                parent_folder_id: self.layout().parent_folder_id.clone(),
                user_folder_count: user_folders.len(),
            },
            timestamp: timestamp(Utc::now()),
        })
    }

    /// Give `email` write access to a folder, without a notification mail
    ///
    /// Used once to let the service account into a folder created by a person.
    pub async fn share_folder(&self, folder_id: &str, email: &str) -> Result<ShareReport, DriveError> {
        info!("[Share] Granting writer on {} to {}", folder_id, email);
        let granted = self
            .drive()
            .create_permission(folder_id, &Permission::writer(email))
            .await?;
        let folder = self.drive().get(folder_id).await?;
        info!("[Share] Folder \"{}\" shared, permission {}", folder.name, granted.id);
        Ok(ShareReport {
            permission_id: granted.id,
            folder_id: folder.id,
            folder_name: folder.name,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareReport {
    pub permission_id: String,
    pub folder_id: String,
    pub folder_name: String,
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
