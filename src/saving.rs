//! Two-tier save pipeline
//!
//! A save first lands in temporary storage, is validated there, and is then
//! promoted into the owner's folder in final storage. Housekeeping after the
//! promotion (duplicate pruning, revision pruning, trash and stale temp
//! cleanup) never fails the save.

use crate::drive::{DriveError, DriveFile, FileFilter, NewFile};
use crate::layout::{
    FinalTags, PortfolioStore, TempTags, final_file_name, sanitize_base, temp_file_name, timestamp,
};
use crate::portfolio::{
    ValidationError, check_shape, is_valid_email, is_valid_roll, validate_portfolio,
};
use chrono::Utc;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Body of a save request as sent by the editor
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SaveRequest {
    #[serde(default)]
    pub roll: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub portfolio: Option<Value>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// A save request that passed the request-level checks
#[derive(Debug, Clone)]
pub struct SaveInput {
    /// Email typed into the form, lowercased; not the owner
    pub portfolio_email: String,
    pub filename: String,
    pub roll: Option<String>,
    pub portfolio: Value,
    pub metadata: Map<String, Value>,
}

#[derive(Error, Debug, PartialEq)]
pub enum RequestError {
    #[error("Missing required fields: email, filename, or portfolio data")]
    MissingFields,

    #[error("Invalid email format or portfolio data")]
    Invalid,
}

impl SaveRequest {
    /// Apply the request-level gate
    ///
    /// Empty strings and `null` count as missing.
    pub fn into_input(self) -> Result<SaveInput, RequestError> {
        let email = self.email.filter(|e| !e.trim().is_empty());
        let filename = self.filename.filter(|f| !f.trim().is_empty());
        let portfolio = self.portfolio.filter(|p| !p.is_null());
        let (Some(email), Some(filename), Some(portfolio)) = (email, filename, portfolio) else {
            return Err(RequestError::MissingFields);
        };
        if !is_valid_email(&email) || !check_shape(&portfolio) {
            return Err(RequestError::Invalid);
        }

        let metadata = match self.metadata {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        Ok(SaveInput {
            portfolio_email: email.to_lowercase(),
            filename,
            roll: self.roll.filter(|r| !r.trim().is_empty()),
            portfolio,
            metadata,
        })
    }
}

impl SaveInput {
    /// Roll number used for naming: the form field first, then the request
    pub fn roll_no(&self) -> Option<&str> {
        self.portfolio
            .get("personalInfo")
            .and_then(|p| p.get("rollNo"))
            .and_then(Value::as_str)
            .filter(|r| !r.trim().is_empty())
            .or(self.roll.as_deref())
    }

    /// The roll number ends up in the file name and tags, so it must be well formed
    /// wherever it came from
    pub fn check_roll(&self) -> Result<(), ValidationError> {
        match self.roll_no() {
            Some(roll) if !is_valid_roll(roll) => Err(ValidationError::InvalidRollNumber),
            _ => Ok(()),
        }
    }
}

#[derive(Error, Debug)]
pub enum SaveError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Storage(#[from] DriveError),

    #[error("Failed to encode portfolio: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Result of a successful save
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveOutcome {
    pub file_id: String,
    pub file_name: String,
    /// False when an earlier save of the same filename was updated
    pub created: bool,
    pub version: String,
    pub prune: PruneReport,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneReport {
    pub deleted_duplicates: usize,
    pub deleted_revisions: usize,
    pub failures: usize,
}

impl PortfolioStore {
    /// Save a portfolio for `owner`
    ///
    /// # Arguments
    /// * `owner` - Authenticated, lowercased email; the only ownership source
    /// * `input` - The checked request
    ///
    /// # Returns
    /// * `Result<SaveOutcome, SaveError>` - The promoted file, or the step that failed
    pub async fn save_portfolio(
        &self,
        owner: &str,
        input: &SaveInput,
    ) -> Result<SaveOutcome, SaveError> {
        info!(
            "[Save] Authenticated user: {}, portfolio email: {}, filename: {}",
            owner, input.portfolio_email, input.filename
        );

        let temp_id = match self.save_to_temporary(owner, input).await {
            Err(SaveError::Storage(err)) if err.is_not_found() => {
                warn!("[Save] Temp folder is gone ({}), looking it up again", err);
                self.forget_folders().await;
                self.save_to_temporary(owner, input).await?
            }
            other => other?,
        };
        info!("[Save] Saved to temporary storage: {}", temp_id);

        let checked = validate_portfolio(owner, &input.portfolio).and_then(|()| input.check_roll());
        if let Err(err) = checked {
            warn!("[Validate] {}", err);
            self.delete_temporary(&temp_id).await;
            return Err(err.into());
        }

        let transferred = match self.transfer_to_final(owner, input).await {
            Err(SaveError::Storage(err)) if err.is_not_found() => {
                warn!("[Save] User folder is gone ({}), looking it up again", err);
                self.forget_folders().await;
                self.transfer_to_final(owner, input).await
            }
            other => other,
        };
        let (kept, created) = match transferred {
            Ok(result) => result,
            Err(err) => {
                self.delete_temporary(&temp_id).await;
                return Err(err);
            }
        };
        info!("[Save] Transferred to final storage: {}", kept.id);

        self.delete_temporary(&temp_id).await;

        let prune = self.prune_related(owner, &input.filename, &kept.id).await;
        self.empty_trash(owner).await;

        if let Err(err) = self.cleanup_old_temp_files(self.temp_max_age(), false).await {
            warn!("[Cleanup] Background old-temp cleanup skipped: {}", err);
        }

        Ok(SaveOutcome {
            version: kept.tag("version").unwrap_or_default().to_string(),
            file_id: kept.id,
            file_name: kept.name,
            created,
            prune,
        })
    }

    /// Step 1: the request as received, wrapped with upload metadata
    async fn save_to_temporary(&self, owner: &str, input: &SaveInput) -> Result<String, SaveError> {
        let now = Utc::now();
        let folder = self.temp_folder().await?;

        let mut metadata = input.metadata.clone();
        metadata.insert("email".into(), Value::String(owner.to_string()));
        metadata.insert("uploadedAt".into(), Value::String(timestamp(now)));
        metadata.insert("status".into(), Value::String("temporary".into()));
        let envelope = serde_json::json!({
            "portfolio": input.portfolio,
            "metadata": metadata,
        });
        let content = serde_json::to_vec_pretty(&envelope)?;

        let meta = NewFile::json(temp_file_name(&input.filename, now), folder)
            .with_description(format!("Temporary portfolio file for {}", owner))
            .with_tags(TempTags::new(owner, &input.filename, now).to_tags());
        let file = self.drive().create_file(&meta, &content).await?;
        Ok(file.id)
    }

    /// Step 3: create or update the owner's copy in final storage
    async fn transfer_to_final(
        &self,
        owner: &str,
        input: &SaveInput,
    ) -> Result<(DriveFile, bool), SaveError> {
        info!("[Transfer] Transferring portfolio to final storage for user: {}", owner);
        let now = Utc::now();
        let user_folder = self.user_folder(owner).await?;

        let roll = input.roll_no();
        let name = final_file_name(&input.filename, roll);
        let content = serde_json::to_vec_pretty(&input.portfolio)?;
        let tags = FinalTags::new(owner, &input.portfolio_email, &input.filename, roll, now);
        let description = format!(
            "Portfolio for {} ({}) - Owned by {} - Uploaded {}",
            input.portfolio_email,
            tags.roll,
            owner,
            timestamp(now)
        );

        let existing = self
            .drive()
            .list_all(&FileFilter::in_folder(&user_folder).json())
            .await?
            .into_iter()
            .find(|f| {
                f.tag("userId") == Some(owner) && f.tag("originalFilename") == Some(input.filename.as_str())
            });

        match existing {
            Some(previous) => {
                info!("[Transfer] Updating existing user portfolio: {}", previous.id);
                let tags = tags.succeeding(&previous.app_properties);
                let meta = NewFile::json(name, user_folder)
                    .with_description(description)
                    .with_tags(tags.to_tags());
                let updated = self.drive().update_file(&previous.id, &meta, &content).await?;
                Ok((updated, false))
            }
            None => {
                info!("[Transfer] Creating new portfolio file for user");
                let meta = NewFile::json(name, user_folder)
                    .with_description(description)
                    .with_tags(tags.to_tags());
                let created = self.drive().create_file(&meta, &content).await?;
                Ok((created, true))
            }
        }
    }

    /// Steps 2 and 4: permanent delete, failures only logged
    async fn delete_temporary(&self, temp_id: &str) {
        match self.drive().delete(temp_id).await {
            Ok(()) => info!("[Cleanup] Deleted temporary file: {}", temp_id),
            Err(err) => warn!("[Cleanup] Failed to delete temporary file {}: {}", temp_id, err),
        }
    }

    /// Step 5: leave exactly one file and one revision for owner+filename
    ///
    /// Untagged files named after the filename (`{base}.json`, `{base}_*`)
    /// are older exports of the same portfolio and are removed as well.
    pub async fn prune_related(&self, owner: &str, filename: &str, kept_id: &str) -> PruneReport {
        let mut report = PruneReport::default();

        let files = match self.user_folder(owner).await {
            Ok(folder) => {
                self.drive()
                    .list_all(&FileFilter::in_folder(folder).json())
                    .await
            }
            Err(err) => Err(err),
        };
        let files = match files {
            Ok(files) => files,
            Err(err) => {
                warn!("[Prune] Failed to prune backups/versions: {}", err);
                report.failures += 1;
                return report;
            }
        };

        let base = sanitize_base(filename);
        let legacy_prefix = format!("{}_", base);
        let legacy_exact = format!("{}.json", base);
        let related = files.iter().filter(|f| {
            if f.id == kept_id {
                return false;
            }
            if f.tag("userId") == Some(owner) && f.tag("originalFilename") == Some(filename) {
                return true;
            }
            f.tag("originalFilename").is_none()
                && (f.name == legacy_exact || f.name.starts_with(&legacy_prefix))
        });

        for file in related {
            match self.drive().delete(&file.id).await {
                Ok(()) => {
                    report.deleted_duplicates += 1;
                    info!("[Prune] Deleted duplicate/backup file: {} ({})", file.name, file.id);
                }
                Err(err) => {
                    report.failures += 1;
                    warn!("[Prune] Failed to delete {}: {}", file.id, err);
                }
            }
        }

        match self.drive().list_revisions(kept_id).await {
            Ok(mut revisions) if revisions.len() > 1 => {
                revisions.sort_by(|a, b| a.modified_time.cmp(&b.modified_time));
                revisions.pop();
                for revision in revisions {
                    match self.drive().delete_revision(kept_id, &revision.id).await {
                        Ok(()) => {
                            report.deleted_revisions += 1;
                            info!("[Prune] Deleted old revision {} of file {}", revision.id, kept_id);
                        }
                        Err(err) => {
                            report.failures += 1;
                            warn!(
                                "[Prune] Failed deleting revision {} of {}: {}",
                                revision.id, kept_id, err
                            );
                        }
                    }
                }
            }
            Ok(_) => {}
            Err(err) => warn!("[Prune] Skipped revision pruning: {}", err),
        }

        report
    }

    /// Step 6: permanently delete trashed JSON files in the folders we own
    ///
    /// Returns the number of files removed.
    pub async fn empty_trash(&self, owner: &str) -> usize {
        let mut folders = Vec::new();
        for folder in [
            self.temp_folder().await,
            self.final_folder().await,
            self.user_folder(owner).await,
        ] {
            match folder {
                Ok(id) => folders.push(id),
                Err(err) => warn!("[Cleanup] Selective trash cleanup encountered an issue: {}", err),
            }
        }

        let mut removed = 0;
        for folder in folders {
            let trashed = match self
                .drive()
                .list_all(&FileFilter::in_folder(&folder).json().trashed())
                .await
            {
                Ok(files) => files,
                Err(err) => {
                    warn!("[Cleanup] Skipped trash cleanup for folder {}: {}", folder, err);
                    continue;
                }
            };
            for file in trashed {
                match self.drive().delete(&file.id).await {
                    Ok(()) => {
                        removed += 1;
                        info!("[Cleanup] Permanently deleted trashed JSON: {} ({})", file.name, file.id);
                    }
                    Err(err) => warn!(
                        "[Cleanup] Failed to permanently delete trashed file {}: {}",
                        file.id, err
                    ),
                }
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(body: Value) -> SaveRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn missing_fields_are_rejected() {
        let err = request(json!({"email": "a@x.io", "portfolio": {}}))
            .into_input()
            .unwrap_err();
        assert_eq!(err, RequestError::MissingFields);

        let err = request(json!({"email": "", "filename": "p", "portfolio": {}}))
            .into_input()
            .unwrap_err();
        assert_eq!(err, RequestError::MissingFields);
    }

    #[test]
    fn invalid_email_or_shape_is_rejected() {
        let err = request(json!({"email": "nope", "filename": "p", "portfolio": {}}))
            .into_input()
            .unwrap_err();
        assert_eq!(err, RequestError::Invalid);

        let err = request(json!({"email": "a@x.io", "filename": "p", "portfolio": {"achievements": 1}}))
            .into_input()
            .unwrap_err();
        assert_eq!(err, RequestError::Invalid);
    }

    #[test]
    fn accepted_requests_lowercase_the_form_email() {
        let input = request(json!({
            "email": "Jane@X.io",
            "filename": "p",
            "roll": "7-R52",
            "portfolio": {"personalInfo": {}},
            "metadata": {"client": "web"}
        }))
        .into_input()
        .unwrap();
        assert_eq!(input.portfolio_email, "jane@x.io");
        assert_eq!(input.metadata["client"], "web");
        assert_eq!(input.roll_no(), Some("7-R52"));
    }

    #[test]
    fn form_roll_takes_precedence() {
        let input = request(json!({
            "email": "a@x.io",
            "filename": "p",
            "roll": "1-R50",
            "portfolio": {"personalInfo": {"rollNo": "2-R51"}}
        }))
        .into_input()
        .unwrap();
        assert_eq!(input.roll_no(), Some("2-R51"));
    }

    #[test]
    fn request_roll_must_be_well_formed() {
        let input = request(json!({
            "email": "a@x.io",
            "filename": "p",
            "roll": "../1-R50",
            "portfolio": {"personalInfo": {}}
        }))
        .into_input()
        .unwrap();
        assert_eq!(input.check_roll(), Err(ValidationError::InvalidRollNumber));

        let input = request(json!({
            "email": "a@x.io",
            "filename": "p",
            "roll": "../1-R50",
            "portfolio": {"personalInfo": {"rollNo": "2-R51"}}
        }))
        .into_input()
        .unwrap();
        assert_eq!(input.check_roll(), Ok(()));
    }
}
