//! Portfolio document model and validation
//!
//! A portfolio is a single JSON document:
//!
//! ```json
//! { "personalInfo": {...}, "achievements": [...], "reflections": [...], "profilePhoto": "data:..." }
//! ```
//!
//! Records are flat objects with free-form fields. Unknown fields are kept so
//! that documents written by newer editors survive a round trip through the
//! backend.

use chrono::Utc;
use lazy_static::lazy_static;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Upper bound for a serialized portfolio
pub const MAX_PORTFOLIO_BYTES: usize = 10 * 1024 * 1024;

lazy_static! {
    static ref EMAIL_REGEX: Regex = Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap();
    static ref ROLL_REGEX: Regex = Regex::new(r"(?i)^\d{1,3}-?[RS]?\d{2}-?[A-Z]?$").unwrap();
    static ref NON_ALNUM_RUN: Regex = Regex::new(r"[^A-Za-z0-9]+").unwrap();
}

/// An embedded file: image, PDF or presentation
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Attachment {
    #[serde(default)]
    pub name: String,

    /// MIME type, empty when unknown
    #[serde(rename = "type", default)]
    pub mime_type: String,

    /// Data URI or URL
    #[serde(default)]
    pub data: String,
}

/// One achievement or reflection
///
/// Achievements use `category`, `description` and `status`; reflections use
/// `mood`, `content` and `linked_achievement`. Both share the rest.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub category: String,

    /// `YYYY-MM-DD`
    #[serde(default)]
    pub date: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mood: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_achievement: Option<String>,

    #[serde(default)]
    pub images: Vec<Attachment>,

    #[serde(default)]
    pub pdf: Option<Attachment>,

    #[serde(default)]
    pub ppt: Option<Attachment>,

    /// Fields this version does not know about
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A complete portfolio document
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Portfolio {
    #[serde(default)]
    pub personal_info: Map<String, Value>,

    #[serde(default)]
    pub achievements: Vec<Record>,

    #[serde(default)]
    pub reflections: Vec<Record>,

    #[serde(default)]
    pub profile_photo: Option<String>,
}

impl Portfolio {
    /// Resolve the achievement a reflection points at
    pub fn linked_achievement(&self, reflection: &Record) -> Option<&Record> {
        let id = reflection.linked_achievement.as_deref()?;
        self.achievements.iter().find(|a| a.id == id)
    }

    /// Reflections whose `linkedAchievement` does not resolve
    pub fn dangling_links(&self) -> Vec<&Record> {
        self.reflections
            .iter()
            .filter(|r| r.linked_achievement.is_some() && self.linked_achievement(r).is_none())
            .collect()
    }
}

/// Reasons a portfolio is rejected
#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    /// Names of the structural checks that did not pass
    #[error("Validation failed: {}", .0.join(", "))]
    FailedChecks(Vec<&'static str>),

    #[error("Invalid roll number format")]
    InvalidRollNumber,
}

/// Generate a record id: millisecond timestamp plus a 5 character suffix
///
/// # Examples
/// ```
/// use portfolio::portfolio::generate_record_id;
///
/// let id = generate_record_id();
/// assert!(id.len() > 5);
/// assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
/// ```
pub fn generate_record_id() -> String {
    const CHARSET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..5)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect();
    format!("{}{}", Utc::now().timestamp_millis(), suffix)
}

pub fn is_valid_email(email: &str) -> bool {
    EMAIL_REGEX.is_match(email)
}

/// Roll numbers like `12-R52`, `280S51` or `7-r52-a`, matched as given
pub fn is_valid_roll(roll: &str) -> bool {
    ROLL_REGEX.is_match(roll)
}

/// Request-level gate applied before anything is written
///
/// The portfolio must be an object whose `achievements` and `reflections`
/// are arrays when present.
pub fn check_shape(portfolio: &Value) -> bool {
    let Some(object) = portfolio.as_object() else {
        return false;
    };
    ["achievements", "reflections"]
        .iter()
        .all(|key| object.get(*key).is_none_or(Value::is_array))
}

/// Full validation run on a portfolio sitting in temporary storage
///
/// # Arguments
/// * `owner_email` - Authenticated email the document will belong to
/// * `portfolio` - The raw document
///
/// # Errors
/// * `FailedChecks` listing every structural check that failed
/// * `InvalidRollNumber` if `personalInfo.rollNo` is malformed
pub fn validate_portfolio(owner_email: &str, portfolio: &Value) -> Result<(), ValidationError> {
    let personal_info = portfolio.get("personalInfo").and_then(Value::as_object);
    let serialized_len = serde_json::to_vec(portfolio)
        .map(|bytes| bytes.len())
        .unwrap_or(usize::MAX);

    let checks = [
        ("hasPersonalInfo", personal_info.is_some_and(|p| !p.is_empty())),
        ("hasValidEmail", is_valid_email(owner_email)),
        (
            "hasAchievements",
            portfolio.get("achievements").is_some_and(Value::is_array),
        ),
        (
            "hasReflections",
            portfolio.get("reflections").is_some_and(Value::is_array),
        ),
        ("reasonableSize", serialized_len < MAX_PORTFOLIO_BYTES),
    ];

    let failed: Vec<&'static str> = checks
        .iter()
        .filter(|(_, passed)| !passed)
        .map(|(name, _)| *name)
        .collect();
    if !failed.is_empty() {
        return Err(ValidationError::FailedChecks(failed));
    }

    // empty or null means not given; anything else must be a well-formed string
    match personal_info.and_then(|p| p.get("rollNo")) {
        None | Some(Value::Null) => {}
        Some(Value::String(roll)) if roll.is_empty() || is_valid_roll(roll) => {}
        Some(_) => return Err(ValidationError::InvalidRollNumber),
    }
    Ok(())
}

/// First non-empty string among `keys` in the personal info
pub fn personal_field<'a>(info: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| info.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|value| !value.is_empty())
}

/// Standard export filename derived from name and roll number
///
/// `Jane Doe` + `12-R52` gives `jane-doe-12-R52`. Falls back to `fallback`
/// when the personal info has neither.
///
/// # Examples
/// ```
/// use portfolio::portfolio::standard_filename;
/// use serde_json::json;
///
/// let info = json!({"studentName": "Jane Doe", "rollNo": "12-r52"});
/// assert_eq!(standard_filename(info.as_object().unwrap(), "portfolio"), "jane-doe-12-R52");
/// ```
pub fn standard_filename(info: &Map<String, Value>, fallback: &str) -> String {
    let name = personal_field(info, &["studentName", "fullName", "firstName"]).map(|n| {
        n.chars()
            .filter(|c| c.is_ascii_alphanumeric() || c.is_whitespace())
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join("-")
            .to_lowercase()
    });
    let roll = personal_field(info, &["rollNo", "roll"]).map(|r| {
        r.chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
            .collect::<String>()
            .to_uppercase()
    });

    match (name.filter(|n| !n.is_empty()), roll.filter(|r| !r.is_empty())) {
        (Some(name), Some(roll)) => format!("{}-{}", name, roll),
        (Some(name), None) => name,
        (None, Some(roll)) => format!("portfolio-{}", roll),
        (None, None) => fallback.to_string(),
    }
}

/// Make an arbitrary string safe to use as an export filename stem
pub fn sanitize_export_name(name: &str) -> String {
    let dashed = NON_ALNUM_RUN.replace_all(name, "-");
    let trimmed: String = dashed.trim_matches('-').to_lowercase().chars().take(80).collect();
    if trimmed.is_empty() {
        "portfolio-data".to_string()
    } else {
        trimmed
    }
}
