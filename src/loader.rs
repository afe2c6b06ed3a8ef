use crate::portfolio::{Attachment, Portfolio, Record, generate_record_id};
use chrono::Utc;
use serde_json::{Map, Value, json};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Failed to read portfolio file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Portfolio file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Load a portfolio export from disk
///
/// The file is parsed as JSON and passed through [`normalize_portfolio`],
/// so exports written by older editor versions load cleanly.
///
/// # Arguments
/// * `path` - Path to the exported `.json` file
///
/// # Returns
/// * `Result<Portfolio, LoadError>` - The normalized portfolio or an error
///
/// # Examples
/// ```no_run
/// use portfolio::loader::load_portfolio_file;
///
/// match load_portfolio_file("jane-doe-12-R52.json") {
///     Ok(p) => println!("{} achievements", p.achievements.len()),
///     Err(e) => eprintln!("Error loading portfolio: {}", e),
/// }
/// ```
pub fn load_portfolio_file(path: impl AsRef<Path>) -> Result<Portfolio, LoadError> {
    let raw = fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&raw)?;
    Ok(normalize_portfolio(&value))
}

/// Upgrade a raw document of any vintage to the current shape
///
/// Non-object input yields an empty portfolio. Achievement and reflection
/// entries that are not objects are dropped.
pub fn normalize_portfolio(raw: &Value) -> Portfolio {
    let Some(object) = raw.as_object() else {
        return Portfolio::default();
    };

    let entries = |key: &str| -> Vec<Record> {
        object
            .get(key)
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(normalize_record).collect())
            .unwrap_or_default()
    };

    Portfolio {
        personal_info: object
            .get("personalInfo")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default(),
        achievements: entries("achievements"),
        reflections: entries("reflections"),
        profile_photo: object
            .get("profilePhoto")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
    }
}

/// Normalize one achievement or reflection entry
pub fn normalize_record(entry: &Value) -> Option<Record> {
    let mut out = entry.as_object()?.clone();

    if text(&out, "id").is_none() {
        out.insert("id".into(), Value::String(generate_record_id()));
    }

    // Single `image` predates the `images` list; stored images are kept as written
    let legacy = out.remove("image").filter(truthy);
    let mut images: Vec<Attachment> = match out.remove("images") {
        Some(Value::Array(list)) => list.iter().filter(|v| truthy(v)).map(stored_image).collect(),
        Some(single) if truthy(&single) => vec![stored_image(&single)],
        Some(_) => Vec::new(),
        None => legacy.iter().map(image_attachment).collect(),
    };

    let mut pdf = out.remove("pdf").and_then(inline_attachment);
    let mut ppt = out.remove("ppt").and_then(inline_attachment);

    let removed: Vec<Value> = ["attachments", "files", "documents"]
        .iter()
        .filter_map(|key| out.remove(*key))
        .collect();
    let folded = removed.into_iter().find(truthy);
    let folded = match folded {
        Some(Value::Array(list)) => list,
        Some(single) => vec![single],
        None => Vec::new(),
    };

    let mut others = Vec::new();
    for attachment in folded.iter().filter_map(attachment_object) {
        match classify(&attachment) {
            AttachmentKind::Image => images.push(image_attachment(&Value::Object(attachment))),
            AttachmentKind::Pdf => {
                if pdf.is_none() {
                    pdf = Some(with_defaults(attachment, "file.pdf", "application/pdf"));
                }
            }
            AttachmentKind::Ppt => {
                if ppt.is_none() {
                    ppt = Some(with_defaults(
                        attachment,
                        "file.pptx",
                        "application/vnd.ms-powerpoint",
                    ));
                }
            }
            AttachmentKind::Other => others.push(Value::Object(attachment)),
        }
    }
    if !others.is_empty() {
        out.insert("_otherAttachments".into(), Value::Array(others));
    }

    let field = |out: &Map<String, Value>, key: &str| text(out, key).unwrap_or_default();
    let description = text(&out, "description")
        .or_else(|| text(&out, "content"))
        .unwrap_or_default();

    let record = Record {
        id: field(&out, "id"),
        title: field(&out, "title"),
        category: field(&out, "category"),
        date: text(&out, "date").unwrap_or_else(|| Utc::now().format("%Y-%m-%d").to_string()),
        description,
        status: text(&out, "status").unwrap_or_else(|| "completed".to_string()),
        mood: text(&out, "mood"),
        content: text(&out, "content"),
        linked_achievement: text(&out, "linkedAchievement"),
        images,
        pdf: pdf.map(|a| attachment_from(&a)),
        ppt: ppt.map(|a| attachment_from(&a)),
        extra: Map::new(),
    };

    for key in [
        "id",
        "title",
        "category",
        "date",
        "description",
        "status",
        "mood",
        "content",
        "linkedAchievement",
    ] {
        out.remove(key);
    }

    Some(Record { extra: out, ..record })
}

enum AttachmentKind {
    Image,
    Pdf,
    Ppt,
    Other,
}

fn classify(attachment: &Map<String, Value>) -> AttachmentKind {
    let mime = text(attachment, "type").unwrap_or_default().to_lowercase();
    let name = text(attachment, "name").unwrap_or_default().to_lowercase();
    let has_ext = |exts: &[&str]| exts.iter().any(|ext| name.ends_with(ext));

    if mime.starts_with("image/") || has_ext(&[".png", ".jpg", ".jpeg", ".gif", ".webp", ".bmp"]) {
        AttachmentKind::Image
    } else if mime.contains("pdf") || has_ext(&[".pdf"]) {
        AttachmentKind::Pdf
    } else if mime.contains("powerpoint") || has_ext(&[".ppt", ".pptx"]) {
        AttachmentKind::Ppt
    } else {
        AttachmentKind::Other
    }
}

/// Bring an attachment of any shape to `{name, type, data}`
///
/// Bare strings are URLs. A `url` field stands in for missing `data` and
/// supplies the name when there is none.
fn attachment_object(value: &Value) -> Option<Map<String, Value>> {
    match value {
        Value::String(url) if !url.is_empty() => {
            let name = url_file_name(url);
            let name = if name.is_empty() { "file".to_string() } else { name };
            Some(to_map(json!({"name": name, "type": "", "data": url})))
        }
        Value::Object(object) => {
            let mut out = object.clone();
            if let Some(url) = text(&out, "url") {
                if text(&out, "data").is_none() {
                    out.insert("data".into(), Value::String(url.clone()));
                }
                if text(&out, "name").is_none() {
                    out.insert("name".into(), Value::String(url_file_name(&url)));
                }
            }
            Some(out)
        }
        _ => None,
    }
}

/// `pdf`/`ppt` may be stored as a bare URL
fn inline_attachment(value: Value) -> Option<Map<String, Value>> {
    match value {
        Value::String(url) if !url.is_empty() => Some(to_map(json!({
            "name": url_file_name(&url),
            "type": "",
            "data": url,
        }))),
        Value::Object(object) => Some(object),
        _ => None,
    }
}

fn with_defaults(mut attachment: Map<String, Value>, name: &str, mime: &str) -> Map<String, Value> {
    if text(&attachment, "name").is_none() {
        attachment.insert("name".into(), Value::String(name.to_string()));
    }
    if text(&attachment, "type").is_none() {
        attachment.insert("type".into(), Value::String(mime.to_string()));
    }
    attachment
}

/// An entry already in `images`, type left as stored
fn stored_image(value: &Value) -> Attachment {
    match value {
        Value::Object(object) => Attachment {
            name: text(object, "name").unwrap_or_default(),
            mime_type: text(object, "type").unwrap_or_default(),
            data: text(object, "data")
                .or_else(|| text(object, "url"))
                .unwrap_or_default(),
        },
        other => Attachment {
            data: match other {
                Value::String(data) => data.clone(),
                _ => String::new(),
            },
            ..Attachment::default()
        },
    }
}

/// Images default to JPEG unless the name or data URI says PNG
fn image_attachment(value: &Value) -> Attachment {
    let (name, mime, data) = match value {
        Value::String(data) => (None, None, data.clone()),
        Value::Object(object) => (
            text(object, "name"),
            text(object, "type"),
            text(object, "data")
                .or_else(|| text(object, "url"))
                .unwrap_or_default(),
        ),
        _ => (None, None, String::new()),
    };
    let is_png = name
        .as_deref()
        .is_some_and(|n| n.to_lowercase().ends_with(".png"))
        || data.starts_with("data:image/png");
    let mime_type = if is_png {
        "image/png".to_string()
    } else {
        mime.unwrap_or_else(|| "image/jpeg".to_string())
    };
    Attachment {
        name: name.unwrap_or_else(|| "image".to_string()),
        mime_type,
        data,
    }
}

fn attachment_from(object: &Map<String, Value>) -> Attachment {
    Attachment {
        name: text(object, "name").unwrap_or_default(),
        mime_type: text(object, "type").unwrap_or_default(),
        data: text(object, "data").unwrap_or_default(),
    }
}

/// Last path segment of a URL without its query string
fn url_file_name(url: &str) -> String {
    let last = url.rsplit('/').next().unwrap_or(url);
    last.split('?').next().unwrap_or_default().to_string()
}

/// Non-empty string value; numbers are stringified
fn text(object: &Map<String, Value>, key: &str) -> Option<String> {
    match object.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

fn to_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
