//! Domain model for the review sync job: raw Tally responses, the fixed
//! reviews CSV schema, and alias-based field mapping.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "revsync-core";

/// Fixed column order of the published reviews CSV. Appended rows must match
/// this header exactly.
pub const CSV_COLUMNS: [&str; 7] = [
    "Product",
    "Brand",
    "Rating",
    "Comment",
    "Category",
    "Recommended",
    "Code",
];

/// Question label aliases. Many-to-one; lets the form wording drift without
/// code changes. Every target must be a member of [`CSV_COLUMNS`].
const BUILTIN_ALIASES: &[(&str, &str)] = &[
    ("Product", "Product"),
    ("Product name", "Product"),
    ("Product Name", "Product"),
    ("What product are you reviewing?", "Product"),
    ("Brand", "Brand"),
    ("Brand name", "Brand"),
    ("Brand Name", "Brand"),
    ("Rating", "Rating"),
    ("Rate it out of 5", "Rating"),
    ("How would you rate it out of 5?", "Rating"),
    ("Comment", "Comment"),
    ("Quick comment", "Comment"),
    ("Tell us why", "Comment"),
    ("Category", "Category"),
    ("Product category", "Category"),
    ("Recommended", "Recommended"),
    ("Would you recommend it?", "Recommended"),
    ("Recommend", "Recommended"),
    ("Recommendation", "Recommended"),
    ("Do you recommend this product?", "Recommended"),
    ("Postcode", "Code"),
    ("Postal code", "Code"),
    ("Post code", "Code"),
    ("Code", "Code"),
];

/// Raw form response as returned by the Tally API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    /// Opaque submission id; empty when the API omits it.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub submitted_at: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub answers: Vec<Answer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    #[serde(default)]
    pub question: Question,
    #[serde(default)]
    pub value: JsonValue,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Question {
    #[serde(default)]
    pub label: Option<String>,
}

impl Response {
    /// Raw submission timestamp string; falls back to `createdAt` when the
    /// API omits `submittedAt`.
    pub fn submitted_at_raw(&self) -> Option<&str> {
        self.submitted_at.as_deref().or(self.created_at.as_deref())
    }

    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        self.submitted_at_raw().and_then(parse_timestamp)
    }
}

/// Parse an RFC 3339 timestamp; naive timestamps are read as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let cleaned = value.trim();
    if cleaned.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(cleaned) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(cleaned, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[derive(Debug, Error)]
pub enum AliasTableError {
    #[error("alias {alias:?} targets unknown column {column:?}")]
    UnknownColumn { alias: String, column: String },
}

/// Immutable many-to-one map from question labels to canonical CSV columns.
#[derive(Debug, Clone)]
pub struct AliasTable {
    entries: BTreeMap<String, String>,
}

impl AliasTable {
    /// Build a table, rejecting aliases that point at columns the CSV schema
    /// does not have.
    pub fn new<'a>(
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self, AliasTableError> {
        let mut entries = BTreeMap::new();
        for (alias, column) in pairs {
            if !CSV_COLUMNS.contains(&column) {
                return Err(AliasTableError::UnknownColumn {
                    alias: alias.to_string(),
                    column: column.to_string(),
                });
            }
            entries.insert(alias.to_string(), column.to_string());
        }
        Ok(Self { entries })
    }

    pub fn builtin() -> Self {
        Self::new(BUILTIN_ALIASES.iter().copied())
            .expect("builtin aliases target known columns")
    }

    pub fn canonical_for(&self, label: &str) -> Option<&str> {
        self.entries.get(label.trim()).map(String::as_str)
    }

    pub fn labels(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(alias, column)| (alias.as_str(), column.as_str()))
    }
}

/// One appended CSV row, field order matching [`CSV_COLUMNS`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReviewRow {
    #[serde(rename = "Product")]
    pub product: String,
    #[serde(rename = "Brand")]
    pub brand: String,
    #[serde(rename = "Rating")]
    pub rating: String,
    #[serde(rename = "Comment")]
    pub comment: String,
    #[serde(rename = "Category")]
    pub category: String,
    #[serde(rename = "Recommended")]
    pub recommended: String,
    #[serde(rename = "Code")]
    pub code: String,
}

impl ReviewRow {
    /// Fields in CSV column order.
    pub fn csv_record(&self) -> [&str; 7] {
        [
            &self.product,
            &self.brand,
            &self.rating,
            &self.comment,
            &self.category,
            &self.recommended,
            &self.code,
        ]
    }

    fn field_mut(&mut self, column: &str) -> Option<&mut String> {
        match column {
            "Product" => Some(&mut self.product),
            "Brand" => Some(&mut self.brand),
            "Rating" => Some(&mut self.rating),
            "Comment" => Some(&mut self.comment),
            "Category" => Some(&mut self.category),
            "Recommended" => Some(&mut self.recommended),
            "Code" => Some(&mut self.code),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedResponse {
    pub row: ReviewRow,
    /// How many answers matched a known alias. Zero means the whole form
    /// edition drifted past the alias table; the row is still emitted.
    pub recognized_fields: usize,
}

/// Map a raw response onto the fixed CSV schema. Unknown labels are skipped,
/// unanswered columns stay empty; never fails.
pub fn map_response(response: &Response, aliases: &AliasTable) -> MappedResponse {
    let mut row = ReviewRow::default();
    let mut recognized_fields = 0;
    for answer in &response.answers {
        let Some(label) = answer.question.label.as_deref() else {
            continue;
        };
        let Some(column) = aliases.canonical_for(label) else {
            continue;
        };
        if let Some(slot) = row.field_mut(column) {
            *slot = extract_value(&answer.value);
            recognized_fields += 1;
        }
    }
    row.recommended = normalize_recommended(&row.recommended);
    MappedResponse {
        row,
        recognized_fields,
    }
}

/// Flatten a Tally answer value to a display string. Select widgets arrive
/// as objects carrying `label`, `labels`, or `text`.
pub fn extract_value(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(text) => text.clone(),
        JsonValue::Bool(flag) => flag.to_string(),
        JsonValue::Number(number) => number.to_string(),
        JsonValue::Array(items) => join_nonempty(items),
        JsonValue::Object(map) => {
            if let Some(JsonValue::String(label)) = map.get("label") {
                label.clone()
            } else if let Some(JsonValue::Array(labels)) = map.get("labels") {
                join_nonempty(labels)
            } else if let Some(JsonValue::String(text)) = map.get("text") {
                text.clone()
            } else {
                String::new()
            }
        }
    }
}

fn join_nonempty(items: &[JsonValue]) -> String {
    items
        .iter()
        .map(extract_value)
        .filter(|rendered| !rendered.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Canonicalize the Recommended column to Yes/No/Maybe; anything else passes
/// through untouched.
fn normalize_recommended(value: &str) -> String {
    match value.trim().to_ascii_lowercase().as_str() {
        "yes" => "Yes".to_string(),
        "no" => "No".to_string(),
        "maybe" => "Maybe".to_string(),
        _ => value.to_string(),
    }
}
