use derive_more::with_trait::Display;
use serde::{Deserialize, Serialize};

/// One URL entry inside a table. Ids are assigned by the store and are only
/// unique within the owning table.
#[derive(Debug, Deserialize, Clone, Display, Serialize, PartialEq)]
#[display("#{id} {source} {url}")]
pub struct UrlRecord {
    pub id: u64,
    pub active: bool,
    pub source: String,
    pub url: String,
}

/// A named, ordered group of URL records. The blob format names the record
/// list `data`, so the serde name diverges from the field name.
#[derive(Debug, Deserialize, Clone, Display, Serialize, PartialEq)]
#[display("{title} ({} urls)", records.len())]
pub struct UrlTable {
    pub title: String,
    #[serde(rename = "data")]
    pub records: Vec<UrlRecord>,
}

/// Fields for a new record; the store assigns the id.
#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct RecordDraft {
    pub active: bool,
    pub source: String,
    pub url: String,
}

/// Partial update for an existing record. Absent fields keep their value.
#[derive(Debug, Deserialize, Clone, Default, Serialize)]
pub struct RecordPatch {
    pub active: Option<bool>,
    pub source: Option<String>,
    pub url: Option<String>,
}

impl UrlTable {
    pub fn new(title: impl Into<String>, records: Vec<UrlRecord>) -> Self {
        Self {
            title: title.into(),
            records,
        }
    }
}
