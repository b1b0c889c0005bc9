use serde::Deserialize;
use serde_json::Value;
use std::fs;
use thiserror::Error;

use crate::modules::types::{UrlRecord, UrlTable};

/// Title given to the table when the blob is a bare record array.
pub const IMPLICIT_TABLE_TITLE: &str = "URLs";

/// Wire shape of the blob document. Single-table deployments store a bare
/// `Record[]`; multi-table deployments store a `Table[]`. The store persists
/// the same shape it loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotShape {
    Records,
    Tables,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot is not a JSON array")]
    NotAnArray,
    #[error("snapshot entries match neither tables nor records: {0}")]
    Malformed(serde_json::Error),
}

/// Decodes a snapshot document, detecting which of the two wire shapes it
/// uses. A bare record array is wrapped into one implicit table.
pub fn parse_snapshot(value: Value) -> Result<(Vec<UrlTable>, SnapshotShape), SnapshotError> {
    let entries = match &value {
        Value::Array(entries) => entries,
        _ => return Err(SnapshotError::NotAnArray),
    };

    // An empty blob carries no shape of its own; treat it as one implicit
    // empty table so records can still be added.
    if entries.is_empty() {
        return Ok((
            vec![UrlTable::new(IMPLICIT_TABLE_TITLE, Vec::new())],
            SnapshotShape::Records,
        ));
    }

    if entries[0].get("data").is_some() {
        let tables: Vec<UrlTable> =
            serde_json::from_value(value).map_err(SnapshotError::Malformed)?;
        return Ok((tables, SnapshotShape::Tables));
    }

    let records: Vec<UrlRecord> =
        serde_json::from_value(value).map_err(SnapshotError::Malformed)?;
    Ok((
        vec![UrlTable::new(IMPLICIT_TABLE_TITLE, records)],
        SnapshotShape::Records,
    ))
}

/// Encodes the collection in the given wire shape. `Records` writes the
/// record list of the single table as a bare array.
pub fn snapshot_value(tables: &[UrlTable], shape: SnapshotShape) -> Result<Value, serde_json::Error> {
    match shape {
        SnapshotShape::Tables => serde_json::to_value(tables),
        SnapshotShape::Records => {
            let records = tables.first().map(|t| t.records.as_slice()).unwrap_or(&[]);
            serde_json::to_value(records)
        }
    }
}

pub fn load_snapshot_file(path: &str) -> Result<Value, Box<dyn std::error::Error>> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Run configuration shared by the worker and the panel, loaded from
/// keeper.toml.
#[derive(Debug, Deserialize)]
pub struct KeeperConfig {
    /// Base URL of the blob backend, e.g. "http://localhost:7071".
    pub backend_url: String,
    #[serde(default = "default_container")]
    pub container: String,
    #[serde(default = "default_blob")]
    pub blob: String,
    /// Absolute URL the snapshot document can be fetched from.
    pub snapshot_url: Option<String>,
    /// Local file fallback when no snapshot URL is reachable.
    pub snapshot_file: Option<String>,
}

fn default_container() -> String {
    "data".to_string()
}

fn default_blob() -> String {
    "urls.json".to_string()
}

pub fn load_run_config(path: &str) -> Result<KeeperConfig, Box<dyn std::error::Error>> {
    let text = fs::read_to_string(path)?;
    let config: KeeperConfig = toml::from_str(&text)?;
    Ok(config)
}
