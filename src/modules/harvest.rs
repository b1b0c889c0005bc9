use std::error::Error;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use derive_more::with_trait::Display;
use log::{error, info};
use rand::Rng;
use rand::distr::Alphanumeric;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::modules::types::{UrlRecord, UrlTable};

/// Outcome counts of one harvest run.
#[derive(Debug, Default, Display, PartialEq)]
#[display("saved={saved} skipped={skipped} failed={failed}")]
pub struct HarvestSummary {
    pub saved: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Downloads every active URL record and stores the response body under
/// `<out_dir>/<table title>/<source>/`.
pub struct Harvester {
    client: Client,
    out_dir: PathBuf,
}

impl Harvester {
    pub fn new(out_dir: impl Into<PathBuf>) -> Result<Self, Box<dyn Error>> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            out_dir: out_dir.into(),
        })
    }

    /// Walks the collection once. Inactive records are skipped; a failing
    /// record is logged and never aborts the run.
    pub fn run(&self, tables: &[UrlTable]) -> HarvestSummary {
        let mut summary = HarvestSummary::default();

        for table in tables {
            for record in &table.records {
                if !record.active {
                    info!("Skipping inactive: {record}");
                    summary.skipped += 1;
                    continue;
                }
                match self.harvest(table, record) {
                    Ok(path) => {
                        info!("Saved {record} to {}", path.display());
                        summary.saved += 1;
                    }
                    Err(e) => {
                        error!("Failed {record}: {e}");
                        summary.failed += 1;
                    }
                }
            }
        }

        summary
    }

    fn harvest(&self, table: &UrlTable, record: &UrlRecord) -> Result<PathBuf, Box<dyn Error>> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("keeper/1.0"));

        let body = self
            .client
            .get(&record.url)
            .headers(headers)
            .send()?
            .error_for_status()?
            .text()?;

        let dir = self.out_dir.join(&table.title).join(&record.source);
        fs::create_dir_all(&dir)?;
        let path = dir.join(generate_filename());
        fs::write(&path, body)?;
        Ok(path)
    }
}

/// Timestamped filename with a random suffix, e.g.
/// `20260823101500-ab12cd-ef34gh-ij56kl.txt`.
pub fn generate_filename() -> String {
    let timestamp = Utc::now().format("%Y%m%d%H%M%S");
    let a = suffix_group();
    let b = suffix_group();
    let c = suffix_group();
    format!("{timestamp}-{a}-{b}-{c}.txt")
}

fn suffix_group() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_has_timestamp_and_three_groups() {
        let name = generate_filename();
        assert!(name.ends_with(".txt"));

        let stem = name.trim_end_matches(".txt");
        let parts: Vec<&str> = stem.split('-').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0].len(), 14);
        assert!(parts[0].chars().all(|c| c.is_ascii_digit()));
        for group in &parts[1..] {
            assert_eq!(group.len(), 6);
            assert!(group.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn inactive_records_are_skipped() {
        let table = UrlTable::new(
            "News",
            vec![UrlRecord {
                id: 1,
                active: false,
                source: "feedA".to_string(),
                url: "http://x/1".to_string(),
            }],
        );
        let harvester = Harvester::new(std::env::temp_dir()).unwrap();
        let summary = harvester.run(&[table]);
        assert_eq!(
            summary,
            HarvestSummary {
                saved: 0,
                skipped: 1,
                failed: 0
            }
        );
    }

    #[test]
    fn unreachable_urls_count_as_failed() {
        let table = UrlTable::new(
            "News",
            vec![UrlRecord {
                id: 1,
                active: true,
                source: "feedA".to_string(),
                url: "not a url".to_string(),
            }],
        );
        let harvester = Harvester::new(std::env::temp_dir()).unwrap();
        let summary = harvester.run(&[table]);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.saved, 0);
    }
}
