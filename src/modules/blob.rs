use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use thiserror::Error;
use url::Url;

/// Why a full-document persist did not happen.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("invalid backend url: {0}")]
    BadUrl(#[from] url::ParseError),

    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),

    /// The backend answered with a non-2xx status; the body text is kept
    /// for diagnostics.
    #[error("backend returned {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("serialize: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Destination for whole-document overwrites. The store only ever replaces
/// the blob wholesale, so this is the entire write surface.
pub trait BlobSink {
    fn overwrite(&self, container: &str, blob: &str, document: &Value) -> Result<(), PersistError>;
}

/// Talks to the blob backend over its `overwrite_blob` HTTP function.
pub struct HttpBlobClient {
    base: Url,
    client: Client,
}

impl HttpBlobClient {
    pub fn new(base: &str) -> Result<Self, PersistError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            base: Url::parse(base)?,
            client,
        })
    }

    /// Fetches a snapshot document from an absolute URL.
    pub fn fetch_document(&self, snapshot_url: &str) -> Result<Value, PersistError> {
        let value = self
            .client
            .get(snapshot_url)
            .headers(default_headers())
            .send()?
            .error_for_status()?
            .json()?;
        Ok(value)
    }

    fn overwrite_endpoint(&self, container: &str, blob: &str) -> Result<Url, url::ParseError> {
        let mut url = self.base.join("api/overwrite_blob")?;
        url.query_pairs_mut()
            .append_pair("container", container)
            .append_pair("blob", blob);
        Ok(url)
    }
}

impl BlobSink for HttpBlobClient {
    fn overwrite(&self, container: &str, blob: &str, document: &Value) -> Result<(), PersistError> {
        let url = self.overwrite_endpoint(container, blob)?;
        let response = self
            .client
            .post(url)
            .headers(default_headers())
            .json(document)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(PersistError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static("keeper/1.0"));
    headers
}
