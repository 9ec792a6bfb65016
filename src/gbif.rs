use std::fs::File;
use std::path::Path;
use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};

use crate::backbone::{BackboneMatch, MatchType};
use crate::domain::JobStatus;
use crate::error::KiraError;
use crate::occurrence::Predicate;

/// Name reconciliation against the GBIF backbone.
pub trait NameMatchClient: Send + Sync {
    /// Matches one chunk of names. `query_index` on the returned rows is
    /// local to the chunk (0-based position in `names`).
    fn match_names(&self, names: &[String]) -> Result<Vec<BackboneMatch>, KiraError>;
}

/// Asynchronous bulk-download jobs on the occurrence archive.
pub trait OccurrenceDownloadClient: Send + Sync {
    fn submit(&self, request: &DownloadRequest) -> Result<String, KiraError>;
    fn status(&self, key: &str) -> Result<JobStatus, KiraError>;
    fn fetch_archive(&self, key: &str, destination: &Path) -> Result<(), KiraError>;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    pub creator: String,
    pub notification_addresses: Vec<String>,
    pub send_notification: bool,
    pub format: String,
    pub predicate: Predicate,
}

#[derive(Debug, Clone)]
pub struct GbifCredentials {
    pub user: String,
    pub password: String,
    pub email: String,
}

impl GbifCredentials {
    pub fn from_env() -> Result<Self, KiraError> {
        let read = |name: &str| {
            std::env::var(name)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .ok_or_else(|| KiraError::MissingCredentials(format!("{name} is not set")))
        };
        Ok(Self {
            user: read("GBIF_USER")?,
            password: read("GBIF_PWD")?,
            email: read("GBIF_EMAIL")?,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMatch {
    #[serde(default)]
    usage_key: Option<i64>,
    #[serde(default)]
    scientific_name: Option<String>,
    #[serde(default)]
    rank: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    confidence: Option<i64>,
    #[serde(default)]
    match_type: Option<MatchType>,
    #[serde(default)]
    synonym: Option<bool>,
    #[serde(default)]
    alternatives: Vec<UsageMatch>,
}

impl UsageMatch {
    fn into_rows(self, query_index: usize, rows: &mut Vec<BackboneMatch>) {
        rows.push(BackboneMatch {
            query_index,
            candidate_key: self.usage_key,
            scientific_name: self.scientific_name,
            match_type: self.match_type.unwrap_or(MatchType::None),
            taxonomic_status: self.status,
            rank: self.rank,
            confidence: self.confidence.unwrap_or(0),
            is_synonym: self.synonym.unwrap_or(false),
        });
        for alternative in self.alternatives {
            alternative.into_rows(query_index, rows);
        }
    }
}

#[derive(Debug, Deserialize)]
struct DownloadStatusBody {
    status: String,
}

#[derive(Clone)]
pub struct GbifHttpClient {
    client: Client,
    base_url: String,
    credentials: Option<GbifCredentials>,
}

impl GbifHttpClient {
    pub fn new(credentials: Option<GbifCredentials>) -> Result<Self, KiraError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("kira-sdm/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| KiraError::Filesystem(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|err| KiraError::GbifHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: "https://api.gbif.org/v1".to_string(),
            credentials,
        })
    }

    fn credentials(&self) -> Result<&GbifCredentials, KiraError> {
        self.credentials.as_ref().ok_or_else(|| {
            KiraError::MissingCredentials("occurrence downloads need GBIF credentials".to_string())
        })
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, KiraError>
    where
        F: FnMut() -> RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 500;
        let mut attempt = 0usize;
        loop {
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(KiraError::GbifHttp(err.to_string()));
                }
            }
        }
    }

    fn ensure_success(response: Response) -> Result<Response, KiraError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "GBIF request failed".to_string());
        Err(KiraError::GbifStatus { status, message })
    }
}

impl NameMatchClient for GbifHttpClient {
    fn match_names(&self, names: &[String]) -> Result<Vec<BackboneMatch>, KiraError> {
        let url = format!("{}/species/match", self.base_url);
        let mut rows = Vec::new();
        for (index, name) in names.iter().enumerate() {
            let response = self.send_with_retries(|| {
                self.client
                    .get(&url)
                    .query(&[("name", name.as_str()), ("verbose", "true")])
            })?;
            let usage: UsageMatch = Self::ensure_success(response)?
                .json()
                .map_err(|err| KiraError::GbifHttp(err.to_string()))?;
            usage.into_rows(index, &mut rows);
        }
        Ok(rows)
    }
}

impl OccurrenceDownloadClient for GbifHttpClient {
    fn submit(&self, request: &DownloadRequest) -> Result<String, KiraError> {
        let credentials = self.credentials()?;
        let url = format!("{}/occurrence/download/request", self.base_url);
        // Submissions are not idempotent, so they bypass the retry loop.
        let response = self
            .client
            .post(&url)
            .basic_auth(&credentials.user, Some(&credentials.password))
            .json(request)
            .send()
            .map_err(|err| KiraError::GbifHttp(err.to_string()))?;
        let key = Self::ensure_success(response)?
            .text()
            .map_err(|err| KiraError::GbifHttp(err.to_string()))?;
        Ok(key.trim().to_string())
    }

    fn status(&self, key: &str) -> Result<JobStatus, KiraError> {
        let url = format!("{}/occurrence/download/{key}", self.base_url);
        let response = self.send_with_retries(|| self.client.get(&url))?;
        let body: DownloadStatusBody = Self::ensure_success(response)?
            .json()
            .map_err(|err| KiraError::GbifHttp(err.to_string()))?;
        Ok(map_download_status(&body.status))
    }

    fn fetch_archive(&self, key: &str, destination: &Path) -> Result<(), KiraError> {
        let url = format!("{}/occurrence/download/request/{key}.zip", self.base_url);
        let response = self.send_with_retries(|| {
            self.client
                .get(&url)
                .timeout(Duration::from_secs(6 * 60 * 60))
        })?;
        let mut response = Self::ensure_success(response)?;
        let mut file =
            File::create(destination).map_err(|err| KiraError::Filesystem(err.to_string()))?;
        std::io::copy(&mut response, &mut file)
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

pub fn map_download_status(status: &str) -> JobStatus {
    match status {
        "PREPARING" => JobStatus::Pending,
        "RUNNING" | "SUSPENDED" => JobStatus::Running,
        "SUCCEEDED" => JobStatus::Done,
        _ => JobStatus::Failed,
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
