use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;

use crate::config::TaxonomySettings;
use crate::error::KiraError;
use crate::paging::PageSource;

/// Paged WoRMS REST endpoint, e.g. `AphiaRecordsByDate` with a fixed query
/// and a moving `offset`.
#[derive(Clone)]
pub struct WormsHttpClient {
    client: Client,
    base_url: String,
    endpoint: String,
    params: Vec<(String, String)>,
}

impl WormsHttpClient {
    pub fn new(settings: &TaxonomySettings) -> Result<Self, KiraError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("kira-sdm/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| KiraError::Filesystem(err.to_string()))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|err| KiraError::WormsHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: "https://www.marinespecies.org/rest".to_string(),
            endpoint: settings.endpoint.trim_matches('/').to_string(),
            params: settings.params.clone(),
        })
    }

    fn page_url(&self) -> String {
        format!("{}/{}", self.base_url, self.endpoint)
    }
}

impl PageSource for WormsHttpClient {
    fn fetch_page(&self, offset: u64, _page_size: u64) -> Result<Vec<Value>, KiraError> {
        let response = self
            .client
            .get(self.page_url())
            .query(&self.params)
            .query(&[("offset", offset)])
            .send()
            .map_err(|err| KiraError::WormsHttp(err.to_string()))?;

        // WoRMS signals the end of the listing with 204 rather than `[]`.
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "WoRMS request failed".to_string());
            return Err(KiraError::WormsStatus { status, message });
        }
        let body = response
            .text()
            .map_err(|err| KiraError::WormsHttp(err.to_string()))?;
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str::<Vec<Value>>(&body).map_err(|err| KiraError::WormsHttp(err.to_string()))
    }
}
