//! Network access: specs, ID lists and event delivery.
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use reqwest::{header::RANGE, StatusCode, Url};
use serde_json::Value;

use crate::{Error, Result};

/// Specs document.
pub const DOWNLOAD_CONFIG_SPECS_ENDPOINT: &str = "download_config_specs";
/// ID list metadata.
pub const GET_ID_LISTS_ENDPOINT: &str = "get_id_lists";
/// Event batches.
pub const LOG_EVENT_ENDPOINT: &str = "log_event";

pub(crate) const SDK_TYPE: &str = "rust-server";
pub(crate) const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Transport used by the SDK to reach the Statsig API.
///
/// `Ok(None)` means the server answered without a body, which callers treat as "nothing new".
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// POST a JSON `body` to an API endpoint (one of the `*_ENDPOINT` constants).
    async fn post(&self, endpoint: &str, body: Value) -> Result<Option<String>>;

    /// GET an absolute `url` (an ID list file), starting at byte `range_start`.
    async fn get_range(&self, url: &str, range_start: u64) -> Result<Option<String>>;
}

/// [`Fetcher`] talking HTTP through `reqwest`.
pub struct HttpFetcher {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
    api: Url,
    secret_key: String,
    /// If we receive a 401 Unauthorized error during a request, it means the secret key is not
    /// valid. We cache this error so we don't issue additional requests to the server.
    unauthorized: AtomicBool,
}

impl HttpFetcher {
    /// Create a fetcher for base URL `api`.
    ///
    /// Returns [`Error::InvalidApiUrl`] if `api` does not parse.
    pub fn new(api: &str, secret_key: impl Into<String>) -> Result<HttpFetcher> {
        let mut api = Url::parse(api).map_err(Error::InvalidApiUrl)?;
        // `Url::join` replaces the last path segment unless the base ends with a slash.
        if !api.path().ends_with('/') {
            let path = format!("{}/", api.path());
            api.set_path(&path);
        }

        Ok(HttpFetcher {
            client: reqwest::Client::new(),
            api,
            secret_key: secret_key.into(),
            unauthorized: AtomicBool::new(false),
        })
    }

    fn check_status(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        response.error_for_status().map_err(|err| match err.status() {
            Some(StatusCode::UNAUTHORIZED) | Some(StatusCode::FORBIDDEN) => {
                log::warn!(target: "statsig", "client is not authorized. Check your server secret key");
                self.unauthorized.store(true, Ordering::Relaxed);
                Error::Unauthorized
            }
            Some(status) => {
                log::warn!(target: "statsig", status = status.as_u16(); "received non-success response");
                Error::UnexpectedStatus(status.as_u16())
            }
            None => Error::from(err),
        })
    }

    async fn read_body(response: reqwest::Response) -> Result<Option<String>> {
        let body = response.text().await?;
        Ok(Some(body).filter(|body| !body.is_empty()))
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn post(&self, endpoint: &str, body: Value) -> Result<Option<String>> {
        if self.unauthorized.load(Ordering::Relaxed) {
            return Err(Error::Unauthorized);
        }

        let url = self.api.join(endpoint).map_err(Error::InvalidApiUrl)?;

        log::debug!(target: "statsig", endpoint; "sending request");
        let response = self
            .client
            .post(url)
            .header("STATSIG-API-KEY", &self.secret_key)
            .header(
                "STATSIG-CLIENT-TIME",
                chrono::Utc::now().timestamp_millis().to_string(),
            )
            .header("STATSIG-SDK-TYPE", SDK_TYPE)
            .header("STATSIG-SDK-VERSION", SDK_VERSION)
            .json(&body)
            .send()
            .await?;

        let response = self.check_status(response)?;
        HttpFetcher::read_body(response).await
    }

    async fn get_range(&self, url: &str, range_start: u64) -> Result<Option<String>> {
        let url = Url::parse(url).map_err(Error::InvalidApiUrl)?;
        let response = self
            .client
            .get(url)
            .header(RANGE, format!("bytes={range_start}-"))
            .send()
            .await?;

        // Lists are served from a CDN, so an authorization failure here says nothing about the key.
        let response = response
            .error_for_status()
            .map_err(|err| match err.status() {
                Some(status) => Error::UnexpectedStatus(status.as_u16()),
                None => Error::from(err),
            })?;
        HttpFetcher::read_body(response).await
    }
}
