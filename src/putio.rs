//! Typed put.io API client.
//!
//! [`PutioClient`] wraps a `reqwest::Client` with bearer-token auth and the
//! shared retry policy from [`crate::retry`]. Reads are GETs; state-changing
//! calls post multipart forms, rebuilt from buffered data on every attempt so
//! retries never re-stream a consumed body. Uploads go to a separate host
//! (`upload.put.io`) with the same policy.
//!
//! The module also carries the OOB authentication pair ([`get_oob`] /
//! [`check_oob`]) used by `putarr get-token`.

use std::fmt;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::retry::{retry, RetryConfig, RetryError, Retryable};

const DEFAULT_BASE_URL: &str = "https://api.put.io/v2";
const DEFAULT_UPLOAD_URL: &str = "https://upload.put.io/v2";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors returned by [`PutioClient`] methods.
#[derive(Debug)]
pub enum PutioError {
    /// HTTP transport failure (connection refused, timeout, DNS, ...).
    Transport(reqwest::Error),
    /// 429 or 5xx — worth retrying, possibly after the advised delay.
    Transient {
        url: String,
        status: StatusCode,
        retry_after: Option<String>,
    },
    /// Any other non-2xx status.
    Status { url: String, status: StatusCode },
    /// The response body was not the JSON we expected.
    Decode { url: String, source: reqwest::Error },
    /// The response was well-formed but missing required data.
    Protocol(String),
    /// The root token was cancelled mid-call.
    Cancelled,
}

impl fmt::Display for PutioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PutioError::Transport(e) => write!(f, "request failed: {e}"),
            PutioError::Transient { url, status, .. } | PutioError::Status { url, status } => {
                write!(f, "url: {url}, status: {status}")
            }
            PutioError::Decode { url, source } => {
                write!(f, "url: {url}, error decoding response: {source}")
            }
            PutioError::Protocol(msg) => write!(f, "{msg}"),
            PutioError::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl std::error::Error for PutioError {}

impl Retryable for PutioError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            PutioError::Transport(_) | PutioError::Transient { .. }
        )
    }

    fn retry_after(&self) -> Option<&str> {
        match self {
            PutioError::Transient { retry_after, .. } => retry_after.as_deref(),
            _ => None,
        }
    }
}

impl From<RetryError<PutioError>> for PutioError {
    fn from(err: RetryError<PutioError>) -> Self {
        match err {
            RetryError::Op(e) => e,
            RetryError::Cancelled => PutioError::Cancelled,
        }
    }
}

/// A put.io transfer as returned by the transfers API.
#[derive(Debug, Clone, Deserialize)]
pub struct Transfer {
    pub id: u64,
    pub hash: Option<String>,
    pub name: Option<String>,
    pub size: Option<i64>,
    pub downloaded: Option<i64>,
    pub finished_at: Option<String>,
    pub estimated_time: Option<i64>,
    #[serde(default)]
    pub status: String,
    pub started_at: Option<String>,
    pub error_message: Option<String>,
    pub file_id: Option<i64>,
    #[serde(default)]
    pub userfile_exists: bool,
}

impl Transfer {
    /// A transfer can be downloaded once put.io has assigned it a file.
    pub fn is_downloadable(&self) -> bool {
        self.file_id.is_some()
    }
}

/// A file or directory in the put.io file tree.
#[derive(Debug, Clone, Deserialize)]
pub struct FileInfo {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub file_type: String,
    #[serde(default)]
    pub content_type: String,
}

/// A directory listing: the directory itself plus its children.
#[derive(Debug, Clone, Deserialize)]
pub struct FileListing {
    pub parent: FileInfo,
    #[serde(default)]
    pub files: Vec<FileInfo>,
}

/// put.io account information.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountInfo {
    pub username: String,
    #[serde(default)]
    pub mail: String,
    #[serde(default)]
    pub account_active: bool,
}

#[derive(Deserialize)]
struct AccountInfoResponse {
    info: AccountInfo,
}

#[derive(Deserialize)]
struct ListTransfersResponse {
    #[serde(default)]
    transfers: Vec<Transfer>,
}

#[derive(Deserialize)]
struct GetTransferResponse {
    transfer: Transfer,
}

#[derive(Deserialize)]
struct UrlResponse {
    url: String,
}

/// Typed client for the put.io HTTP API.
pub struct PutioClient {
    http: reqwest::Client,
    api_token: String,
    base_url: String,
    upload_url: String,
    retry: RetryConfig,
    cancel: CancellationToken,
}

impl PutioClient {
    pub fn new(api_token: &str, cancel: CancellationToken) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build HTTP client");
        Self {
            http,
            api_token: api_token.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            upload_url: DEFAULT_UPLOAD_URL.to_string(),
            retry: RetryConfig::default(),
            cancel,
        }
    }

    /// Override the API and upload base URLs (used by tests).
    #[must_use]
    pub fn with_base_urls(mut self, base_url: &str, upload_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self.upload_url = upload_url.trim_end_matches('/').to_string();
        self
    }

    /// Override the retry policy (used by tests).
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// `GET /account/info` — used at startup to verify the API token.
    pub async fn account_info(&self) -> Result<AccountInfo, PutioError> {
        let url = format!("{}/account/info", self.base_url);
        let resp: AccountInfoResponse = self.get_json(&url).await?;
        Ok(resp.info)
    }

    /// `GET /transfers/list` — all transfers on the account.
    pub async fn list_transfers(&self) -> Result<Vec<Transfer>, PutioError> {
        let url = format!("{}/transfers/list", self.base_url);
        let resp: ListTransfersResponse = self.get_json(&url).await?;
        Ok(resp.transfers)
    }

    /// `GET /transfers/{id}` — a single transfer.
    pub async fn get_transfer(&self, transfer_id: u64) -> Result<Transfer, PutioError> {
        let url = format!("{}/transfers/{transfer_id}", self.base_url);
        let resp: GetTransferResponse = self.get_json(&url).await?;
        Ok(resp.transfer)
    }

    /// `POST /transfers/add` — add a transfer from a URL or magnet link.
    pub async fn add_transfer(&self, transfer_url: &str) -> Result<(), PutioError> {
        let url = format!("{}/transfers/add", self.base_url);
        let transfer_url = transfer_url.to_string();
        self.post_form(&url, move || {
            reqwest::multipart::Form::new().text("url", transfer_url.clone())
        })
        .await
    }

    /// `POST /files/upload` (upload host) — upload a .torrent file.
    pub async fn upload_torrent(&self, data: Vec<u8>) -> Result<(), PutioError> {
        let url = format!("{}/files/upload", self.upload_url);
        self.post_form(&url, move || {
            let part = reqwest::multipart::Part::bytes(data.clone()).file_name("upload.torrent");
            reqwest::multipart::Form::new()
                .part("file", part)
                .text("filename", "upload.torrent")
        })
        .await
    }

    /// `POST /transfers/remove` — remove a transfer from the account.
    pub async fn remove_transfer(&self, transfer_id: u64) -> Result<(), PutioError> {
        let url = format!("{}/transfers/remove", self.base_url);
        self.post_form(&url, move || {
            reqwest::multipart::Form::new().text("transfer_ids", transfer_id.to_string())
        })
        .await
    }

    /// `POST /files/delete` — delete a remote file or directory tree.
    pub async fn delete_file(&self, file_id: i64) -> Result<(), PutioError> {
        let url = format!("{}/files/delete", self.base_url);
        self.post_form(&url, move || {
            reqwest::multipart::Form::new().text("file_ids", file_id.to_string())
        })
        .await
    }

    /// `GET /files/list?parent_id={id}` — list a directory.
    pub async fn list_files(&self, parent_id: i64) -> Result<FileListing, PutioError> {
        let url = format!("{}/files/list?parent_id={parent_id}", self.base_url);
        self.get_json(&url).await
    }

    /// `GET /files/{id}/url` — the direct download URL for a file.
    pub async fn file_url(&self, file_id: i64) -> Result<String, PutioError> {
        let url = format!("{}/files/{file_id}/url", self.base_url);
        let resp: UrlResponse = self.get_json(&url).await?;
        Ok(resp.url)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, PutioError> {
        retry(&self.cancel, &self.retry, |_| async move {
            let resp = self
                .http
                .get(url)
                .bearer_auth(&self.api_token)
                .send()
                .await
                .map_err(PutioError::Transport)?;
            let resp = check_status(url, resp)?;
            resp.json::<T>().await.map_err(|e| PutioError::Decode {
                url: url.to_string(),
                source: e,
            })
        })
        .await
        .map_err(PutioError::from)
    }

    async fn post_form<F>(&self, url: &str, make_form: F) -> Result<(), PutioError>
    where
        F: Fn() -> reqwest::multipart::Form,
    {
        retry(&self.cancel, &self.retry, |_| {
            let form = make_form();
            async move {
                let resp = self
                    .http
                    .post(url)
                    .bearer_auth(&self.api_token)
                    .multipart(form)
                    .send()
                    .await
                    .map_err(PutioError::Transport)?;
                check_status(url, resp)?;
                Ok(())
            }
        })
        .await
        .map_err(PutioError::from)
    }
}

/// Classify a response status: 429/5xx are transient (with any `Retry-After`
/// captured), other non-2xx are permanent.
fn check_status(url: &str, resp: reqwest::Response) -> Result<reqwest::Response, PutioError> {
    let status = resp.status();
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        return Err(PutioError::Transient {
            url: url.to_string(),
            status,
            retry_after,
        });
    }
    if !status.is_success() {
        return Err(PutioError::Status {
            url: url.to_string(),
            status,
        });
    }
    Ok(resp)
}

/// Request a new OOB code for linking the app to a put.io account.
pub async fn get_oob() -> Result<String, PutioError> {
    let url = "https://api.put.io/v2/oauth2/oob/code?app_id=6487";
    let resp = reqwest::get(url).await.map_err(PutioError::Transport)?;
    let resp = check_status(url, resp)?;
    let body: std::collections::HashMap<String, String> =
        resp.json().await.map_err(|e| PutioError::Decode {
            url: url.to_string(),
            source: e,
        })?;
    body.get("code")
        .cloned()
        .ok_or_else(|| PutioError::Protocol("OOB code not found in response".into()))
}

/// Check whether an OOB code has been linked; returns the OAuth token once
/// the user has entered the code at put.io/link.
pub async fn check_oob(oob_code: &str) -> Result<String, PutioError> {
    let url = format!("https://api.put.io/v2/oauth2/oob/code/{oob_code}");
    let resp = reqwest::get(&url).await.map_err(PutioError::Transport)?;
    let resp = check_status(&url, resp)?;
    let body: std::collections::HashMap<String, String> =
        resp.json().await.map_err(|e| PutioError::Decode {
            url: url.clone(),
            source: e,
        })?;
    body.get("oauth_token")
        .cloned()
        .ok_or_else(|| PutioError::Protocol("OAuth token not found in response".into()))
}
