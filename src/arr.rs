//! Arr (Sonarr/Radarr/Whisparr) history client.
//!
//! The only question putarr ever asks an Arr is "have you imported this
//! file yet?". [`ArrClient::check_imported`] walks the paginated history API
//! looking for a `downloadFolderImported` event whose `droppedPath` matches
//! the local path we downloaded to. [`check_imported_any`] asks every
//! configured service in turn, tolerating individual outages.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::retry::{retry, RetryConfig, RetryError, Retryable};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PAGE_SIZE: u64 = 1000;

/// The history event type recorded when an Arr imports a completed download.
const EVENT_IMPORTED: &str = "downloadFolderImported";

/// Errors returned by [`ArrClient`] methods.
#[derive(Debug)]
pub enum ArrError {
    Transport(reqwest::Error),
    Transient {
        url: String,
        status: StatusCode,
        retry_after: Option<String>,
    },
    Status { url: String, status: StatusCode },
    Decode { url: String, source: reqwest::Error },
    Cancelled,
}

impl fmt::Display for ArrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArrError::Transport(e) => write!(f, "request failed: {e}"),
            ArrError::Transient { url, status, .. } | ArrError::Status { url, status } => {
                write!(f, "url: {url}, status: {status}")
            }
            ArrError::Decode { url, source } => {
                write!(f, "url: {url}, error decoding response: {source}")
            }
            ArrError::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl std::error::Error for ArrError {}

impl Retryable for ArrError {
    fn is_retryable(&self) -> bool {
        matches!(self, ArrError::Transport(_) | ArrError::Transient { .. })
    }

    fn retry_after(&self) -> Option<&str> {
        match self {
            ArrError::Transient { retry_after, .. } => retry_after.as_deref(),
            _ => None,
        }
    }
}

impl From<RetryError<ArrError>> for ArrError {
    fn from(err: RetryError<ArrError>) -> Self {
        match err {
            RetryError::Op(e) => e,
            RetryError::Cancelled => ArrError::Cancelled,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryResponse {
    #[serde(default)]
    total_records: u64,
    #[serde(default)]
    records: Vec<HistoryRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryRecord {
    #[serde(default)]
    event_type: String,
    #[serde(default)]
    data: HashMap<String, String>,
}

/// Client for one Arr service's history API.
pub struct ArrClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    retry: RetryConfig,
    cancel: CancellationToken,
}

impl ArrClient {
    pub fn new(base_url: &str, api_key: &str, cancel: CancellationToken) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build HTTP client");
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            retry: RetryConfig::default(),
            cancel,
        }
    }

    /// Override the retry policy (used by tests).
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Whether this service's history records an import of `target_path`.
    ///
    /// Pages through `/api/v3/history` until a matching record is found or
    /// every record has been inspected. Records without a `droppedPath` are
    /// skipped.
    pub async fn check_imported(&self, target_path: &str) -> Result<bool, ArrError> {
        let mut inspected: u64 = 0;
        let mut page: u64 = 0;

        loop {
            let url = format!(
                "{}/api/v3/history?includeSeries=false&includeEpisode=false&page={page}&pageSize={PAGE_SIZE}",
                self.base_url
            );
            let history = self.get_history(&url).await?;

            for record in &history.records {
                if record.event_type == EVENT_IMPORTED {
                    if let Some(dropped) = record.data.get("droppedPath") {
                        if dropped == target_path {
                            return Ok(true);
                        }
                    }
                }
                inspected += 1;
            }

            if history.total_records > inspected {
                page += 1;
            } else {
                return Ok(false);
            }
        }
    }

    async fn get_history(&self, url: &str) -> Result<HistoryResponse, ArrError> {
        retry(&self.cancel, &self.retry, |_| async move {
            let resp = self
                .http
                .get(url)
                .header("X-Api-Key", &self.api_key)
                .send()
                .await
                .map_err(ArrError::Transport)?;

            let status = resp.status();
            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                let retry_after = resp
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .map(ToString::to_string);
                return Err(ArrError::Transient {
                    url: url.to_string(),
                    status,
                    retry_after,
                });
            }
            if !status.is_success() {
                return Err(ArrError::Status {
                    url: url.to_string(),
                    status,
                });
            }

            resp.json::<HistoryResponse>()
                .await
                .map_err(|e| ArrError::Decode {
                    url: url.to_string(),
                    source: e,
                })
        })
        .await
        .map_err(ArrError::from)
    }
}

/// An Arr client paired with its service name, for logging.
pub struct ArrServiceClient {
    pub name: String,
    pub client: ArrClient,
}

/// Ask each service whether it imported `target_path`; returns the name of
/// the first one that confirms. Errors from individual services are logged
/// and do not fail the aggregate — an unreachable Sonarr must not stop
/// Radarr from confirming its own imports.
pub async fn check_imported_any(
    services: &[ArrServiceClient],
    target_path: &str,
) -> Option<String> {
    for svc in services {
        match svc.client.check_imported(target_path).await {
            Ok(true) => return Some(svc.name.clone()),
            Ok(false) => {}
            Err(e) => {
                warn!("error checking import from {}: {e}", svc.name);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use axum::extract::Query;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn client(base: &str) -> ArrClient {
        ArrClient::new(base, "arr-key", CancellationToken::new()).with_retry(RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            ..RetryConfig::default()
        })
    }

    #[derive(Deserialize)]
    struct PageQuery {
        page: u64,
    }

    #[tokio::test]
    async fn finds_import_on_later_page() {
        let hits = Arc::new(AtomicU32::new(0));
        let router = Router::new().route(
            "/api/v3/history",
            get({
                let hits = hits.clone();
                move |Query(q): Query<PageQuery>,
                      headers: axum::http::HeaderMap| {
                    let hits = hits.clone();
                    async move {
                        assert_eq!(headers.get("x-api-key").unwrap(), "arr-key");
                        hits.fetch_add(1, Ordering::SeqCst);
                        let records = if q.page == 0 {
                            json!([{"eventType": "grabbed", "data": {}}])
                        } else {
                            json!([{
                                "eventType": "downloadFolderImported",
                                "data": {"droppedPath": "/downloads/Movie/x.mkv"}
                            }])
                        };
                        Json(json!({"totalRecords": 2000, "records": records}))
                    }
                }
            }),
        );
        let base = serve(router).await;

        let imported = client(&base)
            .check_imported("/downloads/Movie/x.mkv")
            .await
            .unwrap();
        assert!(imported);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausted_pages_without_match_returns_false() {
        let router = Router::new().route(
            "/api/v3/history",
            get(|| async {
                Json(json!({
                    "totalRecords": 2,
                    "records": [
                        {"eventType": "grabbed", "data": {}},
                        {"eventType": "downloadFolderImported",
                         "data": {"droppedPath": "/downloads/Other/y.mkv"}}
                    ]
                }))
            }),
        );
        let base = serve(router).await;

        let imported = client(&base)
            .check_imported("/downloads/Movie/x.mkv")
            .await
            .unwrap();
        assert!(!imported);
    }

    #[tokio::test]
    async fn records_without_dropped_path_are_skipped() {
        let router = Router::new().route(
            "/api/v3/history",
            get(|| async {
                Json(json!({
                    "totalRecords": 1,
                    "records": [{"eventType": "downloadFolderImported", "data": {}}]
                }))
            }),
        );
        let base = serve(router).await;

        let imported = client(&base)
            .check_imported("/downloads/Movie/x.mkv")
            .await
            .unwrap();
        assert!(!imported);
    }

    #[tokio::test]
    async fn permanent_error_is_surfaced() {
        let router = Router::new().route(
            "/api/v3/history",
            get(|| async { axum::http::StatusCode::FORBIDDEN }),
        );
        let base = serve(router).await;

        let err = client(&base)
            .check_imported("/downloads/Movie/x.mkv")
            .await
            .unwrap_err();
        assert!(matches!(err, ArrError::Status { status, .. } if status == StatusCode::FORBIDDEN));
    }

    #[tokio::test]
    async fn multi_service_tolerates_failing_service() {
        // First service always 500s; second confirms the import.
        let broken = Router::new().route(
            "/api/v3/history",
            get(|| async { axum::http::StatusCode::INTERNAL_SERVER_ERROR }),
        );
        let healthy = Router::new().route(
            "/api/v3/history",
            get(|| async {
                Json(json!({
                    "totalRecords": 1,
                    "records": [{
                        "eventType": "downloadFolderImported",
                        "data": {"droppedPath": "/downloads/Movie/x.mkv"}
                    }]
                }))
            }),
        );
        let broken_base = serve(broken).await;
        let healthy_base = serve(healthy).await;

        let services = vec![
            ArrServiceClient {
                name: "sonarr".into(),
                client: client(&broken_base),
            },
            ArrServiceClient {
                name: "radarr".into(),
                client: client(&healthy_base),
            },
        ];

        let confirmed = check_imported_any(&services, "/downloads/Movie/x.mkv").await;
        assert_eq!(confirmed.as_deref(), Some("radarr"));
    }

    #[tokio::test]
    async fn multi_service_returns_none_when_nobody_confirms() {
        let router = Router::new().route(
            "/api/v3/history",
            get(|| async { Json(json!({"totalRecords": 0, "records": []})) }),
        );
        let base = serve(router).await;

        let services = vec![ArrServiceClient {
            name: "sonarr".into(),
            client: client(&base),
        }];
        let confirmed = check_imported_any(&services, "/downloads/Movie/x.mkv").await;
        assert!(confirmed.is_none());
    }
}
