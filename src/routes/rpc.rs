//! The Transmission RPC endpoint.
//!
//! A single route, `/transmission/rpc`, speaking just enough of the protocol
//! for Sonarr/Radarr/Whisparr to treat putarr as a Transmission download
//! client.
//!
//! ## Session handshake
//!
//! Transmission clients expect a `409 Conflict` carrying an
//! `X-Transmission-Session-Id` header, which they echo back on subsequent
//! requests. putarr keeps no session state, so the id is an opaque constant:
//! GET always answers 409 with the header, and POSTs are accepted whether or
//! not the client sends it back.
//!
//! ## Authentication
//!
//! HTTP Basic, checked against the configured username/password. A failed
//! GET is a 403; a failed POST re-triggers the handshake with a 409 so the
//! client re-authenticates.

use std::collections::HashSet;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use base64::Engine;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::state::AppState;
use crate::transmission::{
    torrent_from_transfer, RpcRequest, RpcResponse, SessionConfig, Torrent, TorrentAddArguments,
    TorrentRemoveArguments,
};

const SESSION_HEADER: &str = "x-transmission-session-id";
const SESSION_ID: &str = "putarr-static-session-id";

/// Build the RPC router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/transmission/rpc", post(rpc_post).get(rpc_get))
        .with_state(state)
}

/// `GET /transmission/rpc` — the session handshake.
pub async fn rpc_get(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !credentials_valid(&headers, &state.config) {
        return StatusCode::FORBIDDEN.into_response();
    }
    session_conflict()
}

/// `POST /transmission/rpc` — method dispatch.
pub async fn rpc_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !credentials_valid(&headers, &state.config) {
        return session_conflict();
    }

    let req: RpcRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, Json(json!({"error": e.to_string()})))
                .into_response();
        }
    };

    match req.method.as_str() {
        "session-get" => {
            let session = SessionConfig::new(&state.config.download_directory);
            rpc_success(Some(
                serde_json::to_value(session).unwrap_or_default(),
            ))
        }

        "torrent-get" => match handle_torrent_get(&state).await {
            Ok(arguments) => rpc_success(Some(arguments)),
            Err(e) => {
                error!("torrent-get error: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e})))
                    .into_response()
            }
        },

        "torrent-add" => match handle_torrent_add(&state, req.arguments).await {
            Ok(()) => rpc_success(None),
            Err(e) => {
                error!("torrent-add error: {e}");
                (StatusCode::BAD_REQUEST, Json(json!({"error": e}))).into_response()
            }
        },

        "torrent-remove" => match handle_torrent_remove(&state, req.arguments).await {
            Ok(()) => rpc_success(None),
            Err(e) => {
                error!("torrent-remove error: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e})))
                    .into_response()
            }
        },

        // The Arrs send these but there is nothing to do on put.io's side.
        "torrent-set" | "queue-move-top" => rpc_success(None),

        method => {
            warn!("unknown RPC method: {method:?}");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "unknown method"})),
            )
                .into_response()
        }
    }
}

fn rpc_success(arguments: Option<serde_json::Value>) -> Response {
    Json(RpcResponse::success(arguments)).into_response()
}

fn session_conflict() -> Response {
    (StatusCode::CONFLICT, [(SESSION_HEADER, SESSION_ID)], "").into_response()
}

/// Check HTTP Basic credentials against the configured pair.
fn credentials_valid(headers: &HeaderMap, config: &Config) -> bool {
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((username, password)) = decoded.split_once(':') else {
        return false;
    };
    // Non-short-circuiting `&` so the password is always compared too.
    constant_time_eq(config.username.as_bytes(), username.as_bytes())
        & constant_time_eq(config.password.as_bytes(), password.as_bytes())
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of
/// `provided` length, so an attacker cannot probe the credential length or
/// a matching prefix through response times.
fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for i in 0..expected.len() {
        let p = if i < provided.len() {
            provided[i]
        } else {
            0xff
        };
        diff |= expected[i] ^ p;
    }
    diff == 0
}

async fn handle_torrent_get(state: &AppState) -> Result<serde_json::Value, String> {
    let transfers = state
        .putio
        .list_transfers()
        .await
        .map_err(|e| e.to_string())?;
    let torrents: Vec<Torrent> = transfers
        .iter()
        .map(|t| torrent_from_transfer(t, &state.config.download_directory))
        .collect();
    Ok(json!({ "torrents": torrents }))
}

async fn handle_torrent_add(
    state: &AppState,
    arguments: Option<serde_json::Value>,
) -> Result<(), String> {
    let Some(arguments) = arguments else {
        return Ok(());
    };
    let args: TorrentAddArguments =
        serde_json::from_value(arguments).map_err(|e| e.to_string())?;

    if let Some(metainfo) = args.metainfo {
        let data = base64::engine::general_purpose::STANDARD
            .decode(metainfo)
            .map_err(|e| e.to_string())?;
        state
            .putio
            .upload_torrent(data)
            .await
            .map_err(|e| e.to_string())?;
        info!("[ffff: unknown]: torrent uploaded");
    } else if let Some(filename) = args.filename {
        state
            .putio
            .add_transfer(&filename)
            .await
            .map_err(|e| e.to_string())?;
        info!("[ffff: {}]: magnet link uploaded", magnet_name(&filename));
    }

    Ok(())
}

/// Best-effort display name for a magnet link, from its `dn` parameter.
fn magnet_name(link: &str) -> String {
    if link.starts_with("magnet:") {
        if let Ok(parsed) = url::Url::parse(link) {
            if let Some((_, dn)) = parsed.query_pairs().find(|(k, _)| k == "dn") {
                return dn.into_owned();
            }
        }
    }
    "unknown".to_string()
}

async fn handle_torrent_remove(
    state: &AppState,
    arguments: Option<serde_json::Value>,
) -> Result<(), String> {
    let Some(arguments) = arguments else {
        return Ok(());
    };
    let args: TorrentRemoveArguments =
        serde_json::from_value(arguments).map_err(|e| e.to_string())?;

    let transfers = state
        .putio
        .list_transfers()
        .await
        .map_err(|e| e.to_string())?;

    // The Arrs identify torrents by info-hash. Transfers put.io has no hash
    // for (e.g. plain URL uploads) can never match; those ids fall through
    // as silent no-ops.
    let wanted: HashSet<&str> = args.ids.iter().map(String::as_str).collect();
    let mut matched: HashSet<&str> = HashSet::new();

    for transfer in &transfers {
        let Some(hash) = transfer.hash.as_deref() else {
            continue;
        };
        if !wanted.contains(hash) {
            continue;
        }
        matched.insert(hash);

        if let Err(e) = state.putio.remove_transfer(transfer.id).await {
            error!("failed to remove transfer {}: {e}", transfer.id);
            continue;
        }

        if args.delete_local_data && transfer.userfile_exists {
            if let Some(file_id) = transfer.file_id {
                if let Err(e) = state.putio.delete_file(file_id).await {
                    error!("failed to delete file {file_id}: {e}");
                }
            }
        }
    }

    for id in wanted.difference(&matched) {
        debug!("torrent-remove: no transfer with hash {id}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::routing::{get, post as axum_post};
    use serde_json::Value;
    use tokio::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    use crate::putio::PutioClient;

    /// Records calls made against the stub put.io backend.
    #[derive(Clone, Default)]
    struct Calls(Arc<Mutex<Vec<String>>>);

    impl Calls {
        async fn push(&self, call: impl Into<String>) {
            self.0.lock().await.push(call.into());
        }

        async fn snapshot(&self) -> Vec<String> {
            self.0.lock().await.clone()
        }
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    /// Stub put.io API: one SEEDING transfer with a hash, plus call recording.
    fn stub_putio(calls: Calls) -> Router {
        Router::new()
            .route(
                "/transfers/list",
                get(|State(calls): State<Calls>| async move {
                    calls.push("list").await;
                    Json(json!({
                        "transfers": [{
                            "id": 1,
                            "hash": "abcd1234",
                            "name": "Movie",
                            "size": 100,
                            "downloaded": 100,
                            "status": "SEEDING",
                            "file_id": 42,
                            "userfile_exists": true
                        }]
                    }))
                }),
            )
            .route(
                "/transfers/add",
                axum_post(|State(calls): State<Calls>, body: Bytes| async move {
                    let body = String::from_utf8_lossy(&body).into_owned();
                    calls.push(format!("add:{body}")).await;
                    Json(json!({"status": "OK"}))
                }),
            )
            .route(
                "/transfers/remove",
                axum_post(|State(calls): State<Calls>, body: Bytes| async move {
                    let body = String::from_utf8_lossy(&body).into_owned();
                    calls.push(format!("remove:{body}")).await;
                    Json(json!({"status": "OK"}))
                }),
            )
            .route(
                "/files/delete",
                axum_post(|State(calls): State<Calls>, body: Bytes| async move {
                    let body = String::from_utf8_lossy(&body).into_owned();
                    calls.push(format!("delete:{body}")).await;
                    Json(json!({"status": "OK"}))
                }),
            )
            .route(
                "/files/upload",
                axum_post(|State(calls): State<Calls>, body: Bytes| async move {
                    calls.push(format!("upload:{}", body.len())).await;
                    Json(json!({"status": "OK"}))
                }),
            )
            .with_state(calls)
    }

    async fn test_state(calls: Calls) -> AppState {
        let base = serve(stub_putio(calls)).await;
        let putio = PutioClient::new("token", CancellationToken::new())
            .with_base_urls(&base, &base);
        let config = Config {
            username: "user".into(),
            password: "pass".into(),
            download_directory: "/downloads".into(),
            ..Config::default()
        };
        AppState {
            config: Arc::new(config),
            putio: Arc::new(putio),
        }
    }

    async fn rpc_call(base: &str, body: Value) -> reqwest::Response {
        reqwest::Client::new()
            .post(format!("{base}/transmission/rpc"))
            .basic_auth("user", Some("pass"))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn get_handshake_returns_session_id() {
        let state = test_state(Calls::default()).await;
        let base = serve(router(state)).await;

        let resp = reqwest::Client::new()
            .get(format!("{base}/transmission/rpc"))
            .basic_auth("user", Some("pass"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 409);
        assert_eq!(
            resp.headers().get("x-transmission-session-id").unwrap(),
            SESSION_ID
        );
    }

    #[tokio::test]
    async fn get_with_bad_credentials_is_forbidden() {
        let state = test_state(Calls::default()).await;
        let base = serve(router(state)).await;

        let resp = reqwest::Client::new()
            .get(format!("{base}/transmission/rpc"))
            .basic_auth("user", Some("wrong"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 403);
    }

    #[tokio::test]
    async fn post_with_bad_credentials_retriggers_handshake() {
        let state = test_state(Calls::default()).await;
        let base = serve(router(state)).await;

        let resp = reqwest::Client::new()
            .post(format!("{base}/transmission/rpc"))
            .json(&json!({"method": "session-get"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 409);
        assert!(resp.headers().contains_key("x-transmission-session-id"));
    }

    #[tokio::test]
    async fn session_get_reports_static_session() {
        let state = test_state(Calls::default()).await;
        let base = serve(router(state)).await;

        let resp = rpc_call(&base, json!({"method": "session-get"})).await;
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["result"], "success");
        assert_eq!(body["arguments"]["rpc-version"], "18");
        assert_eq!(body["arguments"]["download-dir"], "/downloads");
    }

    #[tokio::test]
    async fn torrent_get_lists_transfers() {
        let state = test_state(Calls::default()).await;
        let base = serve(router(state)).await;

        let resp = rpc_call(&base, json!({"method": "torrent-get"})).await;
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        let torrents = body["arguments"]["torrents"].as_array().unwrap();
        assert_eq!(torrents.len(), 1);
        assert_eq!(torrents[0]["hashString"], "abcd1234");
        assert_eq!(torrents[0]["status"], 6);
        assert_eq!(torrents[0]["downloadDir"], "/downloads");
    }

    #[tokio::test]
    async fn torrent_add_magnet_calls_add_transfer() {
        let calls = Calls::default();
        let state = test_state(calls.clone()).await;
        let base = serve(router(state)).await;

        let resp = rpc_call(
            &base,
            json!({
                "method": "torrent-add",
                "arguments": {"filename": "magnet:?xt=urn:btih:abc&dn=Movie%20Name"}
            }),
        )
        .await;
        assert_eq!(resp.status(), 200);
        let body = resp.text().await.unwrap();
        assert_eq!(body, r#"{"result":"success"}"#);

        let calls = calls.snapshot().await;
        let add = calls.iter().find(|c| c.starts_with("add:")).unwrap();
        assert!(add.contains("magnet:?xt=urn:btih:abc&dn=Movie%20Name"));
    }

    #[tokio::test]
    async fn torrent_add_metainfo_uploads_torrent() {
        let calls = Calls::default();
        let state = test_state(calls.clone()).await;
        let base = serve(router(state)).await;

        let metainfo = base64::engine::general_purpose::STANDARD.encode(b"d8:announce0:e");
        let resp = rpc_call(
            &base,
            json!({"method": "torrent-add", "arguments": {"metainfo": metainfo}}),
        )
        .await;
        assert_eq!(resp.status(), 200);

        let calls = calls.snapshot().await;
        assert!(calls.iter().any(|c| c.starts_with("upload:")));
    }

    #[tokio::test]
    async fn torrent_remove_matches_by_hash_and_deletes_remote_data() {
        let calls = Calls::default();
        let state = test_state(calls.clone()).await;
        let base = serve(router(state)).await;

        let resp = rpc_call(
            &base,
            json!({
                "method": "torrent-remove",
                "arguments": {"ids": ["abcd1234"], "delete-local-data": true}
            }),
        )
        .await;
        assert_eq!(resp.status(), 200);

        let calls = calls.snapshot().await;
        let remove = calls.iter().find(|c| c.starts_with("remove:")).unwrap();
        assert!(remove.contains('1'));
        let delete = calls.iter().find(|c| c.starts_with("delete:")).unwrap();
        assert!(delete.contains("42"));
    }

    #[tokio::test]
    async fn torrent_remove_unmatched_id_is_silent_noop() {
        let calls = Calls::default();
        let state = test_state(calls.clone()).await;
        let base = serve(router(state)).await;

        let resp = rpc_call(
            &base,
            json!({"method": "torrent-remove", "arguments": {"ids": ["ffff0000"]}}),
        )
        .await;
        assert_eq!(resp.status(), 200);

        let calls = calls.snapshot().await;
        assert!(!calls.iter().any(|c| c.starts_with("remove:")));
    }

    #[tokio::test]
    async fn noop_methods_succeed() {
        let state = test_state(Calls::default()).await;
        let base = serve(router(state)).await;

        for method in ["torrent-set", "queue-move-top"] {
            let resp = rpc_call(&base, json!({"method": method})).await;
            assert_eq!(resp.status(), 200);
            let body: Value = resp.json().await.unwrap();
            assert_eq!(body["result"], "success");
        }
    }

    #[tokio::test]
    async fn unknown_and_missing_methods_are_rejected() {
        let state = test_state(Calls::default()).await;
        let base = serve(router(state)).await;

        let resp = rpc_call(&base, json!({"method": "torrent-dance"})).await;
        assert_eq!(resp.status(), 400);

        let resp = rpc_call(&base, json!({})).await;
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn malformed_body_is_rejected() {
        let state = test_state(Calls::default()).await;
        let base = serve(router(state)).await;

        let resp = reqwest::Client::new()
            .post(format!("{base}/transmission/rpc"))
            .basic_auth("user", Some("pass"))
            .header("content-type", "application/json")
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[test]
    fn constant_time_eq_compares_content_and_length() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secres"));
        assert!(!constant_time_eq(b"secret", b"secre"));
        assert!(!constant_time_eq(b"secret", b"secrets"));
        assert!(!constant_time_eq(b"secret", b""));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn magnet_name_extraction() {
        assert_eq!(
            magnet_name("magnet:?xt=urn:btih:abc&dn=Movie%20Name"),
            "Movie Name"
        );
        assert_eq!(magnet_name("https://example.com/file.torrent"), "unknown");
        assert_eq!(magnet_name("magnet:?xt=urn:btih:abc"), "unknown");
    }
}
