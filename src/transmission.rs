//! Transmission RPC wire types and the put.io → Transmission mapping.
//!
//! putarr only implements the slice of the Transmission protocol the Arr
//! services actually exercise: the session handshake, `session-get`,
//! `torrent-get`, `torrent-add` and `torrent-remove` (plus no-op acks for
//! `torrent-set` and `queue-move-top`). Field names follow the Transmission
//! spec, hence the serde renames.

use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::putio;

/// A Transmission RPC request envelope.
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub arguments: Option<serde_json::Value>,
}

/// A Transmission RPC response envelope.
#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
}

impl RpcResponse {
    pub fn success(arguments: Option<serde_json::Value>) -> Self {
        Self {
            result: "success".to_string(),
            arguments,
        }
    }
}

/// Session settings reported to the Arrs by `session-get`.
#[derive(Debug, Serialize)]
pub struct SessionConfig {
    #[serde(rename = "rpc-version")]
    pub rpc_version: String,
    pub version: String,
    #[serde(rename = "download-dir")]
    pub download_dir: String,
    #[serde(rename = "seedRatioLimit")]
    pub seed_ratio_limit: f32,
    #[serde(rename = "seedRatioLimited")]
    pub seed_ratio_limited: bool,
    #[serde(rename = "idle-seeding-limit")]
    pub idle_seeding_limit: u64,
    #[serde(rename = "idle-seeding-limit-enabled")]
    pub idle_seeding_limit_enabled: bool,
}

impl SessionConfig {
    /// The static session advertised to clients. Version numbers are what
    /// the Arrs expect from a recent Transmission.
    pub fn new(download_dir: &str) -> Self {
        Self {
            rpc_version: "18".to_string(),
            version: "14.0.0".to_string(),
            download_dir: download_dir.to_string(),
            seed_ratio_limit: 1.0,
            seed_ratio_limited: true,
            idle_seeding_limit: 100,
            idle_seeding_limit_enabled: false,
        }
    }
}

/// Transmission torrent status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrentStatus {
    Stopped = 0,
    CheckWait = 1,
    Check = 2,
    Queued = 3,
    Downloading = 4,
    SeedingWait = 5,
    Seeding = 6,
}

impl Serialize for TorrentStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

/// Map a put.io transfer status onto the Transmission status code the Arrs
/// understand. Total: unknown statuses read as check-wait.
pub fn status_from_remote(status: &str) -> TorrentStatus {
    match status {
        "STOPPED" | "COMPLETED" | "ERROR" => TorrentStatus::Stopped,
        "CHECKWAIT" | "PREPARING_DOWNLOAD" => TorrentStatus::CheckWait,
        "CHECK" | "COMPLETING" => TorrentStatus::Check,
        "QUEUED" | "IN_QUEUE" => TorrentStatus::Queued,
        "DOWNLOADING" => TorrentStatus::Downloading,
        "SEEDINGWAIT" => TorrentStatus::SeedingWait,
        "SEEDING" => TorrentStatus::Seeding,
        _ => TorrentStatus::CheckWait,
    }
}

/// A torrent as reported by `torrent-get`.
#[derive(Debug, Serialize)]
pub struct Torrent {
    pub id: u64,
    #[serde(rename = "hashString")]
    pub hash_string: Option<String>,
    pub name: String,
    #[serde(rename = "downloadDir")]
    pub download_dir: String,
    #[serde(rename = "totalSize")]
    pub total_size: i64,
    #[serde(rename = "leftUntilDone")]
    pub left_until_done: i64,
    #[serde(rename = "isFinished")]
    pub is_finished: bool,
    pub eta: i64,
    pub status: TorrentStatus,
    #[serde(rename = "secondsDownloading")]
    pub seconds_downloading: i64,
    #[serde(rename = "errorString")]
    pub error_string: Option<String>,
    #[serde(rename = "downloadedEver")]
    pub downloaded_ever: i64,
    #[serde(rename = "seedRatioLimit")]
    pub seed_ratio_limit: f32,
    #[serde(rename = "seedRatioMode")]
    pub seed_ratio_mode: u32,
    #[serde(rename = "seedIdleLimit")]
    pub seed_idle_limit: u64,
    #[serde(rename = "seedIdleMode")]
    pub seed_idle_mode: u32,
    #[serde(rename = "fileCount")]
    pub file_count: u32,
}

/// Project a put.io transfer into the torrent shape `torrent-get` reports.
pub fn torrent_from_transfer(t: &putio::Transfer, download_dir: &str) -> Torrent {
    let started_at = t
        .started_at
        .as_deref()
        .and_then(|s| chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").ok())
        .map(|naive| naive.and_utc())
        .unwrap_or_else(chrono::Utc::now);
    let seconds_downloading = (chrono::Utc::now() - started_at).num_seconds().max(0);

    let total_size = t.size.unwrap_or(0);
    let downloaded = t.downloaded.unwrap_or(0);
    let left_until_done = (total_size - downloaded).max(0);

    Torrent {
        id: t.id,
        hash_string: t.hash.clone(),
        name: t.name.clone().unwrap_or_else(|| "Unknown".to_string()),
        download_dir: download_dir.to_string(),
        total_size,
        left_until_done,
        is_finished: t.finished_at.is_some(),
        eta: t.estimated_time.unwrap_or(0),
        status: status_from_remote(&t.status),
        seconds_downloading,
        error_string: t.error_message.clone(),
        downloaded_ever: downloaded,
        seed_ratio_limit: 0.0,
        seed_ratio_mode: 0,
        seed_idle_limit: 0,
        seed_idle_mode: 0,
        file_count: 1,
    }
}

/// Arguments accepted by `torrent-add`.
#[derive(Debug, Default, Deserialize)]
pub struct TorrentAddArguments {
    /// Base64-encoded .torrent file contents.
    pub metainfo: Option<String>,
    /// URL or magnet link.
    pub filename: Option<String>,
}

/// Arguments accepted by `torrent-remove`.
#[derive(Debug, Default, Deserialize)]
pub struct TorrentRemoveArguments {
    #[serde(default)]
    pub ids: Vec<String>,
    #[serde(default, rename = "delete-local-data")]
    pub delete_local_data: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer() -> putio::Transfer {
        putio::Transfer {
            id: 7,
            hash: Some("abcd1234".to_string()),
            name: Some("Movie".to_string()),
            size: Some(1000),
            downloaded: Some(400),
            finished_at: None,
            estimated_time: Some(30),
            status: "DOWNLOADING".to_string(),
            started_at: None,
            error_message: None,
            file_id: Some(42),
            userfile_exists: true,
        }
    }

    #[test]
    fn status_mapping_is_total() {
        assert_eq!(status_from_remote("STOPPED"), TorrentStatus::Stopped);
        assert_eq!(status_from_remote("COMPLETED"), TorrentStatus::Stopped);
        assert_eq!(status_from_remote("ERROR"), TorrentStatus::Stopped);
        assert_eq!(status_from_remote("CHECKWAIT"), TorrentStatus::CheckWait);
        assert_eq!(
            status_from_remote("PREPARING_DOWNLOAD"),
            TorrentStatus::CheckWait
        );
        assert_eq!(status_from_remote("CHECK"), TorrentStatus::Check);
        assert_eq!(status_from_remote("COMPLETING"), TorrentStatus::Check);
        assert_eq!(status_from_remote("QUEUED"), TorrentStatus::Queued);
        assert_eq!(status_from_remote("IN_QUEUE"), TorrentStatus::Queued);
        assert_eq!(status_from_remote("DOWNLOADING"), TorrentStatus::Downloading);
        assert_eq!(status_from_remote("SEEDINGWAIT"), TorrentStatus::SeedingWait);
        assert_eq!(status_from_remote("SEEDING"), TorrentStatus::Seeding);
        assert_eq!(status_from_remote("SOMETHING_NEW"), TorrentStatus::CheckWait);
        assert_eq!(status_from_remote(""), TorrentStatus::CheckWait);
    }

    #[test]
    fn torrent_projection_maps_fields() {
        let torrent = torrent_from_transfer(&transfer(), "/downloads");
        assert_eq!(torrent.id, 7);
        assert_eq!(torrent.hash_string.as_deref(), Some("abcd1234"));
        assert_eq!(torrent.name, "Movie");
        assert_eq!(torrent.download_dir, "/downloads");
        assert_eq!(torrent.total_size, 1000);
        assert_eq!(torrent.left_until_done, 600);
        assert_eq!(torrent.downloaded_ever, 400);
        assert!(!torrent.is_finished);
        assert_eq!(torrent.eta, 30);
        assert_eq!(torrent.status, TorrentStatus::Downloading);
        assert_eq!(torrent.file_count, 1);
    }

    #[test]
    fn torrent_projection_defaults() {
        let mut t = transfer();
        t.name = None;
        t.size = None;
        t.downloaded = Some(100);
        t.finished_at = Some("2024-01-01T00:00:00".to_string());
        let torrent = torrent_from_transfer(&t, "/downloads");
        assert_eq!(torrent.name, "Unknown");
        assert_eq!(torrent.total_size, 0);
        // Never negative, even when downloaded exceeds the reported size.
        assert_eq!(torrent.left_until_done, 0);
        assert!(torrent.is_finished);
    }

    #[test]
    fn seconds_downloading_from_started_at() {
        let mut t = transfer();
        let started = chrono::Utc::now() - chrono::Duration::seconds(90);
        t.started_at = Some(started.format("%Y-%m-%dT%H:%M:%S").to_string());
        let torrent = torrent_from_transfer(&t, "/downloads");
        assert!((89..=92).contains(&torrent.seconds_downloading));
    }

    #[test]
    fn torrent_serializes_with_transmission_names() {
        let value = serde_json::to_value(torrent_from_transfer(&transfer(), "/dl")).unwrap();
        assert_eq!(value["hashString"], "abcd1234");
        assert_eq!(value["downloadDir"], "/dl");
        assert_eq!(value["leftUntilDone"], 600);
        assert_eq!(value["status"], 4);
        assert_eq!(value["fileCount"], 1);
    }

    #[test]
    fn session_config_static_values() {
        let value = serde_json::to_value(SessionConfig::new("/dl")).unwrap();
        assert_eq!(value["rpc-version"], "18");
        assert_eq!(value["version"], "14.0.0");
        assert_eq!(value["download-dir"], "/dl");
        assert_eq!(value["seedRatioLimited"], true);
        assert_eq!(value["idle-seeding-limit"], 100);
        assert_eq!(value["idle-seeding-limit-enabled"], false);
    }

    #[test]
    fn remove_arguments_accept_kebab_field() {
        let args: TorrentRemoveArguments = serde_json::from_value(serde_json::json!({
            "ids": ["abcd1234"],
            "delete-local-data": true
        }))
        .unwrap();
        assert_eq!(args.ids, vec!["abcd1234"]);
        assert!(args.delete_local_data);
    }
}
