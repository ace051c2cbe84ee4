//! Core types for the transfer lifecycle engine.
//!
//! A [`Transfer`] is putarr's view of one put.io transfer being processed.
//! Its download plan is an ordered list of [`DownloadTarget`]s — directories
//! to create and files to fetch, parents always before children. Log lines
//! identify transfers and targets by a `[hhhh: name]` tag, where `hhhh` is
//! the first four characters of the transfer hash (or `0000` when put.io has
//! not assigned one, e.g. for plain URL uploads).

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use tokio::sync::oneshot;

use crate::putio;

/// What applying a target to the local filesystem means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Directory,
    File,
}

/// One filesystem effect derived from the remote file tree.
#[derive(Debug, Clone)]
pub struct DownloadTarget {
    /// Download URL; present for files, absent for directories.
    pub from: Option<String>,
    /// Absolute local path under the download directory.
    pub to: PathBuf,
    pub kind: TargetKind,
    /// True for the outermost target only; local cleanup removes this path.
    pub top_level: bool,
    pub transfer_hash: String,
}

impl fmt::Display for DownloadTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}: {}]",
            short_hash(Some(&self.transfer_hash)),
            self.to.display()
        )
    }
}

/// A put.io transfer being processed, plus its download plan.
///
/// The plan is written once (by the plan builder) and read by the download,
/// import, and cleanup stages; accessors hand out snapshots so callers never
/// observe a half-written plan.
#[derive(Debug)]
pub struct Transfer {
    pub transfer_id: u64,
    pub name: String,
    pub hash: Option<String>,
    pub file_id: Option<i64>,
    targets: RwLock<Vec<DownloadTarget>>,
}

impl Transfer {
    pub fn from_remote(remote: &putio::Transfer) -> Self {
        Self {
            transfer_id: remote.id,
            name: remote
                .name
                .clone()
                .unwrap_or_else(|| "Unknown".to_string()),
            hash: remote.hash.clone(),
            file_id: remote.file_id,
            targets: RwLock::new(Vec::new()),
        }
    }

    /// The transfer hash, or the `0000` sentinel when put.io omitted it.
    pub fn hash_or_default(&self) -> String {
        self.hash.clone().unwrap_or_else(|| "0000".to_string())
    }

    pub fn set_targets(&self, targets: Vec<DownloadTarget>) {
        *self.targets.write().expect("targets lock poisoned") = targets;
    }

    /// A snapshot of the full plan.
    pub fn targets(&self) -> Vec<DownloadTarget> {
        self.targets.read().expect("targets lock poisoned").clone()
    }

    /// The outermost target, used for local cleanup.
    pub fn top_level(&self) -> Option<DownloadTarget> {
        self.targets
            .read()
            .expect("targets lock poisoned")
            .iter()
            .find(|t| t.top_level)
            .cloned()
    }

    /// File targets only — the paths the Arr services are expected to import.
    pub fn file_targets(&self) -> Vec<DownloadTarget> {
        self.targets
            .read()
            .expect("targets lock poisoned")
            .iter()
            .filter(|t| t.kind == TargetKind::File)
            .cloned()
            .collect()
    }
}

impl fmt::Display for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}: {}]", short_hash(self.hash.as_deref()), self.name)
    }
}

/// First four characters of the hash, or `0000` when absent or too short.
fn short_hash(hash: Option<&str>) -> &str {
    hash.and_then(|h| h.get(..4)).unwrap_or("0000")
}

/// Lifecycle events flowing from the producer and watchers into the
/// orchestration workers. For any one transfer the sequence is strictly
/// `QueuedForDownload`, `Downloaded`, `Imported`.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    QueuedForDownload(Arc<Transfer>),
    Downloaded(Arc<Transfer>),
    Imported(Arc<Transfer>),
}

/// Outcome of materializing a single target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Success,
    Failed,
}

/// A unit of work for the download workers; the reply is sent exactly once.
#[derive(Debug)]
pub struct DownloadJob {
    pub target: DownloadTarget,
    pub reply: oneshot::Sender<DownloadStatus>,
}

/// Whether a directory name is on the configured skip list
/// (case-insensitive).
pub fn should_skip_directory(name: &str, skip_directories: &[String]) -> bool {
    let name = name.to_lowercase();
    skip_directories
        .iter()
        .any(|skip| skip.to_lowercase() == name)
}
