//! The download manager — owns the transfer lifecycle from "seen on put.io"
//! to "cleaned up everywhere".
//!
//! Three kinds of long-running tasks cooperate over bounded channels:
//!
//! - one **producer** polls put.io, emitting `QueuedForDownload` once per
//!   transfer id (a `seen` set deduplicates across poll cycles and is pruned
//!   to the ids put.io still lists, so a re-added transfer is re-processed);
//! - **orchestration workers** consume lifecycle events, build download
//!   plans, dispatch targets to the download workers, and spawn the
//!   per-transfer import and seeding watchers;
//! - **download workers** materialize one target at a time: create a
//!   directory, or stream a file to a `.downloading` temp path and atomically
//!   rename it into place.
//!
//! Everything selects against a single root cancellation token. `stop()`
//! trips the token and waits for the whole task tree to drain; in-flight
//! HTTP reads abort and temp files are removed on the way out.
//!
//! Nothing is persisted: on startup the producer reconciles the remote
//! transfer list against Arr history, so a transfer that was downloaded and
//! imported while putarr was down goes straight to cleanup.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::arr::{check_imported_any, ArrServiceClient};
use crate::config::Config;
use crate::putio::{PutioClient, PutioError};

use super::types::{
    should_skip_directory, DownloadJob, DownloadStatus, DownloadTarget, TargetKind, Transfer,
    TransferEvent,
};

/// Suffix for in-flight file downloads; the rename to the final path is the
/// publication point.
const DOWNLOADING_SUFFIX: &str = ".downloading";

/// How often the producer logs a summary of active transfers.
const SUMMARY_INTERVAL: Duration = Duration::from_secs(60);

type SharedReceiver<T> = Arc<Mutex<mpsc::Receiver<T>>>;

/// Drives the transfer lifecycle. Construct once, `start()`, and `stop()`
/// on shutdown.
pub struct Manager {
    inner: Arc<Inner>,
    event_rx: Option<SharedReceiver<TransferEvent>>,
    download_rx: Option<SharedReceiver<DownloadJob>>,
}

struct Inner {
    config: Arc<Config>,
    putio: Arc<PutioClient>,
    arr_clients: Vec<ArrServiceClient>,
    event_tx: mpsc::Sender<TransferEvent>,
    download_tx: mpsc::Sender<DownloadJob>,
    seen: RwLock<HashSet<u64>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    /// Client for CDN file downloads. Unlike the API clients it has no
    /// overall request timeout — large files stream for a long time.
    http: reqwest::Client,
}

impl Manager {
    pub fn new(
        config: Arc<Config>,
        putio: Arc<PutioClient>,
        arr_clients: Vec<ArrServiceClient>,
        cancel: CancellationToken,
    ) -> Self {
        // Deep enough that a burst of transfers never wedges the producer
        // against slow workers.
        let capacity = config
            .orchestration_workers
            .max(config.download_workers)
            .max(25)
            * 4;
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let (download_tx, download_rx) = mpsc::channel(capacity);

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build HTTP client");

        Self {
            inner: Arc::new(Inner {
                config,
                putio,
                arr_clients,
                event_tx,
                download_tx,
                seen: RwLock::new(HashSet::new()),
                cancel,
                tracker: TaskTracker::new(),
                http,
            }),
            event_rx: Some(Arc::new(Mutex::new(event_rx))),
            download_rx: Some(Arc::new(Mutex::new(download_rx))),
        }
    }

    /// Spawn the producer and worker pools.
    pub fn start(&mut self) {
        let event_rx = self.event_rx.take().expect("start() called twice");
        let download_rx = self.download_rx.take().expect("start() called twice");

        for _ in 0..self.inner.config.orchestration_workers {
            self.inner.tracker.spawn(orchestration_worker(
                self.inner.clone(),
                event_rx.clone(),
            ));
        }
        for _ in 0..self.inner.config.download_workers {
            self.inner
                .tracker
                .spawn(download_worker(self.inner.clone(), download_rx.clone()));
        }
        self.inner
            .tracker
            .spawn(produce_transfers(self.inner.clone()));
    }

    /// Cancel the root token and wait for every spawned task — workers,
    /// producer, and per-transfer watchers — to finish.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}

// ─── Orchestration ───────────────────────────────────────────────────────────

async fn orchestration_worker(inner: Arc<Inner>, rx: SharedReceiver<TransferEvent>) {
    loop {
        // Hold the receiver lock only while waiting for the next event so
        // other workers can pick up events while this one processes.
        let event = {
            let mut rx = rx.lock().await;
            tokio::select! {
                () = inner.cancel.cancelled() => return,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            }
        };

        match event {
            TransferEvent::QueuedForDownload(transfer) => {
                inner.handle_queued(transfer).await;
            }
            TransferEvent::Downloaded(transfer) => {
                let watcher = inner.clone();
                inner
                    .tracker
                    .spawn(async move { watch_for_import(watcher, transfer).await });
            }
            TransferEvent::Imported(transfer) => {
                inner.cleanup_local(&transfer).await;
                let watcher = inner.clone();
                inner
                    .tracker
                    .spawn(async move { watch_seeding(watcher, transfer).await });
            }
        }
    }
}

async fn download_worker(inner: Arc<Inner>, rx: SharedReceiver<DownloadJob>) {
    loop {
        let job = {
            let mut rx = rx.lock().await;
            tokio::select! {
                () = inner.cancel.cancelled() => return,
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => return,
                },
            }
        };

        let status = inner.download_target(&job.target).await;
        // The consumer may be gone if the run was cancelled mid-transfer.
        let _ = job.reply.send(status);
    }
}

impl Inner {
    /// Send a lifecycle event, giving up silently on shutdown.
    async fn emit(&self, event: TransferEvent) {
        tokio::select! {
            () = self.cancel.cancelled() => {}
            result = self.event_tx.send(event) => {
                if result.is_err() {
                    warn!("event channel closed before shutdown");
                }
            }
        }
    }

    /// Handle a transfer that is ready for download: build the plan, push
    /// every target through the download pool, and emit `Downloaded` only if
    /// all of them succeed. On failure the id is dropped from the seen set
    /// so the next poll cycle queues the transfer again.
    async fn handle_queued(&self, transfer: Arc<Transfer>) {
        info!("{transfer}: download started");

        let targets = match self.download_targets(&transfer).await {
            Ok(targets) => targets,
            Err(e) => {
                error!("{transfer}: failed to get download targets: {e}");
                self.unmark_seen(transfer.transfer_id);
                return;
            }
        };
        if targets.is_empty() {
            warn!("{transfer}: no download targets (all directories skipped?)");
            return;
        }

        let mut replies = Vec::with_capacity(targets.len());
        for target in targets.clone() {
            let (reply_tx, reply_rx) = oneshot::channel();
            let job = DownloadJob {
                target,
                reply: reply_tx,
            };
            tokio::select! {
                () = self.cancel.cancelled() => return,
                result = self.download_tx.send(job) => {
                    if result.is_err() {
                        return;
                    }
                }
            }
            replies.push(reply_rx);
        }

        let mut all_success = true;
        for reply in replies {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                status = reply => {
                    if !matches!(status, Ok(DownloadStatus::Success)) {
                        all_success = false;
                    }
                }
            }
        }

        if all_success {
            info!("{transfer}: download done");
            transfer.set_targets(targets);
            self.emit(TransferEvent::Downloaded(transfer)).await;
        } else {
            warn!("{transfer}: not all targets downloaded");
            self.unmark_seen(transfer.transfer_id);
        }
    }

    /// Remove the top-level target path after import; files under it have
    /// been copied into the Arr's library already.
    async fn cleanup_local(&self, transfer: &Transfer) {
        let Some(top) = transfer.top_level() else {
            return;
        };
        let Ok(meta) = tokio::fs::metadata(&top.to).await else {
            return;
        };
        let result = if meta.is_dir() {
            tokio::fs::remove_dir_all(&top.to).await
        } else {
            tokio::fs::remove_file(&top.to).await
        };
        match result {
            Ok(()) => info!("{top}: deleted"),
            Err(e) => warn!("{top}: failed to delete: {e}"),
        }
    }

    // ─── Plan building ───────────────────────────────────────────────────

    /// Walk the remote file tree into an ordered target list (directories
    /// before their contents).
    async fn download_targets(
        &self,
        transfer: &Transfer,
    ) -> Result<Vec<DownloadTarget>, PutioError> {
        info!("{transfer}: generating targets");

        let Some(file_id) = transfer.file_id else {
            return Err(PutioError::Protocol("transfer has no file id".to_string()));
        };

        let mut targets = Vec::new();
        self.recurse_targets(
            file_id,
            transfer.hash_or_default(),
            PathBuf::from(&self.config.download_directory),
            true,
            &mut targets,
        )
        .await?;
        Ok(targets)
    }

    fn recurse_targets<'a>(
        &'a self,
        file_id: i64,
        hash: String,
        base: PathBuf,
        top_level: bool,
        out: &'a mut Vec<DownloadTarget>,
    ) -> BoxFuture<'a, Result<(), PutioError>> {
        Box::pin(async move {
            let listing = self.putio.list_files(file_id).await?;
            let to = base.join(&listing.parent.name);

            match listing.parent.file_type.as_str() {
                "FOLDER" => {
                    if should_skip_directory(&listing.parent.name, &self.config.skip_directories)
                    {
                        return Ok(());
                    }
                    out.push(DownloadTarget {
                        from: None,
                        to: to.clone(),
                        kind: TargetKind::Directory,
                        top_level,
                        transfer_hash: hash.clone(),
                    });
                    for child in &listing.files {
                        self.recurse_targets(child.id, hash.clone(), to.clone(), false, out)
                            .await?;
                    }
                }
                "VIDEO" => {
                    let url = self.putio.file_url(listing.parent.id).await?;
                    out.push(DownloadTarget {
                        from: Some(url),
                        to,
                        kind: TargetKind::File,
                        top_level,
                        transfer_hash: hash,
                    });
                }
                _ => {}
            }

            Ok(())
        })
    }

    // ─── Target materialization ──────────────────────────────────────────

    /// Apply one target to the local filesystem. Both kinds are idempotent:
    /// an existing directory or file is a success without further work.
    async fn download_target(&self, target: &DownloadTarget) -> DownloadStatus {
        match target.kind {
            TargetKind::Directory => {
                if tokio::fs::metadata(&target.to).await.is_ok() {
                    return DownloadStatus::Success;
                }
                if let Err(e) = create_dir_tree(&target.to).await {
                    error!("{target}: failed to create directory: {e}");
                    return DownloadStatus::Failed;
                }
                self.chown_if_root(&target.to);
                info!("{target}: directory created");
                DownloadStatus::Success
            }
            TargetKind::File => {
                if tokio::fs::metadata(&target.to).await.is_ok() {
                    info!("{target}: already exists");
                    return DownloadStatus::Success;
                }
                info!("{target}: download started");
                match self.fetch_file(target).await {
                    Ok(()) => {
                        info!("{target}: download succeeded");
                        DownloadStatus::Success
                    }
                    Err(e) => {
                        error!("{target}: download failed: {e}");
                        DownloadStatus::Failed
                    }
                }
            }
        }
    }

    /// Stream the file to `{to}.downloading`, then rename into place. On any
    /// failure — HTTP error, I/O error, cancellation — the temp file is
    /// removed so nothing half-written survives.
    async fn fetch_file(&self, target: &DownloadTarget) -> Result<(), FetchError> {
        let Some(url) = target.from.as_deref() else {
            return Err(FetchError::MissingUrl);
        };

        if let Some(parent) = target.to.parent() {
            create_dir_tree(parent).await.map_err(FetchError::Io)?;
        }

        let tmp_path = downloading_path(&target.to);
        let result = self.stream_to(url, &tmp_path).await;
        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }

        self.chown_if_root(&tmp_path);

        if let Err(e) = tokio::fs::rename(&tmp_path, &target.to).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(FetchError::Io(e));
        }
        Ok(())
    }

    async fn stream_to(&self, url: &str, tmp_path: &Path) -> Result<(), FetchError> {
        let mut file = tokio::fs::File::create(tmp_path)
            .await
            .map_err(FetchError::Io)?;

        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(FetchError::Request)?;
        if !resp.status().is_success() {
            return Err(FetchError::Status(resp.status()));
        }

        let mut stream = resp.bytes_stream();
        loop {
            let chunk = tokio::select! {
                () = self.cancel.cancelled() => return Err(FetchError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(FetchError::Request)?;
            file.write_all(&chunk).await.map_err(FetchError::Io)?;
        }

        file.flush().await.map_err(FetchError::Io)?;
        Ok(())
    }

    /// When running as root, hand downloaded paths to the configured uid so
    /// the Arrs can import them. Group is left unchanged; failure is logged
    /// but never fails the target.
    fn chown_if_root(&self, path: &Path) {
        if !nix::unistd::geteuid().is_root() {
            return;
        }
        let uid = nix::unistd::Uid::from_raw(self.config.uid);
        if let Err(e) = nix::unistd::chown(path, Some(uid), None) {
            warn!("failed to change ownership of {}: {e}", path.display());
        }
    }

    // ─── Import checks ───────────────────────────────────────────────────

    /// Whether every file target has been imported by some Arr service.
    /// False when there is nothing to check — a transfer with no file
    /// targets can never be confirmed.
    async fn is_imported(&self, transfer: &Transfer) -> bool {
        let file_targets = transfer.file_targets();
        if file_targets.is_empty() || self.arr_clients.is_empty() {
            return false;
        }
        self.all_imported(&file_targets).await
    }

    async fn all_imported(&self, file_targets: &[DownloadTarget]) -> bool {
        for target in file_targets {
            let path = target.to.to_string_lossy();
            match check_imported_any(&self.arr_clients, &path).await {
                Some(service) => info!("{target}: found imported by {service}"),
                None => return false,
            }
        }
        true
    }

    // ─── Seen registry ───────────────────────────────────────────────────

    fn is_seen(&self, id: u64) -> bool {
        self.seen.read().expect("seen lock poisoned").contains(&id)
    }

    fn mark_seen(&self, id: u64) {
        self.seen.write().expect("seen lock poisoned").insert(id);
    }

    /// Forget an id so the producer queues the transfer again next poll.
    fn unmark_seen(&self, id: u64) {
        self.seen.write().expect("seen lock poisoned").remove(&id);
    }

    /// Drop ids put.io no longer lists, so a transfer that is removed
    /// remotely and later re-added gets processed again.
    fn prune_seen(&self, active: &HashSet<u64>) {
        self.seen
            .write()
            .expect("seen lock poisoned")
            .retain(|id| active.contains(id));
    }
}

// ─── Watchers ────────────────────────────────────────────────────────────────

/// Poll the Arr services until every file target of the transfer has been
/// imported, then emit `Imported`.
async fn watch_for_import(inner: Arc<Inner>, transfer: Arc<Transfer>) {
    info!("{transfer}: watching imports");

    let file_targets = transfer.file_targets();
    if file_targets.is_empty() {
        warn!("{transfer}: no file targets to wait for; leaving transfer as downloaded");
        return;
    }
    if inner.arr_clients.is_empty() {
        warn!("{transfer}: no arr services configured; leaving transfer as downloaded");
        return;
    }

    let period = Duration::from_secs(inner.config.polling_interval);
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            () = inner.cancel.cancelled() => return,
            _ = ticker.tick() => {
                if inner.all_imported(&file_targets).await {
                    info!("{transfer}: imported");
                    inner.emit(TransferEvent::Imported(transfer)).await;
                    return;
                }
            }
        }
    }
}

/// Poll put.io until the transfer stops seeding, then remove it and delete
/// its remote files. This is the terminal stage of the lifecycle.
async fn watch_seeding(inner: Arc<Inner>, transfer: Arc<Transfer>) {
    info!("{transfer}: watching seeding");

    let period = Duration::from_secs(inner.config.polling_interval);
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            () = inner.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let remote = match inner.putio.get_transfer(transfer.transfer_id).await {
            Ok(remote) => remote,
            Err(e) => {
                warn!("{transfer}: failed to get transfer status: {e}");
                continue;
            }
        };
        if remote.status == "SEEDING" {
            continue;
        }

        info!("{transfer}: stopped seeding");
        match inner.putio.remove_transfer(transfer.transfer_id).await {
            Ok(()) => info!("{transfer}: removed from put.io"),
            Err(e) => warn!("{transfer}: failed to remove transfer: {e}"),
        }
        if let Some(file_id) = transfer.file_id {
            match inner.putio.delete_file(file_id).await {
                Ok(()) => info!("{transfer}: deleted remote files"),
                Err(e) => warn!("{transfer}: unable to delete remote files: {e}"),
            }
        }
        info!("{transfer}: done seeding");
        return;
    }
}

// ─── Producer ────────────────────────────────────────────────────────────────

/// Startup reconciliation followed by the steady-state polling loop.
async fn produce_transfers(inner: Arc<Inner>) {
    info!("checking unfinished transfers");
    check_existing_transfers(&inner).await;
    info!("done checking for unfinished transfers, starting to monitor");

    let period = Duration::from_secs(inner.config.polling_interval);
    let mut ticker = interval_at(Instant::now() + period, period);
    let mut last_summary = std::time::Instant::now();

    loop {
        tokio::select! {
            () = inner.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let transfers = match inner.putio.list_transfers().await {
            Ok(transfers) => transfers,
            Err(e) => {
                warn!("listing put.io transfers failed, retrying next cycle: {e}");
                continue;
            }
        };

        for remote in &transfers {
            if inner.is_seen(remote.id) || !remote.is_downloadable() {
                continue;
            }
            let transfer = Arc::new(Transfer::from_remote(remote));
            info!("{transfer}: ready for download");
            inner
                .emit(TransferEvent::QueuedForDownload(transfer))
                .await;
            if inner.cancel.is_cancelled() {
                return;
            }
            inner.mark_seen(remote.id);
        }

        let active: HashSet<u64> = transfers.iter().map(|t| t.id).collect();
        inner.prune_seen(&active);

        if last_summary.elapsed() >= SUMMARY_INTERVAL {
            info!("active transfers: {}", transfers.len());
            for remote in &transfers {
                info!("  {}", Transfer::from_remote(remote));
            }
            last_summary = std::time::Instant::now();
        }
    }
}

/// Recover transfers that finished while putarr was down: anything already
/// imported according to the Arrs skips straight to the `Imported` stage
/// (local cleanup and seeding watch).
async fn check_existing_transfers(inner: &Arc<Inner>) {
    let transfers = match inner.putio.list_transfers().await {
        Ok(transfers) => transfers,
        Err(e) => {
            error!("failed to list transfers: {e}");
            return;
        }
    };

    for remote in &transfers {
        if !remote.is_downloadable() {
            continue;
        }
        let transfer = Arc::new(Transfer::from_remote(remote));

        let targets = match inner.download_targets(&transfer).await {
            Ok(targets) => targets,
            Err(e) => {
                warn!("{transfer}: could not get targets: {e}");
                continue;
            }
        };
        transfer.set_targets(targets);

        if inner.is_imported(&transfer).await {
            info!("{transfer}: already imported");
            inner.mark_seen(transfer.transfer_id);
            inner.emit(TransferEvent::Imported(transfer)).await;
        } else {
            info!("{transfer}: not imported yet");
        }
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// `{path}.downloading`
fn downloading_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(DOWNLOADING_SUFFIX);
    PathBuf::from(os)
}

/// Create a directory and any missing parents with mode 0755.
async fn create_dir_tree(path: &Path) -> std::io::Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o755);
    builder.create(path).await
}

#[derive(Debug)]
enum FetchError {
    MissingUrl,
    Request(reqwest::Error),
    Status(reqwest::StatusCode),
    Io(std::io::Error),
    Cancelled,
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::MissingUrl => write!(f, "no URL found for target"),
            FetchError::Request(e) => write!(f, "request failed: {e}"),
            FetchError::Status(status) => write!(f, "HTTP error: {status}"),
            FetchError::Io(e) => write!(f, "{e}"),
            FetchError::Cancelled => write!(f, "download cancelled"),
        }
    }
}
