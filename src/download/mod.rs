//! The transfer lifecycle engine.
//!
//! Watches put.io for finished transfers, downloads their files, waits for
//! the Arr services to import them, then cleans up locally and remotely.

pub mod manager;
pub mod types;

pub use manager::Manager;
pub use types::{DownloadStatus, DownloadTarget, TargetKind, Transfer, TransferEvent};
