#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]

//! putarr — put.io ⇄ Sonarr/Radarr/Whisparr proxy.
//!
//! putarr presents itself to the Arr services as a Transmission RPC download
//! client while driving transfers on put.io behind the scenes. The download
//! manager polls put.io for finished transfers, fetches their files into the
//! local download directory, waits for the Arrs to import them, then cleans
//! up both locally and remotely once seeding ends.
//!
//! - `config` — TOML configuration loading and validation
//! - `retry` — bounded exponential backoff with Retry-After support
//! - `putio` — typed put.io API client
//! - `arr` — Arr history client and import detection
//! - `transmission` — Transmission RPC wire types and status mapping
//! - `routes` — the `/transmission/rpc` endpoint
//! - `download` — the transfer lifecycle engine
//! - `setup` — `get-token` and `generate-config` helpers

pub mod arr;
pub mod config;
pub mod download;
pub mod putio;
pub mod retry;
pub mod routes;
pub mod setup;
pub mod state;
pub mod transmission;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use state::AppState;
