#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::unused_async)]

//! qualifyd-broker library — the terminal session broker's building blocks.
//!
//! - `hub` — session registry, assessment lock table, shutdown
//! - `k8s` — cluster client, pod templates, workload manager, idle reaper
//! - `ssh` — interactive shell channel over SSH
//! - `ws` — WebSocket upgrade, session bridge, wire protocol
//! - `auth` — API key middleware for the admin surface
//! - `config` — configuration loading
//! - `routes` — REST route handlers

pub mod auth;
pub mod config;
pub mod hub;
pub mod k8s;
pub mod routes;
pub mod ssh;
pub mod state;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use auth::ApiKey;
pub use config::Config;
pub use hub::BrokerHub;
pub use k8s::workload::WorkloadManager;
pub use state::AppState;
