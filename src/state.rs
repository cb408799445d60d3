//! Shared application state passed to every handler via Axum's `State`
//! extractor.

use std::sync::Arc;

use crate::config::Config;
use crate::hub::BrokerHub;
use crate::k8s::workload::WorkloadManager;

/// Shared application state for the broker.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Registry of live sessions, lock-table custodian, shutdown broadcaster.
    pub hub: Arc<BrokerHub>,
    /// Resolves session keys to ready pods; degraded to a fixed host when
    /// the cluster is unreachable.
    pub workload: WorkloadManager,
}
