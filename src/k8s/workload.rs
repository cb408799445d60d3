//! Workload manager — policy layer above the cluster client.
//!
//! Translates a [`SessionKey`] into a ready pod while enforcing
//! at-most-one-pod-per-(assessment, session):
//!
//! - `ensure_pod` resolves or provisions under the per-assessment lock.
//!   The lock covers only the *decision* (exists? adopt? create?); readiness
//!   polling happens in the session bridge afterwards, so one slow pod never
//!   serialises other assessments.
//! - `heartbeat` refreshes the `last-activity` annotation while a session
//!   is active, rediscovering the pod by session label if its name drifted.
//! - `reap_idle` deletes pods whose idle time exceeds their `ttl`
//!   annotation. Pod deletion on client disconnect is deliberately *not*
//!   done — the reaper is the only janitor, which preserves reattach.
//!
//! ## Fallback mode
//!
//! When the cluster client cannot initialise and a fixed terminal host is
//! configured, the manager runs degraded: `ensure_pod` returns the fixed
//! host, and `heartbeat` / `destroy` / `reap_idle` are no-ops.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::ClusterConfig;
use crate::hub::AssessmentLocks;

use super::template::{self, PodOverrides, TemplateError};
use super::{Client, ClusterError, PodRef};

/// Correlation identity of one terminal session: the assessment it belongs
/// to and the session id used across the pod labels, the lock table, and
/// logs. The session id is rewritten in place when an existing pod is
/// adopted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKey {
    pub assessment_id: String,
    pub session_id: String,
}

/// Where a session's shell actually lives.
#[derive(Debug, Clone)]
pub enum PodTarget {
    /// A cluster-provisioned pod.
    Cluster(PodRef),
    /// The fixed fallback host (cluster-less development).
    Fixed { host: String },
}

/// Errors from workload operations.
#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("pod {0} never received an address")]
    NoAddress(String),
}

struct Inner {
    /// `None` in fallback mode.
    client: Option<Client>,
    locks: Arc<AssessmentLocks>,
    templates_path: PathBuf,
    default_image: String,
    pod_ttl: Duration,
    fallback_host: String,
}

/// Policy layer above [`Client`]. Cloneable — clones share the same inner
/// state.
#[derive(Clone)]
pub struct WorkloadManager {
    inner: Arc<Inner>,
}

impl WorkloadManager {
    /// Cluster-backed manager.
    pub fn new(client: Client, locks: Arc<AssessmentLocks>, config: &ClusterConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                client: Some(client),
                locks,
                templates_path: PathBuf::from(&config.templates_path),
                default_image: config.default_image.clone(),
                pod_ttl: Duration::from_secs(config.pod_ttl_secs),
                fallback_host: String::new(),
            }),
        }
    }

    /// Degraded manager routing every session to a fixed host.
    pub fn fallback(host: &str, locks: Arc<AssessmentLocks>) -> Self {
        Self {
            inner: Arc::new(Inner {
                client: None,
                locks,
                templates_path: PathBuf::new(),
                default_image: String::new(),
                pod_ttl: Duration::ZERO,
                fallback_host: host.to_string(),
            }),
        }
    }

    /// Whether the manager is running without a cluster.
    pub fn is_fallback(&self) -> bool {
        self.inner.client.is_none()
    }

    /// Resolve or provision the pod for `key`, under the assessment lock.
    ///
    /// With `new_session == false` an existing pod for the exact key wins;
    /// failing that, any pod for the assessment is adopted and
    /// `key.session_id` is rewritten to the adopted pod's session label.
    /// Otherwise a fresh pod is created from the named template. The
    /// returned pod is **not yet ready** — readiness is the caller's wait.
    pub async fn ensure_pod(
        &self,
        key: &mut SessionKey,
        overrides: &PodOverrides,
        new_session: bool,
    ) -> Result<PodTarget, WorkloadError> {
        let Some(client) = &self.inner.client else {
            return Ok(PodTarget::Fixed {
                host: self.inner.fallback_host.clone(),
            });
        };

        let lock = self.inner.locks.lock_for(&key.assessment_id).await;
        let _guard = lock.lock().await;

        if !new_session {
            match client
                .resolve_by_labels(&key.assessment_id, &key.session_id)
                .await
            {
                Ok(pod) => {
                    info!(
                        "Resuming session {} on existing pod {}",
                        key.session_id, pod.name
                    );
                    return Ok(PodTarget::Cluster(pod));
                }
                Err(ClusterError::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }

            let pods = client.list_by_assessment(&key.assessment_id).await?;
            if let Some(pod) = pods.into_iter().next() {
                // Adopt the assessment's existing pod and rewrite the
                // session id to match it.
                info!(
                    "Adopting pod {} for assessment {} (session {} -> {})",
                    pod.name, key.assessment_id, key.session_id, pod.session_id
                );
                key.session_id = pod.session_id.clone();
                return Ok(PodTarget::Cluster(pod));
            }
        }

        let pod = template::load(&self.inner.templates_path, overrides.template_name())?;
        let pod = template::render(
            pod,
            key,
            overrides,
            client.namespace(),
            &self.inner.default_image,
            self.inner.pod_ttl,
            Utc::now(),
        )?;
        let created = client.create(pod).await?;
        Ok(PodTarget::Cluster(created))
    }

    /// Whether `target` is ready to accept an SSH connection.
    pub async fn pod_ready(&self, target: &PodTarget) -> Result<bool, WorkloadError> {
        match (target, &self.inner.client) {
            (PodTarget::Fixed { .. }, _) | (_, None) => Ok(true),
            (PodTarget::Cluster(pod), Some(client)) => Ok(client.pod_ready(&pod.name).await?),
        }
    }

    /// Resolve the network address for `target`, retrying while the
    /// orchestrator is still assigning one (5 attempts, 2 s doubling).
    pub async fn address_of(&self, target: &PodTarget) -> Result<String, WorkloadError> {
        let (pod, client) = match (target, &self.inner.client) {
            (PodTarget::Fixed { host }, _) => return Ok(host.clone()),
            (PodTarget::Cluster(pod), Some(client)) => (pod, client),
            (PodTarget::Cluster(pod), None) => {
                return Err(WorkloadError::NoAddress(pod.name.clone()))
            }
        };

        if let Some(address) = &pod.address {
            return Ok(address.clone());
        }

        let mut delay = Duration::from_secs(2);
        let attempts = 5;
        for attempt in 1..=attempts {
            match client.pod_address(&pod.name).await {
                Ok(Some(address)) => return Ok(address),
                Ok(None) => {
                    info!(
                        "Attempt {attempt}/{attempts}: pod {} has no address yet",
                        pod.name
                    );
                }
                Err(e) => {
                    warn!(
                        "Attempt {attempt}/{attempts}: failed to read pod {}: {e}",
                        pod.name
                    );
                }
            }
            if attempt < attempts {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
        Err(WorkloadError::NoAddress(pod.name.clone()))
    }

    /// Refresh the pod's `last-activity` annotation.
    ///
    /// On failure the pod is rediscovered by assessment + session label —
    /// its name may have drifted if it was recreated externally — the
    /// caller's remembered [`PodRef`] is updated, and the touch is retried
    /// once.
    pub async fn heartbeat(&self, pod: &mut PodRef) -> Result<(), WorkloadError> {
        let Some(client) = &self.inner.client else {
            return Ok(());
        };

        match client.touch_activity(&pod.name, Utc::now()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(
                    "Heartbeat for pod {} failed ({e}), rediscovering by label",
                    pod.name
                );
                let rediscovered = client
                    .list_by_assessment(&pod.assessment_id)
                    .await?
                    .into_iter()
                    .find(|candidate| candidate.session_id == pod.session_id)
                    .ok_or(ClusterError::NotFound {
                        assessment_id: pod.assessment_id.clone(),
                        session_id: pod.session_id.clone(),
                    })?;
                *pod = rediscovered;
                client.touch_activity(&pod.name, Utc::now()).await?;
                Ok(())
            }
        }
    }

    /// Delete the pod for `key`. Idempotent; no lock is taken — deletion
    /// is atomic on the cluster side.
    pub async fn destroy(&self, key: &SessionKey) -> Result<(), WorkloadError> {
        let Some(client) = &self.inner.client else {
            return Ok(());
        };
        match client
            .resolve_by_labels(&key.assessment_id, &key.session_id)
            .await
        {
            Ok(pod) => {
                client.delete(&pod.name).await?;
                Ok(())
            }
            Err(ClusterError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// All terminal pods for one assessment (admin surface).
    pub async fn list_pods(&self, assessment_id: &str) -> Result<Vec<PodRef>, WorkloadError> {
        match &self.inner.client {
            Some(client) => Ok(client.list_by_assessment(assessment_id).await?),
            None => Ok(Vec::new()),
        }
    }

    /// Delete every terminal pod whose idle time exceeds its TTL. Returns
    /// the number reaped.
    pub async fn reap_idle(&self) -> Result<usize, WorkloadError> {
        let Some(client) = &self.inner.client else {
            return Ok(0);
        };

        let now = Utc::now();
        let default_ttl = self.inner.pod_ttl;
        let mut reaped = 0;
        for pod in client.list_terminal_pods().await? {
            if is_expired(&pod, now, default_ttl) {
                info!(
                    "Reaping idle pod {} (assessment {}, last activity {:?})",
                    pod.name, pod.assessment_id, pod.last_activity
                );
                if let Err(e) = client.delete(&pod.name).await {
                    warn!("Failed to reap pod {}: {e}", pod.name);
                } else {
                    reaped += 1;
                }
            }
        }
        Ok(reaped)
    }
}

/// Reap decision: expired iff `now - last_activity > ttl`. A pod with no
/// `last-activity` annotation is left alone — the next heartbeat writes
/// one. A missing or unparsable `ttl` falls back to `default_ttl`.
fn is_expired(pod: &PodRef, now: DateTime<Utc>, default_ttl: Duration) -> bool {
    let Some(last_activity) = pod.last_activity else {
        return false;
    };
    let ttl = pod.ttl.unwrap_or(default_ttl);
    let Ok(ttl) = chrono::Duration::from_std(ttl) else {
        return false;
    };
    now - last_activity > ttl
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(last_activity: Option<&str>, ttl: Option<Duration>) -> PodRef {
        PodRef {
            name: "terminal-a-b-xyz".to_string(),
            namespace: "qualifyd-dev".to_string(),
            assessment_id: "asmt-1".to_string(),
            session_id: "sess-1".to_string(),
            address: None,
            ready: false,
            last_activity: last_activity.map(|raw| {
                DateTime::parse_from_rfc3339(raw)
                    .unwrap()
                    .with_timezone(&Utc)
            }),
            ttl,
        }
    }

    fn at(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw)
            .unwrap()
            .with_timezone(&Utc)
    }

    const DEFAULT_TTL: Duration = Duration::from_secs(7200);

    #[test]
    fn pod_is_reaped_after_ttl_elapses() {
        let p = pod(Some("2026-03-01T10:00:00Z"), Some(DEFAULT_TTL));
        assert!(!is_expired(&p, at("2026-03-01T11:59:00Z"), DEFAULT_TTL));
        // Exactly at the boundary is not yet expired.
        assert!(!is_expired(&p, at("2026-03-01T12:00:00Z"), DEFAULT_TTL));
        assert!(is_expired(&p, at("2026-03-01T12:00:01Z"), DEFAULT_TTL));
    }

    #[test]
    fn missing_ttl_uses_default() {
        let p = pod(Some("2026-03-01T10:00:00Z"), None);
        assert!(!is_expired(&p, at("2026-03-01T11:00:00Z"), DEFAULT_TTL));
        assert!(is_expired(&p, at("2026-03-01T12:01:00Z"), DEFAULT_TTL));
    }

    #[test]
    fn missing_last_activity_is_never_reaped() {
        let p = pod(None, Some(DEFAULT_TTL));
        assert!(!is_expired(&p, at("2026-03-02T10:00:00Z"), DEFAULT_TTL));
    }

    #[tokio::test]
    async fn fallback_manager_returns_fixed_host() {
        let locks = Arc::new(AssessmentLocks::default());
        let manager = WorkloadManager::fallback("10.1.2.3", locks);
        assert!(manager.is_fallback());

        let mut key = SessionKey {
            assessment_id: "asmt-1".to_string(),
            session_id: "sess-1".to_string(),
        };
        let target = manager
            .ensure_pod(&mut key, &PodOverrides::default(), false)
            .await
            .unwrap();
        match &target {
            PodTarget::Fixed { host } => assert_eq!(host, "10.1.2.3"),
            PodTarget::Cluster(_) => panic!("expected fixed host"),
        }
        // The session id is never rewritten in fallback mode.
        assert_eq!(key.session_id, "sess-1");

        assert!(manager.pod_ready(&target).await.unwrap());
        assert_eq!(manager.address_of(&target).await.unwrap(), "10.1.2.3");
        assert_eq!(manager.reap_idle().await.unwrap(), 0);
        assert!(manager.destroy(&key).await.is_ok());
    }

    #[tokio::test]
    async fn fallback_heartbeat_is_noop() {
        let locks = Arc::new(AssessmentLocks::default());
        let manager = WorkloadManager::fallback("10.1.2.3", locks);
        let mut p = pod(None, None);
        manager.heartbeat(&mut p).await.unwrap();
        assert_eq!(p.name, "terminal-a-b-xyz");
    }
}
