//! Cluster client — thin façade over the Kubernetes API for terminal pods.
//!
//! All interaction with the orchestrator goes through [`Client`]: list, get,
//! create, delete, annotation updates, and readiness checks, scoped to a
//! single namespace. The label and annotation schema lives here and nowhere
//! else.
//!
//! ## Label schema (externally observable, stable)
//!
//! - `app.qualifyd.io/component = terminal`
//! - `app.qualifyd.io/assessment-id = <assessmentId>`
//! - `app.qualifyd.io/session-id = <sessionId>`
//!
//! ## Annotation schema
//!
//! - `qualifyd.io/last-activity = <RFC3339 timestamp>`
//! - `qualifyd.io/ttl = <duration, e.g. 2h>`
//! - `qualifyd.io/created-at = <RFC3339 timestamp>`
//!
//! The client is stateless apart from cached credentials and is freely
//! shared across tasks.

pub mod template;
pub mod workload;

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client as KubeClient;
use thiserror::Error;
use tracing::{info, warn};

/// Label key identifying terminal pods.
pub const COMPONENT_LABEL_KEY: &str = "app.qualifyd.io/component";
/// Label value identifying terminal pods.
pub const COMPONENT_LABEL_VALUE: &str = "terminal";
/// Label key carrying the assessment id.
pub const ASSESSMENT_ID_LABEL_KEY: &str = "app.qualifyd.io/assessment-id";
/// Label key carrying the session id.
pub const SESSION_ID_LABEL_KEY: &str = "app.qualifyd.io/session-id";
/// Annotation holding the RFC3339 timestamp of the last session activity.
pub const LAST_ACTIVITY_ANNOTATION: &str = "qualifyd.io/last-activity";
/// Annotation holding the idle TTL after which the reaper deletes the pod.
pub const TTL_ANNOTATION: &str = "qualifyd.io/ttl";
/// Annotation holding the RFC3339 creation timestamp.
pub const CREATED_AT_ANNOTATION: &str = "qualifyd.io/created-at";
/// Prefix for generated terminal pod names.
pub const POD_NAME_PREFIX: &str = "terminal";

/// Errors from the cluster façade.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster credentials unavailable: {0}")]
    Credentials(String),
    #[error("kubernetes api error: {0}")]
    Api(#[from] kube::Error),
    #[error("no terminal pod found for assessment {assessment_id} session {session_id}")]
    NotFound {
        assessment_id: String,
        session_id: String,
    },
}

/// A pod as the broker sees it: identity, address, readiness, and the
/// annotations the idle reaper consumes. Cluster-side state indexed by
/// label — sessions reference it but never own it.
#[derive(Debug, Clone)]
pub struct PodRef {
    pub name: String,
    pub namespace: String,
    pub assessment_id: String,
    pub session_id: String,
    /// Pod IP, once assigned by the scheduler.
    pub address: Option<String>,
    pub ready: bool,
    pub last_activity: Option<DateTime<Utc>>,
    pub ttl: Option<Duration>,
}

/// Thin façade over `kube::Api<Pod>`, scoped to one namespace.
#[derive(Clone)]
pub struct Client {
    pods: Api<Pod>,
    namespace: String,
}

impl Client {
    /// Discover credentials and validate them with one benign listing call.
    ///
    /// Prefers in-cluster credentials; on failure falls back to the local
    /// kubeconfig. Either way the client is only returned once a
    /// limit-1 pod list has succeeded.
    pub async fn connect(namespace: &str) -> Result<Self, ClusterError> {
        let config = match kube::Config::incluster() {
            Ok(config) => {
                info!("Using in-cluster credentials, namespace: {namespace}");
                config
            }
            Err(e) => {
                info!("In-cluster config unavailable ({e}), falling back to kubeconfig");
                kube::Config::infer()
                    .await
                    .map_err(|e| ClusterError::Credentials(e.to_string()))?
            }
        };

        let kube_client =
            KubeClient::try_from(config).map_err(|e| ClusterError::Credentials(e.to_string()))?;
        let pods: Api<Pod> = Api::namespaced(kube_client, namespace);

        // Validate before declaring the client healthy.
        pods.list(&ListParams::default().limit(1)).await?;
        info!("Cluster client initialised, namespace: {namespace}");

        Ok(Self {
            pods,
            namespace: namespace.to_string(),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Label selector matching the single pod for (assessment, session).
    fn session_selector(assessment_id: &str, session_id: &str) -> String {
        format!(
            "{COMPONENT_LABEL_KEY}={COMPONENT_LABEL_VALUE},{ASSESSMENT_ID_LABEL_KEY}={assessment_id},{SESSION_ID_LABEL_KEY}={session_id}"
        )
    }

    /// Label selector matching all pods for an assessment.
    fn assessment_selector(assessment_id: &str) -> String {
        format!(
            "{COMPONENT_LABEL_KEY}={COMPONENT_LABEL_VALUE},{ASSESSMENT_ID_LABEL_KEY}={assessment_id}"
        )
    }

    /// Label selector matching every terminal pod in the namespace.
    fn component_selector() -> String {
        format!("{COMPONENT_LABEL_KEY}={COMPONENT_LABEL_VALUE}")
    }

    /// Return the pod matching both the assessment and session labels.
    ///
    /// More than one match should not happen (creation is serialised per
    /// assessment); if it does, the first in listing order wins and a
    /// warning is logged — the idle reaper prunes the extras eventually.
    pub async fn resolve_by_labels(
        &self,
        assessment_id: &str,
        session_id: &str,
    ) -> Result<PodRef, ClusterError> {
        let selector = Self::session_selector(assessment_id, session_id);
        let pods = self.pods.list(&ListParams::default().labels(&selector)).await?;

        if pods.items.len() > 1 {
            warn!(
                "{} pods match assessment {assessment_id} session {session_id}, using first",
                pods.items.len()
            );
        }
        pods.items
            .first()
            .map(pod_to_ref)
            .ok_or_else(|| ClusterError::NotFound {
                assessment_id: assessment_id.to_string(),
                session_id: session_id.to_string(),
            })
    }

    /// Enumerate all pods for an assessment regardless of session.
    pub async fn list_by_assessment(
        &self,
        assessment_id: &str,
    ) -> Result<Vec<PodRef>, ClusterError> {
        let selector = Self::assessment_selector(assessment_id);
        let pods = self.pods.list(&ListParams::default().labels(&selector)).await?;
        Ok(pods.items.iter().map(pod_to_ref).collect())
    }

    /// Enumerate every terminal pod in the namespace (reaper input).
    pub async fn list_terminal_pods(&self) -> Result<Vec<PodRef>, ClusterError> {
        let selector = Self::component_selector();
        let pods = self.pods.list(&ListParams::default().labels(&selector)).await?;
        Ok(pods.items.iter().map(pod_to_ref).collect())
    }

    /// Submit a rendered pod manifest. Returns the accepted pod, which is
    /// not yet ready.
    pub async fn create(&self, pod: Pod) -> Result<PodRef, ClusterError> {
        let created = self.pods.create(&PostParams::default(), &pod).await?;
        let podref = pod_to_ref(&created);
        info!(
            "Terminal pod {} created (assessment {}, session {})",
            podref.name, podref.assessment_id, podref.session_id
        );
        Ok(podref)
    }

    /// Delete a pod immediately (grace period 0, foreground propagation).
    /// Deleting a pod that is already gone is not an error.
    pub async fn delete(&self, name: &str) -> Result<(), ClusterError> {
        let params = DeleteParams::foreground().grace_period(0);
        match self.pods.delete(name, &params).await {
            Ok(_) => {
                info!("Terminal pod {name} deleted");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Update the `last-activity` annotation via read-modify-write. A pod
    /// missing the annotation gets it written with `now`.
    pub async fn touch_activity(
        &self,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ClusterError> {
        let mut pod = self.pods.get(name).await?;
        pod.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(LAST_ACTIVITY_ANNOTATION.to_string(), now.to_rfc3339());
        self.pods.replace(name, &PostParams::default(), &pod).await?;
        Ok(())
    }

    /// Whether the pod is ready: `Ready` condition true *and* a routable
    /// address assigned.
    pub async fn pod_ready(&self, name: &str) -> Result<bool, ClusterError> {
        let pod = self.pods.get(name).await?;
        Ok(pod_is_ready(&pod))
    }

    /// The pod's routable address, if one has been assigned.
    pub async fn pod_address(&self, name: &str) -> Result<Option<String>, ClusterError> {
        let pod = self.pods.get(name).await?;
        Ok(pod.status.as_ref().and_then(|s| s.pod_ip.clone()))
    }
}

/// Whether the pod is ready for a session: all ready conditions reported
/// true *and* a routable address assigned. The condition and the IP are
/// updated independently by the orchestrator, so checking the condition
/// alone can declare an addressless pod ready.
fn pod_is_ready(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    let condition_true = status.conditions.as_ref().is_some_and(|conditions| {
        conditions
            .iter()
            .any(|c| c.type_ == "Ready" && c.status == "True")
    });
    condition_true && status.pod_ip.as_ref().is_some_and(|ip| !ip.is_empty())
}

/// Project a raw pod object onto the broker's view of it.
fn pod_to_ref(pod: &Pod) -> PodRef {
    let labels = pod.metadata.labels.as_ref();
    let annotations = pod.metadata.annotations.as_ref();
    let label = |key: &str| {
        labels
            .and_then(|l| l.get(key))
            .cloned()
            .unwrap_or_default()
    };

    let last_activity = annotations
        .and_then(|a| a.get(LAST_ACTIVITY_ANNOTATION))
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|ts| ts.with_timezone(&Utc));
    let ttl = annotations
        .and_then(|a| a.get(TTL_ANNOTATION))
        .and_then(|raw| humantime::parse_duration(raw).ok());

    PodRef {
        name: pod.metadata.name.clone().unwrap_or_default(),
        namespace: pod.metadata.namespace.clone().unwrap_or_default(),
        assessment_id: label(ASSESSMENT_ID_LABEL_KEY),
        session_id: label(SESSION_ID_LABEL_KEY),
        address: pod.status.as_ref().and_then(|s| s.pod_ip.clone()),
        ready: pod_is_ready(pod),
        last_activity,
        ttl,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn pod_with(
        labels: &[(&str, &str)],
        annotations: &[(&str, &str)],
        conditions: Vec<PodCondition>,
        ip: Option<&str>,
    ) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("terminal-a-b-xyz".to_string()),
                namespace: Some("qualifyd-dev".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            },
            spec: None,
            status: Some(PodStatus {
                conditions: Some(conditions),
                pod_ip: ip.map(ToString::to_string),
                ..Default::default()
            }),
        }
    }

    fn ready_condition(status: &str) -> PodCondition {
        PodCondition {
            type_: "Ready".to_string(),
            status: status.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn selectors_encode_label_schema() {
        assert_eq!(
            Client::session_selector("a1", "s1"),
            "app.qualifyd.io/component=terminal,app.qualifyd.io/assessment-id=a1,app.qualifyd.io/session-id=s1"
        );
        assert_eq!(
            Client::assessment_selector("a1"),
            "app.qualifyd.io/component=terminal,app.qualifyd.io/assessment-id=a1"
        );
        assert_eq!(
            Client::component_selector(),
            "app.qualifyd.io/component=terminal"
        );
    }

    #[test]
    fn pod_projection_extracts_identity_and_annotations() {
        let pod = pod_with(
            &[
                (COMPONENT_LABEL_KEY, COMPONENT_LABEL_VALUE),
                (ASSESSMENT_ID_LABEL_KEY, "asmt-1"),
                (SESSION_ID_LABEL_KEY, "sess-1"),
            ],
            &[
                (LAST_ACTIVITY_ANNOTATION, "2026-03-01T10:00:00+00:00"),
                (TTL_ANNOTATION, "2h"),
            ],
            vec![ready_condition("True")],
            Some("10.0.0.7"),
        );
        let podref = pod_to_ref(&pod);
        assert_eq!(podref.assessment_id, "asmt-1");
        assert_eq!(podref.session_id, "sess-1");
        assert_eq!(podref.address.as_deref(), Some("10.0.0.7"));
        assert!(podref.ready);
        assert_eq!(podref.ttl, Some(Duration::from_secs(7200)));
        assert_eq!(
            podref.last_activity.unwrap().to_rfc3339(),
            "2026-03-01T10:00:00+00:00"
        );
    }

    #[test]
    fn not_ready_until_condition_true_and_address_assigned() {
        let pod = pod_with(&[], &[], vec![ready_condition("False")], None);
        assert!(!pod_is_ready(&pod));
        let pod = pod_with(&[], &[], vec![], Some("10.0.0.7"));
        assert!(!pod_is_ready(&pod));
        // The Ready condition can flip true before the IP is assigned; an
        // addressless pod is not ready.
        let pod = pod_with(&[], &[], vec![ready_condition("True")], None);
        assert!(!pod_is_ready(&pod));
        let pod = pod_with(&[], &[], vec![ready_condition("True")], Some(""));
        assert!(!pod_is_ready(&pod));
        let pod = pod_with(&[], &[], vec![ready_condition("True")], Some("10.0.0.7"));
        assert!(pod_is_ready(&pod));
    }

    #[test]
    fn malformed_annotations_are_ignored() {
        let pod = pod_with(
            &[],
            &[(LAST_ACTIVITY_ANNOTATION, "yesterday"), (TTL_ANNOTATION, "long")],
            vec![],
            None,
        );
        let podref = pod_to_ref(&pod);
        assert!(podref.last_activity.is_none());
        assert!(podref.ttl.is_none());
    }

    #[test]
    fn go_style_ttl_durations_parse() {
        // The annotation format the original annotation writer used.
        assert_eq!(
            humantime::parse_duration("2h0m0s").unwrap(),
            Duration::from_secs(7200)
        );
        assert_eq!(
            humantime::parse_duration("2h").unwrap(),
            Duration::from_secs(7200)
        );
    }
}
