//! Pod template loading and per-session override application.
//!
//! Templates are plain pod manifests in YAML, loaded by name from the
//! configured templates directory (`<dir>/<name>.yaml`). Each creation
//! loads the file fresh — there is no shared mutable template state.
//!
//! Overrides are applied to a deep copy of the template:
//! generated name, hostname, required labels, activity/ttl annotations,
//! and optional image / cpu / memory (cpu and memory land on both requests
//! and limits of the primary container).

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use thiserror::Error;

use super::workload::SessionKey;
use super::{
    ASSESSMENT_ID_LABEL_KEY, COMPONENT_LABEL_KEY, COMPONENT_LABEL_VALUE, CREATED_AT_ANNOTATION,
    LAST_ACTIVITY_ANNOTATION, POD_NAME_PREFIX, SESSION_ID_LABEL_KEY, TTL_ANNOTATION,
};

/// Name of the template used when the client does not ask for one.
pub const DEFAULT_TEMPLATE: &str = "default";
/// Image used when neither override, configured default, nor template
/// provide one.
pub const DEFAULT_IMAGE: &str = "qualifyd-terminal:dev";

/// Errors from template loading and rendering.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("failed to read template {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse template {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("template {0} has no containers")]
    NoContainers(String),
    #[error("invalid resource quantity {0:?}")]
    BadQuantity(String),
}

/// Per-session overrides carried from the upgrade request's query string.
#[derive(Debug, Clone, Default)]
pub struct PodOverrides {
    /// Template name; empty means [`DEFAULT_TEMPLATE`].
    pub template_type: String,
    pub image: String,
    pub cpu: String,
    pub memory: String,
    /// Extra labels merged after the required ones.
    pub labels: BTreeMap<String, String>,
    /// Extra annotations merged after the required ones.
    pub annotations: BTreeMap<String, String>,
}

impl PodOverrides {
    /// The effective template name.
    pub fn template_name(&self) -> &str {
        if self.template_type.is_empty() {
            DEFAULT_TEMPLATE
        } else {
            &self.template_type
        }
    }
}

/// Load a named pod template from `dir`.
pub fn load(dir: &Path, name: &str) -> Result<Pod, TemplateError> {
    let path = dir.join(format!("{name}.yaml"));
    let display = path.display().to_string();
    let raw = std::fs::read_to_string(&path).map_err(|source| TemplateError::Read {
        path: display.clone(),
        source,
    })?;
    serde_yaml::from_str(&raw).map_err(|source| TemplateError::Parse {
        path: display,
        source,
    })
}

/// Validate a Kubernetes resource quantity: a decimal number followed by an
/// optional SI or binary suffix (`500m`, `2`, `1.5Gi`, `512Mi`, ...).
pub fn is_valid_quantity(raw: &str) -> bool {
    const SUFFIXES: [&str; 14] = [
        "m", "k", "M", "G", "T", "P", "E", "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "",
    ];
    if raw.is_empty() {
        return false;
    }
    let numeric_end = raw
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(numeric_end);
    !number.is_empty()
        && number.parse::<f64>().is_ok()
        && SUFFIXES.contains(&suffix)
}

/// Render a loaded template into a creatable manifest for one session.
///
/// `default_image` is the environment-configured image (empty = unset);
/// when neither an override nor the configured default is present the
/// template's own image stands, and a template without one falls back to
/// the compiled-in [`DEFAULT_IMAGE`].
pub fn render(
    mut pod: Pod,
    key: &SessionKey,
    overrides: &PodOverrides,
    namespace: &str,
    default_image: &str,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<Pod, TemplateError> {
    let meta = &mut pod.metadata;
    meta.name = None;
    meta.generate_name = Some(format!(
        "{POD_NAME_PREFIX}-{}-{}-",
        key.assessment_id, key.session_id
    ));
    meta.namespace = Some(namespace.to_string());

    let labels = meta.labels.get_or_insert_with(BTreeMap::new);
    labels.insert(
        COMPONENT_LABEL_KEY.to_string(),
        COMPONENT_LABEL_VALUE.to_string(),
    );
    labels.insert(
        ASSESSMENT_ID_LABEL_KEY.to_string(),
        key.assessment_id.clone(),
    );
    labels.insert(SESSION_ID_LABEL_KEY.to_string(), key.session_id.clone());
    for (k, v) in &overrides.labels {
        labels.insert(k.clone(), v.clone());
    }

    let annotations = meta.annotations.get_or_insert_with(BTreeMap::new);
    annotations.insert(LAST_ACTIVITY_ANNOTATION.to_string(), now.to_rfc3339());
    annotations.insert(CREATED_AT_ANNOTATION.to_string(), now.to_rfc3339());
    annotations.insert(
        TTL_ANNOTATION.to_string(),
        humantime::format_duration(ttl).to_string(),
    );
    for (k, v) in &overrides.annotations {
        annotations.insert(k.clone(), v.clone());
    }

    let spec = pod.spec.as_mut().ok_or_else(|| {
        TemplateError::NoContainers(overrides.template_name().to_string())
    })?;
    // A short hostname keyed on the assessment alone keeps shell prompts
    // stable across reattached sessions.
    spec.hostname = Some(format!("{POD_NAME_PREFIX}-{}", key.assessment_id));

    let container = spec.containers.first_mut().ok_or_else(|| {
        TemplateError::NoContainers(overrides.template_name().to_string())
    })?;

    if !overrides.image.is_empty() {
        container.image = Some(overrides.image.clone());
    } else if !default_image.is_empty() {
        container.image = Some(default_image.to_string());
    } else if container.image.is_none() {
        container.image = Some(DEFAULT_IMAGE.to_string());
    }

    if !overrides.cpu.is_empty() || !overrides.memory.is_empty() {
        let resources = container.resources.get_or_insert_with(Default::default);
        let requests = resources.requests.get_or_insert_with(BTreeMap::new);
        let limits = resources.limits.get_or_insert_with(BTreeMap::new);
        for (key, raw) in [("cpu", &overrides.cpu), ("memory", &overrides.memory)] {
            if raw.is_empty() {
                continue;
            }
            if !is_valid_quantity(raw) {
                return Err(TemplateError::BadQuantity(raw.clone()));
            }
            requests.insert(key.to_string(), Quantity(raw.clone()));
            limits.insert(key.to_string(), Quantity(raw.clone()));
        }
    }

    Ok(pod)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = r"
apiVersion: v1
kind: Pod
metadata:
  labels:
    team: assessments
spec:
  containers:
    - name: terminal
      image: qualifyd-terminal:v3
      ports:
        - containerPort: 22
";

    fn key() -> SessionKey {
        SessionKey {
            assessment_id: "asmt-1".to_string(),
            session_id: "sess-1".to_string(),
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn rendered(overrides: &PodOverrides, default_image: &str) -> Pod {
        let template: Pod = serde_yaml::from_str(TEMPLATE).unwrap();
        render(
            template,
            &key(),
            overrides,
            "qualifyd-dev",
            default_image,
            Duration::from_secs(7200),
            now(),
        )
        .unwrap()
    }

    #[test]
    fn required_labels_and_annotations_are_set() {
        let pod = rendered(&PodOverrides::default(), "");
        let meta = &pod.metadata;
        assert_eq!(
            meta.generate_name.as_deref(),
            Some("terminal-asmt-1-sess-1-")
        );
        assert_eq!(meta.namespace.as_deref(), Some("qualifyd-dev"));

        let labels = meta.labels.as_ref().unwrap();
        assert_eq!(labels.get(COMPONENT_LABEL_KEY).unwrap(), "terminal");
        assert_eq!(labels.get(ASSESSMENT_ID_LABEL_KEY).unwrap(), "asmt-1");
        assert_eq!(labels.get(SESSION_ID_LABEL_KEY).unwrap(), "sess-1");
        // Template-provided labels survive.
        assert_eq!(labels.get("team").unwrap(), "assessments");

        let annotations = meta.annotations.as_ref().unwrap();
        assert_eq!(
            annotations.get(LAST_ACTIVITY_ANNOTATION).unwrap(),
            "2026-03-01T10:00:00+00:00"
        );
        assert_eq!(annotations.get(TTL_ANNOTATION).unwrap(), "2h");

        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(spec.hostname.as_deref(), Some("terminal-asmt-1"));
    }

    #[test]
    fn image_precedence_override_then_default_then_template() {
        let with_override = rendered(
            &PodOverrides {
                image: "custom:1".to_string(),
                ..Default::default()
            },
            "env:1",
        );
        assert_eq!(
            with_override.spec.unwrap().containers[0].image.as_deref(),
            Some("custom:1")
        );

        let with_default = rendered(&PodOverrides::default(), "env:1");
        assert_eq!(
            with_default.spec.unwrap().containers[0].image.as_deref(),
            Some("env:1")
        );

        let verbatim = rendered(&PodOverrides::default(), "");
        assert_eq!(
            verbatim.spec.unwrap().containers[0].image.as_deref(),
            Some("qualifyd-terminal:v3")
        );
    }

    #[test]
    fn resources_land_on_requests_and_limits() {
        let pod = rendered(
            &PodOverrides {
                cpu: "500m".to_string(),
                memory: "1Gi".to_string(),
                ..Default::default()
            },
            "",
        );
        let spec = pod.spec.unwrap();
        let resources = spec.containers[0].resources.as_ref().unwrap();
        let requests = resources.requests.as_ref().unwrap();
        let limits = resources.limits.as_ref().unwrap();
        assert_eq!(requests.get("cpu").unwrap().0, "500m");
        assert_eq!(limits.get("cpu").unwrap().0, "500m");
        assert_eq!(requests.get("memory").unwrap().0, "1Gi");
        assert_eq!(limits.get("memory").unwrap().0, "1Gi");
    }

    #[test]
    fn bad_quantity_is_rejected() {
        let template: Pod = serde_yaml::from_str(TEMPLATE).unwrap();
        let err = render(
            template,
            &key(),
            &PodOverrides {
                cpu: "lots".to_string(),
                ..Default::default()
            },
            "qualifyd-dev",
            "",
            Duration::from_secs(7200),
            now(),
        )
        .unwrap_err();
        assert!(matches!(err, TemplateError::BadQuantity(_)));
    }

    #[test]
    fn quantity_validation() {
        for ok in ["500m", "2", "1.5", "1Gi", "512Mi", "100k", "0.5"] {
            assert!(is_valid_quantity(ok), "{ok} should be valid");
        }
        for bad in ["", "m", "1X", "one", "1.2.3", "Gi1"] {
            assert!(!is_valid_quantity(bad), "{bad} should be invalid");
        }
    }

    #[test]
    fn missing_template_file_errors() {
        let err = load(Path::new("/nonexistent"), "default").unwrap_err();
        assert!(matches!(err, TemplateError::Read { .. }));
    }
}
