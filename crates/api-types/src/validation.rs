//! Validation rules applied by the server before persisting a GPU

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::gpu::ConditionType;
use crate::gpu::Gpu;
use crate::gpu::GpuStatus;
use crate::gpu::RecommendedAction;
use crate::naming::canonical_name;

const DNS1123_SUBDOMAIN_MAX_LEN: usize = 253;
const DNS1123_LABEL_MAX_LEN: usize = 63;

static DNS1123_SUBDOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .expect("valid regex")
});

static DNS1123_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("valid regex"));

static GPU_UUID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^GPU-[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$",
    )
    .expect("valid regex")
});

/// A single rejected field
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
#[display("{field}: {message}")]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Aggregate of every rule a GPU violated
#[derive(Debug, Clone, PartialEq, Eq, Default, derive_more::Display)]
#[display("invalid GPU: {}", join_errors(errors))]
pub struct ValidationError {
    pub errors: Vec<FieldError>,
}

impl ValidationError {
    fn push(&mut self, field: &str, message: impl Into<String>) {
        self.errors.push(FieldError {
            field: field.to_string(),
            message: message.into(),
        });
    }

    fn into_result(self) -> Result<(), ValidationError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

fn join_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl core::error::Error for ValidationError {}

pub fn is_dns1123_subdomain(value: &str) -> bool {
    value.len() <= DNS1123_SUBDOMAIN_MAX_LEN && DNS1123_SUBDOMAIN.is_match(value)
}

pub fn is_dns1123_label(value: &str) -> bool {
    value.len() <= DNS1123_LABEL_MAX_LEN && DNS1123_LABEL.is_match(value)
}

pub fn is_gpu_uuid(value: &str) -> bool {
    GPU_UUID.is_match(value)
}

/// Validates a GPU about to be created or updated.
///
/// The name must already be set (see [`crate::naming::ensure_name`]).
pub fn validate_gpu(gpu: &Gpu) -> Result<(), ValidationError> {
    let mut errs = ValidationError::default();
    let meta = &gpu.metadata;

    if meta.name.is_empty() {
        errs.push("metadata.name", "name or generateName is required");
    } else if !is_dns1123_subdomain(&meta.name) {
        errs.push(
            "metadata.name",
            format!("{:?} is not a DNS-1123 subdomain", meta.name),
        );
    }

    if !meta.namespace.is_empty() && !is_dns1123_label(&meta.namespace) {
        errs.push(
            "metadata.namespace",
            format!("{:?} is not a DNS-1123 label", meta.namespace),
        );
    }

    if gpu.spec.node_name.is_empty() {
        errs.push("spec.nodeName", "required");
    } else if !is_dns1123_subdomain(&gpu.spec.node_name) {
        errs.push(
            "spec.nodeName",
            format!("{:?} is not a DNS-1123 subdomain", gpu.spec.node_name),
        );
    }

    if gpu.spec.uuid.is_empty() {
        errs.push("spec.uuid", "required");
    } else if !is_gpu_uuid(&gpu.spec.uuid) {
        errs.push(
            "spec.uuid",
            format!(
                "{:?} does not match GPU-<8>-<4>-<4>-<4>-<12>",
                gpu.spec.uuid
            ),
        );
    }

    if !meta.generate_name.is_empty()
        && !meta.name.is_empty()
        && !gpu.spec.node_name.is_empty()
        && !gpu.spec.uuid.is_empty()
    {
        let expected = canonical_name(&meta.generate_name, &gpu.spec.node_name, &gpu.spec.uuid);
        if meta.name != expected {
            errs.push(
                "metadata.name",
                format!("must be {expected:?} when generateName is used"),
            );
        }
    }

    validate_status_into(&gpu.status, &mut errs);
    errs.into_result()
}

/// Validates the condition vocabulary and recommended actions.
pub fn validate_status(status: &GpuStatus) -> Result<(), ValidationError> {
    let mut errs = ValidationError::default();
    validate_status_into(status, &mut errs);
    errs.into_result()
}

fn validate_status_into(status: &GpuStatus, errs: &mut ValidationError) {
    let mut seen = HashSet::new();
    for (i, cond) in status.conditions.iter().enumerate() {
        let field = format!("status.conditions[{i}]");
        let Ok(type_) = cond.type_.parse::<ConditionType>() else {
            errs.push(&field, format!("unknown condition type {:?}", cond.type_));
            continue;
        };
        if !cond.status.is_known() {
            errs.push(
                &field,
                format!("status {:?} must be True, False or Unknown", cond.status.as_str()),
            );
        }
        if !seen.insert(type_) {
            errs.push(&field, format!("duplicate condition type {type_}"));
        }
        if !cond.reason.is_empty() && !type_.reasons().contains(&cond.reason.as_str()) {
            errs.push(
                &field,
                format!("reason {:?} is not valid for {type_}", cond.reason),
            );
        }
    }
    for (i, action) in status.recommended_actions.iter().enumerate() {
        if action.parse::<RecommendedAction>().is_err() {
            errs.push(
                &format!("status.recommendedActions[{i}]"),
                format!("unknown action {action:?}"),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::Condition;
    use crate::gpu::ConditionStatus;
    use crate::naming::ensure_name;

    fn valid_gpu() -> Gpu {
        let mut gpu = Gpu::with_generate_name(
            "gpu-",
            "worker-node-1",
            "GPU-00000000-0000-0000-0000-000000000001",
        );
        ensure_name(&mut gpu);
        gpu
    }

    #[test]
    fn accepts_well_formed_gpu() {
        assert_eq!(validate_gpu(&valid_gpu()), Ok(()));
    }

    #[test]
    fn requires_spec_fields() {
        let mut gpu = valid_gpu();
        gpu.spec.node_name.clear();
        gpu.spec.uuid.clear();
        let err = validate_gpu(&gpu).expect_err("should reject");
        let fields: Vec<_> = err.errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"spec.nodeName"), "got {fields:?}");
        assert!(fields.contains(&"spec.uuid"), "got {fields:?}");
    }

    #[test]
    fn rejects_malformed_uuid() {
        let mut gpu = valid_gpu();
        gpu.spec.uuid = "GPU-1234".to_string();
        gpu.metadata.generate_name.clear();
        let err = validate_gpu(&gpu).expect_err("should reject");
        assert!(err.to_string().contains("spec.uuid"));
    }

    #[test]
    fn rejects_name_that_disagrees_with_generate_name() {
        let mut gpu = valid_gpu();
        gpu.metadata.name = "gpu-000000000000".to_string();
        let err = validate_gpu(&gpu).expect_err("should reject");
        assert!(err.to_string().contains("generateName"));
    }

    #[test]
    fn rejects_uppercase_names() {
        let mut gpu = valid_gpu();
        gpu.metadata.generate_name.clear();
        gpu.metadata.name = "GPU-0".to_string();
        assert!(validate_gpu(&gpu).is_err());
    }

    #[test]
    fn status_vocabulary_is_enforced() {
        let status = GpuStatus {
            conditions: vec![
                Condition {
                    type_: "Ready".to_string(),
                    status: ConditionStatus::False,
                    reason: "DriverInitFailure".to_string(),
                    ..Default::default()
                },
                Condition {
                    type_: "Ready".to_string(),
                    status: ConditionStatus::True,
                    reason: "FallenOffBus".to_string(),
                    ..Default::default()
                },
                Condition {
                    type_: "Haunted".to_string(),
                    ..Default::default()
                },
            ],
            recommended_actions: vec!["ResetGPU".to_string(), "Pray".to_string()],
        };
        let err = validate_status(&status).expect_err("should reject");
        assert_eq!(err.errors.len(), 4, "{err}");
    }

    #[test]
    fn rejects_condition_status_outside_tri_state() {
        let mut gpu = valid_gpu();
        gpu.status.conditions.push(Condition {
            type_: "Ready".to_string(),
            status: ConditionStatus::Other("Maybe".to_string()),
            reason: "DriverReady".to_string(),
            ..Default::default()
        });
        let err = validate_gpu(&gpu).expect_err("should reject");
        assert_eq!(err.errors.len(), 1, "{err}");
        assert_eq!(err.errors[0].field, "status.conditions[0]");
        assert!(err.to_string().contains("\"Maybe\""), "{err}");
    }

    #[test]
    fn error_message_joins_fields() {
        let err = ValidationError {
            errors: vec![
                FieldError {
                    field: "spec.uuid".to_string(),
                    message: "required".to_string(),
                },
                FieldError {
                    field: "spec.nodeName".to_string(),
                    message: "required".to_string(),
                },
            ],
        };
        assert_eq!(
            err.to_string(),
            "invalid GPU: spec.uuid: required; spec.nodeName: required"
        );
    }

    #[test]
    fn dns_helpers() {
        assert!(is_dns1123_subdomain("worker-node-1.example.com"));
        assert!(!is_dns1123_subdomain("-bad"));
        assert!(is_dns1123_label("default"));
        assert!(!is_dns1123_label("a.b"));
    }
}
