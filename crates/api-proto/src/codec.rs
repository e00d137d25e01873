//! Conversion between the `api-types` model and the generated wire messages.
//!
//! Conversions are pure and never validate: condition types, reasons and
//! recommended actions travel as opaque strings. Missing sub-messages decode
//! to empty values, and missing top-level objects stay `None`.

use api_types::Condition;
use api_types::ConditionStatus;
use api_types::Gpu;
use api_types::GpuList;
use api_types::GpuSpec;
use api_types::GpuStatus;
use api_types::ListMeta;
use api_types::ObjectMeta;
use chrono::DateTime;
use chrono::Utc;

use crate::v1alpha1 as wire;

pub fn timestamp_to_wire(ts: Option<DateTime<Utc>>) -> Option<prost_types::Timestamp> {
    ts.map(|ts| prost_types::Timestamp {
        seconds: ts.timestamp(),
        nanos: ts.timestamp_subsec_nanos() as i32,
    })
}

/// Out-of-range timestamps decode as unset.
pub fn timestamp_from_wire(ts: Option<prost_types::Timestamp>) -> Option<DateTime<Utc>> {
    let ts = ts?;
    let nanos = u32::try_from(ts.nanos).ok()?;
    DateTime::from_timestamp(ts.seconds, nanos)
}

impl From<ObjectMeta> for wire::ObjectMeta {
    fn from(meta: ObjectMeta) -> Self {
        Self {
            name: meta.name,
            namespace: meta.namespace,
            uid: meta.uid,
            resource_version: meta.resource_version,
            generation: meta.generation,
            creation_timestamp: timestamp_to_wire(meta.creation_timestamp),
            generate_name: meta.generate_name,
            labels: meta.labels.into_iter().collect(),
        }
    }
}

impl From<wire::ObjectMeta> for ObjectMeta {
    fn from(meta: wire::ObjectMeta) -> Self {
        Self {
            name: meta.name,
            generate_name: meta.generate_name,
            namespace: meta.namespace,
            uid: meta.uid,
            resource_version: meta.resource_version,
            generation: meta.generation,
            creation_timestamp: timestamp_from_wire(meta.creation_timestamp),
            labels: meta.labels.into_iter().collect(),
        }
    }
}

impl From<GpuSpec> for wire::GpuSpec {
    fn from(spec: GpuSpec) -> Self {
        Self {
            uuid: spec.uuid,
            node_name: spec.node_name,
        }
    }
}

impl From<wire::GpuSpec> for GpuSpec {
    fn from(spec: wire::GpuSpec) -> Self {
        Self {
            uuid: spec.uuid,
            node_name: spec.node_name,
        }
    }
}

impl From<Condition> for wire::Condition {
    fn from(cond: Condition) -> Self {
        Self {
            r#type: cond.type_,
            status: cond.status.as_str().to_string(),
            last_transition_time: timestamp_to_wire(cond.last_transition_time),
            reason: cond.reason,
            message: cond.message,
        }
    }
}

impl From<wire::Condition> for Condition {
    fn from(cond: wire::Condition) -> Self {
        Self {
            type_: cond.r#type,
            status: ConditionStatus::from(cond.status),
            last_transition_time: timestamp_from_wire(cond.last_transition_time),
            reason: cond.reason,
            message: cond.message,
        }
    }
}

impl From<GpuStatus> for wire::GpuStatus {
    fn from(status: GpuStatus) -> Self {
        Self {
            conditions: status.conditions.into_iter().map(Into::into).collect(),
            recommended_actions: status.recommended_actions,
        }
    }
}

impl From<wire::GpuStatus> for GpuStatus {
    fn from(status: wire::GpuStatus) -> Self {
        Self {
            conditions: status.conditions.into_iter().map(Into::into).collect(),
            recommended_actions: status.recommended_actions,
        }
    }
}

impl From<Gpu> for wire::Gpu {
    fn from(gpu: Gpu) -> Self {
        Self {
            metadata: Some(gpu.metadata.into()),
            spec: Some(gpu.spec.into()),
            status: Some(gpu.status.into()),
        }
    }
}

impl From<wire::Gpu> for Gpu {
    fn from(gpu: wire::Gpu) -> Self {
        Self {
            metadata: gpu.metadata.map(Into::into).unwrap_or_default(),
            spec: gpu.spec.map(Into::into).unwrap_or_default(),
            status: gpu.status.map(Into::into).unwrap_or_default(),
        }
    }
}

impl From<GpuList> for wire::GpuList {
    fn from(list: GpuList) -> Self {
        Self {
            metadata: Some(wire::ListMeta {
                resource_version: list.metadata.resource_version,
            }),
            items: list.items.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<wire::GpuList> for GpuList {
    fn from(list: wire::GpuList) -> Self {
        Self {
            metadata: ListMeta {
                resource_version: list
                    .metadata
                    .map(|m| m.resource_version)
                    .unwrap_or_default(),
            },
            items: list.items.into_iter().map(Into::into).collect(),
        }
    }
}

pub fn gpu_to_wire(gpu: Option<Gpu>) -> Option<wire::Gpu> {
    gpu.map(Into::into)
}

pub fn gpu_from_wire(gpu: Option<wire::Gpu>) -> Option<Gpu> {
    gpu.map(Into::into)
}

pub fn gpu_list_to_wire(list: Option<GpuList>) -> Option<wire::GpuList> {
    list.map(Into::into)
}

pub fn gpu_list_from_wire(list: Option<wire::GpuList>) -> Option<GpuList> {
    list.map(Into::into)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::TimeZone;
    use similar_asserts::assert_eq;

    use super::*;

    fn populated_gpu() -> Gpu {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap();
        Gpu {
            metadata: ObjectMeta {
                name: "gpu-89ebd4226844".to_string(),
                generate_name: "gpu-".to_string(),
                namespace: "default".to_string(),
                uid: "7b0b5d8e-0d67-4b8f-9f0a-2a3d5e1c4b11".to_string(),
                resource_version: "42".to_string(),
                generation: 3,
                creation_timestamp: Some(created),
                labels: BTreeMap::from([("model".to_string(), "a100".to_string())]),
            },
            spec: GpuSpec {
                uuid: "GPU-00000000-0000-0000-0000-000000000001".to_string(),
                node_name: "worker-node-1".to_string(),
            },
            status: GpuStatus {
                conditions: vec![Condition {
                    type_: "Ready".to_string(),
                    status: ConditionStatus::False,
                    last_transition_time: Some(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()),
                    reason: "DriverInitFailure".to_string(),
                    message: "Driver failed to load".to_string(),
                }],
                recommended_actions: vec!["ResetGPU".to_string(), "ReportIssue".to_string()],
            },
        }
    }

    #[test]
    fn gpu_round_trips_through_wire() {
        let gpu = populated_gpu();

        let decoded: Gpu = wire::Gpu::from(gpu.clone()).into();

        assert_eq!(decoded, gpu);
    }

    #[test]
    fn ready_condition_survives_encoding() {
        // Arrange
        let gpu = populated_gpu();

        // Act
        let encoded = wire::Gpu::from(gpu.clone());
        let bytes = prost::Message::encode_to_vec(&encoded);
        let decoded_wire: wire::Gpu =
            prost::Message::decode(bytes.as_slice()).expect("should decode");
        let decoded = Gpu::from(decoded_wire);

        // Assert
        assert_eq!(decoded.status, gpu.status);
        let cond = &decoded.status.conditions[0];
        assert_eq!(
            cond.last_transition_time.map(|t| t.to_rfc3339()),
            Some("2024-01-01T12:00:00+00:00".to_string())
        );
    }

    #[test]
    fn nanosecond_timestamps_are_preserved() {
        let ts = Utc.timestamp_opt(1_704_110_400, 123_456_789).unwrap();
        assert_eq!(timestamp_from_wire(timestamp_to_wire(Some(ts))), Some(ts));
    }

    #[test]
    fn unset_timestamp_stays_unset() {
        assert_eq!(timestamp_to_wire(None), None);
        assert_eq!(timestamp_from_wire(None), None);
        let bogus = prost_types::Timestamp {
            seconds: 0,
            nanos: -1,
        };
        assert_eq!(timestamp_from_wire(Some(bogus)), None);
    }

    #[test]
    fn none_maps_to_none() {
        assert_eq!(gpu_to_wire(None), None);
        assert_eq!(gpu_from_wire(None), None);
        assert_eq!(gpu_list_to_wire(None), None);
        assert_eq!(gpu_list_from_wire(None), None);
    }

    #[test]
    fn missing_sub_messages_decode_empty() {
        let gpu = Gpu::from(wire::Gpu::default());
        assert_eq!(gpu, Gpu::default());
    }

    #[test]
    fn unknown_status_is_carried_verbatim() {
        let cond = Condition::from(wire::Condition {
            r#type: "Haunted".to_string(),
            status: "Maybe".to_string(),
            ..Default::default()
        });
        assert_eq!(cond.status, ConditionStatus::Other("Maybe".to_string()));
        assert_eq!(cond.type_, "Haunted", "codec must not validate types");
        assert_eq!(wire::Condition::from(cond).status, "Maybe");
    }

    #[test]
    fn list_keeps_revision_and_order() {
        let mut second = populated_gpu();
        second.metadata.name = "gpu-2".to_string();
        let list = GpuList {
            metadata: ListMeta {
                resource_version: "99".to_string(),
            },
            items: vec![populated_gpu(), second],
        };

        let decoded = gpu_list_from_wire(gpu_list_to_wire(Some(list.clone())));

        assert_eq!(decoded, Some(list));
    }
}
