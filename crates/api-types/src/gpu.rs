//! The GPU resource family

use std::str::FromStr;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::descriptor;
use crate::descriptor::ResourceDescriptor;
use crate::meta::ListMeta;
use crate::meta::ObjectMeta;
use crate::meta::Resource;

/// One physical GPU on the node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Gpu {
    pub metadata: ObjectMeta,
    pub spec: GpuSpec,
    pub status: GpuStatus,
}

/// Desired, hardware-derived identity of a GPU
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GpuSpec {
    /// Hardware UUID, `GPU-xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx`
    pub uuid: String,
    /// Host the GPU is attached to
    pub node_name: String,
}

/// Observed health of a GPU
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GpuStatus {
    pub conditions: Vec<Condition>,
    pub recommended_actions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub last_transition_time: Option<DateTime<Utc>>,
    pub reason: String,
    pub message: String,
}

/// A list snapshot taken at a single store revision
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GpuList {
    pub metadata: ListMeta,
    pub items: Vec<Gpu>,
}

impl Resource for Gpu {
    const DESCRIPTOR: ResourceDescriptor = descriptor::GPU;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Gpu {
    /// Creates a GPU whose name is derived from `generate_name` on create.
    pub fn with_generate_name(
        generate_name: impl Into<String>,
        node_name: impl Into<String>,
        uuid: impl Into<String>,
    ) -> Self {
        Self {
            metadata: ObjectMeta {
                generate_name: generate_name.into(),
                ..Default::default()
            },
            spec: GpuSpec {
                uuid: uuid.into(),
                node_name: node_name.into(),
            },
            status: GpuStatus::default(),
        }
    }

    pub fn condition(&self, type_: ConditionType) -> Option<&Condition> {
        self.status
            .conditions
            .iter()
            .find(|c| c.type_ == type_.as_str())
    }

    /// Inserts or replaces the condition of the same type.
    ///
    /// The transition time is only moved forward when the status flips, so
    /// repeated reports of the same state keep the original timestamp.
    pub fn set_condition(&mut self, mut condition: Condition, now: DateTime<Utc>) {
        match self
            .status
            .conditions
            .iter_mut()
            .find(|c| c.type_ == condition.type_)
        {
            Some(existing) => {
                if existing.status != condition.status {
                    existing.status = condition.status;
                    existing.last_transition_time =
                        Some(condition.last_transition_time.unwrap_or(now));
                }
                existing.reason = condition.reason;
                existing.message = condition.message;
            }
            None => {
                if condition.last_transition_time.is_none() {
                    condition.last_transition_time = Some(now);
                }
                self.status.conditions.push(condition);
            }
        }
    }
}

/// Tri-state condition status
///
/// Values outside the tri-state are kept verbatim in `Other`; validation
/// rejects them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
    #[serde(untagged)]
    Other(String),
}

impl ConditionStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
            ConditionStatus::Other(raw) => raw,
        }
    }

    pub const fn is_known(&self) -> bool {
        !matches!(self, ConditionStatus::Other(_))
    }
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConditionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "True" => Ok(ConditionStatus::True),
            "False" => Ok(ConditionStatus::False),
            "Unknown" => Ok(ConditionStatus::Unknown),
            other => Err(format!("unknown condition status {other:?}")),
        }
    }
}

impl From<String> for ConditionStatus {
    fn from(raw: String) -> Self {
        raw.parse().unwrap_or(ConditionStatus::Other(raw))
    }
}

/// Condition types a GPU can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionType {
    Ready,
    Degraded,
    ResetRequired,
    HardwareFailure,
}

impl ConditionType {
    pub const ALL: [ConditionType; 4] = [
        ConditionType::Ready,
        ConditionType::Degraded,
        ConditionType::ResetRequired,
        ConditionType::HardwareFailure,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            ConditionType::Ready => "Ready",
            ConditionType::Degraded => "Degraded",
            ConditionType::ResetRequired => "ResetRequired",
            ConditionType::HardwareFailure => "HardwareFailure",
        }
    }

    /// Reason codes accepted for this condition type.
    pub const fn reasons(self) -> &'static [&'static str] {
        match self {
            ConditionType::Ready => &[
                "DriverReady",
                "DriverInitFailure",
                "DeviceInitializing",
                "DeviceLost",
            ],
            ConditionType::Degraded => &[
                "NotDegraded",
                "ThermalThrottling",
                "PowerCapped",
                "EccErrorsCorrected",
                "NvlinkDegraded",
            ],
            ConditionType::ResetRequired => &[
                "NoResetRequired",
                "XidError",
                "RowRemapPending",
                "EccErrorsUncorrectable",
            ],
            ConditionType::HardwareFailure => &[
                "NoHardwareFailure",
                "FallenOffBus",
                "RowRemapFailure",
                "InforomCorrupted",
            ],
        }
    }
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConditionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConditionType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown condition type {s:?}"))
    }
}

/// Remediation an operator or controller is advised to take
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecommendedAction {
    None,
    ResetGpu,
    RebootNode,
    DrainNode,
    ReplaceGpu,
    ReportIssue,
}

impl RecommendedAction {
    pub const ALL: [RecommendedAction; 6] = [
        RecommendedAction::None,
        RecommendedAction::ResetGpu,
        RecommendedAction::RebootNode,
        RecommendedAction::DrainNode,
        RecommendedAction::ReplaceGpu,
        RecommendedAction::ReportIssue,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            RecommendedAction::None => "None",
            RecommendedAction::ResetGpu => "ResetGPU",
            RecommendedAction::RebootNode => "RebootNode",
            RecommendedAction::DrainNode => "DrainNode",
            RecommendedAction::ReplaceGpu => "ReplaceGPU",
            RecommendedAction::ReportIssue => "ReportIssue",
        }
    }
}

impl std::fmt::Display for RecommendedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecommendedAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecommendedAction::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| format!("unknown recommended action {s:?}"))
    }
}
