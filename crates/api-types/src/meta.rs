use std::collections::BTreeMap;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::descriptor::ResourceDescriptor;

/// Namespace used when a request or object leaves it empty
pub const DEFAULT_NAMESPACE: &str = "default";

/// Identity and bookkeeping shared by every stored object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectMeta {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Prefix used to derive `name` when the name is left empty
    #[serde(skip_serializing_if = "String::is_empty")]
    pub generate_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Opaque identifier assigned on create, immutable afterwards
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uid: String,
    /// Store revision of the last mutation, opaque to clients
    #[serde(skip_serializing_if = "String::is_empty")]
    pub resource_version: String,
    /// Bumped only when `spec` changes
    pub generation: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl ObjectMeta {
    /// The namespace, with empty normalised to [`DEFAULT_NAMESPACE`].
    pub fn namespace_or_default(&self) -> &str {
        if self.namespace.is_empty() {
            DEFAULT_NAMESPACE
        } else {
            &self.namespace
        }
    }

    /// Cache key of the form `namespace/name`.
    pub fn key(&self) -> String {
        object_key(self.namespace_or_default(), &self.name)
    }
}

/// Metadata carried by list responses
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListMeta {
    /// Store revision at which the list snapshot was taken
    pub resource_version: String,
}

/// Builds the `namespace/name` key used by client-side caches.
pub fn object_key(namespace: &str, name: &str) -> String {
    let namespace = if namespace.is_empty() {
        DEFAULT_NAMESPACE
    } else {
        namespace
    };
    format!("{namespace}/{name}")
}

/// Common accessors every resource kind provides.
pub trait Resource: Clone + std::fmt::Debug + Send + Sync + 'static {
    const DESCRIPTOR: ResourceDescriptor;

    fn meta(&self) -> &ObjectMeta;

    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn name(&self) -> &str {
        &self.meta().name
    }

    fn resource_version(&self) -> &str {
        &self.meta().resource_version
    }

    fn key(&self) -> String {
        self.meta().key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_namespace_is_normalised() {
        let meta = ObjectMeta {
            name: "gpu-1".to_string(),
            ..Default::default()
        };
        assert_eq!(meta.namespace_or_default(), "default");
        assert_eq!(meta.key(), "default/gpu-1");
    }

    #[test]
    fn explicit_namespace_is_kept() {
        let meta = ObjectMeta {
            name: "gpu-1".to_string(),
            namespace: "gpu-operator".to_string(),
            ..Default::default()
        };
        assert_eq!(meta.key(), "gpu-operator/gpu-1");
    }

    #[test]
    fn json_omits_empty_fields() {
        let meta = ObjectMeta {
            name: "gpu-1".to_string(),
            generation: 1,
            ..Default::default()
        };
        let json = serde_json::to_value(&meta).expect("should serialize");
        assert_eq!(json, serde_json::json!({"name": "gpu-1", "generation": 1}));
    }
}
