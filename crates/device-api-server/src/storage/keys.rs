use api_types::ResourceDescriptor;
use api_types::DEFAULT_NAMESPACE;

/// Builds storage keys of the form
/// `/registry/nodes/<node>/<plural>/<namespace>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBuilder {
    root: String,
}

impl KeyBuilder {
    pub fn new(node_name: &str, descriptor: &ResourceDescriptor) -> Self {
        Self {
            root: format!(
                "/registry/nodes/{}/{}/",
                node_name.to_lowercase(),
                descriptor.plural
            ),
        }
    }

    /// Key of a single object; an empty namespace means `default`.
    pub fn object(&self, namespace: &str, name: &str) -> String {
        format!("{}{}/{name}", self.root, normalize(namespace))
    }

    /// Prefix covering one namespace, or the whole node for `None`.
    ///
    /// Prefixes end in `/` so that `gpu` never matches `gpu-operator`.
    pub fn prefix(&self, namespace: Option<&str>) -> String {
        match namespace {
            Some(ns) => format!("{}{}/", self.root, normalize(ns)),
            None => self.root.clone(),
        }
    }
}

fn normalize(namespace: &str) -> &str {
    if namespace.is_empty() {
        DEFAULT_NAMESPACE
    } else {
        namespace
    }
}

#[cfg(test)]
mod tests {
    use api_types::descriptor::GPU;

    use super::*;

    #[test]
    fn object_keys_follow_registry_layout() {
        let keys = KeyBuilder::new("Worker-Node-1", &GPU);
        assert_eq!(
            keys.object("", "gpu-1"),
            "/registry/nodes/worker-node-1/gpus/default/gpu-1"
        );
        assert_eq!(
            keys.object("gpu-operator", "gpu-1"),
            "/registry/nodes/worker-node-1/gpus/gpu-operator/gpu-1"
        );
    }

    #[test]
    fn prefixes_are_slash_terminated() {
        let keys = KeyBuilder::new("worker-node-1", &GPU);
        assert_eq!(keys.prefix(None), "/registry/nodes/worker-node-1/gpus/");
        assert_eq!(
            keys.prefix(Some("gpu")),
            "/registry/nodes/worker-node-1/gpus/gpu/"
        );
        assert!(!keys
            .object("gpu-operator", "x")
            .starts_with(&keys.prefix(Some("gpu"))));
    }
}
