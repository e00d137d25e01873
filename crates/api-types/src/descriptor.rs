//! Declarative description of the resource kinds served by the device API.
//!
//! Everything that varies per kind (storage key segment, namespacing, supported
//! verbs, wire service name) is read from a [`ResourceDescriptor`] instead of
//! being scattered across the server and the client.

/// Verbs a resource kind may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    List,
    Watch,
    Create,
    Update,
    Delete,
}

impl Verb {
    pub const fn as_str(self) -> &'static str {
        match self {
            Verb::Get => "get",
            Verb::List => "list",
            Verb::Watch => "watch",
            Verb::Create => "create",
            Verb::Update => "update",
            Verb::Delete => "delete",
        }
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static description of one resource kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub group: &'static str,
    pub version: &'static str,
    pub kind: &'static str,
    /// Lower-case plural, used as the storage key segment
    pub plural: &'static str,
    pub namespaced: bool,
    pub verbs: &'static [Verb],
    /// Fully qualified gRPC service name
    pub service: &'static str,
}

impl ResourceDescriptor {
    pub fn supports(&self, verb: Verb) -> bool {
        self.verbs.contains(&verb)
    }

    /// `group/version`
    pub fn api_version(&self) -> String {
        format!("{}/{}", self.group, self.version)
    }
}

/// The GPU resource
pub const GPU: ResourceDescriptor = ResourceDescriptor {
    group: "device.nvidia.com",
    version: "v1alpha1",
    kind: "GPU",
    plural: "gpus",
    namespaced: true,
    verbs: &[
        Verb::Get,
        Verb::List,
        Verb::Watch,
        Verb::Create,
        Verb::Update,
        Verb::Delete,
    ],
    service: "nvidia.device.v1alpha1.GpuService",
};

/// All kinds known to this build.
pub const ALL: &[ResourceDescriptor] = &[GPU];
