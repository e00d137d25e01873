//! Shared API type definitions
//!
//! This crate contains the in-memory resource model served by the device API:
//! the GPU resource family, its object metadata, the condition vocabulary,
//! canonical-name derivation and validation rules. Both the server and the
//! client library build on these types; neither the wire format nor the
//! storage encoding leaks in here.

pub mod descriptor;
pub mod gpu;
pub mod labels;
pub mod meta;
pub mod naming;
pub mod validation;

pub use descriptor::ResourceDescriptor;
pub use descriptor::Verb;
pub use gpu::Condition;
pub use gpu::ConditionStatus;
pub use gpu::ConditionType;
pub use gpu::Gpu;
pub use gpu::GpuList;
pub use gpu::GpuSpec;
pub use gpu::GpuStatus;
pub use gpu::RecommendedAction;
pub use labels::LabelSelector;
pub use meta::ListMeta;
pub use meta::ObjectMeta;
pub use meta::Resource;
pub use meta::DEFAULT_NAMESPACE;
pub use naming::canonical_name;
pub use naming::ensure_name;
pub use validation::ValidationError;
