//! Wire definitions for the device API.
//!
//! The generated tonic/prost code lives in [`v1alpha1`]; [`codec`] converts
//! between those messages and the `api-types` model.

pub mod codec;

pub mod v1alpha1 {
    #![allow(clippy::all)]
    tonic::include_proto!("nvidia.device.v1alpha1");
}

/// Encoded descriptor set served by the reflection service.
pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("device_api_descriptor");

/// Watch event `type` values carried on the wire.
pub mod event_type {
    pub const ADDED: &str = "ADDED";
    pub const MODIFIED: &str = "MODIFIED";
    pub const DELETED: &str = "DELETED";
    pub const BOOKMARK: &str = "BOOKMARK";
    pub const ERROR: &str = "ERROR";
}
