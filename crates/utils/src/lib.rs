//! Helpers shared by the device API binaries and libraries.

pub mod logging;
pub mod version;
