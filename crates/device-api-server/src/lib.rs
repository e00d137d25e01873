//! Node-local GPU device API server.
//!
//! GPUs are stored as revisioned objects under
//! `/registry/nodes/<node>/gpus/<namespace>/<name>` and served over gRPC on a
//! Unix socket with get, list, watch and write verbs.

pub mod config;
pub mod metrics;
pub mod server;
pub mod service;
pub mod storage;
