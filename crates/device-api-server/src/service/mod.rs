//! gRPC handlers translating wire requests into storage operations.

mod gpu;
mod status;

pub use gpu::GpuService;
pub use status::storage_status;
pub use status::validation_status;
