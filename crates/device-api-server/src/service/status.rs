use api_types::ValidationError;
use error_stack::Report;
use tonic::Status;
use tracing::error;

use crate::storage::StorageError;

/// Maps a storage failure onto the status code clients act upon.
pub fn storage_status(report: &Report<StorageError>) -> Status {
    let context = report.current_context();
    let message = context.to_string();
    match context {
        StorageError::NotFound { .. } => Status::not_found(message),
        StorageError::AlreadyExists { .. } => Status::already_exists(message),
        StorageError::Conflict { .. } => Status::aborted(message),
        StorageError::InvalidObject { .. } => Status::invalid_argument(message),
        StorageError::Expired { .. } | StorageError::FutureRevision { .. } => {
            Status::out_of_range(message)
        }
        StorageError::WatcherEvicted => Status::resource_exhausted(message),
        StorageError::Codec | StorageError::Backend => {
            error!(error = ?report, "storage failure");
            Status::internal(message)
        }
    }
}

pub fn validation_status(err: &ValidationError) -> Status {
    Status::invalid_argument(err.to_string())
}
