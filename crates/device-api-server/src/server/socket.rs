use std::fs::Permissions;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use error_stack::Report;
use error_stack::ResultExt;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tracing::info;
use tracing::warn;

use super::ServerError;

/// Mode applied to the socket file after binding.
pub const SOCKET_MODE: u32 = 0o660;

/// Binds the API socket, clearing a stale socket file left by a previous run.
///
/// Fails if another process is still accepting connections on `path`.
pub async fn bind(path: &Path) -> Result<UnixListener, Report<ServerError>> {
    let socket_error = || ServerError::Socket {
        path: path.display().to_string(),
    };

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .change_context_lazy(socket_error)
            .attach_printable_lazy(|| format!("creating {}", dir.display()))?;
    }

    if path.exists() {
        if UnixStream::connect(path).await.is_ok() {
            return Err(Report::new(ServerError::SocketInUse {
                path: path.display().to_string(),
            }));
        }
        warn!(path = %path.display(), "removing stale socket");
        std::fs::remove_file(path).change_context_lazy(socket_error)?;
    }

    let listener = UnixListener::bind(path).change_context_lazy(socket_error)?;
    std::fs::set_permissions(path, Permissions::from_mode(SOCKET_MODE))
        .change_context_lazy(socket_error)
        .attach_printable("setting socket permissions")?;
    info!(path = %path.display(), "listening on unix socket");
    Ok(listener)
}

/// Removes the socket file; a missing file is not an error.
pub fn remove(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => info!(path = %path.display(), "removed socket"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove socket"),
    }
}
