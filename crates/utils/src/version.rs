//! Build identification for the device API binaries.

use std::sync::LazyLock;

const IMAGE_VERSION: &str = env!("IMAGE_VERSION");
const GIT_SHA: Option<&str> = option_env!("VERGEN_GIT_SHA");
const GIT_DIRTY: Option<&str> = option_env!("VERGEN_GIT_DIRTY");
const BUILD_TIMESTAMP: Option<&str> = option_env!("VERGEN_BUILD_TIMESTAMP");
const RUSTC_SEMVER: Option<&str> = option_env!("VERGEN_RUSTC_SEMVER");
const SHORT_SHA_LEN: usize = 8;

/// `<image version>-<short git sha>[-dirty]`, printed at startup and by `--version`.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    let sha = GIT_SHA.map_or("unknown", short_sha);
    let dirty = if GIT_DIRTY == Some("true") { "-dirty" } else { "" };
    format!("{IMAGE_VERSION}-{sha}{dirty}")
});

/// [`VERSION`] plus when and with which compiler it was built.
pub static LONG_VERSION: LazyLock<String> = LazyLock::new(|| {
    format!(
        "{} (built {}, rustc {})",
        &**VERSION,
        BUILD_TIMESTAMP.unwrap_or("unknown"),
        RUSTC_SEMVER.unwrap_or("unknown")
    )
});

fn short_sha(sha: &str) -> &str {
    &sha[..sha.len().min(SHORT_SHA_LEN)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_starts_with_image_version() {
        assert!(
            VERSION.starts_with(IMAGE_VERSION),
            "unexpected version string {}",
            &**VERSION
        );
        assert!(!VERSION.ends_with('-'), "sha segment must not be empty");
    }

    #[test]
    fn long_version_extends_version() {
        assert!(LONG_VERSION.starts_with(&**VERSION));
        assert!(LONG_VERSION.contains("rustc "));
    }

    #[test]
    fn short_sha_truncates() {
        assert_eq!(short_sha("0123456789abcdef"), "01234567");
        assert_eq!(short_sha("abc"), "abc");
    }
}
