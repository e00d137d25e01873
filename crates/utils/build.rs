use std::env;

use vergen_git2::BuildBuilder;
use vergen_git2::Emitter;
use vergen_git2::Git2Builder;
use vergen_git2::RustcBuilder;

fn main() {
    let image_version = env::var("VERSION").unwrap_or_else(|_| "latest".to_string());
    println!("cargo:rustc-env=IMAGE_VERSION={image_version}");
    println!("cargo:rerun-if-env-changed=VERSION");

    // Outside a git checkout (e.g. a vendored tarball) the version falls
    // back to "unknown" instead of failing the build.
    if let Err(err) = emit_build_metadata() {
        println!("cargo:warning=device API build metadata unavailable: {err}");
    }
}

fn emit_build_metadata() -> anyhow::Result<()> {
    let build = BuildBuilder::default().build_timestamp(true).build()?;
    let rustc = RustcBuilder::default().semver(true).build()?;
    let git = Git2Builder::default().sha(true).dirty(true).build()?;

    Emitter::default()
        .fail_on_error()
        .add_instructions(&build)?
        .add_instructions(&rustc)?
        .add_instructions(&git)?
        .emit()
}
