use std::env;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = PathBuf::from(env::var("OUT_DIR")?);

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .file_descriptor_set_path(out_dir.join("device_api_descriptor.bin"))
        .compile_protos(&["proto/device_api.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/device_api.proto");
    Ok(())
}
