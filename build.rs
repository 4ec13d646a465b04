fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto");

    // Use the vendored compiler unless the caller points at one.
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    tonic_build::configure().compile(
        &["proto/tipb.proto", "proto/resource_usage_agent.proto"],
        &["proto"],
    )?;

    Ok(())
}
