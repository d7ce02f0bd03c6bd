/// Generates the gRPC bindings for `proto/echo.proto`.
///
/// Messages also derive `serde` traits so the gateway can read them from
/// query strings and JSON bodies and write them back as JSON. Every field is
/// optional on the wire (`#[serde(default)]`), matching proto3.
///
/// The encoded `FileDescriptorSet` is written to `OUT_DIR/echo_descriptor.bin`
/// for server reflection and call classification.
use std::env;
use std::path::PathBuf;

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let descriptor_path = out_dir.join("echo_descriptor.bin");

    let mut config = tonic_prost_build::Config::new();
    config
        .type_attribute(
            ".echo.v1",
            "#[derive(serde::Serialize, serde::Deserialize)]\n#[serde(default)]",
        )
        .file_descriptor_set_path(&descriptor_path);

    tonic_prost_build::configure()
        .compile_with_config(config, &["proto/echo.proto"], &["proto"])
        .unwrap();
}
