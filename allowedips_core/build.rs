use std::env;
use std::path::PathBuf;

// Generates include/allowedips.h for C callers of the `extern "C"` surface.
fn main() {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let include_dir = manifest_dir.join("include");
    std::fs::create_dir_all(&include_dir).expect("Failed to create include directory");

    for input in ["src/public_api.rs", "src/errors.rs", "src/telemetry.rs", "src/handle_registry.rs", "cbindgen.toml"] {
        println!("cargo:rerun-if-changed={input}");
    }

    let config = cbindgen::Config::from_file(manifest_dir.join("cbindgen.toml"))
        .expect("Failed to read cbindgen.toml");

    cbindgen::Builder::new()
        .with_config(config)
        .with_crate(&manifest_dir)
        .generate()
        .expect("Unable to generate bindings")
        .write_to_file(include_dir.join("allowedips.h"));
}
