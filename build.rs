// build.rs

use std::env;

// The version string clients and servers compare during the handshake.
// Game builds override it to pin compatibility to their own release.
fn main() {
    let version = env::var("QUESTLINK_VERSION")
        .or_else(|_| env::var("CARGO_PKG_VERSION"))
        .unwrap_or_else(|_| "dev".to_string());

    println!("cargo:rustc-env=QUESTLINK_VERSION={version}");
    println!("cargo:rerun-if-env-changed=QUESTLINK_VERSION");
}
