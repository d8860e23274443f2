use std::env;
use std::fs;

fn main() {
    // Read workspace metadata from workspace Cargo.toml
    let workspace_manifest_path = "../../Cargo.toml"; // relative to this crate
    println!("cargo:rerun-if-changed={}", workspace_manifest_path);
    let manifest_content = fs::read_to_string(workspace_manifest_path).unwrap_or_default();

    let app_name = manifest_content
        .lines()
        .find(|l| l.trim_start().starts_with("app-name"))
        .and_then(|l| l.split('=').nth(1))
        .map(|v| v.trim().trim_matches('"').to_string())
        .unwrap_or_else(|| env::var("CARGO_PKG_NAME").unwrap_or_else(|_| "apy".into()));

    println!("cargo:rustc-env=APP_NAME={}", app_name);
}
