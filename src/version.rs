// Centralized version information

// Cargo package version from Cargo.toml
pub const CARGO_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version shown on the update page and in the boot log
pub fn full_version() -> String {
    format!("v{}-rust", CARGO_VERSION)
}
