//! Stamps the binary with where and when it was built, for `taskd version` and the daemon banner.

use std::time::{SystemTime, UNIX_EPOCH};

/// `epoch:<secs>`. SOURCE_DATE_EPOCH wins so reproducible builds stay reproducible.
fn build_time() -> String {
    let secs = std::env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0)
        });
    format!("epoch:{secs}")
}

fn build_host() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");
    println!("cargo:rustc-env=TASKD_BUILD_TIME={}", build_time());
    println!("cargo:rustc-env=TASKD_BUILD_HOST={}", build_host());
}
