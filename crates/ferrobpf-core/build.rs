//! Build script for ferrobpf-core
//!
//! This script checks system requirements before compilation:
//! - Minimum Rust version (the workspace builds `ferrobpf-utils` with edition 2024)
//! - Target platform (map creation through `bpf(2)` is Linux-only)
//!
//! ## Requirements
//!
//! - **Rust**: 1.85.0 or newer
//! - **Linux**: kernel BPF support for the syscall backend
//! - **Other hosts**: programs can still be prepared against the in-memory backend

fn main()
{
    // Edition 2024 was stabilised in Rust 1.85.0; tests also need `mem::offset_of!` (1.77)
    if let Ok(rustc_version) = rustc_version::version() {
        let min_rust_version = rustc_version::Version::new(1, 85, 0);

        if rustc_version < min_rust_version {
            panic!(
                "ferrobpf-core requires Rust {} or newer, found {}",
                min_rust_version, rustc_version
            );
        }
    } else {
        // If we can't get version (e.g., in some build environments), just warn
        println!("cargo:warning=could not verify Rust version");
    }

    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os != "linux" {
        println!("cargo:warning=ferrobpf-core: no kernel map backend for {target_os}, only InMemoryBackend is available");
    }
}
