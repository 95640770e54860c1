//! Build script for trapdoor-core
//!
//! Checks system requirements before compilation:
//! - Minimum Rust version (let-else and `is_some_and` need Rust 1.70.0+)
//! - Platform support (the `ptrace` backend is x86-64 Linux only)

fn main()
{
    if let Ok(rustc_version) = rustc_version::version() {
        let min_rust_version = rustc_version::Version::new(1, 70, 0);

        assert!(
            rustc_version >= min_rust_version,
            "trapdoor-core requires Rust {min_rust_version} or newer, found {rustc_version}"
        );
    } else {
        // If we can't get version (e.g., in some build environments), just warn
        println!("cargo:warning=could not verify Rust version");
    }

    let os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let arch = std::env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
    if os != "linux" || arch != "x86_64" {
        println!("cargo:warning=trapdoor-core has no debug backend for {arch}-{os}; only the core will be usable");
    }
}
