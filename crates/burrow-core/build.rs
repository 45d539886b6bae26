//! Build script for burrow-core
//!
//! Checks the toolchain and warns about platforms without a process backend:
//! - Minimum Rust version
//! - Linux and macOS get a real backend; everything else only builds the
//!   overlays and the simulated target

fn main()
{
    println!("cargo:rerun-if-changed=build.rs");

    match rustc_version::version() {
        Ok(found) => {
            let minimum = rustc_version::Version::new(1, 70, 0);
            if found < minimum {
                panic!("burrow-core requires Rust {minimum} or newer, found {found}");
            }
        }
        Err(_) => println!("cargo:warning=could not verify Rust version"),
    }

    let os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if os != "linux" && os != "macos" {
        println!("cargo:warning=burrow-core has no process backend for '{os}'; attaching will return Unsupported");
    }

    let endian = std::env::var("CARGO_CFG_TARGET_ENDIAN").unwrap_or_default();
    if endian == "big" {
        println!("cargo:warning=burrow-core assumes little-endian targets; values will be byte-swapped");
    }
}
