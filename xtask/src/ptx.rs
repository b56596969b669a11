//! Direct PTX build of the kernels crate.
//!
//! The rustc flag set and the `-Zbuild-std` invocation are dictated by the
//! rust-cuda toolchain; what this module adds is locating (or building) the
//! `rustc_codegen_nvvm` backend and exporting `CUDA_ARCH` so the kernels
//! build script can key its capability cfgs off the requested architecture.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};

use crate::BuildOpts;

const KERNELS_PACKAGE: &str = "cuda-static-containers-kernels";
const NVPTX_TARGET: &str = "nvptx64-nvidia-cuda";
const BACKEND_LIB: &str = "librustc_codegen_nvvm.so";

/// Env override for a prebuilt codegen backend.
const BACKEND_ENV: &str = "NVVM_BACKEND_PATH";

pub fn build(opts: &BuildOpts, arch: &str) -> Result<()> {
    let root = env::current_dir()?;
    let backend = locate_backend(&root)?;
    let backend_dir = backend.parent().unwrap();

    let mut cargo = Command::new("cargo");
    cargo.args(["build", "--target", NVPTX_TARGET]);
    cargo.arg("--target-dir").arg(root.join("target/nvptx"));
    // The nvptx target ships no prebuilt core/alloc.
    cargo.args([
        "-Zbuild-std=core,alloc",
        "-Zbuild-std-features=panic_immediate_abort",
    ]);
    if opts.release {
        cargo.arg("--release");
    }
    cargo.args(["-p", opts.package.as_deref().unwrap_or(KERNELS_PACKAGE)]);
    cargo.args(&opts.cargo_args);

    cargo.env(
        "CARGO_ENCODED_RUSTFLAGS",
        device_rustflags(&backend, arch).join("\x1f"),
    );
    cargo.env("LD_LIBRARY_PATH", prepend_ld_path(backend_dir));
    cargo.env("CUDA_ARCH", arch.trim_start_matches("compute_"));

    println!("PTX build for {arch} via {}", backend.display());
    if !cargo
        .status()
        .context("failed to run cargo for the PTX build")?
        .success()
    {
        bail!("PTX build failed");
    }
    Ok(())
}

/// The rustc invocation the nvvm backend expects: no_std with abort-only
/// panics, the `nvvm_internal` tool attribute registered, and the
/// architecture threaded through to LLVM.
fn device_rustflags(backend: &Path, arch: &str) -> Vec<String> {
    let mut flags = vec![format!("-Zcodegen-backend={}", backend.display())];
    flags.extend(
        [
            "-Zcrate-attr=feature(register_tool)",
            "-Zcrate-attr=register_tool(nvvm_internal)",
            "-Zcrate-attr=no_std",
            "-Zsaturating_float_casts=false",
            "-Cembed-bitcode=no",
            "-Cdebuginfo=0",
            "-Coverflow-checks=off",
            "-Copt-level=3",
            "-Cpanic=abort",
            "-Cno-redzone=yes",
        ]
        .map(String::from),
    );
    flags.push(format!("-Cllvm-args=-arch={arch} --override-libm"));
    flags.push(format!("-Ctarget-feature=+{arch}"));
    flags
}

fn prepend_ld_path(backend_dir: &Path) -> String {
    match env::var("LD_LIBRARY_PATH") {
        Ok(existing) if !existing.is_empty() => {
            format!("{}:{existing}", backend_dir.display())
        }
        _ => backend_dir.display().to_string(),
    }
}

/// Finds the codegen backend: an explicit env override first, then the
/// usual target directories, and as a last resort a `cargo build` of the
/// backend itself followed by a rescan.
fn locate_backend(root: &Path) -> Result<PathBuf> {
    if let Ok(explicit) = env::var(BACKEND_ENV) {
        let path = PathBuf::from(explicit);
        if path.exists() {
            return Ok(path);
        }
        bail!("{BACKEND_ENV} points at a missing file: {}", path.display());
    }

    if let Some(found) = scan_target_dirs(root) {
        return Ok(found);
    }

    println!("{BACKEND_LIB} not found, building rustc_codegen_nvvm");
    let status = Command::new("cargo")
        .args(["build", "-p", "rustc_codegen_nvvm"])
        .current_dir(root)
        .status()?;
    if !status.success() {
        bail!("failed to build rustc_codegen_nvvm");
    }

    scan_target_dirs(root).with_context(|| {
        format!("{BACKEND_LIB} still missing after building; set {BACKEND_ENV} to its location")
    })
}

fn scan_target_dirs(root: &Path) -> Option<PathBuf> {
    let target_roots = ["target", "target/cuda-builder-codegen", "rust-cuda/target"];
    let profiles = ["debug", "release"];

    target_roots
        .iter()
        .flat_map(|target| {
            profiles
                .iter()
                .map(move |profile| root.join(target).join(profile).join("deps").join(BACKEND_LIB))
        })
        .find(|candidate| candidate.exists())
}
