//! Workspace build driver.
//!
//! `cargo xtask host` is a plain cargo build. `cargo xtask ptx` compiles the
//! kernels crate for `nvptx64-nvidia-cuda` through `rustc_codegen_nvvm`,
//! which cargo cannot drive unaided (custom codegen backend, rebuilt
//! core/alloc, a fixed stack of rustc flags). `cargo xtask all` runs both.

mod ptx;

use std::process::Command;

use anyhow::{bail, Result};
use clap::{Args, Parser};

#[derive(Parser)]
#[command(name = "xtask", about = "Build driver for cuda-static-containers")]
enum Task {
    /// Build the host crates.
    Host(BuildOpts),
    /// Build the kernels crate to PTX.
    Ptx(PtxOpts),
    /// Build the host crates, then the PTX.
    All(PtxOpts),
}

#[derive(Args, Clone)]
struct BuildOpts {
    /// Optimized build.
    #[arg(long)]
    release: bool,
    /// Build a single package instead of the default.
    #[arg(short, long)]
    package: Option<String>,
    /// Extra arguments forwarded to cargo.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    cargo_args: Vec<String>,
}

#[derive(Args, Clone)]
struct PtxOpts {
    #[command(flatten)]
    build: BuildOpts,
    /// Target GPU architecture.
    #[arg(long, default_value = "compute_75")]
    arch: String,
}

fn main() -> Result<()> {
    match Task::parse() {
        Task::Host(opts) => host_build(&opts),
        Task::Ptx(opts) => ptx::build(&opts.build, &opts.arch),
        Task::All(opts) => {
            host_build(&opts.build)?;
            ptx::build(&opts.build, &opts.arch)
        }
    }
}

fn host_build(opts: &BuildOpts) -> Result<()> {
    let mut cargo = Command::new("cargo");
    cargo.arg("build");
    if opts.release {
        cargo.arg("--release");
    }
    if let Some(package) = &opts.package {
        cargo.args(["-p", package]);
    }
    cargo.args(&opts.cargo_args);

    if !cargo.status()?.success() {
        bail!("host build failed");
    }
    Ok(())
}
