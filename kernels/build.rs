use std::env;
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

// Double hashing rounds the window count up to a tabulated prime so every
// key-derived probe step stays coprime with the table. The table is dense
// below DENSE_LIMIT, giving small tables the tightest prime, then
// geometrically spaced (ratio 129/128) up to SPARSE_CEILING so the capacity
// overshoot for huge tables stays under one percent without embedding
// millions of entries.
const DENSE_LIMIT: usize = 100_000;
const SPARSE_CEILING: usize = 1 << 46;
const SPARSE_STEP_NUM: usize = 129;
const SPARSE_STEP_DEN: usize = 128;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=CUDA_ARCH");
    println!("cargo::rustc-check-cfg=cfg(back_to_back_cas)");

    emit_cas_capability();
    write_prime_table();
}

/// Independent per-word CAS on a slot needs compute capability 7.0 or newer;
/// older architectures fall back to the CAS-then-store protocol. The PTX
/// build (xtask ptx) exports CUDA_ARCH; host builds default to on so the
/// host fallbacks exercise the same protocol selection.
fn emit_cas_capability() {
    let arch: u32 = env::var("CUDA_ARCH")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(75);
    if arch >= 70 {
        println!("cargo:rustc-cfg=back_to_back_cas");
    }
}

fn write_prime_table() {
    let mut primes: Vec<usize> = primal::Sieve::new(DENSE_LIMIT).primes_from(2).collect();

    let mut target = DENSE_LIMIT;
    while target <= SPARSE_CEILING {
        let mut candidate = target;
        while !primal::is_prime(candidate as u64) {
            candidate += 1;
        }
        primes.push(candidate);
        target = candidate * SPARSE_STEP_NUM / SPARSE_STEP_DEN;
    }

    let mut out = String::new();
    out.push_str("// Prime table for double-hashing extents: every prime below\n");
    out.push_str("// 100_000, then geometrically spaced primes (see build.rs).\n");
    out.push_str("pub const PRIMES: &[usize] = &[\n");
    for chunk in primes.chunks(8) {
        out.push_str("    ");
        for prime in chunk {
            write!(out, "{prime}, ").unwrap();
        }
        out.push('\n');
    }
    out.push_str("];\n");

    let path = PathBuf::from(env::var("OUT_DIR").unwrap()).join("primes.rs");
    fs::write(path, out).expect("failed to write primes.rs");
}
