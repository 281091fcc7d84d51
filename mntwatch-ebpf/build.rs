use which::which;

/// Rebuild the BPF object whenever the linker changes, since it is not tracked
/// by cargo otherwise.
fn main() {
    match which("bpf-linker") {
        Ok(path) => println!("cargo:rerun-if-changed={}", path.display()),
        Err(e) => println!("cargo:warning=bpf-linker not found: {e}"),
    }
}
