// The ISR stub table in arch::x86_64::idt stores absolute addresses of
// global_asm! labels in a read-only array; that's incompatible with the
// position-independent executables the host toolchain links by default.
// This only affects linking the hosted test binary for this crate, not
// the freestanding kernel artifact produced by the external boot shim.
fn main() {
    let target = std::env::var("TARGET").unwrap_or_default();
    if target.contains("linux") {
        println!("cargo:rustc-link-arg=-no-pie");
    }
}
