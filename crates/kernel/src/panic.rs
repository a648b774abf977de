//! Kernel panic path
//!
//! Panics are reserved for states the error taxonomy cannot express
//! (corrupted invariants, double faults). The handler logs what it can
//! and parks the CPU; there is nothing to unwind to.

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    crate::kerror!("[PANIC] {}", info);

    #[cfg(target_arch = "x86_64")]
    crate::arch::halt_forever();

    #[cfg(not(target_arch = "x86_64"))]
    loop {}
}
