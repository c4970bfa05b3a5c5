#[cfg(not(target_arch = "x86_64"))]
use std::sync::atomic::{fence, Ordering};

pub const CACHE_LINE_BYTES: usize = 64;

/// Schedules the cache line containing `addr` for write-back to the backing
/// persistent medium. Non-ordering: pair with [`sfence`] before relying on
/// durability.
#[inline]
pub fn clwb(addr: *const u8) {
    #[cfg(all(target_arch = "x86_64", target_feature = "clwb"))]
    // SAFETY:
    // CLWB is non-destructive on any mapped address and the target feature is
    // statically enabled for this build.
    unsafe {
        core::arch::asm!("clwb [{0}]", in(reg) addr, options(nostack, preserves_flags));
    }

    #[cfg(all(target_arch = "x86_64", not(target_feature = "clwb")))]
    // SAFETY:
    // CLFLUSH is part of baseline x86_64 and valid for any mapped address.
    // It evicts the line where CLWB would retain it; durability semantics are
    // identical.
    unsafe {
        core::arch::x86_64::_mm_clflush(addr);
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = addr;
        fence(Ordering::SeqCst);
    }
}

/// Flushes every cache line intersecting `[addr, addr + len)`.
#[inline]
pub fn clwb_range(addr: *const u8, len: usize) {
    if len == 0 {
        return;
    }
    let start = addr as usize & !(CACHE_LINE_BYTES - 1);
    let end = addr as usize + len;
    let mut line = start;
    while line < end {
        clwb(line as *const u8);
        line += CACHE_LINE_BYTES;
    }
}

/// Store barrier: all preceding flushes become durable before any subsequent
/// store may become durable.
#[inline]
pub fn sfence() {
    #[cfg(target_arch = "x86_64")]
    // SAFETY:
    // SFENCE has no memory operands and no preconditions.
    unsafe {
        core::arch::x86_64::_mm_sfence();
    }

    #[cfg(not(target_arch = "x86_64"))]
    fence(Ordering::SeqCst);
}
