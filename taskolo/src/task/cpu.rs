//! Saved register state and the context switch itself.
//!
//! `CpuContext` holds the x86-64 SysV callee-saved set plus the two
//! floating-point control words the ABI requires callees to preserve.
//! Everything caller-saved is already on the stack by the time
//! [`cpu_switch`] runs, because it is an ordinary `extern "C"` call.

#[cfg(not(target_arch = "x86_64"))]
compile_error!("taskolo only supports x86_64");

use std::arch::naked_asm;

/// SSE control/status default: all exceptions masked, round-to-nearest.
const MXCSR_DEFAULT: u32 = 0x1F80;

/// x87 control word default: all exceptions masked, 64-bit precision.
const FCW_DEFAULT: u16 = 0x037F;

/// Saved CPU state for one task (or for a scheduler's main context).
///
/// Field order is load-bearing: the offsets are hardcoded in the
/// [`cpu_switch`] assembly below.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct CpuContext {
    rsp: u64,   // 0x00
    rbp: u64,   // 0x08
    rbx: u64,   // 0x10
    r12: u64,   // 0x18
    r13: u64,   // 0x20
    r14: u64,   // 0x28
    r15: u64,   // 0x30
    mxcsr: u32, // 0x38
    fcw: u16,   // 0x3c
    _pad: u16,
}

impl CpuContext {
    /// An empty context. Valid only as the *save* side of a swap; the first
    /// `cpu_switch` away from it fills every field.
    pub(crate) const fn new() -> Self {
        CpuContext {
            rsp: 0,
            rbp: 0,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            mxcsr: MXCSR_DEFAULT,
            fcw: FCW_DEFAULT,
            _pad: 0,
        }
    }

    /// Prepare this context so that the first swap into it enters `entry` on
    /// the stack whose one-past-the-end address is `stack_top`.
    ///
    /// The stack is seeded with two words: the entry address, which the
    /// switch's final `ret` pops, and a zero sentinel return address above
    /// it. `entry` must never return; there is nowhere to return to.
    ///
    /// # Safety
    ///
    /// `stack_top` must point one past the last usable byte of a stack that
    /// stays alive (and unmoved) for as long as this context can be resumed.
    pub(crate) unsafe fn init(&mut self, entry: extern "C" fn() -> !, stack_top: *mut u8) {
        // Align down to 16, then leave one slot so that after `ret` pops the
        // entry address, rsp % 16 == 8, which is what the SysV ABI promises
        // at function entry.
        let top = (stack_top as usize) & !0xf;
        let slot = (top - 16) as *mut u64;
        unsafe {
            slot.write(entry as usize as u64);
            slot.add(1).write(0);
        }

        *self = CpuContext::new();
        self.rsp = slot as u64;
    }
}

/// Save the current register state into `save` and resume `restore`.
///
/// Returns only when some other `cpu_switch` targets `save` again. For a
/// fresh context the final `ret` pops the entry address planted by
/// [`CpuContext::init`]; for a suspended one it returns to the instruction
/// after the `cpu_switch` call that parked it.
///
/// # Safety
///
/// Both pointers must be valid. `restore` must have been initialized, either
/// by [`CpuContext::init`] or by a previous switch away from it. The stacks
/// behind both contexts must outlive the switch.
#[unsafe(naked)]
pub(crate) extern "C" fn cpu_switch(_save: *mut CpuContext, _restore: *const CpuContext) {
    naked_asm!(
        // Save callee-saved registers and fp control state into `save` (rdi).
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        "stmxcsr [rdi + 0x38]",
        "fnstcw  word ptr [rdi + 0x3c]",
        // Load the same set from `restore` (rsi).
        "ldmxcsr [rsi + 0x38]",
        "fldcw   word ptr [rsi + 0x3c]",
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        "ret",
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::stack::Stack;
    use std::cell::UnsafeCell;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct SwapCell(UnsafeCell<CpuContext>);

    // Safety: the test below is the only user and runs on one thread.
    unsafe impl Sync for SwapCell {}

    static HOST: SwapCell = SwapCell(UnsafeCell::new(CpuContext::new()));
    static GUEST: SwapCell = SwapCell(UnsafeCell::new(CpuContext::new()));
    static HITS: AtomicU32 = AtomicU32::new(0);

    extern "C" fn guest_entry() -> ! {
        HITS.fetch_add(1, Ordering::SeqCst);
        cpu_switch(GUEST.0.get(), HOST.0.get());
        unreachable!("switched back into a completed guest context");
    }

    #[test]
    fn test_switch_roundtrip() {
        let stack = Stack::with_size(32 * 1024).unwrap();
        unsafe {
            (*GUEST.0.get()).init(guest_entry, stack.top());
        }

        cpu_switch(HOST.0.get(), GUEST.0.get());

        assert_eq!(HITS.load(Ordering::SeqCst), 1);
    }
}
