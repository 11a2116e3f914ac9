//! Per-task stacks with a guard page, plus a size-keyed reuse pool.

use crate::utils::sys::page_size;
use anyhow::{Context, Result};
use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, mprotect, munmap};
use std::collections::HashMap;
use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

/// A fixed-size stack: `[guard page | usable stack ...]`.
///
/// The guard page sits at the low end and is PROT_NONE for the stack's whole
/// lifetime, so an overflow faults deterministically instead of corrupting a
/// neighboring allocation. Stacks grow down; [`Stack::top`] is one past the
/// last usable byte.
#[derive(Debug)]
pub(crate) struct Stack {
    /// mmap base == start of the guard page.
    base: NonNull<c_void>,
    /// Guard page plus usable bytes.
    total: usize,
    usable: usize,
}

// Safety: Stack is a plain owned memory region. The raw pointer makes it
// !Send by default, but ownership is exclusive (one task) and the region is
// only touched by whichever thread currently hosts that task.
unsafe impl Send for Stack {}

impl Stack {
    /// Map a stack with `usable` bytes (rounded up to whole pages) and
    /// protect the leading guard page.
    pub(crate) fn with_size(usable: usize) -> Result<Self> {
        let pgs = page_size();
        let usable = usable.div_ceil(pgs) * pgs;
        let total = usable + pgs;

        let len = NonZeroUsize::new(total).context("zero-sized stack")?;

        // Safety: fresh anonymous mapping, length is non-zero.
        let base = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_STACK,
            )
            .context("mmap for task stack failed")?
        };

        // Safety: `base` is page-aligned and covers at least one page.
        unsafe {
            mprotect(base, pgs, ProtFlags::PROT_NONE).context("mprotect guard page failed")?;
        }

        Ok(Stack {
            base,
            total,
            usable,
        })
    }

    /// One past the last usable byte. The stack grows down from here.
    pub(crate) fn top(&self) -> *mut u8 {
        // Safety: base + total stays within the mapping bounds (one past).
        unsafe { (self.base.as_ptr() as *mut u8).add(self.total) }
    }

    pub(crate) fn usable(&self) -> usize {
        self.usable
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let pgs = page_size();
        // Restore the guard page to read/write before unmapping; some
        // allocators and debugging tools refuse to recycle PROT_NONE pages.
        //
        // Safety: we own the mapping and nothing runs on this stack anymore.
        unsafe {
            if let Err(e) = mprotect(self.base, pgs, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE)
            {
                tracing::error!("failed to unprotect stack guard page: {}", e);
            }
            if let Err(e) = munmap(self.base, self.total) {
                tracing::error!("failed to unmap task stack: {}", e);
            }
        }
    }
}

/// Stacks kept per size for a limited number of pooled entries.
const MAX_POOLED_PER_SIZE: usize = 16;

/// Per-scheduler freelist of stacks from finished tasks, keyed by usable
/// size. Spawning prefers a pooled stack over a fresh mapping.
#[derive(Debug, Default)]
pub(crate) struct StackPool {
    by_size: HashMap<usize, Vec<Stack>>,
}

impl StackPool {
    pub(crate) fn take(&mut self, usable: usize) -> Result<Stack> {
        let pgs = page_size();
        let usable = usable.div_ceil(pgs) * pgs;
        if let Some(stack) = self.by_size.get_mut(&usable).and_then(Vec::pop) {
            return Ok(stack);
        }
        Stack::with_size(usable)
    }

    pub(crate) fn put(&mut self, stack: Stack) {
        let slot = self.by_size.entry(stack.usable()).or_default();
        if slot.len() < MAX_POOLED_PER_SIZE {
            slot.push(stack);
        }
        // Beyond the cap the stack is simply unmapped.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_layout() -> Result<()> {
        let pgs = page_size();
        let stack = Stack::with_size(10_000)?;

        // Usable size is rounded up to whole pages.
        assert_eq!(stack.usable() % pgs, 0);
        assert!(stack.usable() >= 10_000);

        // The mapping is page aligned and the top sits guard + usable above.
        let base = stack.base.as_ptr() as usize;
        assert_eq!(base % pgs, 0);
        assert_eq!(stack.top() as usize, base + pgs + stack.usable());
        Ok(())
    }

    #[test]
    fn test_stack_is_writable_below_top() -> Result<()> {
        let stack = Stack::with_size(16 * 1024)?;
        unsafe {
            let p = stack.top().sub(8);
            p.write_volatile(0xAB);
            assert_eq!(p.read_volatile(), 0xAB);
        }
        Ok(())
    }

    #[test]
    fn test_pool_reuses_by_size() -> Result<()> {
        let mut pool = StackPool::default();

        let stack = pool.take(64 * 1024)?;
        let top = stack.top() as usize;
        pool.put(stack);

        let again = pool.take(64 * 1024)?;
        assert_eq!(again.top() as usize, top);

        let other = pool.take(128 * 1024)?;
        assert_ne!(other.top() as usize, top);
        Ok(())
    }
}
