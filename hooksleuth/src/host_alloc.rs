//! Facade over the host's own allocator.
//!
//! Arrays rewritten in place and handed back to the host are later freed
//! and inspected by the host's own runtime, so they must come from the
//! host's allocation source, not a generic allocator. The facade binds the
//! host's internal allocate/free functions once their addresses have been
//! resolved.

use std::ffi::c_void;

use tracing::trace;

/// Signature of the host's allocate entry point.
pub type HostAllocFn = unsafe extern "C" fn(u64) -> *mut c_void;
/// Signature of the host's free entry point.
pub type HostFreeFn = unsafe extern "C" fn(*mut c_void);

#[derive(Clone, Copy)]
pub struct HostAllocator {
    alloc: HostAllocFn,
    free: HostFreeFn,
}

impl HostAllocator {
    /// Binds the facade to resolved allocate/free addresses.
    ///
    /// # Safety
    ///
    /// Both addresses must point at live host functions with exactly the
    /// [`HostAllocFn`] and [`HostFreeFn`] signatures.
    pub unsafe fn from_addresses(alloc: usize, free: usize) -> Self {
        Self {
            alloc: std::mem::transmute::<usize, HostAllocFn>(alloc),
            free: std::mem::transmute::<usize, HostFreeFn>(free),
        }
    }

    pub fn from_fns(alloc: HostAllocFn, free: HostFreeFn) -> Self {
        Self { alloc, free }
    }

    /// Requests `size` bytes from the host. Returns null when the host
    /// cannot satisfy the request; callers abort their mutation rather
    /// than write into a block they did not get.
    pub fn allocate(&self, size: usize) -> *mut c_void {
        let ptr = unsafe { (self.alloc)(size as u64) };
        trace!("host allocate {size} -> {:#x}", ptr as usize);
        ptr
    }

    /// Returns a block to the host. Freeing null is a no-op.
    pub fn free(&self, ptr: *mut c_void) {
        if ptr.is_null() {
            return;
        }
        trace!("host free {:#x}", ptr as usize);
        unsafe { (self.free)(ptr) };
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use std::alloc::{GlobalAlloc, Layout, System};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicIsize, Ordering};
    use std::sync::{LazyLock, Mutex, MutexGuard};

    // Tracked stand-in for the host allocator, shared with the menu codec
    // tests. Every block is recorded so frees of unknown pointers and
    // leaks are caught.
    static ALLOCATIONS: LazyLock<Mutex<HashMap<usize, Layout>>> =
        LazyLock::new(|| Mutex::new(HashMap::new()));

    // Remaining successful allocations before the shim starts returning
    // null; negative means never fail.
    static FAIL_AFTER: AtomicIsize = AtomicIsize::new(-1);

    // Tests that inject failures or compare live-allocation counts hold
    // this to keep other shim users out.
    static EXCLUSIVE: Mutex<()> = Mutex::new(());

    pub unsafe extern "C" fn shim_alloc(size: u64) -> *mut c_void {
        let remaining = FAIL_AFTER.load(Ordering::SeqCst);
        if remaining == 0 {
            return std::ptr::null_mut();
        }
        if remaining > 0 {
            FAIL_AFTER.fetch_sub(1, Ordering::SeqCst);
        }

        let layout = Layout::from_size_align(size.max(1) as usize, 8).unwrap();
        let ptr = System.alloc(layout) as *mut c_void;
        if !ptr.is_null() {
            ALLOCATIONS.lock().unwrap().insert(ptr as usize, layout);
        }
        ptr
    }

    pub unsafe extern "C" fn shim_free(ptr: *mut c_void) {
        let layout = ALLOCATIONS
            .lock()
            .unwrap()
            .remove(&(ptr as usize))
            .expect("freed a pointer the shim never handed out");
        System.dealloc(ptr as *mut u8, layout);
    }

    pub fn allocator() -> HostAllocator {
        HostAllocator::from_fns(shim_alloc, shim_free)
    }

    pub fn exclusive() -> MutexGuard<'static, ()> {
        EXCLUSIVE.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_fail_after(n: isize) {
        FAIL_AFTER.store(n, Ordering::SeqCst);
    }

    pub fn live_allocations() -> usize {
        ALLOCATIONS.lock().unwrap().len()
    }

    #[test]
    fn test_allocate_and_free() {
        let _guard = exclusive();
        let host = allocator();

        let before = live_allocations();
        let block = host.allocate(64);
        assert!(!block.is_null());
        assert_eq!(live_allocations(), before + 1);

        unsafe { std::ptr::write_bytes(block as *mut u8, 0xAB, 64) };

        host.free(block);
        assert_eq!(live_allocations(), before);
    }

    #[test]
    fn test_free_null_is_noop() {
        let host = allocator();
        host.free(std::ptr::null_mut());
    }

    #[test]
    fn test_allocate_failure_returns_null() {
        let _guard = exclusive();
        set_fail_after(0);
        let host = allocator();
        assert!(host.allocate(16).is_null());
        set_fail_after(-1);
    }
}
