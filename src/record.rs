use crate::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

/// One slot in a domain's hazard table.
///
/// Records are only ever allocated, never freed, while their domain lives. A record is owned by
/// at most one [`HazardPointer`](crate::HazardPointer) at a time, tracked through `active`.
pub(crate) struct HazPtrRecord {
    pub(crate) ptr: AtomicPtr<u8>,
    pub(crate) next: AtomicPtr<HazPtrRecord>,
    pub(crate) active: AtomicBool,
}

impl HazPtrRecord {
    pub(crate) fn new_active() -> Self {
        Self {
            ptr: AtomicPtr::new(core::ptr::null_mut()),
            next: AtomicPtr::new(core::ptr::null_mut()),
            active: AtomicBool::new(true),
        }
    }

    pub(crate) fn protect(&self, ptr: *mut u8) {
        self.ptr.store(ptr, Ordering::Release);
    }

    pub(crate) fn reset(&self) {
        self.ptr.store(core::ptr::null_mut(), Ordering::Release);
    }

    pub(crate) fn try_acquire(&self) -> bool {
        !self.active.load(Ordering::Relaxed)
            && self
                .active
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
    }

    pub(crate) fn release(&self) {
        debug_assert!(self.ptr.load(Ordering::Relaxed).is_null());
        self.active.store(false, Ordering::Release);
    }
}
