use crate::control::{ControlBlock, Reclaimer, Sealed};
use crate::sync::atomic::{AtomicPtr, Ordering};
use crate::sync::WithMut;
use crate::{AtomicShared, Domain, Global, HazardPointer, SharedPtr};
use core::ptr::NonNull;

type Block<'domain, T, F> = ControlBlock<T, &'domain Domain<F>>;

impl<F> Sealed for &'_ Domain<F> {}

impl<'domain, F> Reclaimer for &'domain Domain<F> {
    type Atomic<T> = HazardCell<'domain, T, F>;

    unsafe fn reclaim<T>(self, block: NonNull<ControlBlock<T, Self>>) {
        // Safety:
        //
        //  1. The block was boxed by ControlBlock::allocate.
        //  2. Its count is zero, so no cell holds it; only readers that already protected it
        //     can still see it, and they only look at the count.
        //  3. Reclaim happens once per block.
        //  4. The block has no drop glue.
        unsafe { self.retire(block.as_ptr()) };
    }
}

/// An atomic [`SharedPtr`] slot whose loads are protected by hazard pointers.
///
/// Each load announces the block it is about to count in a [`HazardPointer`] from the cell's
/// domain, so a concurrent [`store`](AtomicShared::store) that releases the last reference
/// retires the block instead of freeing it. Values themselves are dropped as soon as their count
/// reaches zero; only the small control block waits on the domain.
///
/// Every pointer stored into the cell must come from the same domain instance as the cell, which
/// is checked at runtime. Mixing domain *families* is a type error.
///
/// ```rust
/// use atomic_shared::{AtomicShared, Domain, HazardCell, SharedPtr};
///
/// let cell = HazardCell::new_in(Some(SharedPtr::new(1)), Domain::global());
/// let one = cell.load().unwrap();
/// cell.store(Some(SharedPtr::new(2)));
/// assert_eq!(*one, 1);
/// assert_eq!(cell.load().as_deref(), Some(&2));
/// ```
pub struct HazardCell<'domain, T, F = Global> {
    ptr: AtomicPtr<Block<'domain, T, F>>,
    domain: &'domain Domain<F>,
}

// Safety: the cell moves and shares SharedPtr<T>, which is Send + Sync under these bounds.
unsafe impl<T: Send + Sync, F> Send for HazardCell<'_, T, F> {}
// Safety: see above.
unsafe impl<T: Send + Sync, F> Sync for HazardCell<'_, T, F> {}

impl<'domain, T, F> HazardCell<'domain, T, F> {
    fn publish(
        &self,
        value: Option<SharedPtr<T, &'domain Domain<F>>>,
    ) -> *mut Block<'domain, T, F> {
        match value {
            Some(value) => {
                self.check_domain(&value);
                SharedPtr::into_block(value).as_ptr()
            }
            None => core::ptr::null_mut(),
        }
    }

    fn check_domain(&self, value: &SharedPtr<T, &'domain Domain<F>>) {
        let domain: &Domain<F> = SharedPtr::reclaimer(value);
        assert!(
            core::ptr::eq(domain, self.domain),
            "value retires into a different domain than the cell protects loads in"
        );
    }

    /// # Safety
    ///
    /// `ptr` is null or carries a reference the caller owns.
    unsafe fn adopt(
        ptr: *mut Block<'domain, T, F>,
    ) -> Option<SharedPtr<T, &'domain Domain<F>>> {
        // Safety: forwarded to the caller.
        NonNull::new(ptr).map(|block| unsafe { SharedPtr::from_block(block) })
    }
}

impl<'domain, T, F> AtomicShared<T> for HazardCell<'domain, T, F> {
    type Reclaimer = &'domain Domain<F>;

    fn new_in(value: Option<SharedPtr<T, Self::Reclaimer>>, domain: &'domain Domain<F>) -> Self {
        let cell = Self {
            ptr: AtomicPtr::new(core::ptr::null_mut()),
            domain,
        };
        let ptr = cell.publish(value);
        cell.ptr.store(ptr, Ordering::Relaxed);
        cell
    }

    fn load(&self) -> Option<SharedPtr<T, Self::Reclaimer>> {
        if self.ptr.load(Ordering::Acquire).is_null() {
            return None;
        }

        let mut hazard = HazardPointer::new_in_domain(self.domain);
        loop {
            let (block, _) = hazard.protect_ptr(&self.ptr)?;
            // Safety: the block is protected, so even if its count is zero its storage is not
            // reclaimed while we look at it.
            if unsafe { block.as_ref() }.increment_if_nonzero() {
                // Safety: we just took a reference for it.
                return Some(unsafe { SharedPtr::from_block(block) });
            }
            // The last reference went away after we protected it, so the cell has moved on.
        }
    }

    fn swap(
        &self,
        desired: Option<SharedPtr<T, Self::Reclaimer>>,
    ) -> Option<SharedPtr<T, Self::Reclaimer>> {
        let new = self.publish(desired);
        let old = self.ptr.swap(new, Ordering::AcqRel);
        // Safety: the cell's reference to the old value is now ours.
        unsafe { Self::adopt(old) }
    }

    fn compare_exchange(
        &self,
        current: Option<&SharedPtr<T, Self::Reclaimer>>,
        new: Option<SharedPtr<T, Self::Reclaimer>>,
    ) -> Result<Option<SharedPtr<T, Self::Reclaimer>>, Option<SharedPtr<T, Self::Reclaimer>>> {
        let current = current.map_or(core::ptr::null_mut(), |c| SharedPtr::block(c).as_ptr());
        let replacement = match &new {
            Some(new) => {
                self.check_domain(new);
                SharedPtr::block(new).as_ptr()
            }
            None => core::ptr::null_mut(),
        };

        match self
            .ptr
            .compare_exchange(current, replacement, Ordering::AcqRel, Ordering::Relaxed)
        {
            Ok(old) => {
                // The cell now owns the reference `new` carried.
                if let Some(new) = new {
                    SharedPtr::into_block(new);
                }
                // Safety: the cell's reference to the old value is now ours.
                Ok(unsafe { Self::adopt(old) })
            }
            Err(_) => Err(new),
        }
    }

    fn take(&mut self) -> Option<SharedPtr<T, Self::Reclaimer>> {
        let old = self.ptr.with_mut(|ptr| core::mem::replace(ptr, core::ptr::null_mut()));
        // Safety: the cell's reference is now ours.
        unsafe { Self::adopt(old) }
    }

    fn is_null(&self) -> bool {
        self.ptr.load(Ordering::Relaxed).is_null()
    }
}

impl<T, F> Drop for HazardCell<'_, T, F> {
    fn drop(&mut self) {
        let old = self.ptr.with_mut(|ptr| core::mem::replace(ptr, core::ptr::null_mut()));
        if let Some(block) = NonNull::new(old) {
            // Safety: the cell owned this reference.
            unsafe { ControlBlock::decrement(block) };
        }
    }
}
