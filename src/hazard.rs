use crate::record::HazPtrRecord;
use crate::sync::atomic::{AtomicPtr, Ordering};
use crate::Domain;
use core::marker::PhantomData;
use core::ptr::NonNull;

/// A single announcement slot that keeps one address from being reclaimed.
///
/// A hazard pointer protects nothing when first made. Loading an [`AtomicPtr`] through
/// [`HazardPointer::protect_ptr`] publishes the loaded address, and any object retired into the
/// same [`Domain`] at that address stays allocated until the protection is reset, replaced by
/// another `protect_*` call, or the hazard pointer is dropped.
///
/// The protection is tied to the exclusive borrow `protect_ptr` takes, so the returned pointer
/// cannot outlive it.
pub struct HazardPointer<'domain, F = crate::Global> {
    hazard: &'domain HazPtrRecord,
    domain: &'domain Domain<F>,
}

impl Default for HazardPointer<'static, crate::Global> {
    fn default() -> Self {
        Self::new()
    }
}

impl HazardPointer<'static, crate::Global> {
    /// Create a new hazard pointer in the [global domain](crate::Global).
    pub fn new() -> Self {
        HazardPointer::new_in_domain(Domain::global())
    }
}

impl<'domain, F> HazardPointer<'domain, F> {
    /// Create a new hazard pointer in the given domain.
    pub fn new_in_domain(domain: &'domain Domain<F>) -> Self {
        Self {
            hazard: domain.acquire(),
            domain,
        }
    }

    /// Load `src` and protect the loaded address from reclamation.
    ///
    /// Repeats load, announce, re-load until the announced address is the one `src` still holds,
    /// so a concurrent writer that swapped the pointer out in between is never missed.
    ///
    /// Returns `None` (and protects nothing) if `src` holds null.
    pub fn protect_ptr<'l, T>(
        &'l mut self,
        src: &'_ AtomicPtr<T>,
    ) -> Option<(NonNull<T>, PhantomData<&'l T>)> {
        let mut ptr = src.load(Ordering::Relaxed);
        loop {
            match self.try_protect_ptr(ptr, src) {
                Ok(None) => break None,
                // The borrow checker cannot see that the `'l` of the try and the loop agree
                // (rust-lang/rust#51545), so mint a fresh marker.
                Ok(Some((ptr, _))) => break Some((ptr, PhantomData)),
                Err(ptr_now) => ptr = ptr_now,
            }
        }
    }

    /// Announce `ptr`, then check that `src` still holds it.
    ///
    /// On a mismatch the announcement is withdrawn and the value `src` now holds comes back in
    /// `Err`. Returns `Ok(None)` if `ptr` is null.
    #[allow(clippy::type_complexity)]
    pub fn try_protect_ptr<'l, T>(
        &'l mut self,
        ptr: *mut T,
        src: &'_ AtomicPtr<T>,
    ) -> Result<Option<(NonNull<T>, PhantomData<&'l T>)>, *mut T> {
        if ptr.is_null() {
            self.hazard.reset();
            return Ok(None);
        }

        self.hazard.protect(ptr.cast());

        crate::sync::atomic::light_barrier();

        let ptr_now = src.load(Ordering::Acquire);
        if ptr != ptr_now {
            self.hazard.reset();
            Err(ptr_now)
        } else {
            Ok(NonNull::new(ptr).map(|ptr| (ptr, PhantomData)))
        }
    }

    /// Announce `ptr` without checking where it came from.
    ///
    /// Only useful when the caller already knows `ptr` cannot have been retired yet, for
    /// instance because it still holds a counted reference to it.
    pub fn protect_raw<T>(&mut self, ptr: *mut T) {
        self.hazard.protect(ptr.cast());
    }

    /// Withdraw the current announcement, if any.
    pub fn reset_protection(&mut self) {
        self.hazard.reset();
    }
}

impl<F> Drop for HazardPointer<'_, F> {
    fn drop(&mut self) {
        self.hazard.reset();
        self.domain.release(self.hazard);
    }
}
