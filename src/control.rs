use crate::sync::atomic::{fence, AtomicIsize, Ordering};
use crate::AtomicShared;
use alloc::boxed::Box;
use core::ptr::NonNull;

mod sealed {
    pub trait Sealed {}
}
pub(crate) use sealed::Sealed;

/// How the storage of a control block is given back once its last reference is released.
///
/// The strategy is a small `Copy` value stored in every control block, and it also names the
/// atomic cell type that loads blocks of this kind safely:
///
/// - `&'domain Domain<F>` retires blocks into that hazard-pointer [`Domain`](crate::Domain).
///   Its cell is [`HazardCell`](crate::HazardCell).
/// - [`SplitCount`](crate::SplitCount) frees blocks on the spot, because its cell,
///   [`SplitCell`](crate::SplitCell), never lets a reader see a block without first holding
///   a (local) reference to it.
///
/// This trait is sealed.
pub trait Reclaimer: Sealed + Copy + Send + Sync + Sized {
    /// The atomic pointer cell that publishes blocks reclaimed by this strategy.
    type Atomic<T>: AtomicShared<T, Reclaimer = Self>;

    /// Give back `block`'s storage. Its value has already been dropped.
    ///
    /// # Safety
    ///
    /// `block` came from [`ControlBlock::allocate`], its count has reached zero, and this is
    /// the only call for it.
    #[doc(hidden)]
    unsafe fn reclaim<T>(self, block: NonNull<ControlBlock<T, Self>>);
}

/// The reference count and owning pointer shared by every handle to one value.
///
/// Only reachable through [`SharedPtr`](crate::SharedPtr) and the cells.
pub struct ControlBlock<T, R> {
    ref_count: AtomicIsize,
    value: NonNull<T>,
    reclaimer: R,
}

impl<T, R: Reclaimer> ControlBlock<T, R> {
    /// Box a new block that owns `value`, with a count of one.
    pub(crate) fn allocate(value: Box<T>, reclaimer: R) -> NonNull<Self> {
        let block = Box::new(ControlBlock {
            ref_count: AtomicIsize::new(1),
            value: NonNull::from(Box::leak(value)),
            reclaimer,
        });
        NonNull::from(Box::leak(block))
    }

    /// # Safety
    ///
    /// The caller holds one of the counted references.
    pub(crate) unsafe fn value(&self) -> &T {
        // Safety: the value lives until the count drops to zero, which the caller prevents.
        unsafe { self.value.as_ref() }
    }

    /// # Safety
    ///
    /// The caller holds the only reference and the block was never published to a cell.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn value_mut(&self) -> &mut T {
        // Safety: nothing else can observe the value, by the caller's promise.
        unsafe { &mut *self.value.as_ptr() }
    }

    pub(crate) fn reclaimer(&self) -> R {
        self.reclaimer
    }

    pub(crate) fn count(&self) -> isize {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Add a reference. The caller must already hold one, so the count cannot be zero.
    pub(crate) fn increment(&self) {
        let old = self.ref_count.fetch_add(1, Ordering::Relaxed);
        debug_assert!(old > 0, "increment on a control block that already reached zero");
    }

    /// Add a reference unless the count has already reached zero.
    ///
    /// This is how a protected but uncounted observation becomes an owning one. Once the count
    /// is zero the value is gone, and it must stay gone.
    pub(crate) fn increment_if_nonzero(&self) -> bool {
        let mut count = self.ref_count.load(Ordering::Relaxed);
        while count > 0 {
            match self.ref_count.compare_exchange_weak(
                count,
                count + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(count_now) => count = count_now,
            }
        }
        false
    }

    /// Fold a cell's local count into the global one. `n` may be negative.
    pub(crate) fn add(&self, n: isize) {
        let old = self.ref_count.fetch_add(n, Ordering::Relaxed);
        debug_assert!(old + n > 0, "transfer of {} emptied a live control block", n);
    }

    /// Drop one reference, destroying the value and reclaiming the block if it was the last.
    ///
    /// # Safety
    ///
    /// The caller gives up one counted reference to the live block `this`.
    pub(crate) unsafe fn decrement(this: NonNull<Self>) {
        // Safety: the caller's reference keeps the block alive up to here.
        if unsafe { this.as_ref() }.ref_count.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        fence(Ordering::Acquire);
        // Safety: the count went from one to zero on our decrement, so we own the value.
        drop(unsafe { Box::from_raw(this.as_ref().value.as_ptr()) });
        // Safety: as above; nothing can bring the count back up from zero.
        unsafe { Self::reclaim(this) };
    }

    /// Like [`ControlBlock::decrement`], but hands back the value instead of dropping it.
    ///
    /// # Safety
    ///
    /// Same as [`ControlBlock::decrement`].
    pub(crate) unsafe fn decrement_into_inner(this: NonNull<Self>) -> Option<T> {
        // Safety: the caller's reference keeps the block alive up to here.
        if unsafe { this.as_ref() }.ref_count.fetch_sub(1, Ordering::Release) != 1 {
            return None;
        }
        fence(Ordering::Acquire);
        // Safety: the count went from one to zero on our decrement, so we own the value.
        let value = unsafe { Box::from_raw(this.as_ref().value.as_ptr()) };
        // Safety: as in `decrement`.
        unsafe { Self::reclaim(this) };
        Some(*value)
    }

    unsafe fn reclaim(this: NonNull<Self>) {
        // Safety: we are the single caller that observed the count reach zero.
        let reclaimer = unsafe { this.as_ref() }.reclaimer;
        unsafe { reclaimer.reclaim(this) };
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use crate::SplitCount;

    use super::ControlBlock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountDrops(Arc<AtomicUsize>);
    impl Drop for CountDrops {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn increment_if_nonzero_refuses_dead_block() {
        let drops = Arc::new(AtomicUsize::new(0));
        let block = ControlBlock::allocate(
            Box::new(CountDrops(Arc::clone(&drops))),
            SplitCount,
        );
        let b = unsafe { block.as_ref() };
        assert!(b.increment_if_nonzero());
        assert_eq!(b.count(), 2);
        unsafe { ControlBlock::decrement(block) };
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        let probe = ControlBlock::allocate(Box::new(()), SplitCount);
        unsafe { probe.as_ref() }.ref_count.store(0, Ordering::Relaxed);
        assert!(!unsafe { probe.as_ref() }.increment_if_nonzero());
        unsafe { probe.as_ref() }.ref_count.store(1, Ordering::Relaxed);
        unsafe { ControlBlock::decrement(probe) };

        unsafe { ControlBlock::decrement(block) };
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn negative_transfer_keeps_block_alive() {
        let drops = Arc::new(AtomicUsize::new(0));
        let block = ControlBlock::allocate(
            Box::new(CountDrops(Arc::clone(&drops))),
            SplitCount,
        );
        let b = unsafe { block.as_ref() };
        b.add(3);
        b.add(-2);
        assert_eq!(b.count(), 2);
        unsafe { ControlBlock::decrement(block) };
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        assert_eq!(
            unsafe { ControlBlock::decrement_into_inner(block) }.map(|_| ()),
            Some(())
        );
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
