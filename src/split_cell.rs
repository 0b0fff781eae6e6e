//! Split reference counting.
//!
//! A [`SplitCell`] packs the address of the control block it holds together with a signed
//! *local* count into a single `u128`:
//!
//! ```text
//!  127                   64 63                     0
//! +------------------------+------------------------+
//! |      local (i64)       | control block address  |
//! +------------------------+------------------------+
//! ```
//!
//! A load first reserves a reference by bumping the local count in the same atomic step that
//! reads the address. While that reservation stands, the cell's own reference cannot be released
//! without first moving the local count into the block's count, so the block stays alive while
//! the loader increments the global count and then gives its local reservation back.
//!
//! If the cell was overwritten in between, the writer already moved the reservation into the
//! global count, and the loader pays it back by releasing a global reference instead.
//!
//! The local count is signed. If the same block is stored back into the cell while a load is in
//! flight, that load returns its reservation into the new epoch and drives the local count below
//! zero. The writer that finally replaces the block folds the negative count in as well, which
//! cancels the reservation an earlier writer already transferred.
use crate::control::{ControlBlock, Reclaimer, Sealed};
use crate::sync::atomic::{AtomicU128, Ordering};
use crate::sync::WithMut;
use crate::{AtomicShared, SharedPtr};
use alloc::boxed::Box;
use core::marker::PhantomData;
use core::ptr::NonNull;

const ADDRESS_MASK: u128 = u64::MAX as u128;
const LOCAL_ONE: u128 = 1 << 64;

/// Reclaims control blocks as soon as their count reaches zero.
///
/// Pairs with [`SplitCell`], which never lets a reader touch a block it does not hold a (local)
/// reference to, so there is nothing to defer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SplitCount;

impl Sealed for SplitCount {}

impl Reclaimer for SplitCount {
    type Atomic<T> = SplitCell<T>;

    unsafe fn reclaim<T>(self, block: NonNull<ControlBlock<T, Self>>) {
        // Safety: the block came from a Box and its last reference is gone.
        drop(unsafe { Box::from_raw(block.as_ptr()) });
    }
}

type Block<T> = ControlBlock<T, SplitCount>;

/// The packed cell state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Packed(u128);

impl Packed {
    fn publish<T>(block: *mut Block<T>) -> Self {
        Packed(block as usize as u128)
    }

    fn block<T>(self) -> *mut Block<T> {
        (self.0 & ADDRESS_MASK) as usize as *mut Block<T>
    }

    fn is_null(self) -> bool {
        self.0 & ADDRESS_MASK == 0
    }

    pub(crate) fn local(self) -> i64 {
        (self.0 >> 64) as u64 as i64
    }

    fn same_block(self, other: Self) -> bool {
        (self.0 ^ other.0) & ADDRESS_MASK == 0
    }

    // Wrapping arithmetic on the whole word is two's complement arithmetic on the top 64 bits;
    // the address bits are untouched.
    fn reserve(self) -> Self {
        Packed(self.0.wrapping_add(LOCAL_ONE))
    }

    fn unreserve(self) -> Self {
        Packed(self.0.wrapping_sub(LOCAL_ONE))
    }
}

/// An atomic [`SharedPtr`] slot whose loads are protected by a split reference count.
///
/// Loads never allocate and need no domain. A load is a handful of compare-and-swaps on the cell
/// plus one increment on the block. Blocks are freed the moment their count reaches zero.
///
/// The cell needs a double-width compare-and-swap. Where the CPU has none, the state falls back
/// to the locked emulation of `portable_atomic`.
///
/// ```rust
/// use atomic_shared::{AtomicShared, SharedPtr, SplitCell, SplitCount};
///
/// let cell = SplitCell::null_in(SplitCount);
/// assert!(cell.load().is_none());
/// cell.store(Some(SharedPtr::new_in("a", SplitCount)));
/// let a = cell.swap(Some(SharedPtr::new_in("b", SplitCount)));
/// assert_eq!(a.as_deref(), Some(&"a"));
/// assert_eq!(cell.load().as_deref(), Some(&"b"));
/// ```
pub struct SplitCell<T> {
    state: AtomicU128,
    _owns: PhantomData<SharedPtr<T, SplitCount>>,
}

// Safety: the cell moves and shares SharedPtr<T>, which is Send + Sync under these bounds.
unsafe impl<T: Send + Sync> Send for SplitCell<T> {}
// Safety: see above.
unsafe impl<T: Send + Sync> Sync for SplitCell<T> {}

impl<T> SplitCell<T> {
    fn publish(value: Option<SharedPtr<T, SplitCount>>) -> Packed {
        match value {
            Some(value) => Packed::publish(SharedPtr::into_block(value).as_ptr()),
            None => Packed(0),
        }
    }

    /// Take the reference the cell held in `old`, folding its local count into the block.
    ///
    /// # Safety
    ///
    /// `old` was just removed from the cell by the caller, so its reference belongs to them.
    unsafe fn settle(old: Packed) -> Option<SharedPtr<T, SplitCount>> {
        let block = NonNull::new(old.block::<T>())?;
        let local = old.local();
        if local != 0 {
            // Safety: the cell's reference keeps the block alive.
            unsafe { block.as_ref() }.add(local as isize);
        }
        // Safety: the cell's reference is now ours.
        Some(unsafe { SharedPtr::from_block(block) })
    }

    /// Bump the local count of whatever block the cell holds.
    ///
    /// Returns the state after the bump, or `None` if the cell is empty.
    pub(crate) fn reserve(&self) -> Option<Packed> {
        let mut current = Packed(self.state.load(Ordering::Relaxed));
        loop {
            if current.is_null() {
                return None;
            }
            let reserved = current.reserve();
            match self.state.compare_exchange_weak(
                current.0,
                reserved.0,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(reserved),
                Err(now) => current = Packed(now),
            }
        }
    }

    /// Turn a reservation into a counted reference and give the reservation back.
    ///
    /// # Safety
    ///
    /// `reserved` came from [`SplitCell::reserve`] on this cell, and is completed only once.
    pub(crate) unsafe fn complete(&self, reserved: Packed) -> SharedPtr<T, SplitCount> {
        let block = reserved.block::<T>();
        // Safety: the reservation keeps the block alive (see module docs).
        let block = unsafe { NonNull::new_unchecked(block) };
        unsafe { block.as_ref() }.increment();
        // Safety: we just took a reference for it.
        let loaded = unsafe { SharedPtr::from_block(block) };

        let mut current = Packed(self.state.load(Ordering::Relaxed));
        while current.same_block(reserved) {
            match self.state.compare_exchange_weak(
                current.0,
                current.unreserve().0,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return loaded,
                Err(now) => current = Packed(now),
            }
        }

        // The block was swapped out and our reservation was folded into its count.
        // Safety: that folded-in reference is ours to release, and `loaded` keeps the block alive.
        unsafe { ControlBlock::decrement(block) };
        loaded
    }
}

impl<T> AtomicShared<T> for SplitCell<T> {
    type Reclaimer = SplitCount;

    fn new_in(value: Option<SharedPtr<T, SplitCount>>, _: SplitCount) -> Self {
        Self {
            state: AtomicU128::new(Self::publish(value).0),
            _owns: PhantomData,
        }
    }

    fn load(&self) -> Option<SharedPtr<T, SplitCount>> {
        let reserved = self.reserve()?;
        // Safety: fresh reservation on this cell.
        Some(unsafe { self.complete(reserved) })
    }

    fn swap(
        &self,
        desired: Option<SharedPtr<T, SplitCount>>,
    ) -> Option<SharedPtr<T, SplitCount>> {
        let new = Self::publish(desired);
        let old = Packed(self.state.swap(new.0, Ordering::AcqRel));
        // Safety: we removed `old` from the cell.
        unsafe { Self::settle(old) }
    }

    fn compare_exchange(
        &self,
        current: Option<&SharedPtr<T, SplitCount>>,
        new: Option<SharedPtr<T, SplitCount>>,
    ) -> Result<Option<SharedPtr<T, SplitCount>>, Option<SharedPtr<T, SplitCount>>> {
        let expected = current.map_or(core::ptr::null_mut(), |c| SharedPtr::block(c).as_ptr());
        let replacement = match &new {
            Some(new) => Packed::publish(SharedPtr::block(new).as_ptr()),
            None => Packed(0),
        };

        let mut observed = Packed(self.state.load(Ordering::Relaxed));
        // Retry only while the block matches and just the local count moved.
        while observed.block::<T>() == expected {
            match self.state.compare_exchange_weak(
                observed.0,
                replacement.0,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    if let Some(new) = new {
                        SharedPtr::into_block(new);
                    }
                    // Safety: we removed `observed` from the cell.
                    return Ok(unsafe { Self::settle(observed) });
                }
                Err(now) => observed = Packed(now),
            }
        }
        Err(new)
    }

    fn take(&mut self) -> Option<SharedPtr<T, SplitCount>> {
        let old = self.state.with_mut(|state| core::mem::replace(state, 0));
        // Safety: we removed `old` from the cell.
        unsafe { Self::settle(Packed(old)) }
    }

    fn is_null(&self) -> bool {
        Packed(self.state.load(Ordering::Relaxed)).is_null()
    }
}

impl<T> Drop for SplitCell<T> {
    fn drop(&mut self) {
        drop(self.take());
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::{Block, Packed, SplitCell, ADDRESS_MASK};
    use crate::{AtomicShared, SharedPtr, SplitCount};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct CountDrops(u32, Arc<AtomicUsize>);
    impl Drop for CountDrops {
        fn drop(&mut self) {
            self.1.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn value(n: u32, drops: &Arc<AtomicUsize>) -> SharedPtr<CountDrops, SplitCount> {
        SharedPtr::new_in(CountDrops(n, Arc::clone(drops)), SplitCount)
    }

    #[test]
    fn local_count_is_signed() {
        let p = Packed(0x1234);
        assert_eq!(p.unreserve().local(), -1);
        assert_eq!(p.unreserve().0 & ADDRESS_MASK, 0x1234);
        assert_eq!(p.unreserve().reserve(), p);
        assert_eq!(p.reserve().reserve().local(), 2);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn tagged_addresses_keep_their_high_bits() {
        // Top-byte tags as handed out by allocators on aarch64 with TBI or MTE.
        let tagged = 0x0b00_0000_1234_5670_usize as *mut Block<u8>;
        let p = Packed::publish(tagged);
        assert_eq!(p.block::<u8>(), tagged);
        assert_eq!(p.local(), 0);

        let reserved = p.reserve();
        assert!(reserved.same_block(p));
        assert_eq!(reserved.block::<u8>(), tagged);
        assert_eq!(reserved.local(), 1);
        assert_eq!(p.unreserve().block::<u8>(), tagged);
    }

    #[test]
    fn many_outstanding_reservations() {
        const OUTSTANDING: usize = 40_000;
        let drops = Arc::new(AtomicUsize::new(0));
        let cell = SplitCell::new_in(Some(value(1, &drops)), SplitCount);

        let reservations: Vec<_> = (0..OUTSTANDING)
            .map(|_| cell.reserve().unwrap())
            .collect();
        assert_eq!(reservations[OUTSTANDING - 1].local(), OUTSTANDING as i64);

        let loaded: Vec<_> = reservations
            .into_iter()
            .map(|reserved| unsafe { cell.complete(reserved) })
            .collect();
        assert_eq!(Packed(cell.state.load(Ordering::Relaxed)).local(), 0);
        assert_eq!(SharedPtr::strong_count(&loaded[0]), OUTSTANDING + 1);

        drop(loaded);
        drop(cell);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stalled_load_survives_concurrent_store() {
        let drops = Arc::new(AtomicUsize::new(0));
        let cell = SplitCell::new_in(Some(value(1, &drops)), SplitCount);

        let reserved = cell.reserve().unwrap();
        assert_eq!(reserved.local(), 1);

        std::thread::scope(|s| {
            s.spawn(|| cell.store(Some(value(2, &drops))));
        });
        // The old value lost its cell, but the reservation was folded into its count.
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        let loaded = unsafe { cell.complete(reserved) };
        assert_eq!(loaded.0, 1);
        assert_eq!(SharedPtr::strong_count(&loaded), 1);
        drop(loaded);
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        drop(cell);
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn reservation_returned_into_later_epoch_of_same_block() {
        let drops = Arc::new(AtomicUsize::new(0));
        let cell = SplitCell::new_in(Some(value(1, &drops)), SplitCount);

        let reserved = cell.reserve().unwrap();
        // Swap the block out and straight back in while the load is stalled.
        let same = cell.swap(None).unwrap();
        cell.store(Some(same));

        let loaded = unsafe { cell.complete(reserved) };
        assert_eq!(Packed(cell.state.load(Ordering::Relaxed)).local(), -1);
        assert_eq!(SharedPtr::strong_count(&loaded), 3);

        // Replacing the block folds the negative count back in.
        cell.store(None);
        assert_eq!(SharedPtr::strong_count(&loaded), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(loaded);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn compare_exchange_ignores_local_count() {
        let drops = Arc::new(AtomicUsize::new(0));
        let first = value(1, &drops);
        let cell = SplitCell::new_in(Some(first.clone()), SplitCount);

        let reserved = cell.reserve().unwrap();
        let previous = cell
            .compare_exchange(Some(&first), Some(value(2, &drops)))
            .unwrap()
            .unwrap();
        assert!(SharedPtr::ptr_eq(&previous, &first));
        // Cell reference + transferred reservation + `first`.
        assert_eq!(SharedPtr::strong_count(&first), 3);

        let loaded = unsafe { cell.complete(reserved) };
        assert!(SharedPtr::ptr_eq(&loaded, &first));
        drop((previous, loaded));
        assert_eq!(SharedPtr::strong_count(&first), 1);

        let rejected = cell.compare_exchange(Some(&first), None).unwrap_err();
        assert_eq!(rejected.map(|r| r.0), None);
        assert_eq!(cell.load().map(|v| v.0), Some(2));
    }
}
