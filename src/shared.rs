use crate::control::{ControlBlock, Reclaimer};
use crate::{Domain, Global};
use alloc::boxed::Box;
use core::fmt;
use core::marker::PhantomData;
use core::mem::ManuallyDrop;
use core::ops::Deref;
use core::ptr::NonNull;

/// A reference-counted pointer to a `T` that can be published through an atomic cell.
///
/// `SharedPtr` behaves like [`Arc`](alloc::sync::Arc): cloning adds a reference, dropping the last
/// reference drops the value. Unlike `Arc`, its control block also knows how it must be reclaimed,
/// which is what lets it be loaded out of a concurrently-mutated [`HazardCell`](crate::HazardCell)
/// or [`SplitCell`](crate::SplitCell) without a lock.
///
/// A `SharedPtr` is never null. A cell that may be empty holds an `Option<SharedPtr>`.
///
/// ```rust
/// use atomic_shared::SharedPtr;
///
/// let a = SharedPtr::new(42);
/// let b = a.clone();
/// assert_eq!(*b, 42);
/// assert!(SharedPtr::ptr_eq(&a, &b));
/// assert_eq!(SharedPtr::strong_count(&a), 2);
/// ```
pub struct SharedPtr<T, R: Reclaimer = &'static Domain<Global>> {
    block: NonNull<ControlBlock<T, R>>,
    _owns: PhantomData<ControlBlock<T, R>>,
}

// Safety: like Arc, a SharedPtr hands out &T across threads and may drop T on any of them.
unsafe impl<T: Send + Sync, R: Reclaimer> Send for SharedPtr<T, R> {}
// Safety: see above.
unsafe impl<T: Send + Sync, R: Reclaimer> Sync for SharedPtr<T, R> {}

impl<T> SharedPtr<T> {
    /// Allocate `value` in a new control block that retires into the global domain.
    pub fn new(value: T) -> Self {
        Self::new_in(value, Domain::global())
    }
}

impl<T, R: Reclaimer> SharedPtr<T, R> {
    /// Allocate `value` in a new control block reclaimed by `reclaimer`.
    pub fn new_in(value: T, reclaimer: R) -> Self {
        Self::from_box(Box::new(value), reclaimer)
    }

    /// Take ownership of an existing allocation.
    pub fn from_box(value: Box<T>, reclaimer: R) -> Self {
        Self {
            block: ControlBlock::allocate(value, reclaimer),
            _owns: PhantomData,
        }
    }

    /// Adopt one counted reference to `block`.
    ///
    /// # Safety
    ///
    /// The caller owns a reference to the live `block` and hands it to the returned pointer.
    pub(crate) unsafe fn from_block(block: NonNull<ControlBlock<T, R>>) -> Self {
        Self {
            block,
            _owns: PhantomData,
        }
    }

    /// Give up this pointer without releasing its reference.
    pub(crate) fn into_block(this: Self) -> NonNull<ControlBlock<T, R>> {
        ManuallyDrop::new(this).block
    }

    pub(crate) fn block(this: &Self) -> NonNull<ControlBlock<T, R>> {
        this.block
    }

    fn control(&self) -> &ControlBlock<T, R> {
        // Safety: our reference keeps the block alive.
        unsafe { self.block.as_ref() }
    }

    /// The strategy the value's control block is reclaimed with.
    pub fn reclaimer(this: &Self) -> R {
        this.control().reclaimer()
    }

    /// True if both pointers share one control block.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.block == other.block
    }

    /// The address of the value.
    pub fn as_ptr(this: &Self) -> *const T {
        &**this
    }

    /// The number of references to the value.
    ///
    /// A [`SplitCell`](crate::SplitCell) batches the references of in-flight loads, so the number
    /// may briefly be an undercount while another thread is loading it. Only meaningful as a
    /// snapshot.
    pub fn strong_count(this: &Self) -> usize {
        this.control().count() as usize
    }

    /// Mutable access to a pointer that has not been shared with anyone yet.
    ///
    /// # Safety
    ///
    /// `this` was created by this thread and has never been cloned or published to a cell.
    /// Once a block has been in a [`HazardCell`](crate::HazardCell), a reader that protected it
    /// there may still pick up a reference at any time.
    pub(crate) unsafe fn get_mut_unshared(this: &mut Self) -> &mut T {
        debug_assert_eq!(Self::strong_count(this), 1);
        // Safety: the caller promises the value is not visible anywhere else.
        unsafe { this.control().value_mut() }
    }

    /// Returns the value if this was the last reference to it.
    ///
    /// Otherwise, releases this reference and returns `None`. Like
    /// [`Arc::into_inner`](alloc::sync::Arc::into_inner), when every owner calls this, exactly one
    /// of them gets the value.
    pub fn into_inner(this: Self) -> Option<T> {
        let block = Self::into_block(this);
        // Safety: we owned one reference and give it up here.
        unsafe { ControlBlock::decrement_into_inner(block) }
    }
}

impl<T> SharedPtr<T, crate::SplitCount> {
    /// Mutable access to the value if this is the only reference to it.
    ///
    /// Only split-count pointers offer this. Under hazard pointers, a reader that protected a
    /// block while it was still in a cell may turn that into a counted reference at any point
    /// while the count is nonzero, so a count of one does not mean exclusive.
    pub fn get_mut(this: &mut Self) -> Option<&mut T> {
        if Self::strong_count(this) == 1 {
            // Safety: no cell holds the block (it would own a reference too), and every
            // reservation ever taken on it in a cell was folded into the count when the block
            // left that cell. So ours is the only way to reach the value.
            Some(unsafe { this.control().value_mut() })
        } else {
            None
        }
    }
}

impl<T, R: Reclaimer> Deref for SharedPtr<T, R> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // Safety: we hold a counted reference.
        unsafe { self.control().value() }
    }
}

impl<T, R: Reclaimer> Clone for SharedPtr<T, R> {
    fn clone(&self) -> Self {
        self.control().increment();
        Self {
            block: self.block,
            _owns: PhantomData,
        }
    }
}

impl<T, R: Reclaimer> Drop for SharedPtr<T, R> {
    fn drop(&mut self) {
        // Safety: we own one reference and never use the block again.
        unsafe { ControlBlock::decrement(self.block) };
    }
}

impl<T, R: Reclaimer> AsRef<T> for SharedPtr<T, R> {
    fn as_ref(&self) -> &T {
        self
    }
}

impl<T: fmt::Debug, R: Reclaimer> fmt::Debug for SharedPtr<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: fmt::Display, R: Reclaimer> fmt::Display for SharedPtr<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}

impl<T, R: Reclaimer> fmt::Pointer for SharedPtr<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&Self::as_ptr(self), f)
    }
}
