use crate::{Reclaimer, SharedPtr};

/// An atomic, nullable slot holding one counted reference to a [`SharedPtr`]'s value.
///
/// Every operation is lock-free. A cell owns exactly one reference to whatever it holds, and
/// hands out new references on [`load`](AtomicShared::load). The two implementations differ only
/// in how a load keeps the block alive between reading the address and incrementing its count:
///
/// - [`HazardCell`](crate::HazardCell) announces the address in a hazard pointer first.
/// - [`SplitCell`](crate::SplitCell) reserves a local count packed next to the address.
///
/// Code that is generic over the strategy names the cell through [`Reclaimer::Atomic`]:
///
/// ```rust
/// use atomic_shared::{AtomicShared, Reclaimer, SharedPtr};
///
/// fn bump<R: Reclaimer>(cell: &R::Atomic<u32>, r: R) {
///     loop {
///         let cur = cell.load();
///         let next = SharedPtr::new_in(cur.as_deref().map_or(1, |v| v + 1), r);
///         if cell.compare_exchange(cur.as_ref(), Some(next)).is_ok() {
///             break;
///         }
///     }
/// }
///
/// let cell = atomic_shared::SplitCell::null_in(atomic_shared::SplitCount);
/// bump(&cell, atomic_shared::SplitCount);
/// bump(&cell, atomic_shared::SplitCount);
/// assert_eq!(cell.load().as_deref(), Some(&2));
/// ```
pub trait AtomicShared<T>: Sized {
    /// The strategy whose blocks this cell can hold.
    type Reclaimer: Reclaimer;

    /// A cell holding `value`, whose blocks are reclaimed with `reclaimer`.
    fn new_in(value: Option<SharedPtr<T, Self::Reclaimer>>, reclaimer: Self::Reclaimer) -> Self;

    /// An empty cell.
    fn null_in(reclaimer: Self::Reclaimer) -> Self {
        Self::new_in(None, reclaimer)
    }

    /// A new reference to the current value, or `None` if the cell is empty.
    fn load(&self) -> Option<SharedPtr<T, Self::Reclaimer>>;

    /// Replace the current value, releasing the cell's reference to the old one.
    fn store(&self, desired: Option<SharedPtr<T, Self::Reclaimer>>) {
        drop(self.swap(desired));
    }

    /// Replace the current value and return the cell's reference to the old one.
    fn swap(
        &self,
        desired: Option<SharedPtr<T, Self::Reclaimer>>,
    ) -> Option<SharedPtr<T, Self::Reclaimer>>;

    /// Replace the value with `new` if the cell still holds the same control block as `current`.
    ///
    /// Identity is that of the control block, not the value. Since the caller owns `current`, its
    /// block cannot be reclaimed and reused for an unrelated value in between, so the comparison
    /// cannot be fooled by address reuse.
    ///
    /// On success returns the reference the cell held before. On failure `new` comes back
    /// untouched.
    #[allow(clippy::type_complexity)]
    fn compare_exchange(
        &self,
        current: Option<&SharedPtr<T, Self::Reclaimer>>,
        new: Option<SharedPtr<T, Self::Reclaimer>>,
    ) -> Result<Option<SharedPtr<T, Self::Reclaimer>>, Option<SharedPtr<T, Self::Reclaimer>>>;

    /// Empty the cell through exclusive access.
    fn take(&mut self) -> Option<SharedPtr<T, Self::Reclaimer>>;

    /// True if the cell holds nothing right now.
    fn is_null(&self) -> bool;
}
