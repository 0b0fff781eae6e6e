use crate::record::HazPtrRecord;
use crate::sync::atomic::{AtomicIsize, AtomicPtr, AtomicUsize, Ordering};
use crate::sync::WithMut;
use crate::HazardPointer;
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::marker::PhantomData;

#[cfg(loom)]
const RCOUNT_THRESHOLD: isize = 5;
#[cfg(not(loom))]
const RCOUNT_THRESHOLD: isize = 1000;
const HCOUNT_MULTIPLIER: isize = 2;

/// The [domain family](Domain) of the process-wide domain.
///
/// Every [`SharedPtr`](crate::SharedPtr) created with [`SharedPtr::new`](crate::SharedPtr::new)
/// retires its control block here, and every cell built on it protects its loads here. You get
/// the single instance with [`Domain::global`].
#[non_exhaustive]
pub struct Global;
impl Global {
    const fn new() -> Self {
        Global
    }
}

#[cfg(not(loom))]
static SHARED_DOMAIN: Domain<Global> = Domain::new(&Global::new());

#[cfg(loom)]
loom::lazy_static! {
    static ref SHARED_DOMAIN: Domain<Global> = Domain::new(&Global::new());
}

/// A set of hazard records plus the objects retired against them.
///
/// A control block retired into a domain is only freed once no [`HazardPointer`] of that same
/// domain announces its address. Readers and writers must therefore agree on the domain; the
/// cells in this crate guarantee that by storing the domain they were built with and handing it
/// to every control block they publish.
///
/// ## Domain families
///
/// `F` is a zero-sized marker that keeps obviously incompatible domains apart at compile time:
/// a `HazardCell<'_, T, Global>` cannot be paired with a `Domain<MyFamily>`. Two instances of
/// the same family are still interchangeable as far as the type checker is concerned, so prefer
/// [`unique_domain!`] when a fresh isolated domain is all you need:
///
/// ```rust
/// let domain = atomic_shared::unique_domain!();
/// let _h = domain.acquire_record();
/// ```
///
/// ## Reclamation
///
/// Retiring does not free anything right away. Once enough objects have piled up (at least
/// `1000`, or twice the number of hazard records if that is larger), the retiring thread scans
/// all records and frees every retired object whose address is not announced. Whatever is
/// left over when the domain is dropped is freed then.
pub struct Domain<F> {
    records: AtomicPtr<HazPtrRecord>,
    nrecords: AtomicIsize,
    retired: RetiredList,
    count: AtomicIsize,
    nbulk_reclaims: AtomicUsize,
    family: PhantomData<fn() -> F>,
}

impl Domain<Global> {
    /// Get a handle to the process-wide [global domain](Global).
    pub fn global() -> &'static Self {
        &SHARED_DOMAIN
    }
}

/// Construct a [`Domain`] whose family type exists nowhere else.
#[macro_export]
macro_rules! unique_domain {
    () => {{
        struct UniqueFamily;
        $crate::Domain::new(&UniqueFamily)
    }};
}

// Statics need a const constructor, but loom atomics cannot be built in const context.
macro_rules! new {
    ($($decl:tt)*) => {
        /// Construct a new, empty domain of the given family.
        ///
        /// See the [`Domain`] documentation for what the family buys you.
        pub $($decl)*(_: &'_ F) -> Self {
            Self {
                records: AtomicPtr::new(core::ptr::null_mut()),
                nrecords: AtomicIsize::new(0),
                retired: RetiredList::new(),
                count: AtomicIsize::new(0),
                nbulk_reclaims: AtomicUsize::new(0),
                family: PhantomData,
            }
        }
    };
}

impl<F> Domain<F> {
    #[cfg(not(loom))]
    new!(const fn new);
    #[cfg(loom)]
    new!(fn new);

    /// Take a hazard record from this domain, wrapped in a [`HazardPointer`].
    ///
    /// The record goes back to the domain when the returned value is dropped.
    pub fn acquire_record(&self) -> HazardPointer<'_, F> {
        HazardPointer::new_in_domain(self)
    }

    pub(crate) fn acquire(&self) -> &HazPtrRecord {
        let mut node = self.records.load(Ordering::Acquire);
        while !node.is_null() {
            // Safety: records are never deallocated while the domain lives.
            let rec = unsafe { &*node };
            if rec.try_acquire() {
                return rec;
            }
            node = rec.next.load(Ordering::Acquire);
        }
        self.acquire_new()
    }

    pub(crate) fn release(&self, rec: &HazPtrRecord) {
        rec.release();
    }

    #[cfg(test)]
    pub(crate) fn nrecords(&self) -> isize {
        self.nrecords.load(Ordering::Acquire)
    }

    fn acquire_new(&self) -> &HazPtrRecord {
        let rec = Box::into_raw(Box::new(HazPtrRecord::new_active()));
        let mut head = self.records.load(Ordering::Acquire);
        loop {
            // Safety: rec is not reachable by any other thread yet.
            unsafe { &mut *rec }.next.with_mut(|p| *p = head);
            match self.records.compare_exchange_weak(
                head,
                rec,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(head_now) => head = head_now,
            }
        }
        let nrecords = self.nrecords.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::trace!(records = nrecords, "allocated hazard record");
        // Safety: records are never deallocated while the domain lives.
        unsafe { &*rec }
    }

    /// Retire `ptr` and drop it as a `Box<T>` once no hazard pointer of this domain guards it.
    ///
    /// Returns the number of objects this call happened to reclaim.
    ///
    /// # Safety
    ///
    /// 1. `ptr` was produced by `Box::<T>::into_raw`.
    /// 2. `ptr` can no longer be reached by readers that have not already protected it.
    /// 3. `ptr` has not been retired before.
    /// 4. Dropping the `Box<T>` remains sound until this domain reclaims it or is dropped.
    pub unsafe fn retire<T>(&self, ptr: *mut T) -> usize {
        unsafe fn drop_box<T>(ptr: *mut u8) {
            // Safety: `retire` requires ptr to come from Box<T>, and each retired entry is
            // deleted at most once.
            drop(unsafe { Box::from_raw(ptr.cast::<T>()) });
        }

        let retired = Box::into_raw(Box::new(Retired {
            ptr: ptr.cast(),
            deleter: drop_box::<T>,
            next: AtomicPtr::new(core::ptr::null_mut()),
        }));

        crate::sync::atomic::light_barrier();

        // Safety: retired is a fresh single-element list.
        unsafe { self.retired.push(retired, retired) };
        self.count.fetch_add(1, Ordering::Release);

        self.check_threshold_and_reclaim()
    }

    /// Reclaim every retired object that is not currently protected.
    ///
    /// Returns the number of objects reclaimed.
    pub fn eager_reclaim(&self) -> usize {
        self.nbulk_reclaims.fetch_add(1, Ordering::Acquire);
        self.do_reclamation(0)
    }

    // Only used by tests: reclaims and then waits out reclamations running on other threads.
    #[doc(hidden)]
    pub fn cleanup(&self) {
        self.eager_reclaim();
        while self.nbulk_reclaims.load(Ordering::Acquire) > 0 {
            crate::sync::relax();
        }
    }

    fn threshold(&self) -> isize {
        RCOUNT_THRESHOLD.max(HCOUNT_MULTIPLIER * self.nrecords.load(Ordering::Acquire))
    }

    fn check_count_threshold(&self) -> isize {
        let mut rcount = self.count.load(Ordering::Acquire);
        while rcount > self.threshold() {
            match self
                .count
                .compare_exchange_weak(rcount, 0, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return rcount,
                Err(rcount_now) => rcount = rcount_now,
            }
        }
        0
    }

    fn check_threshold_and_reclaim(&self) -> usize {
        let rcount = self.check_count_threshold();
        if rcount == 0 {
            return 0;
        }
        self.nbulk_reclaims.fetch_add(1, Ordering::Acquire);
        self.do_reclamation(rcount)
    }

    fn do_reclamation(&self, mut rcount: isize) -> usize {
        let mut total_reclaimed = 0;
        loop {
            let mut done = true;
            let stolen = self.retired.pop_all();
            if !stolen.is_null() {
                crate::sync::atomic::heavy_barrier();
                let guarded = self.guarded_addresses();
                let (nreclaimed, is_done) = self.match_reclaim(stolen, &guarded);
                done = is_done;
                rcount -= nreclaimed as isize;
                total_reclaimed += nreclaimed;
            }

            if rcount != 0 {
                self.count.fetch_add(rcount, Ordering::Release);
            }
            rcount = self.check_count_threshold();
            if rcount == 0 && done {
                break;
            }
        }
        self.nbulk_reclaims.fetch_sub(1, Ordering::Release);
        tracing::debug!(
            reclaimed = total_reclaimed,
            remaining = self.count.load(Ordering::Relaxed),
            "hazard domain reclamation pass"
        );
        total_reclaimed
    }

    // Sorted and deduplicated, so each retired object costs one binary search.
    fn guarded_addresses(&self) -> Vec<*mut u8> {
        let mut guarded = Vec::new();
        let mut node = self.records.load(Ordering::Acquire);
        while !node.is_null() {
            // Safety: records are never deallocated while the domain lives.
            let rec = unsafe { &*node };
            let ptr = rec.ptr.load(Ordering::Acquire);
            if !ptr.is_null() {
                guarded.push(ptr);
            }
            node = rec.next.load(Ordering::Acquire);
        }
        guarded.sort_unstable();
        guarded.dedup();
        guarded
    }

    fn match_reclaim(&self, stolen: *mut Retired, guarded: &[*mut u8]) -> (usize, bool) {
        let mut reclaimable: *mut Retired = core::ptr::null_mut();
        let mut unreclaimed: *mut Retired = core::ptr::null_mut();
        let mut unreclaimed_tail: *mut Retired = core::ptr::null_mut();
        let mut nreclaimed = 0;

        let mut node = stolen;
        while !node.is_null() {
            // Safety: we own the whole stolen list, nobody else can reach these entries.
            let n = unsafe { &*node };
            let next = n.next.load(Ordering::Relaxed);
            debug_assert_ne!(node, next);

            if guarded.binary_search(&n.ptr).is_err() {
                n.next.store(reclaimable, Ordering::Relaxed);
                reclaimable = node;
                nreclaimed += 1;
            } else {
                n.next.store(unreclaimed, Ordering::Relaxed);
                if unreclaimed_tail.is_null() {
                    unreclaimed_tail = node;
                }
                unreclaimed = node;
            }
            node = next;
        }

        // Safety: no hazard record announces any entry on `reclaimable`, and each entry was
        // stolen from the retired list exactly once.
        unsafe { self.reclaim_unprotected(reclaimable) };

        let done = self.retired.is_empty();
        // Safety: unreclaimed..unreclaimed_tail is a well-formed list we own.
        unsafe { self.retired.push(unreclaimed, unreclaimed_tail) };
        (nreclaimed, done)
    }

    /// # Safety
    ///
    /// Every entry of `retired` is owned by the caller and no longer protected.
    unsafe fn reclaim_unprotected(&self, mut retired: *mut Retired) -> usize {
        let mut n = 0;
        while !retired.is_null() {
            // Safety: entries on the list came from Box::into_raw in `retire`.
            let entry = unsafe { Box::from_raw(retired) };
            retired = entry.next.load(Ordering::Relaxed);
            // Safety: guaranteed by the contract of `retire` and by the caller.
            unsafe { (entry.deleter)(entry.ptr) };
            n += 1;
        }
        n
    }
}

impl<F> Drop for Domain<F> {
    fn drop(&mut self) {
        let head = self.retired.pop_all();
        // Safety: &mut self means no hazard pointer borrowed from this domain is alive.
        let reclaimed = unsafe { self.reclaim_unprotected(head) };

        let mut node: *mut HazPtrRecord = self.records.with_mut(|p| *p);
        while !node.is_null() {
            // Safety: as above, no one can hold any of our records any more.
            let mut rec = unsafe { Box::from_raw(node) };
            node = rec.next.with_mut(|p| *p);
        }
        tracing::debug!(reclaimed, "hazard domain dropped");
    }
}

struct Retired {
    ptr: *mut u8,
    /// # Safety
    ///
    /// Safe to call on `ptr` exactly once, after no hazard pointer protects it.
    deleter: unsafe fn(*mut u8),
    next: AtomicPtr<Retired>,
}

struct RetiredList {
    head: AtomicPtr<Retired>,
}

impl RetiredList {
    #[cfg(not(loom))]
    const fn new() -> Self {
        Self {
            head: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    #[cfg(loom)]
    fn new() -> Self {
        Self {
            head: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// # Safety
    ///
    /// `sublist_head..=sublist_tail` is a list owned by the caller, or both are null.
    unsafe fn push(&self, sublist_head: *mut Retired, sublist_tail: *mut Retired) {
        if sublist_head.is_null() {
            return;
        }

        let mut head = self.head.load(Ordering::Acquire);
        loop {
            // Safety: the caller owns the sublist until the CAS below publishes it.
            unsafe { &*sublist_tail }.next.store(head, Ordering::Release);
            match self.head.compare_exchange_weak(
                head,
                sublist_head,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(head_now) => head = head_now,
            }
        }
    }

    fn pop_all(&self) -> *mut Retired {
        self.head.swap(core::ptr::null_mut(), Ordering::Acquire)
    }

    fn is_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed).is_null()
    }
}

/// ```compile_fail
/// use atomic_shared::*;
/// let other = Domain::new(&());
/// let cell: HazardCell<'_, i32, Global> = HazardCell::null_in(Domain::global());
///
/// // The cell retires into the global family, the pointer into `()`.
/// cell.store(Some(SharedPtr::new_in(1, &other)));
/// ```
#[cfg(doctest)]
struct CannotConfuseFamilies;
