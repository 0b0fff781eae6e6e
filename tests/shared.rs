use atomic_shared::*;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct CountDrops(usize, Arc<AtomicUsize>);
impl Drop for CountDrops {
    fn drop(&mut self) {
        self.1.fetch_add(1, Ordering::SeqCst);
    }
}

fn round_trip<R: Reclaimer>(r: R) {
    let drops = Arc::new(AtomicUsize::new(0));
    let cell = <R::Atomic<CountDrops>>::null_in(r);
    assert!(cell.is_null());
    assert!(cell.load().is_none());

    cell.store(Some(SharedPtr::new_in(CountDrops(1, Arc::clone(&drops)), r)));
    assert!(!cell.is_null());

    let first = cell.load().expect("just stored");
    assert_eq!(first.0, 1);
    assert_eq!(SharedPtr::strong_count(&first), 2);

    let again = cell.load().expect("still there");
    assert!(SharedPtr::ptr_eq(&first, &again));
    drop(again);

    let previous = cell
        .swap(Some(SharedPtr::new_in(CountDrops(2, Arc::clone(&drops)), r)))
        .expect("was not empty");
    assert!(SharedPtr::ptr_eq(&previous, &first));
    drop(previous);
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    drop(first);
    assert_eq!(drops.load(Ordering::SeqCst), 1);

    assert_eq!(cell.load().map(|v| v.0), Some(2));
    drop(cell);
    assert_eq!(drops.load(Ordering::SeqCst), 2);
}

#[test]
fn round_trip_hazard() {
    let domain = Domain::new(&());
    round_trip(&domain);
}

#[test]
fn round_trip_split() {
    round_trip(SplitCount);
}

fn last_clone_drops_value<R: Reclaimer>(r: R) {
    const CLONES: usize = 100;
    let drops = Arc::new(AtomicUsize::new(0));
    let original = SharedPtr::new_in(CountDrops(5, Arc::clone(&drops)), r);
    let mut clones: Vec<_> = (0..CLONES).map(|_| original.clone()).collect();
    assert_eq!(SharedPtr::strong_count(&original), CLONES + 1);

    // Release from both ends and the middle in turn, with the original somewhere in between.
    let mut original = Some(original);
    let mut i = 0;
    while clones.len() > 1 {
        let at = match i % 3 {
            0 => 0,
            1 => clones.len() - 1,
            _ => clones.len() / 2,
        };
        let clone = clones.swap_remove(at);
        assert_eq!(clone.0, 5);
        drop(clone);
        if i == CLONES / 2 {
            drop(original.take());
        }
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        i += 1;
    }
    assert!(original.is_none());

    let last = clones.pop().expect("one clone left");
    assert_eq!(SharedPtr::strong_count(&last), 1);
    drop(last);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn last_clone_drops_value_hazard() {
    let domain = Domain::new(&());
    last_clone_drops_value(&domain);
}

#[test]
fn last_clone_drops_value_split() {
    last_clone_drops_value(SplitCount);
}

#[test]
fn take_empties_cell() {
    let mut cell = SplitCell::new_in(Some(SharedPtr::new_in(3, SplitCount)), SplitCount);
    let three = cell.take().expect("not empty");
    assert_eq!(*three, 3);
    assert_eq!(SharedPtr::strong_count(&three), 1);
    assert!(cell.take().is_none());
    assert!(cell.is_null());
}

#[test]
fn compare_exchange_with_null() {
    let cell = HazardCell::null_in(Domain::global());
    let one = SharedPtr::new(1);
    assert!(cell.compare_exchange(None, Some(one.clone())).unwrap().is_none());
    let rejected = cell.compare_exchange(None, Some(SharedPtr::new(2)));
    assert_eq!(rejected.unwrap_err().as_deref(), Some(&2));
    let previous = cell.compare_exchange(Some(&one), None).unwrap();
    assert!(SharedPtr::ptr_eq(&previous.unwrap(), &one));
    assert_eq!(SharedPtr::strong_count(&one), 1);
}

fn readers_and_writers<R: Reclaimer>(r: R)
where
    R::Atomic<CountDrops>: Send + Sync,
{
    const WRITES: usize = 2_000;
    let drops = Arc::new(AtomicUsize::new(0));
    let cell = <R::Atomic<CountDrops>>::new_in(
        Some(SharedPtr::new_in(CountDrops(0, Arc::clone(&drops)), r)),
        r,
    );

    std::thread::scope(|s| {
        for w in 0..2 {
            let cell = &cell;
            let drops = &drops;
            s.spawn(move || {
                for i in 0..WRITES {
                    let v = CountDrops(w * WRITES + i, Arc::clone(drops));
                    cell.store(Some(SharedPtr::new_in(v, r)));
                }
            });
        }
        for _ in 0..4 {
            let cell = &cell;
            s.spawn(move || {
                let mut seen = 0;
                for _ in 0..WRITES {
                    let v = cell.load().expect("never emptied");
                    assert!(v.0 < 2 * WRITES);
                    seen += 1;
                }
                assert_eq!(seen, WRITES);
            });
        }
    });

    drop(cell);
    assert_eq!(drops.load(Ordering::SeqCst), 2 * WRITES + 1);
}

#[test]
fn concurrent_hazard() {
    let domain = Domain::new(&());
    readers_and_writers(&domain);
}

#[test]
fn concurrent_split() {
    readers_and_writers(SplitCount);
}

fn self_store<R: Reclaimer>(r: R) {
    let drops = Arc::new(AtomicUsize::new(0));
    let cell = <R::Atomic<CountDrops>>::new_in(
        Some(SharedPtr::new_in(CountDrops(7, Arc::clone(&drops)), r)),
        r,
    );
    for _ in 0..3 {
        cell.store(cell.load());
    }
    let v = cell.load().expect("still stored");
    assert_eq!(v.0, 7);
    assert_eq!(SharedPtr::strong_count(&v), 2);
    drop(v);
    drop(cell);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn self_store_hazard() {
    self_store(Domain::global());
}

#[test]
fn self_store_split() {
    self_store(SplitCount);
}
