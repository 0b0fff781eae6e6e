use crate::{AtomicShared, Domain, Global, Reclaimer, SharedPtr};
use core::cell::UnsafeCell;

struct Node<T, R: Reclaimer> {
    // Written once at push, taken once by the pop that unlinks the node.
    value: UnsafeCell<Option<T>>,
    next: Option<SharedPtr<Node<T, R>, R>>,
}

// Safety: `value` is only touched by the thread that created the node and by the single pop that
// unlinked it, so sharing a node only ever moves a T between threads.
unsafe impl<T: Send, R: Reclaimer> Sync for Node<T, R> {}

impl<T, R: Reclaimer> Drop for Node<T, R> {
    fn drop(&mut self) {
        // Unlink iteratively so that a long chain does not recurse once per node.
        let mut next = self.next.take();
        while let Some(node) = next {
            next = match SharedPtr::into_inner(node) {
                Some(mut node) => node.next.take(),
                None => None,
            };
        }
    }
}

/// A lock-free LIFO stack (Treiber stack) of `T`s.
///
/// Nodes are [`SharedPtr`]s, and the head is an atomic cell of the strategy `R` picks, so the
/// stack needs no other reclamation machinery of its own. A popped node stays allocated for as long
/// as a concurrent operation still looks at it.
///
/// ```rust
/// use atomic_shared::{SplitCount, Stack};
///
/// let stack = Stack::new_in(SplitCount);
/// stack.push(1);
/// stack.push(2);
/// assert_eq!(stack.pop(), Some(2));
/// assert_eq!(stack.pop(), Some(1));
/// assert_eq!(stack.pop(), None);
/// ```
pub struct Stack<T, R: Reclaimer = &'static Domain<Global>> {
    head: R::Atomic<Node<T, R>>,
    reclaimer: R,
}

impl<T> Stack<T> {
    /// An empty stack whose nodes retire into the global domain.
    pub fn new() -> Self {
        Self::new_in(Domain::global())
    }
}

impl<T> Default for Stack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, R: Reclaimer> Stack<T, R> {
    /// An empty stack whose nodes are reclaimed by `reclaimer`.
    pub fn new_in(reclaimer: R) -> Self {
        Self {
            head: <R::Atomic<Node<T, R>>>::null_in(reclaimer),
            reclaimer,
        }
    }

    /// Push `value` onto the top of the stack.
    pub fn push(&self, value: T) {
        let mut node = Some(SharedPtr::new_in(
            Node {
                value: UnsafeCell::new(Some(value)),
                next: None,
            },
            self.reclaimer,
        ));
        let mut head = self.head.load();
        // A failed exchange hands the node back, so this only ends through `return`.
        while let Some(mut n) = node {
            // Safety: `n` has not been cloned or published yet. A failed exchange hands it back
            // without ever exposing it.
            unsafe { SharedPtr::get_mut_unshared(&mut n) }.next = head.clone();
            match self.head.compare_exchange(head.as_ref(), Some(n)) {
                Ok(_) => return,
                Err(rejected) => {
                    node = rejected;
                    head = self.head.load();
                }
            }
        }
    }

    /// Pop the value on top of the stack, or `None` if the stack is empty.
    pub fn pop(&self) -> Option<T> {
        let mut head = self.head.load();
        loop {
            let node = head?;
            if self
                .head
                .compare_exchange(Some(&node), node.next.clone())
                .is_ok()
            {
                // Safety: only the pop whose exchange unlinked `node` gets here, and the pusher
                // is long done with it.
                return unsafe { (*node.value.get()).take() };
            }
            head = self.head.load();
        }
    }

    /// True if the stack held no values at the time of the call.
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::Stack;
    use crate::{Domain, Reclaimer, SplitCount};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountDrops(Arc<AtomicUsize>);
    impl Drop for CountDrops {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn lifo() {
        let stack = Stack::new();
        assert!(stack.is_empty());
        for i in 0..10 {
            stack.push(i);
        }
        assert!(!stack.is_empty());
        for i in (0..10).rev() {
            assert_eq!(stack.pop(), Some(i));
        }
        assert_eq!(stack.pop(), None);
        assert!(stack.is_empty());
    }

    #[test]
    fn drop_releases_remaining_values() {
        let drops = Arc::new(AtomicUsize::new(0));
        let stack = Stack::new_in(SplitCount);
        for _ in 0..5 {
            stack.push(CountDrops(Arc::clone(&drops)));
        }
        drop(stack.pop());
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        drop(stack);
        assert_eq!(drops.load(Ordering::SeqCst), 5);
    }

    fn racing_pushes_keep_every_value<R: Reclaimer>(r: R)
    where
        Stack<usize, R>: Sync,
    {
        let stack: Stack<usize, R> = Stack::new_in(r);
        std::thread::scope(|s| {
            for t in 0..4 {
                let stack = &stack;
                s.spawn(move || {
                    for i in 0..1_000 {
                        stack.push(t * 1_000 + i);
                    }
                });
            }
        });
        let mut popped: Vec<_> = core::iter::from_fn(|| stack.pop()).collect();
        popped.sort_unstable();
        assert_eq!(popped, (0..4_000).collect::<Vec<_>>());
    }

    #[test]
    fn racing_pushes_hazard() {
        let domain = Domain::new(&());
        racing_pushes_keep_every_value(&domain);
    }

    #[test]
    fn racing_pushes_split() {
        racing_pushes_keep_every_value(SplitCount);
    }

    #[test]
    fn long_chain_drops_without_recursion() {
        let domain = Domain::new(&());
        let stack = Stack::new_in(&domain);
        for i in 0..200_000 {
            stack.push(i);
        }
        drop(stack);
    }
}
