use crate::{AtomicShared, Domain, Global, Reclaimer, SharedPtr};
use core::cell::UnsafeCell;

struct Node<T, R: Reclaimer> {
    // `None` for the sentinel. Taken once, by the dequeue that makes this node the new sentinel.
    value: UnsafeCell<Option<T>>,
    next: R::Atomic<Node<T, R>>,
}

// Safety: `value` is only touched by the enqueuer before the node is linked and by the single
// dequeue that advanced `head` onto it.
unsafe impl<T: Send, R: Reclaimer> Sync for Node<T, R> {}

impl<T, R: Reclaimer> Node<T, R> {
    fn new(value: Option<T>, reclaimer: R) -> SharedPtr<Self, R> {
        SharedPtr::new_in(
            Self {
                value: UnsafeCell::new(value),
                next: <R::Atomic<Self>>::null_in(reclaimer),
            },
            reclaimer,
        )
    }
}

impl<T, R: Reclaimer> Drop for Node<T, R> {
    fn drop(&mut self) {
        let mut next = self.next.take();
        while let Some(node) = next {
            next = match SharedPtr::into_inner(node) {
                Some(mut node) => node.next.take(),
                None => None,
            };
        }
    }
}

/// A lock-free FIFO queue (Michael-Scott queue) of `T`s.
///
/// The queue always holds a sentinel node at `head`; the first value is in the node after it.
/// Enqueuers link a node after the last one and then swing `tail` forward. Any thread that finds
/// `tail` lagging behind the last node helps swing it, so no operation waits on another.
///
/// ```rust
/// use atomic_shared::Queue;
///
/// let queue = Queue::new();
/// queue.enqueue("a");
/// queue.enqueue("b");
/// assert_eq!(queue.dequeue(), Some("a"));
/// assert_eq!(queue.dequeue(), Some("b"));
/// assert_eq!(queue.dequeue(), None);
/// ```
pub struct Queue<T, R: Reclaimer = &'static Domain<Global>> {
    head: R::Atomic<Node<T, R>>,
    tail: R::Atomic<Node<T, R>>,
    reclaimer: R,
}

const SENTINEL: &str = "queue head and tail are never empty";

impl<T> Queue<T> {
    /// An empty queue whose nodes retire into the global domain.
    pub fn new() -> Self {
        Self::new_in(Domain::global())
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, R: Reclaimer> Queue<T, R> {
    /// An empty queue whose nodes are reclaimed by `reclaimer`.
    pub fn new_in(reclaimer: R) -> Self {
        let sentinel = Node::new(None, reclaimer);
        Self {
            head: <R::Atomic<Node<T, R>>>::new_in(Some(sentinel.clone()), reclaimer),
            tail: <R::Atomic<Node<T, R>>>::new_in(Some(sentinel), reclaimer),
            reclaimer,
        }
    }

    /// Append `value` at the back of the queue.
    pub fn enqueue(&self, value: T) {
        let node = Node::new(Some(value), self.reclaimer);
        let mut link = Some(node.clone());
        loop {
            let tail = self.tail.load().expect(SENTINEL);
            if let Some(next) = tail.next.load() {
                let _ = self.tail.compare_exchange(Some(&tail), Some(next));
                continue;
            }
            match tail.next.compare_exchange(None, link) {
                Ok(_) => {
                    let _ = self.tail.compare_exchange(Some(&tail), Some(node));
                    return;
                }
                Err(rejected) => link = rejected,
            }
        }
    }

    /// Remove the value at the front of the queue, or `None` if the queue is empty.
    pub fn dequeue(&self) -> Option<T> {
        loop {
            let head = self.head.load().expect(SENTINEL);
            let tail = self.tail.load().expect(SENTINEL);
            let next = head.next.load()?;
            if SharedPtr::ptr_eq(&head, &tail) {
                // `tail` lags behind a node that is already linked.
                let _ = self.tail.compare_exchange(Some(&tail), Some(next));
                continue;
            }
            if self
                .head
                .compare_exchange(Some(&head), Some(next.clone()))
                .is_ok()
            {
                // Safety: exactly one dequeue advances `head` onto `next`, and the enqueuer
                // stopped touching it when it was linked.
                return unsafe { (*next.value.get()).take() };
            }
        }
    }

    /// True if the queue held no values at the time of the call.
    pub fn is_empty(&self) -> bool {
        self.head.load().map_or(true, |head| head.next.is_null())
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::Queue;
    use crate::{AtomicShared, Domain, SharedPtr, SplitCount};

    #[test]
    fn new_queue_is_empty() {
        let queue: Queue<i32, SplitCount> = Queue::new_in(SplitCount);
        assert!(queue.is_empty());
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn fifo() {
        let domain = Domain::new(&());
        let queue = Queue::new_in(&domain);
        queue.enqueue(5);
        assert!(!queue.is_empty());
        queue.enqueue(6);
        assert_eq!(queue.dequeue(), Some(5));
        assert_eq!(queue.dequeue(), Some(6));
        assert!(queue.is_empty());
    }

    #[test]
    fn sentinel_is_shared_by_head_and_tail() {
        let queue: Queue<u8, SplitCount> = Queue::new_in(SplitCount);
        let head = queue.head.load().unwrap();
        let tail = queue.tail.load().unwrap();
        assert!(SharedPtr::ptr_eq(&head, &tail));
        queue.enqueue(1);
        let tail = queue.tail.load().unwrap();
        assert!(!SharedPtr::ptr_eq(&head, &tail));
    }

    #[test]
    fn long_queue_drops_without_recursion() {
        let queue = Queue::new_in(SplitCount);
        for i in 0..200_000u32 {
            queue.enqueue(i);
        }
        drop(queue);
    }
}
