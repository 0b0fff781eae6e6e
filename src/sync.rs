#[cfg(all(not(feature = "std"), loom))]
compile_error!("loom requires the standard library");

#[cfg(loom)]
pub(crate) mod atomic {
    pub(crate) use super::loom_u128::AtomicU128;
    pub(crate) use loom::sync::atomic::{
        fence, AtomicBool, AtomicIsize, AtomicPtr, AtomicUsize, Ordering,
    };

    pub(crate) fn light_barrier() {
        fence(Ordering::SeqCst)
    }

    pub(crate) fn heavy_barrier() {
        fence(Ordering::SeqCst)
    }
}

#[cfg(not(loom))]
pub(crate) mod atomic {
    pub(crate) use core::sync::atomic::{
        fence, AtomicBool, AtomicIsize, AtomicPtr, AtomicUsize, Ordering,
    };

    pub(crate) use portable_atomic::AtomicU128;

    // TODO: use membarrier(2) on linux so readers only pay a compiler fence.
    pub(crate) fn light_barrier() {
        fence(Ordering::SeqCst)
    }

    pub(crate) fn heavy_barrier() {
        fence(Ordering::SeqCst)
    }
}

#[cfg(loom)]
pub(crate) use loom::thread::yield_now;
#[cfg(all(not(loom), feature = "std"))]
pub(crate) use std::thread::yield_now;

/// Back off while another thread holds a short internal lock.
pub(crate) fn relax() {
    #[cfg(not(any(loom, feature = "std")))]
    core::hint::spin_loop();
    #[cfg(any(loom, feature = "std"))]
    yield_now();
}

// Loom atomics have no `get_mut`; this gives both flavours the same exclusive-access API.
pub(crate) trait WithMut<T> {
    fn with_mut<R>(&mut self, f: impl FnOnce(&mut T) -> R) -> R;
}

#[cfg(not(loom))]
impl<T> WithMut<*mut T> for core::sync::atomic::AtomicPtr<T> {
    fn with_mut<R>(&mut self, f: impl FnOnce(&mut *mut T) -> R) -> R {
        f(self.get_mut())
    }
}

#[cfg(not(loom))]
impl WithMut<u128> for portable_atomic::AtomicU128 {
    fn with_mut<R>(&mut self, f: impl FnOnce(&mut u128) -> R) -> R {
        f(self.get_mut())
    }
}

#[cfg(loom)]
impl<T> WithMut<*mut T> for loom::sync::atomic::AtomicPtr<T> {
    fn with_mut<R>(&mut self, f: impl FnOnce(&mut *mut T) -> R) -> R {
        loom::sync::atomic::AtomicPtr::with_mut(self, f)
    }
}

#[cfg(loom)]
impl WithMut<u128> for loom_u128::AtomicU128 {
    fn with_mut<R>(&mut self, f: impl FnOnce(&mut u128) -> R) -> R {
        f(&mut self.lock())
    }
}

// Loom has no 128-bit atomic. A loom mutex makes each operation one atomic step in the model,
// which is all the split cell relies on.
#[cfg(loom)]
mod loom_u128 {
    use loom::sync::atomic::Ordering;
    use loom::sync::{Mutex, MutexGuard};

    pub(crate) struct AtomicU128(Mutex<u128>);

    impl AtomicU128 {
        pub(crate) fn new(v: u128) -> Self {
            Self(Mutex::new(v))
        }

        pub(super) fn lock(&self) -> MutexGuard<'_, u128> {
            self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
        }

        pub(crate) fn load(&self, _: Ordering) -> u128 {
            *self.lock()
        }

        pub(crate) fn swap(&self, v: u128, _: Ordering) -> u128 {
            core::mem::replace(&mut *self.lock(), v)
        }

        pub(crate) fn compare_exchange_weak(
            &self,
            current: u128,
            new: u128,
            _: Ordering,
            _: Ordering,
        ) -> Result<u128, u128> {
            let mut v = self.lock();
            if *v == current {
                *v = new;
                Ok(current)
            } else {
                Err(*v)
            }
        }
    }
}
