use std::sync::atomic::{AtomicU32, Ordering};

use nix::errno::Errno;

const ONE_SUBMIT: u32 = 1;
const SUBMIT_MASK: u32 = 0xffff;
const ONE_SLEEP: u32 = 1 << 16;
const SLEEP_MASK: u32 = 0xffff_0000;

/// A compact wait/wake counter packed into one 32-bit word.
///
/// The low half counts outstanding submissions (`submit`), the high half
/// counts threads that have parked themselves waiting for `submit` to reach
/// a desired value (`nsleep`). Packing both halves into one word lets a
/// waiter publish its intent to sleep and observe the current count in a
/// single compare-and-swap, so a wake between the check and the park cannot
/// be lost.
///
/// `submit` is limited to 65 535; [`enter()`](Self::enter) refuses to go
/// past that rather than silently carrying into the sleep half. `nsleep` is
/// bounded by the number of threads, which is far below its 16-bit limit.
///
/// The counter uses release-acquire ordering, so writes made before a
/// `leave()` are visible to a thread after its `wait()` returns.
#[derive(Debug)]
pub struct WaitEvent {
    value: AtomicU32,
}

impl WaitEvent {
    pub fn new() -> Self {
        Self {
            value: AtomicU32::new(0),
        }
    }

    /// Record one submission. Returns the previous submission count.
    pub fn enter(&self) -> u32 {
        let prev = self
            .value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                (v & SUBMIT_MASK != SUBMIT_MASK).then_some(v + ONE_SUBMIT)
            })
            .expect("too many outstanding submissions");
        prev & SUBMIT_MASK
    }

    /// Retire one submission. Returns the previous submission count, so the
    /// caller observing 1 knows it retired the last one and should
    /// [`wake()`](Self::wake) the waiters.
    pub fn leave(&self) -> u32 {
        let prev = self
            .value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                (v & SUBMIT_MASK != 0).then_some(v - ONE_SUBMIT)
            })
            .expect("submission counter underflow");
        prev & SUBMIT_MASK
    }

    /// The current submission count.
    pub fn pending(&self) -> u32 {
        self.value.load(Ordering::Acquire) & SUBMIT_MASK
    }

    /// Block until the submission count equals `desired`.
    pub fn wait(&self, desired: u32) {
        debug_assert!(desired <= SUBMIT_MASK);
        let mut old = self.value.load(Ordering::Acquire);
        loop {
            if old & SUBMIT_MASK == desired {
                return;
            }
            // the sleep registration and the count check must be one atomic
            // step, otherwise a wake could slip in between and be lost
            let val = old + ONE_SLEEP;
            match self
                .value
                .compare_exchange_weak(old, val, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    futex_wait(&self.value, val);
                    old = self.value.load(Ordering::Acquire);
                }
                Err(cur) => old = cur,
            }
        }
    }

    /// Release every thread currently registered as sleeping.
    pub fn wake(&self) {
        let mut old = self.value.load(Ordering::Acquire);
        loop {
            let nsleep = (old & SLEEP_MASK) >> 16;
            if nsleep == 0 {
                return;
            }
            match self.value.compare_exchange_weak(
                old,
                old & !SLEEP_MASK,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    futex_wake(&self.value, nsleep);
                    return;
                }
                Err(cur) => old = cur,
            }
        }
    }
}

impl Default for WaitEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WaitEvent {
    fn drop(&mut self) {
        let value = *self.value.get_mut();
        if value != 0 && !std::thread::panicking() {
            panic!(
                "WaitEvent dropped while in use (submit {}, nsleep {})",
                value & SUBMIT_MASK,
                (value & SLEEP_MASK) >> 16
            );
        }
    }
}

fn futex_wait(word: &AtomicU32, expected: u32) {
    let rv = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            std::ptr::null::<libc::timespec>(),
        )
    };
    if rv < 0 {
        // EAGAIN: the word changed before we parked; EINTR: signal delivery
        let errno = Errno::last();
        assert!(
            matches!(errno, Errno::EAGAIN | Errno::EINTR),
            "FUTEX_WAIT failed with {errno:?}"
        );
    }
}

fn futex_wake(word: &AtomicU32, count: u32) {
    let rv = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            count,
        )
    };
    assert!(rv >= 0, "FUTEX_WAKE failed with {:?}", Errno::last());
}
