//! Waiter primitives shared by both pool flavors.

pub mod wait_event;

pub use wait_event::WaitEvent;

/// Emit `n` CPU pause hints. Used by spin phases to be polite to the other
/// hardware thread of the core; this is not a suspension point.
#[inline]
pub fn cpu_relax(n: u32) {
    for _ in 0..n {
        std::hint::spin_loop();
    }
}
