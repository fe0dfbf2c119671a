//! Cooperative signal bits
//!
//! Nothing in the engine is pre-empted. Asynchronous requests (a GC that
//! became due, a host interrupt) are raised as atomic bits here and serviced
//! at the evaluator's per-step checkpoint. The handle is `Arc`-shared so a
//! host signal handler can raise bits from another thread; only raising and
//! clearing bits happens outside the engine thread, which keeps the handler
//! async-signal-safe.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// A garbage collection is due (ballast crossed zero).
pub const SIG_RECYCLE: u32 = 1 << 0;
/// Host interrupt; maps to a halt once bootstrap is complete.
pub const SIG_ESCAPE: u32 = 1 << 1;

/// Shared, clonable set of raised signal bits.
#[derive(Clone, Default)]
pub struct SignalFlags {
    bits: Arc<AtomicU32>,
}

impl SignalFlags {
    pub fn new() -> SignalFlags {
        SignalFlags::default()
    }

    pub fn raise(&self, bit: u32) {
        self.bits.fetch_or(bit, Ordering::SeqCst);
    }

    /// True if any of the masked bits are raised.
    pub fn pending(&self, mask: u32) -> bool {
        self.bits.load(Ordering::SeqCst) & mask != 0
    }

    /// Atomically clear one bit, reporting whether it was raised.
    pub fn take(&self, bit: u32) -> bool {
        self.bits.fetch_and(!bit, Ordering::SeqCst) & bit != 0
    }

    pub fn clear_all(&self) {
        self.bits.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raise_take_cycle() {
        let sig = SignalFlags::new();
        assert!(!sig.pending(SIG_RECYCLE | SIG_ESCAPE));

        sig.raise(SIG_RECYCLE);
        assert!(sig.pending(SIG_RECYCLE));
        assert!(!sig.pending(SIG_ESCAPE));

        assert!(sig.take(SIG_RECYCLE));
        assert!(!sig.take(SIG_RECYCLE), "take clears the bit");
    }

    #[test]
    fn test_handle_is_shared() {
        let sig = SignalFlags::new();
        let other = sig.clone();
        other.raise(SIG_ESCAPE);
        assert!(sig.pending(SIG_ESCAPE));
    }
}
