//! Cooperative cancellation for storage calls.
//!
//! A [`Cancellation`] is a shared flag. Engine operations check it before
//! every storage round-trip; the flag never interrupts a statement that has
//! already been dispatched.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared cancellation token.
///
/// Clones observe the same flag, so a caller can keep one handle and pass
/// another into an engine operation.
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
}

impl Cancellation {
    /// Creates a token in the "not cancelled" state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` once [`Self::cancel`] has been called on any clone.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Marks the token as cancelled.
    ///
    /// Returns `true` if this call flipped the flag, `false` if it was
    /// already set.
    pub fn cancel(&self) -> bool {
        self.flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let token = Cancellation::new();
        let other = token.clone();
        assert!(!other.is_cancelled());

        assert!(token.cancel());
        assert!(other.is_cancelled());
        assert!(!other.cancel());
    }
}
