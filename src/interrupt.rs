//! Cooperative cancellation shared between the loops and tool executors.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Marker content appended to the log when generation or execution is cut
/// short. Prompt assembly and the step loop recognise it to hand control
/// back to the user.
pub const INTERRUPT_MARKER: &str = "Interrupted by user";

/// Shared cancellation flag.
///
/// Checked between stream chunks and between tool-executor yields; setting
/// it is idempotent and safe from any thread or signal handler context.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Rearms the token for the next operation.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Returns `Err(Interrupted)` if cancellation was signalled.
    pub fn check(&self) -> crate::Result<()> {
        if self.is_cancelled() {
            Err(crate::Error::Interrupted)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_idempotent() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(crate::Error::Interrupted)));
    }

    #[test]
    fn test_reset_rearms() {
        let token = CancelToken::new();
        token.cancel();
        token.reset();
        assert!(token.check().is_ok());
    }

    #[test]
    fn test_clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
