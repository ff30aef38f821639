//! Cooperative pause counters ("block/unblock"), per spec.md §5 and §9.
//!
//! Raised before a critical section, lowered after; the paused side waits
//! for the counter to read zero again instead of busy-spinning, replacing
//! the source's `while block_status == 0: continue` polling loop with a
//! `Notify`-backed wait.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Clone)]
pub struct Gate {
    count: Arc<AtomicI64>,
    notify: Arc<Notify>,
}

impl Gate {
    pub fn new() -> Self {
        Self {
            count: Arc::new(AtomicI64::new(0)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Enters the critical section. Pairs with exactly one [`Self::lower`].
    pub fn raise(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    /// Leaves the critical section and wakes anyone waiting on
    /// [`Self::wait_until_clear`].
    pub fn lower(&self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_raised(&self) -> bool {
        self.count.load(Ordering::SeqCst) > 0
    }

    /// Suspends until the counter reads zero. Registers the `Notify`
    /// listener before re-checking the counter, so a `lower()` racing with
    /// the check can never be missed between the check and the await.
    pub async fn wait_until_clear(&self) {
        loop {
            if !self.is_raised() {
                return;
            }
            let notified = self.notify.notified();
            if !self.is_raised() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_returns_immediately_when_never_raised() {
        let gate = Gate::new();
        gate.wait_until_clear().await;
    }

    #[tokio::test]
    async fn wait_unblocks_after_matching_lower() {
        let gate = Gate::new();
        gate.raise();
        let waiter = gate.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_until_clear().await;
        });
        tokio::task::yield_now().await;
        gate.lower();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn nested_raises_require_matching_lowers() {
        let gate = Gate::new();
        gate.raise();
        gate.raise();
        gate.lower();
        assert!(gate.is_raised());
        gate.lower();
        assert!(!gate.is_raised());
    }
}
