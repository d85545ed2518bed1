//! Exactly-once completion slots.
//!
//! A slot is created empty, resolved (or rejected) at most once from another
//! task, and awaited by any number of consumers. Resolution may race with the
//! first `wait` call; late waiters observe the stored value.

use tokio::sync::watch;

use super::WorkerError;

/// A named completion cell: one resolution, many waiters.
#[derive(Debug)]
pub struct Slot<T: Clone> {
    tx: watch::Sender<Option<Result<T, WorkerError>>>,
}

impl<T: Clone> Slot<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Store the value. The first resolution wins; later calls are ignored.
    pub fn resolve(&self, value: Result<T, WorkerError>) {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
            true
        });
    }

    /// Reject the slot only if nothing resolved it yet.
    pub fn reject(&self, err: WorkerError) {
        self.resolve(Err(err));
    }

    /// Value if already resolved, without waiting.
    pub fn try_get(&self) -> Option<Result<T, WorkerError>> {
        self.tx.borrow().clone()
    }

    /// Wait for the resolution.
    pub async fn wait(&self) -> Result<T, WorkerError> {
        let mut rx = self.tx.subscribe();
        // wait_for only fails when the sender is dropped; the slot owns it.
        let value = rx
            .wait_for(|slot| slot.is_some())
            .await
            .map_err(|_| WorkerError::Exited)?;
        match value.clone() {
            Some(result) => result,
            None => Err(WorkerError::Exited),
        }
    }
}

impl<T: Clone> Default for Slot<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn waiter_sees_value_resolved_later() {
        let slot = std::sync::Arc::new(Slot::<u32>::new());
        let s = slot.clone();
        let waiter = tokio::spawn(async move { s.wait().await });
        tokio::task::yield_now().await;
        slot.resolve(Ok(42));
        assert_eq!(waiter.await.unwrap().unwrap(), 42);
    }

    #[tokio::test]
    async fn first_resolution_wins() {
        let slot = Slot::<u32>::new();
        slot.resolve(Ok(1));
        slot.reject(WorkerError::Exited);
        slot.resolve(Ok(2));
        assert_eq!(slot.wait().await.unwrap(), 1);
        assert_eq!(slot.try_get().unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn rejection_propagates_to_all_waiters() {
        let slot = std::sync::Arc::new(Slot::<u32>::new());
        let a = slot.clone();
        let b = slot.clone();
        let wa = tokio::spawn(async move { a.wait().await });
        let wb = tokio::spawn(async move { b.wait().await });
        tokio::task::yield_now().await;
        slot.reject(WorkerError::Exited);
        assert!(wa.await.unwrap().is_err());
        assert!(wb.await.unwrap().is_err());
    }
}
