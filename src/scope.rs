//! Cancellation scopes for groups of in-flight link operations.
//!
//! A [`Scope`] wraps a [`CancellationToken`]. Every suspend point of the
//! protocol stack is driven through [`Scope::run`], so cancelling the scope
//! releases every caller waiting under it with [`DriverError::Cancelled`].
//! Scopes are single-use: once cancelled, owners install a fresh one with
//! [`Scope::replace`].

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::errors::{DriverError, Result};

#[derive(Debug, Clone, Default)]
pub struct Scope {
    token: CancellationToken,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel every operation registered under this scope. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the scope has been cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Cancel the current scope and install a fresh one, returning a handle to it.
    pub fn replace(&mut self) -> Scope {
        self.token.cancel();
        self.token = CancellationToken::new();
        self.clone()
    }

    /// Drive `fut` under this scope.
    ///
    /// Fails immediately if the scope is already cancelled, so an operation
    /// started late can never succeed under a torn-down scope.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.token.is_cancelled() {
            return Err(DriverError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(DriverError::Cancelled),
            res = fut => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_releases_all_waiters() {
        let scope = Scope::new();
        let mut waiters = Vec::new();
        for _ in 0..4 {
            let scope = scope.clone();
            waiters.push(tokio::spawn(async move {
                scope
                    .run(async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(())
                    })
                    .await
            }));
        }
        tokio::task::yield_now().await;
        scope.cancel();

        for waiter in futures::future::join_all(waiters).await {
            let outcome = waiter.expect("task panicked");
            assert!(matches!(outcome, Err(DriverError::Cancelled)));
        }
    }

    #[tokio::test]
    async fn run_after_cancel_never_succeeds() {
        let scope = Scope::new();
        scope.cancel();
        scope.cancel();
        let outcome = scope.run(async { Ok(42) }).await;
        assert!(matches!(outcome, Err(DriverError::Cancelled)));
    }

    #[tokio::test]
    async fn replace_cancels_old_scope_only() {
        let mut slot = Scope::new();
        let old = slot.clone();
        let fresh = slot.replace();
        assert!(old.is_cancelled());
        assert!(!fresh.is_cancelled());
        assert_eq!(fresh.run(async { Ok("ok") }).await.unwrap(), "ok");
    }
}
