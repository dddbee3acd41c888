use super::BaseError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Inner {
    canceled: AtomicBool,
    notify: Notify,
    callbacks: Mutex<Vec<Callback>>,
}

/// Cooperative cancellation shared by clones.
///
/// Work units poll [`is_canceled`](Self::is_canceled) or await
/// [`canceled`](Self::canceled); cleanup hooks registered with
/// [`on_cancel`](Self::on_cancel) run once, on the canceling thread.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if self.inner.canceled.swap(true, Ordering::SeqCst) {
            return;
        }
        let callbacks: Vec<Callback> = std::mem::take(&mut *self.inner.callbacks.lock());
        for cb in callbacks {
            cb();
        }
        self.inner.notify.notify_waiters();
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    /// Runs `cb` on cancel, or right away when already canceled.
    pub fn on_cancel<F>(&self, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut callbacks = self.inner.callbacks.lock();
            if !self.is_canceled() {
                callbacks.push(Box::new(cb));
                return;
            }
        }
        cb();
    }

    pub fn check(&self) -> Result<(), BaseError> {
        if self.is_canceled() {
            return Err(BaseError::Canceled);
        }
        Ok(())
    }

    pub async fn canceled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_canceled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn callbacks_run_once() {
        let token = CancellationToken::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        token.on_cancel(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        token.cancel();
        token.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(token.check().is_err());

        let c = count.clone();
        token.on_cancel(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn waiters_wake_up() {
        let token = CancellationToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.canceled().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("timeout")
            .expect("join");
    }
}
