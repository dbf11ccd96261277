//! One-shot close signal with an observable closed token.

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

type CloseFn = Box<dyn FnOnce() + Send>;

/// Emits a close function exactly once, no matter how many tasks race on
/// [`Closer::close`], and exposes the closed state as a cancellation token so
/// every derived task can select on it.
pub(crate) struct Closer {
    token: CancellationToken,
    slot: Mutex<Option<CloseFn>>,
}

impl Closer {
    /// Create a new closer. `f` runs on the first `close()` call only.
    pub(crate) fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self {
            token: CancellationToken::new(),
            slot: Mutex::new(Some(Box::new(f))),
        }
    }

    /// Cancel the token and run the close function. Subsequent calls are
    /// no-ops.
    pub(crate) fn close(&self) {
        let f = self.slot.lock().take();
        if let Some(f) = f {
            self.token.cancel();
            f();
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token that is cancelled once the closer fires. Cheap to clone; every
    /// blocking task derived from the owner must select on it.
    pub(crate) fn closed_signal(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl std::fmt::Debug for Closer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Closer")
            .field("is_closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn close_runs_the_function_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let closer = Closer::new(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!closer.is_closed());
        closer.close();
        closer.close();
        closer.close();

        assert!(closer.is_closed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_close_is_single_shot() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let closer = Arc::new(Closer::new(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        }));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let closer = closer.clone();
            handles.push(std::thread::spawn(move || closer.close()));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_signal_releases_waiters() {
        let closer = Arc::new(Closer::new(|| {}));
        let signal = closer.closed_signal();

        let waiter = tokio::spawn(async move {
            signal.cancelled().await;
        });

        closer.close();
        waiter.await.unwrap();
    }
}
