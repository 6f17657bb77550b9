use tokio::sync::watch;

/// Owning side of a cooperative cancellation flag. Dropping it without
/// calling [`CancellationSource::cancel`] never cancels.
#[derive(Debug)]
pub struct CancellationSource {
    tx: watch::Sender<bool>,
}

/// Cheap, cloneable view of a cancellation flag handed to long-running work.
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    rx: watch::Receiver<bool>,
}

pub fn cancellation() -> (CancellationSource, CancellationSignal) {
    let (tx, rx) = watch::channel(false);
    (CancellationSource { tx }, CancellationSignal { rx })
}

impl CancellationSource {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn signal(&self) -> CancellationSignal {
        CancellationSignal {
            rx: self.tx.subscribe(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl CancellationSignal {
    /// A signal that is never raised, for direct (non-worker) calls.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the flag is raised; pends forever if it never can be.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancellationSignal {
    fn default() -> Self {
        Self::never()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let (source, signal) = cancellation();
        let waiter = tokio::spawn({
            let signal = signal.clone();
            async move { signal.cancelled().await }
        });
        assert!(!signal.is_cancelled());
        source.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .expect("waiter task");
        assert!(signal.is_cancelled());
        assert!(source.signal().is_cancelled());
    }

    #[tokio::test]
    async fn never_signal_stays_pending() {
        let signal = CancellationSignal::never();
        let outcome = tokio::time::timeout(Duration::from_millis(20), signal.cancelled()).await;
        assert!(outcome.is_err());
        assert!(!signal.is_cancelled());
    }
}
