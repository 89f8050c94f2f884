//! Abort signals with first-wins fan-in.
//!
//! An [`AbortController`] fires at most once. Every [`AbortSignal`] handed out
//! by it observes the same [`AbortReason`]. [`AbortSignal::any`] merges several
//! sources into one signal that fires with the reason of whichever source
//! triggered first, then drops its listeners.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use wiremux::abort::{AbortController, AbortReason, AbortSignal};
//!
//! let caller = AbortController::new();
//! let signal = AbortSignal::any([caller.signal(), AbortSignal::timeout(Duration::from_secs(5))]);
//!
//! caller.abort(AbortReason::cancelled("user navigated away"));
//! let reason = signal.aborted().await;
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{self, FutureExt};
use tokio::sync::watch;

use crate::error::WiremuxError;

/// Which kind of source fired an abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortKind {
    /// Explicit cancellation by the caller or the peer.
    Cancelled,
    /// A deadline elapsed.
    Timeout,
    /// The owning connection is shutting down.
    Shutdown,
}

/// Why and when a signal fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortReason {
    pub kind: AbortKind,
    pub message: String,
    pub at: Instant,
}

impl AbortReason {
    pub fn new(kind: AbortKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            at: Instant::now(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(AbortKind::Cancelled, message)
    }

    pub fn timeout() -> Self {
        Self::new(AbortKind::Timeout, "Timeout")
    }

    pub fn shutdown(message: impl Into<String>) -> Self {
        Self::new(AbortKind::Shutdown, message)
    }

    /// Map the reason onto the call error surfaced to callers.
    pub fn into_call_error(self) -> WiremuxError {
        match self.kind {
            AbortKind::Cancelled => WiremuxError::CallCancelled(self.message),
            AbortKind::Timeout => WiremuxError::CallTimeout,
            AbortKind::Shutdown => WiremuxError::CallAborted(self.message),
        }
    }
}

/// Owner side of an abort signal.
///
/// Cloning shares the same underlying state.
#[derive(Debug, Clone)]
pub struct AbortController {
    tx: Arc<watch::Sender<Option<AbortReason>>>,
}

impl AbortController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Get a signal observing this controller.
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: Some(self.tx.subscribe()),
        }
    }

    /// Fire the signal. Returns `false` if it had already fired.
    pub fn abort(&self, reason: AbortReason) -> bool {
        let mut reason = Some(reason);
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = reason.take();
            true
        })
    }

    #[inline]
    pub fn is_aborted(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<AbortReason> {
        self.tx.borrow().clone()
    }

    /// Resolves once every signal derived from this controller is dropped.
    async fn unobserved(&self) {
        self.tx.closed().await
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of an abort controller.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: Option<watch::Receiver<Option<AbortReason>>>,
}

impl AbortSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        Self { rx: None }
    }

    /// A signal that fires with [`AbortKind::Timeout`] after `duration`.
    ///
    /// Must be called within a Tokio runtime.
    pub fn timeout(duration: Duration) -> Self {
        let controller = AbortController::new();
        let signal = controller.signal();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {
                    controller.abort(AbortReason::timeout());
                }
                _ = controller.unobserved() => {}
            }
        });
        signal
    }

    /// Merge several signals: the result fires with the first reason any of
    /// them fires with.
    ///
    /// Sources that can never fire are skipped. If a source has already fired,
    /// the merged signal is returned pre-aborted with that reason and no
    /// listener is installed. Otherwise a listener task is spawned (requires
    /// a Tokio runtime) and exits as soon as one source fires or the merged
    /// signal is dropped.
    pub fn any<I>(signals: I) -> Self
    where
        I: IntoIterator<Item = AbortSignal>,
    {
        let mut sources: Vec<AbortSignal> =
            signals.into_iter().filter(|s| s.rx.is_some()).collect();

        if let Some(reason) = sources.iter().find_map(AbortSignal::reason) {
            let controller = AbortController::new();
            controller.abort(reason);
            return controller.signal();
        }

        match sources.len() {
            0 => Self::never(),
            1 => sources.remove(0),
            _ => {
                let controller = AbortController::new();
                let merged = controller.signal();
                let waits: Vec<_> = sources
                    .into_iter()
                    .map(|source| async move { source.aborted().await }.boxed())
                    .collect();
                tokio::spawn(async move {
                    tokio::select! {
                        (reason, _, _) = future::select_all(waits) => {
                            controller.abort(reason);
                        }
                        _ = controller.unobserved() => {}
                    }
                });
                merged
            }
        }
    }

    #[inline]
    pub fn is_aborted(&self) -> bool {
        self.rx.as_ref().map_or(false, |rx| rx.borrow().is_some())
    }

    pub fn reason(&self) -> Option<AbortReason> {
        self.rx.as_ref().and_then(|rx| rx.borrow().clone())
    }

    /// Wait until the signal fires.
    ///
    /// Never resolves for [`AbortSignal::never`] or when every controller was
    /// dropped without firing.
    pub async fn aborted(&self) -> AbortReason {
        let Some(rx) = &self.rx else {
            return future::pending().await;
        };
        let mut rx = rx.clone();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return future::pending().await;
            }
        }
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::never()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_fires_once() {
        let controller = AbortController::new();
        let signal = controller.signal();
        assert!(!signal.is_aborted());

        assert!(controller.abort(AbortReason::cancelled("first")));
        assert!(!controller.abort(AbortReason::cancelled("second")));

        assert_eq!(signal.reason().unwrap().message, "first");
    }

    #[test]
    fn test_never_signal() {
        let signal = AbortSignal::never();
        assert!(!signal.is_aborted());
        assert!(signal.reason().is_none());
    }

    #[tokio::test]
    async fn test_any_returns_already_aborted_source() {
        let done = AbortController::new();
        done.abort(AbortReason::shutdown("gone"));
        let pending = AbortController::new();

        let merged = AbortSignal::any([pending.signal(), done.signal(), AbortSignal::never()]);
        assert!(merged.is_aborted());
        assert_eq!(merged.reason().unwrap().kind, AbortKind::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_abort_wins_over_timeout() {
        let caller = AbortController::new();
        let merged = AbortSignal::any([
            caller.signal(),
            AbortSignal::timeout(Duration::from_millis(50)),
        ]);

        let started = tokio::time::Instant::now();
        let cancel = caller.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.abort(AbortReason::cancelled("caller gave up"));
        });

        let reason = merged.aborted().await;
        assert_eq!(reason.kind, AbortKind::Cancelled);
        assert_eq!(reason.message, "caller gave up");
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(10));
        assert!(elapsed < Duration::from_millis(50));

        // The timeout firing later must not replace the reason.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(merged.reason().unwrap().kind, AbortKind::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_signal_fires() {
        let signal = AbortSignal::timeout(Duration::from_millis(20));
        let reason = signal.aborted().await;
        assert_eq!(reason.kind, AbortKind::Timeout);
        assert!(matches!(
            reason.into_call_error(),
            WiremuxError::CallTimeout
        ));
    }
}
