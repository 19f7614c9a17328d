// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! A minimal, cloneable cancellation signal shared by every task that
//! cooperates on a single flow invocation.
//!
//! Built over a [`tokio::sync::watch`] channel rather than a bespoke
//! flag-plus-notify pair: `watch` already gives us a cloneable receiver,
//! idempotent `send`, and an async `changed()` wait with none of the
//! lost-wakeup hazards of a raw `Notify`.

use std::sync::Arc;
use tokio::sync::watch;

/// Read-only handle observed by modules and the executor.
///
/// Holds on to a clone of the paired sender purely to keep the `watch`
/// channel open: a token whose `CancellationSource` has already been
/// dropped (e.g. [`CancellationToken::never`]) must still block forever on
/// [`CancellationToken::cancelled`] rather than observe a closed channel
/// and resolve spuriously.
#[derive(Clone)]
pub struct CancellationToken {
    rx: watch::Receiver<bool>,
    _tx_keepalive: Arc<watch::Sender<bool>>,
}

/// Trigger side, held by the invoking caller (or the executor, for
/// deadline-derived cancellation).
pub struct CancellationSource {
    tx: Arc<watch::Sender<bool>>,
}

impl CancellationSource {
    /// Create a linked (source, token) pair. The token starts
    /// not-cancelled.
    pub fn new() -> (Self, CancellationToken) {
        let (tx, rx) = watch::channel(false);
        let tx = Arc::new(tx);
        (Self { tx: tx.clone() }, CancellationToken { rx, _tx_keepalive: tx })
    }

    /// Request cancellation. Idempotent: calling this twice leaves the
    /// token in the same cancelled state it reached after the first call.
    pub fn cancel(&self) {
        // `watch::Sender::send` ignores a value equal to the current one
        // only in the sense that it still notifies; repeated sends of
        // `true` are observationally identical to observers.
        let _ = self.tx.send(true);
    }
}

impl CancellationToken {
    /// A token that is never cancelled, for contexts with no caller-supplied
    /// cancellation (e.g. tests).
    pub fn never() -> Self {
        let (_source, token) = CancellationSource::new();
        token
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation has been requested. Never resolves if
    /// the paired `CancellationSource` is dropped without cancelling
    /// (the `changed()` error case), matching "no ordering guarantee" for
    /// a token whose source is gone.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}
