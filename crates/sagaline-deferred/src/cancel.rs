//! Cooperative cancellation signal.
//!
//! A [`CancellationSource`] owns the ability to fire; the [`CancellationToken`]
//! handed out from it is a read-only view that can be queried and can have
//! callbacks registered on it. Tokens are cheap to clone and are shared by every
//! step of a composition, nested compositions included.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tracing::debug;

type Callback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct SignalState {
    fired: bool,
    next_id: u64,
    callbacks: Vec<(u64, Callback)>,
}

#[derive(Default)]
struct Signal {
    state: Mutex<SignalState>,
}

impl Signal {
    fn lock(&self) -> std::sync::MutexGuard<'_, SignalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The owning side of a cancellation signal.
#[derive(Default)]
pub struct CancellationSource {
    signal: Arc<Signal>,
}

impl CancellationSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A read-only handle observing this source.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            signal: Some(Arc::clone(&self.signal)),
        }
    }

    /// Fire the signal, running every registered callback on this thread.
    ///
    /// Firing twice is a no-op.
    pub fn cancel(&self) {
        let callbacks = {
            let mut state = self.signal.lock();
            if state.fired {
                return;
            }
            state.fired = true;
            std::mem::take(&mut state.callbacks)
        };
        debug!(callbacks = callbacks.len(), "cancellation requested");
        for (_, callback) in callbacks {
            callback();
        }
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.signal.lock().fired
    }
}

impl fmt::Debug for CancellationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationSource")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// Read-only view of a cancellation signal.
///
/// The default token is detached from any source and never fires.
#[derive(Clone, Default)]
pub struct CancellationToken {
    signal: Option<Arc<Signal>>,
}

impl CancellationToken {
    /// A token that can never be canceled.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.signal.as_ref().is_some_and(|signal| signal.lock().fired)
    }

    /// Whether this token is attached to a source at all.
    #[must_use]
    pub fn can_be_canceled(&self) -> bool {
        self.signal.is_some()
    }

    /// Run `callback` once when the signal fires.
    ///
    /// If the signal has already fired the callback runs immediately on the
    /// calling thread. Dropping the returned [`Registration`] before the signal
    /// fires removes the callback.
    pub fn register(&self, callback: impl FnOnce() + Send + 'static) -> Registration {
        let Some(signal) = &self.signal else {
            return Registration::empty();
        };

        {
            let mut state = signal.lock();
            if !state.fired {
                let id = state.next_id;
                state.next_id += 1;
                state.callbacks.push((id, Box::new(callback)));
                return Registration {
                    signal: Arc::downgrade(signal),
                    id: Some(id),
                };
            }
        }

        callback();
        Registration::empty()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("can_be_canceled", &self.can_be_canceled())
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// Handle to a callback registered on a [`CancellationToken`].
#[must_use = "dropping a registration unregisters its callback"]
#[derive(Debug)]
pub struct Registration {
    signal: Weak<Signal>,
    id: Option<u64>,
}

impl Registration {
    fn empty() -> Self {
        Self {
            signal: Weak::new(),
            id: None,
        }
    }

    /// Keep the callback registered for as long as the signal lives.
    pub fn forget(mut self) {
        self.id = None;
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let (Some(id), Some(signal)) = (self.id, self.signal.upgrade()) else {
            return;
        };
        signal.lock().callbacks.retain(|(registered, _)| *registered != id);
    }
}
