use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

/// Boxed error accepted from step bodies.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// The error payload of a faulted operation.
///
/// A fault is shared by every operation that propagates it, so cloning is
/// cheap and all clones refer to the same observation state. A fault must be
/// observed by someone: a compensation handler, a step that overrides it, or
/// the final caller awaiting the composition. When the last clone of an
/// unobserved fault is dropped a warning is logged.
#[derive(Clone)]
pub struct Fault {
    inner: Arc<FaultInner>,
}

struct FaultInner {
    errors: Arc<[BoxError]>,
    observed: AtomicBool,
}

impl Fault {
    /// Create a fault from a single error.
    pub fn new(error: impl Into<BoxError>) -> Self {
        Self::from_shared(Arc::from(vec![error.into()]))
    }

    /// Create a fault carrying several errors, the first being the primary one.
    ///
    /// An empty list yields a fault with a generic primary error.
    #[must_use]
    pub fn aggregate(errors: Vec<BoxError>) -> Self {
        if errors.is_empty() {
            return Self::new(EmptyFault);
        }
        Self::from_shared(Arc::from(errors))
    }

    fn from_shared(errors: Arc<[BoxError]>) -> Self {
        Self {
            inner: Arc::new(FaultInner {
                errors,
                observed: AtomicBool::new(false),
            }),
        }
    }

    /// The primary error.
    #[must_use]
    pub fn error(&self) -> &(dyn Error + Send + Sync + 'static) {
        &*self.inner.errors[0]
    }

    /// All errors carried by this fault, primary first.
    pub fn errors(&self) -> impl Iterator<Item = &(dyn Error + Send + Sync + 'static)> {
        self.inner.errors.iter().map(|error| &**error)
    }

    /// Find the first carried error of type `E`.
    #[must_use]
    pub fn downcast_ref<E: Error + 'static>(&self) -> Option<&E> {
        self.inner
            .errors
            .iter()
            .find_map(|error| error.downcast_ref::<E>())
    }

    /// Whether some observer has already seen this fault.
    #[must_use]
    pub fn is_observed(&self) -> bool {
        self.inner.observed.load(Ordering::Acquire)
    }

    /// Mark the fault as seen, suppressing the unobserved-fault warning.
    pub fn mark_observed(&self) {
        self.inner.observed.store(true, Ordering::Release);
    }

    /// A fresh, unobserved fault carrying the same errors.
    #[must_use]
    pub fn rethrown(&self) -> Self {
        Self::from_shared(Arc::clone(&self.inner.errors))
    }

    /// Whether both handles refer to the same fault instance.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fault")
            .field("errors", &self.inner.errors)
            .field("observed", &self.is_observed())
            .finish()
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error())?;
        let extra = self.inner.errors.len() - 1;
        if extra > 0 {
            write!(f, " (and {extra} more)")?;
        }
        Ok(())
    }
}

impl Error for Fault {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.error().source()
    }
}

impl Drop for FaultInner {
    fn drop(&mut self) {
        if !*self.observed.get_mut() {
            warn!(
                error = %self.errors[0],
                count = self.errors.len(),
                "fault dropped without being observed"
            );
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("operation faulted without an error")]
struct EmptyFault;
