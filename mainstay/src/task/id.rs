use crate::context::ambient;
use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

/// An opaque ID that uniquely identifies a joinable task relative to all
/// other tasks created by this process.
///
/// IDs are never reused. They are not sequential and do not indicate the
/// order in which tasks were created.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct Id(pub(crate) NonZeroU64);

impl Id {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);

        let id = COUNTER.fetch_add(1, Ordering::Relaxed);

        // This number is unimaginably large; even at a billion tasks per
        // second it takes centuries to wrap.
        let Some(id) = NonZeroU64::new(id) else {
            Self::exhausted();
        };

        Self(id)
    }

    #[cold]
    fn exhausted() -> ! {
        panic!("failed to generate unique task ID: bitspace exhausted")
    }

    pub(crate) fn as_u64(&self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Returns the [`Id`] of the joinable task whose identity flows through the
/// current execution segment.
///
/// # Panics
///
/// Panics if called outside any joinable task, or inside a
/// relevance-suppression scope. For a non-panicking version see
/// [`try_current`].
pub fn current() -> Id {
    try_current().expect("no joinable task is ambient on this execution segment")
}

/// Returns the [`Id`] of the ambient joinable task, or `None` when called
/// outside any task (or inside a relevance-suppression scope).
pub fn try_current() -> Option<Id> {
    ambient::current_task().map(|core| core.id)
}
