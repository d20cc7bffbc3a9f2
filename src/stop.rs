//! Cooperative stop flags, keyed by session.
//!
//! Loops poll their [`StopSignal`] at the top of every iteration and end at
//! the next page boundary with [`Termination::Stopped`](crate::models::Termination::Stopped).
//! In-flight requests are never interrupted.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// The stop-flag table shared by every running job.
#[derive(Debug, Clone, Default)]
pub struct StopFlags {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl StopFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, session: &str) {
        self.lock().insert(session.to_string());
    }

    pub fn clear(&self, session: &str) {
        self.lock().remove(session);
    }

    pub fn is_set(&self, session: &str) -> bool {
        self.lock().contains(session)
    }

    /// Handle a running loop polls for its own session.
    pub fn signal(&self, session: impl Into<String>) -> StopSignal {
        StopSignal {
            flags: self.clone(),
            session: session.into(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StopSignal {
    flags: StopFlags,
    session: String,
}

impl StopSignal {
    /// A signal nobody can raise.
    pub fn never() -> Self {
        StopFlags::new().signal(String::new())
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn is_stopped(&self) -> bool {
        self.flags.is_set(&self.session)
    }
}
