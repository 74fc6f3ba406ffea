use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Source of the current wall-clock time.
///
/// Validation and query defaulting read the time through a `Clock` so tests
/// can pin it.
#[derive(Clone)]
pub enum Clock {
    /// Reads `Utc::now()`.
    System,
    /// Always returns the same instant.
    Fixed(DateTime<Utc>),
    /// Delegates to a caller-provided function.
    Custom(Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>),
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => f.write_str("Clock::System"),
            Self::Fixed(t) => f.debug_tuple("Clock::Fixed").field(t).finish(),
            Self::Custom(_) => f.write_str("Clock::Custom"),
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::System
    }
}

impl Clock {
    /// Return the current instant according to this clock.
    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Self::System => Utc::now(),
            Self::Fixed(t) => *t,
            Self::Custom(f) => f(),
        }
    }
}
