//! Per-call context carried through the interceptor chain.

use std::time::Duration;

use tokio::time::Instant;

/// Trace id, identity and deadline for one in-flight call.
///
/// Created empty by the transport, extended by the session stage, read by the
/// handler and the access log. Extending returns a new value; nothing mutates
/// a context another stage has already seen.
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    trace_id: String,
    subject_id: String,
    token: String,
    deadline: Option<Instant>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context whose deadline is `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { deadline: Some(Instant::now() + timeout), ..Self::default() }
    }

    pub fn trace_id(&self) -> &str { &self.trace_id }

    /// Authenticated subject. Empty for anonymous calls.
    pub fn subject_id(&self) -> &str { &self.subject_id }

    pub fn token(&self) -> &str { &self.token }
    pub fn deadline(&self) -> Option<Instant> { self.deadline }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Copy with the deadline tightened to `deadline` when that is earlier.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        };
        Self { deadline: Some(deadline), ..self.clone() }
    }

    /// Copy carrying the session values established for this call.
    pub fn with_session(
        &self,
        trace_id: impl Into<String>,
        token: impl Into<String>,
        subject_id: impl Into<String>,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            token: token.into(),
            subject_id: subject_id.into(),
            deadline: self.deadline,
        }
    }
}
