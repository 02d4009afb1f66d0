//! Per-call execution context.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::trace::Trace;

/// Well-known metadata keys.
pub mod metadata_key {
    /// Body codec name (`json` or `proto`).
    pub const CONTENT_TYPE: &str = "content-type";
    /// Remote peer address as seen by the server.
    pub const CLIENT_IP: &str = "client-ip";
    /// Serialized trace token.
    pub const TRACER: &str = "tracer";
    /// Trace id of the current invocation.
    pub const TRACE_ID: &str = "trace-id";
    /// Dotted span id of the current invocation.
    pub const SPAN_ID: &str = "span-id";
}

/// Metadata, trace, deadline and cancellation for one call.
///
/// Clients read the metadata and trace when building a request. Servers
/// build one per invocation and hand it to the service, so a handler can
/// pass it straight into downstream calls to continue the trace.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    metadata: HashMap<String, String>,
    trace: Option<Trace>,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl CallContext {
    /// Empty context without deadline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn for_invocation(
        metadata: HashMap<String, String>,
        trace: Trace,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            metadata,
            trace: Some(trace),
            deadline,
            cancel: CancellationToken::new(),
        }
    }

    /// Sets a deadline `timeout` from now.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Sets an absolute deadline, keeping an earlier one if already set.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(self.deadline.map_or(deadline, |d| d.min(deadline)));
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Attaches a trace to propagate.
    #[must_use]
    pub fn with_trace(mut self, trace: Trace) -> Self {
        self.trace = Some(trace);
        self
    }

    /// All metadata entries.
    #[must_use]
    pub const fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Looks up one metadata entry.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// The trace, if one is attached.
    #[must_use]
    pub const fn trace(&self) -> Option<&Trace> {
        self.trace.as_ref()
    }

    /// The deadline, if any.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Token cancelled when the caller gives up or the invocation times out.
    #[must_use]
    pub const fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Stops every wait tied to this context.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
