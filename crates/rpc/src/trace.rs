//! Distributed trace token carried in request metadata.
//!
//! The token is a JSON object `{id, name, createAt, span}` where `span` is a
//! chain of spans linked through `parent`. Each hop parses the inbound token
//! and continues it with a child span, or starts a fresh trace when the
//! token is missing or unreadable.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const SPAN_ID_LEN: usize = 8;

/// One hop of a trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    /// Short random id of this hop.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Name of the operation, usually the method called.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// When the span started.
    #[serde(rename = "createAt", default = "Utc::now")]
    pub create_at: DateTime<Utc>,
    /// The calling span, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Box<Span>>,
}

impl Span {
    fn new(parent: Option<Self>, name: &str) -> Self {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(SPAN_ID_LEN);

        Self {
            id,
            name: name.to_string(),
            create_at: Utc::now(),
            parent: parent.map(Box::new),
        }
    }

    /// Dotted chain of span ids from the root down to this span.
    #[must_use]
    pub fn span_id(&self) -> String {
        match &self.parent {
            Some(parent) => format!("{}.{}", parent.span_id(), self.id),
            None => self.id.clone(),
        }
    }
}

/// A trace token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    /// Trace id shared by every hop.
    pub id: String,
    /// Name of the operation that started the trace.
    #[serde(default)]
    pub name: String,
    /// When the trace started.
    #[serde(rename = "createAt", default = "Utc::now")]
    pub create_at: DateTime<Utc>,
    /// Innermost span.
    #[serde(default)]
    pub span: Option<Span>,
}

impl Trace {
    /// Starts a new trace with a root span named `name`.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            name: name.to_string(),
            create_at: Utc::now(),
            span: Some(Span::new(None, name)),
        }
    }

    /// Parses a token, returning `None` when it is not a valid trace.
    #[must_use]
    pub fn parse(token: &str) -> Option<Self> {
        serde_json::from_str::<Self>(token)
            .ok()
            .filter(|trace| !trace.id.is_empty())
    }

    /// Continues the trace from `token`, or starts a new one named `name`.
    #[must_use]
    pub fn continue_from(token: Option<&str>, name: &str) -> Self {
        token
            .and_then(Self::parse)
            .map_or_else(|| Self::new(name), |trace| trace.child(name))
    }

    /// Returns this trace with a new innermost span named `name`.
    #[must_use]
    pub fn child(&self, name: &str) -> Self {
        Self {
            id: self.id.clone(),
            name: self.name.clone(),
            create_at: self.create_at,
            span: Some(Span::new(self.span.clone(), name)),
        }
    }

    /// The trace id.
    #[must_use]
    pub fn trace_id(&self) -> &str {
        &self.id
    }

    /// Dotted span id of the innermost span.
    #[must_use]
    pub fn span_id(&self) -> String {
        self.span.as_ref().map(Span::span_id).unwrap_or_default()
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}
