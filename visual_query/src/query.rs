use parking_lot::RwLock;
use std::fmt;

/// What the service is currently looking for.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryMode {
    /// Nothing specific: every label of a fixed vocabulary is reported.
    Idle,
    Caption(String),
    Label(String),
}

impl QueryMode {
    /// Text the query was issued with, if any.
    pub fn text(&self) -> Option<&str> {
        match self {
            QueryMode::Idle => None,
            QueryMode::Caption(text) | QueryMode::Label(text) => Some(text),
        }
    }
}

impl fmt::Display for QueryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryMode::Idle => write!(f, "idle"),
            QueryMode::Caption(text) => write!(f, "caption `{}`", text),
            QueryMode::Label(label) => write!(f, "label `{}`", label),
        }
    }
}

/// Immutable copy of the query state used for one inference pass.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySnapshot {
    pub mode: QueryMode,
    pub min_confidence: f32,
}

#[derive(Debug)]
pub struct QueryState {
    inner: RwLock<QuerySnapshot>,
}

impl QueryState {
    pub fn new(mode: QueryMode, min_confidence: f32) -> Self {
        Self {
            inner: RwLock::new(QuerySnapshot {
                mode,
                min_confidence,
            }),
        }
    }

    /// Replaces the active mode, keeping the confidence floor.
    pub fn set_query(&self, mode: QueryMode) {
        let mut state = self.inner.write();
        tracing::debug!("Query changed from {} to {}", state.mode, mode);
        state.mode = mode;
    }

    pub fn snapshot(&self) -> QuerySnapshot {
        self.inner.read().clone()
    }
}
