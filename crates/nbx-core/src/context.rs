//! Execution context handed to watchers
//!
//! The context identifies the note, paragraph and session whose execution
//! produced a change. Watchers receive it unchanged apart from the cascade
//! depth, so a watcher can target the scheduler of the right note.

use nbx_object::{NoteId, ParagraphId};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unique session identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Ulid);

impl SessionId {
    /// Generate new session ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Origin of a binder call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    note: NoteId,
    paragraph: Option<ParagraphId>,
    session: SessionId,
    depth: u32,
}

impl ExecutionContext {
    /// Context for a note, with no running paragraph (e.g. a UI event)
    #[inline]
    #[must_use]
    pub fn new(note: impl Into<NoteId>) -> Self {
        Self {
            note: note.into(),
            paragraph: None,
            session: SessionId::new(),
            depth: 0,
        }
    }

    /// Context for a running paragraph
    #[inline]
    #[must_use]
    pub fn for_paragraph(note: impl Into<NoteId>, paragraph: impl Into<ParagraphId>) -> Self {
        Self {
            paragraph: Some(paragraph.into()),
            ..Self::new(note)
        }
    }

    /// With explicit session
    #[inline]
    #[must_use]
    pub fn with_session(mut self, session: SessionId) -> Self {
        self.session = session;
        self
    }

    /// Same note, session and depth, re-targeted at another paragraph
    #[must_use]
    pub fn for_unit(&self, paragraph: impl Into<ParagraphId>) -> Self {
        Self {
            paragraph: Some(paragraph.into()),
            ..self.clone()
        }
    }

    /// Context passed to watchers fired from this one
    #[must_use]
    pub fn descend(&self) -> Self {
        Self {
            depth: self.depth.saturating_add(1),
            ..self.clone()
        }
    }

    /// Owning note
    #[inline]
    #[must_use]
    pub fn note(&self) -> &NoteId {
        &self.note
    }

    /// Running paragraph, if any
    #[inline]
    #[must_use]
    pub fn paragraph(&self) -> Option<&ParagraphId> {
        self.paragraph.as_ref()
    }

    /// Originating session
    #[inline]
    #[must_use]
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Number of watcher dispatches between the original caller and this one
    #[inline]
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.depth
    }
}
