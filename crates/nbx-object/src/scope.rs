//! Scope identifiers
//!
//! Every angular object lives in exactly one [`Scope`]. A note-level scope is
//! shared by all paragraphs of the note; a paragraph-level scope belongs to
//! one paragraph and is isolated from the note scope and from its siblings.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Note (document) identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NoteId(String);

impl NoteId {
    /// Create a note ID
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as string slice
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NoteId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NoteId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for NoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Paragraph identifier, unique within a note
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParagraphId(String);

impl ParagraphId {
    /// Create a paragraph ID
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as string slice
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ParagraphId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ParagraphId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for ParagraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Isolation boundary for angular objects
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    note: NoteId,
    paragraph: Option<ParagraphId>,
}

impl Scope {
    /// Note-level scope
    #[inline]
    #[must_use]
    pub fn note(note: impl Into<NoteId>) -> Self {
        Self {
            note: note.into(),
            paragraph: None,
        }
    }

    /// Paragraph-level scope
    #[inline]
    #[must_use]
    pub fn paragraph(note: impl Into<NoteId>, paragraph: impl Into<ParagraphId>) -> Self {
        Self {
            note: note.into(),
            paragraph: Some(paragraph.into()),
        }
    }

    /// Owning note
    #[inline]
    #[must_use]
    pub fn note_id(&self) -> &NoteId {
        &self.note
    }

    /// Owning paragraph, `None` for note-level scopes
    #[inline]
    #[must_use]
    pub fn paragraph_id(&self) -> Option<&ParagraphId> {
        self.paragraph.as_ref()
    }

    /// Check if this is a note-level scope
    #[inline]
    #[must_use]
    pub fn is_note_scope(&self) -> bool {
        self.paragraph.is_none()
    }

    /// Check if this scope belongs to the given note
    #[inline]
    #[must_use]
    pub fn belongs_to(&self, note: &NoteId) -> bool {
        &self.note == note
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.paragraph {
            Some(paragraph) => write!(f, "note:{}/paragraph:{}", self.note, paragraph),
            None => write!(f, "note:{}", self.note),
        }
    }
}
