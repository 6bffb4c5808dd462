//! Revision identifiers, flags, and the revision record itself.

use crate::error::{TreeError, TreeResult};
use std::cmp::Ordering;
use std::fmt;

/// A revision identifier: a short ASCII token beginning with a generation
/// integer, e.g. `"1-11111111"` or `"2-cc"`.
///
/// Revision IDs order first by generation, then lexicographically by the
/// suffix after the dash. This ordering decides priority among sibling
/// leaves when a document is in conflict.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RevId(String);

impl RevId {
    /// Parses and validates a revision ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is empty, longer than 255 bytes,
    /// not ASCII, or does not start with a nonzero generation number
    /// followed by `-`.
    pub fn parse(token: impl Into<String>) -> TreeResult<Self> {
        let token = token.into();
        if token.is_empty() || token.len() > u8::MAX as usize || !token.is_ascii() {
            return Err(TreeError::BadRevId(token));
        }
        let Some(dash) = token.find('-') else {
            return Err(TreeError::BadRevId(token));
        };
        let gen = &token[..dash];
        if gen.is_empty() || !gen.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TreeError::BadRevId(token));
        }
        if gen.parse::<u64>().map(|g| g == 0).unwrap_or(true) {
            return Err(TreeError::BadRevId(token));
        }
        if token[dash + 1..].is_empty() {
            return Err(TreeError::BadRevId(token));
        }
        Ok(Self(token))
    }

    /// Returns the generation number (the integer before the dash).
    #[must_use]
    pub fn generation(&self) -> u64 {
        let dash = self.0.find('-').expect("validated at parse");
        self.0[..dash].parse().expect("validated at parse")
    }

    /// Returns the digest suffix (the part after the dash).
    #[must_use]
    pub fn suffix(&self) -> &str {
        let dash = self.0.find('-').expect("validated at parse");
        &self.0[dash + 1..]
    }

    /// Returns the full token as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the token bytes as written in the encoded record.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Ord for RevId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation()
            .cmp(&other.generation())
            .then_with(|| self.suffix().cmp(other.suffix()))
    }
}

impl PartialOrd for RevId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Flag bits carried by a revision.
///
/// Only `LEAF`, `DELETED`, and `HAS_ATTACHMENTS` are persisted by the
/// codec; `NEW` and `KEEP_BODY` are runtime state. The high bits 0x40 and
/// 0x80 are reserved for the codec's private use and never appear here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RevFlags(u8);

impl RevFlags {
    /// The revision is a deleted tombstone.
    pub const DELETED: RevFlags = RevFlags(0x01);
    /// The revision has no children.
    pub const LEAF: RevFlags = RevFlags(0x02);
    /// The revision was added since the tree was last saved.
    pub const NEW: RevFlags = RevFlags(0x04);
    /// The revision body references binary attachments.
    pub const HAS_ATTACHMENTS: RevFlags = RevFlags(0x08);
    /// The revision body must be retained even after it stops being a leaf.
    pub const KEEP_BODY: RevFlags = RevFlags(0x10);

    /// Bits that survive a round-trip through the codec.
    pub const PERSISTENT: RevFlags = RevFlags(0x01 | 0x02 | 0x08);

    /// Creates an empty flag set.
    #[must_use]
    pub const fn empty() -> Self {
        RevFlags(0)
    }

    /// Creates a flag set from raw bits, masking out unknown bits.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        RevFlags(bits & 0x1F)
    }

    /// Returns the raw bits.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Returns true if all bits of `other` are set in `self`.
    #[must_use]
    pub const fn contains(self, other: RevFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns the union of both flag sets.
    #[must_use]
    pub const fn union(self, other: RevFlags) -> Self {
        RevFlags(self.0 | other.0)
    }

    /// Returns `self` with the bits of `other` cleared.
    #[must_use]
    pub const fn without(self, other: RevFlags) -> Self {
        RevFlags(self.0 & !other.0)
    }

    /// Returns only the bits that the codec persists.
    #[must_use]
    pub const fn persistent(self) -> Self {
        RevFlags(self.0 & Self::PERSISTENT.0)
    }
}

impl std::ops::BitOr for RevFlags {
    type Output = RevFlags;
    fn bitor(self, rhs: RevFlags) -> RevFlags {
        self.union(rhs)
    }
}

/// The body of a revision: inline bytes, a back-reference into a prior
/// on-disk record, or nothing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RevBody {
    /// No body is stored for this revision.
    #[default]
    None,
    /// The body bytes are stored inline in the tree record.
    Inline(Vec<u8>),
    /// The body lives in an earlier record at the given file offset.
    Stored {
        /// File offset of the record holding the body.
        offset: u64,
        /// Size of the body in bytes.
        size: u64,
    },
}

impl RevBody {
    /// Returns the inline body bytes, if present.
    #[must_use]
    pub fn inline(&self) -> Option<&[u8]> {
        match self {
            RevBody::Inline(b) => Some(b),
            _ => None,
        }
    }

    /// Returns true if this is `RevBody::None`.
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, RevBody::None)
    }
}

/// One revision of a document.
///
/// The parent link is an index into the owning [`RevTree`](crate::RevTree)'s
/// arena; the root has no parent. Within an encoded tree every non-root
/// parent index refers to an earlier record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    /// The revision's identifier.
    pub rev_id: RevId,
    /// Index of the parent revision in the owning tree, if any.
    pub parent: Option<u16>,
    /// Flag bits.
    pub flags: RevFlags,
    /// Local sequence number under which this revision was recorded.
    pub sequence: u64,
    /// The revision body.
    pub body: RevBody,
}

impl Revision {
    /// Creates a new revision with the given ID, no parent, and no body.
    #[must_use]
    pub fn new(rev_id: RevId) -> Self {
        Self {
            rev_id,
            parent: None,
            flags: RevFlags::empty(),
            sequence: 0,
            body: RevBody::None,
        }
    }

    /// Returns true if the revision is a leaf.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.flags.contains(RevFlags::LEAF)
    }

    /// Returns true if the revision is a deletion tombstone.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.flags.contains(RevFlags::DELETED)
    }

    /// Returns true if the revision is an active (non-deleted) leaf.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.is_leaf() && !self.is_deleted()
    }

    /// Priority ordering used when sorting a tree for encoding:
    /// leaves before non-leaves, non-deleted before deleted, then by
    /// descending revision ID.
    #[must_use]
    pub fn priority_cmp(&self, other: &Self) -> Ordering {
        other
            .is_leaf()
            .cmp(&self.is_leaf())
            .then_with(|| self.is_deleted().cmp(&other.is_deleted()))
            .then_with(|| other.rev_id.cmp(&self.rev_id))
    }
}
