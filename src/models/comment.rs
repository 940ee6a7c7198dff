//! Review comment model and in-memory thread arena.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use std::collections::HashMap;
use std::fmt;

/// Which side of the diff a comment is anchored to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum CommentSide {
    Parent,
    Revision,
}

impl From<&str> for CommentSide {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "PARENT" => Self::Parent,
            _ => Self::Revision,
        }
    }
}

/// Sync state of a comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum CommentStatus {
    /// Created offline; an `AddComment` entry is queued.
    LocalOnly,
    /// Handed to the server at least once without confirmation yet.
    SyncPending,
    Synced,
    /// The operation carrying this comment failed terminally.
    SyncFailed,
    /// Diverged from a remote copy; see the change's conflicts.
    ConflictDetected,
    /// A synced comment edited locally; an `UpdateComment` entry is queued.
    ModifiedLocally,
}

impl CommentStatus {
    /// Whether local content exists that the server has not confirmed.
    pub fn has_unsynced_content(self) -> bool {
        !matches!(self, Self::Synced)
    }
}

impl fmt::Display for CommentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalOnly => write!(f, "local_only"),
            Self::SyncPending => write!(f, "sync_pending"),
            Self::Synced => write!(f, "synced"),
            Self::SyncFailed => write!(f, "sync_failed"),
            Self::ConflictDetected => write!(f, "conflict_detected"),
            Self::ModifiedLocally => write!(f, "modified_locally"),
        }
    }
}

/// Character range a comment applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentRange {
    pub start_line: i64,
    pub start_character: i64,
    pub end_line: i64,
    pub end_character: i64,
}

/// Lines of a file covered by a comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineSpan {
    /// File-level comment; covers every line.
    WholeFile,
    /// Inclusive line interval.
    Lines { start: i64, end: i64 },
}

impl LineSpan {
    pub fn new(line: Option<i64>, range: Option<&CommentRange>) -> Self {
        match (range, line) {
            (Some(r), _) => Self::Lines {
                start: r.start_line,
                end: r.end_line,
            },
            (None, Some(line)) => Self::Lines { start: line, end: line },
            (None, None) => Self::WholeFile,
        }
    }

    pub fn overlaps(&self, other: &LineSpan) -> bool {
        match (self, other) {
            (Self::WholeFile, _) | (_, Self::WholeFile) => true,
            (Self::Lines { start: a0, end: a1 }, Self::Lines { start: b0, end: b1 }) => {
                a0 <= b1 && b0 <= a1
            }
        }
    }
}

/// Split form of `content_hash`: the message digest and the unresolved flag
/// are compared independently so edits to disjoint fields can be told apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentFingerprint {
    pub message_digest: String,
    pub unresolved: bool,
}

impl ContentFingerprint {
    pub fn of(message: &str, unresolved: bool) -> Self {
        let digest = Sha256::digest(message.as_bytes());
        let message_digest = digest.iter().map(|b| format!("{:02x}", b)).collect();
        Self {
            message_digest,
            unresolved,
        }
    }

    /// Parse a stored hash. Returns `None` for malformed input.
    pub fn parse(s: &str) -> Option<Self> {
        let (digest, flag) = s.rsplit_once(':')?;
        let unresolved = match flag {
            "1" => true,
            "0" => false,
            _ => return None,
        };
        Some(Self {
            message_digest: digest.to_string(),
            unresolved,
        })
    }

    pub fn encode(&self) -> String {
        format!("{}:{}", self.message_digest, u8::from(self.unresolved))
    }

    /// Which fields differ from `base`.
    pub fn changed_fields(&self, base: &ContentFingerprint) -> ChangedFields {
        ChangedFields {
            message: self.message_digest != base.message_digest,
            unresolved: self.unresolved != base.unresolved,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangedFields {
    pub message: bool,
    pub unresolved: bool,
}

impl ChangedFields {
    pub fn any(&self) -> bool {
        self.message || self.unresolved
    }

    pub fn is_disjoint(&self, other: &ChangedFields) -> bool {
        !(self.message && other.message) && !(self.unresolved && other.unresolved)
    }
}

/// A review comment.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Comment {
    pub id: i64,
    pub change_id: i64,
    pub patch_set_id: i64,
    pub file_path: String,
    pub side: CommentSide,

    /// Anchor line; `None` for file-level comments.
    pub line: Option<i64>,

    pub start_line: Option<i64>,
    pub start_character: Option<i64>,
    pub end_line: Option<i64>,
    pub end_character: Option<i64>,

    pub message: String,
    pub author: String,
    pub unresolved: bool,
    pub status: CommentStatus,

    /// Server-side comment UUID once known.
    pub remote_id: Option<String>,

    /// Local id of the comment this one replies to (same change).
    pub parent_id: Option<i64>,

    /// Removed locally; retained while replies or a pending delete reference it.
    pub deleted: bool,

    /// Fingerprint of the current content (see [`ContentFingerprint`]).
    pub content_hash: String,

    /// Fingerprint at the last confirmed sync.
    pub base_hash: Option<String>,

    pub created_at: i64,
    pub updated_at: i64,
}

impl Comment {
    pub fn range(&self) -> Option<CommentRange> {
        Some(CommentRange {
            start_line: self.start_line?,
            start_character: self.start_character?,
            end_line: self.end_line?,
            end_character: self.end_character?,
        })
    }

    pub fn span(&self) -> LineSpan {
        LineSpan::new(self.line, self.range().as_ref())
    }

    pub fn fingerprint(&self) -> ContentFingerprint {
        ContentFingerprint::of(&self.message, self.unresolved)
    }

    pub fn base_fingerprint(&self) -> Option<ContentFingerprint> {
        self.base_hash.as_deref().and_then(ContentFingerprint::parse)
    }
}

/// Comments of a change arranged into reply threads.
///
/// Comments live in one arena; parent/child links are arena indices, with an
/// id → index map for lookups. A reply whose parent is missing is treated as
/// a thread root.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CommentThreads {
    comments: Vec<Comment>,
    roots: Vec<usize>,
    children: Vec<Vec<usize>>,
    #[serde(skip)]
    index: HashMap<i64, usize>,
}

impl CommentThreads {
    /// Build the arena. Input order is preserved within each sibling list,
    /// so callers pass comments sorted by creation time.
    pub fn from_comments(comments: Vec<Comment>) -> Self {
        let index: HashMap<i64, usize> =
            comments.iter().enumerate().map(|(i, c)| (c.id, i)).collect();
        let mut children = vec![Vec::new(); comments.len()];
        let mut roots = Vec::new();

        for (i, comment) in comments.iter().enumerate() {
            match comment.parent_id.and_then(|p| index.get(&p)) {
                Some(&parent) if parent != i => children[parent].push(i),
                _ => roots.push(i),
            }
        }

        Self {
            comments,
            roots,
            children,
            index,
        }
    }

    pub fn len(&self) -> usize {
        self.comments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.comments.is_empty()
    }

    pub fn get(&self, id: i64) -> Option<&Comment> {
        self.index.get(&id).map(|&i| &self.comments[i])
    }

    pub fn roots(&self) -> impl Iterator<Item = &Comment> {
        self.roots.iter().map(move |&i| &self.comments[i])
    }

    /// Direct replies to `id`.
    pub fn replies(&self, id: i64) -> impl Iterator<Item = &Comment> {
        let slots: &[usize] = self
            .index
            .get(&id)
            .map(|&i| self.children[i].as_slice())
            .unwrap_or(&[]);
        slots.iter().map(move |&i| &self.comments[i])
    }

    /// The thread rooted at `root_id`, depth-first.
    pub fn thread(&self, root_id: i64) -> Vec<&Comment> {
        let mut out = Vec::new();
        let Some(&start) = self.index.get(&root_id) else {
            return out;
        };
        let mut stack = vec![start];
        while let Some(i) = stack.pop() {
            out.push(&self.comments[i]);
            stack.extend(self.children[i].iter().rev());
        }
        out
    }

    /// Whether the thread containing `id` ends unresolved (last reply wins).
    pub fn is_unresolved(&self, root_id: i64) -> bool {
        self.thread(root_id)
            .iter()
            .filter(|c| !c.deleted)
            .max_by_key(|c| (c.created_at, c.id))
            .map_or(false, |c| c.unresolved)
    }
}
