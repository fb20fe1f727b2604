//! Operation component model.
//!
//! An operation is an ordered walk over a document: `Retain` skips chars,
//! `Insert` adds new text at the current position, `Delete` removes the next
//! chars. Applied left to right, the walk must account for every char of the
//! source document. All lengths and positions are counted in chars (Unicode
//! scalar values), never bytes, so multi-byte text transforms identically on
//! every replica.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::OtError;

/// One step of an operation's walk over the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpComponent {
    /// Keep the next `n` chars unchanged.
    Retain(usize),
    /// Insert text at the current position.
    Insert(String),
    /// Remove the next `n` chars.
    Delete(usize),
}

impl OpComponent {
    /// Length of the component in chars.
    pub fn len(&self) -> usize {
        match self {
            Self::Retain(n) | Self::Delete(n) => *n,
            Self::Insert(s) => s.chars().count(),
        }
    }

    /// True for zero-length components, which have no effect.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Retain(n) | Self::Delete(n) => *n == 0,
            Self::Insert(s) => s.is_empty(),
        }
    }
}

/// An edit to a document, expressed as a component walk plus the metadata
/// needed to order it against concurrent edits.
///
/// `base_version` is the document version the operation was produced
/// against; `origin` identifies the session that produced it and breaks
/// ties between concurrent inserts at the same position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    components: Vec<OpComponent>,
    pub base_version: u64,
    pub origin: Uuid,
}

impl Operation {
    /// Create an empty operation against `base_version`.
    pub fn new(base_version: u64, origin: Uuid) -> Self {
        Self {
            components: Vec::new(),
            base_version,
            origin,
        }
    }

    /// Append a retain, merging into a trailing retain.
    pub fn retain(mut self, n: usize) -> Self {
        self.push(OpComponent::Retain(n));
        self
    }

    /// Append an insert, merging into a trailing insert.
    pub fn insert(mut self, text: impl Into<String>) -> Self {
        self.push(OpComponent::Insert(text.into()));
        self
    }

    /// Append a delete, merging into a trailing delete.
    pub fn delete(mut self, n: usize) -> Self {
        self.push(OpComponent::Delete(n));
        self
    }

    /// The component walk, in application order.
    pub fn components(&self) -> &[OpComponent] {
        &self.components
    }

    /// Length of the document this operation applies to, in chars
    /// (sum of retains and deletes).
    pub fn source_len(&self) -> usize {
        self.components
            .iter()
            .map(|c| match c {
                OpComponent::Retain(n) | OpComponent::Delete(n) => *n,
                OpComponent::Insert(_) => 0,
            })
            .sum()
    }

    /// Length of the document this operation produces, in chars
    /// (sum of retains and inserts).
    pub fn target_len(&self) -> usize {
        self.components
            .iter()
            .map(|c| match c {
                OpComponent::Retain(n) => *n,
                OpComponent::Insert(s) => s.chars().count(),
                OpComponent::Delete(_) => 0,
            })
            .sum()
    }

    /// True when applying the operation would leave any document unchanged.
    pub fn is_identity(&self) -> bool {
        self.components
            .iter()
            .all(|c| matches!(c, OpComponent::Retain(_)) || c.is_empty())
    }

    /// Apply the operation to `content`, producing the edited text.
    ///
    /// Fails with [`OtError::LengthMismatch`] when the operation does not
    /// account for exactly `content.chars().count()` chars.
    pub fn apply(&self, content: &str) -> Result<String, OtError> {
        let src_len = content.chars().count();
        if src_len != self.source_len() {
            return Err(OtError::LengthMismatch {
                expected: self.source_len(),
                got: src_len,
            });
        }

        let mut out = String::with_capacity(content.len());
        let mut chars = content.chars();
        for component in &self.components {
            match component {
                OpComponent::Retain(n) => out.extend(chars.by_ref().take(*n)),
                OpComponent::Insert(s) => out.push_str(s),
                OpComponent::Delete(n) => chars.by_ref().take(*n).for_each(drop),
            }
        }
        Ok(out)
    }

    /// Build the inverse operation against the pre-image `content`: applying
    /// the result to `self.apply(content)` restores `content`.
    ///
    /// The inverse is based against the version this operation produced.
    pub fn invert(&self, content: &str) -> Result<Operation, OtError> {
        let src_len = content.chars().count();
        if src_len != self.source_len() {
            return Err(OtError::LengthMismatch {
                expected: self.source_len(),
                got: src_len,
            });
        }

        let mut inv = Operation::new(self.base_version + 1, self.origin);
        let mut chars = content.chars();
        for component in &self.components {
            match component {
                OpComponent::Retain(n) => {
                    chars.by_ref().take(*n).for_each(drop);
                    inv = inv.retain(*n);
                }
                OpComponent::Insert(s) => {
                    inv = inv.delete(s.chars().count());
                }
                OpComponent::Delete(n) => {
                    let deleted: String = chars.by_ref().take(*n).collect();
                    inv = inv.insert(deleted);
                }
            }
        }
        Ok(inv)
    }

    /// Canonicalize the component walk: drop empty components and merge
    /// same-kind neighbors. Pure and idempotent; operations built through
    /// the builder methods are already canonical, so this matters for
    /// operations that arrived over the wire.
    pub fn optimize(self) -> Operation {
        let mut out = Operation::new(self.base_version, self.origin);
        for component in self.components {
            out.push(component);
        }
        out
    }

    fn push(&mut self, component: OpComponent) {
        if component.is_empty() {
            return;
        }
        match (self.components.last_mut(), component) {
            (Some(OpComponent::Retain(a)), OpComponent::Retain(b)) => *a += b,
            (Some(OpComponent::Delete(a)), OpComponent::Delete(b)) => *a += b,
            (Some(OpComponent::Insert(a)), OpComponent::Insert(b)) => a.push_str(&b),
            (_, component) => self.components.push(component),
        }
    }
}

/// Consuming cursor over an operation's components.
///
/// Splits components on demand so compose and transform can walk two
/// operations in lockstep over differently-aligned component boundaries.
pub(crate) struct OpCursor {
    queue: VecDeque<OpComponent>,
}

impl OpCursor {
    pub(crate) fn new(op: &Operation) -> Self {
        Self {
            queue: op.components().iter().cloned().collect(),
        }
    }

    pub(crate) fn peek(&self) -> Option<&OpComponent> {
        self.queue.front()
    }

    /// Pop the front component whole.
    pub(crate) fn pop(&mut self) -> Option<OpComponent> {
        self.queue.pop_front()
    }

    /// Pop up to `max` chars from the front component, splitting it in place
    /// when it is longer. Insert text splits on char boundaries.
    pub(crate) fn pop_at_most(&mut self, max: usize) -> Option<OpComponent> {
        let front = self.queue.pop_front()?;
        if front.len() <= max {
            return Some(front);
        }
        let (taken, rest) = match front {
            OpComponent::Retain(n) => (OpComponent::Retain(max), OpComponent::Retain(n - max)),
            OpComponent::Delete(n) => (OpComponent::Delete(max), OpComponent::Delete(n - max)),
            OpComponent::Insert(s) => {
                let split = s
                    .char_indices()
                    .nth(max)
                    .map(|(i, _)| i)
                    .unwrap_or(s.len());
                let rest = s[split..].to_string();
                let mut head = s;
                head.truncate(split);
                (OpComponent::Insert(head), OpComponent::Insert(rest))
            }
        };
        self.queue.push_front(rest);
        Some(taken)
    }
}
