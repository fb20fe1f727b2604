//! Concurrent-operation transformation.
//!
//! `transform(a, b)` rewrites two operations produced against the same
//! document version so each can run after the other:
//!
//! ```text
//!        base ──a──► Da                 base ──b──► Db
//!          Da ──b'──► D                   Db ──a'──► D
//! ```
//!
//! Both replicas reach the identical document `D`. This is the convergence
//! property the whole sync layer rests on; `tests/algebra_properties.rs`
//! exercises it over randomized operation pairs.

use crate::error::OtError;
use crate::operation::{OpComponent, OpCursor, Operation};

/// Transform two concurrent operations against each other.
///
/// Both operations must be based on the same document version (equal source
/// lengths). Returns `(a', b')` where `a'` applies after `b` and `b'`
/// applies after `a`.
///
/// Concurrent inserts at the same position are ordered by origin id: the
/// lower id keeps the left position on every replica, so the tie resolves
/// identically everywhere without coordination.
pub fn transform(a: &Operation, b: &Operation) -> Result<(Operation, Operation), OtError> {
    if a.source_len() != b.source_len() {
        return Err(OtError::LengthMismatch {
            expected: a.source_len(),
            got: b.source_len(),
        });
    }

    let mut ca = OpCursor::new(a);
    let mut cb = OpCursor::new(b);
    let mut at = Operation::new(a.base_version + 1, a.origin);
    let mut bt = Operation::new(b.base_version + 1, b.origin);

    loop {
        let a_inserts = matches!(ca.peek(), Some(OpComponent::Insert(_)));
        let b_inserts = matches!(cb.peek(), Some(OpComponent::Insert(_)));

        // Inserts consume no source chars, so they are handled before the
        // pairwise walk. When both sides insert here, the origin order
        // decides which text lands first.
        if a_inserts && (!b_inserts || a.origin <= b.origin) {
            if let Some(OpComponent::Insert(s)) = ca.pop() {
                bt = bt.retain(s.chars().count());
                at = at.insert(s);
            }
            continue;
        }
        if b_inserts {
            if let Some(OpComponent::Insert(s)) = cb.pop() {
                at = at.retain(s.chars().count());
                bt = bt.insert(s);
            }
            continue;
        }

        let step = match (ca.peek(), cb.peek()) {
            (None, None) => break,
            (Some(x), Some(y)) => x.len().min(y.len()),
            // One walk ran out of source chars before the other; the length
            // precheck makes this unreachable for well-formed operations.
            _ => {
                return Err(OtError::LengthMismatch {
                    expected: a.source_len(),
                    got: b.source_len(),
                })
            }
        };

        match (ca.pop_at_most(step), cb.pop_at_most(step)) {
            (Some(OpComponent::Retain(_)), Some(OpComponent::Retain(_))) => {
                at = at.retain(step);
                bt = bt.retain(step);
            }
            // Both deleted the same chars; neither transformed op needs to.
            (Some(OpComponent::Delete(_)), Some(OpComponent::Delete(_))) => {}
            (Some(OpComponent::Retain(_)), Some(OpComponent::Delete(_))) => {
                bt = bt.delete(step);
            }
            (Some(OpComponent::Delete(_)), Some(OpComponent::Retain(_))) => {
                at = at.delete(step);
            }
            _ => {
                return Err(OtError::LengthMismatch {
                    expected: a.source_len(),
                    got: b.source_len(),
                })
            }
        }
    }

    Ok((at, bt))
}
