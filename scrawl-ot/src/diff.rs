//! Text diffing and edit-span conflict detection.
//!
//! `diff` produces the single-span operation between two text states by
//! trimming the common prefix and suffix. It is not a minimal multi-span
//! diff; the sync layer only needs it to express "what did this replica
//! change since the last common base" when incremental history is gone.
//!
//! `conflicts` reports whether two operations against the same base touch
//! overlapping spans, which is the line between automatic reconciliation
//! and asking a human to merge.

use uuid::Uuid;

use crate::operation::{OpComponent, Operation};

/// Compute the operation that rewrites `before` into `after`.
///
/// The result retains the common prefix, deletes the changed middle of
/// `before`, inserts the changed middle of `after`, and retains the common
/// suffix. `diff(a, b).apply(a) == b` always holds.
pub fn diff(before: &str, after: &str, base_version: u64, origin: Uuid) -> Operation {
    let b: Vec<char> = before.chars().collect();
    let a: Vec<char> = after.chars().collect();

    let mut prefix = 0;
    while prefix < b.len() && prefix < a.len() && b[prefix] == a[prefix] {
        prefix += 1;
    }

    let mut suffix = 0;
    while suffix < b.len() - prefix
        && suffix < a.len() - prefix
        && b[b.len() - 1 - suffix] == a[a.len() - 1 - suffix]
    {
        suffix += 1;
    }

    let deleted = b.len() - prefix - suffix;
    let inserted: String = a[prefix..a.len() - suffix].iter().collect();

    Operation::new(base_version, origin)
        .retain(prefix)
        .delete(deleted)
        .insert(inserted)
        .retain(suffix)
}

/// True when two operations against the same base edit overlapping spans.
///
/// Overlap means intersecting delete ranges, or an insert strictly inside
/// the other operation's deleted range. Inserts at the same position do not
/// conflict; the transform tie-break orders them deterministically.
pub fn conflicts(a: &Operation, b: &Operation) -> bool {
    let (deletes_a, inserts_a) = edit_spans(a);
    let (deletes_b, inserts_b) = edit_spans(b);

    for &(s1, e1) in &deletes_a {
        for &(s2, e2) in &deletes_b {
            if s1 < e2 && s2 < e1 {
                return true;
            }
        }
    }
    for &p in &inserts_a {
        if deletes_b.iter().any(|&(s, e)| s < p && p < e) {
            return true;
        }
    }
    for &p in &inserts_b {
        if deletes_a.iter().any(|&(s, e)| s < p && p < e) {
            return true;
        }
    }
    false
}

/// Deleted ranges and insert positions of an operation, in source
/// coordinates.
fn edit_spans(op: &Operation) -> (Vec<(usize, usize)>, Vec<usize>) {
    let mut deletes = Vec::new();
    let mut inserts = Vec::new();
    let mut pos = 0usize;

    for component in op.components() {
        match component {
            OpComponent::Retain(n) => pos += n,
            OpComponent::Insert(_) => inserts.push(pos),
            OpComponent::Delete(n) => {
                deletes.push((pos, pos + n));
                pos += n;
            }
        }
    }
    (deletes, inserts)
}
