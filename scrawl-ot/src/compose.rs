//! Sequential-operation composition.
//!
//! `compose(a, b)` collapses "apply `a`, then apply `b`" into one operation,
//! so a chain of edits can travel or be stored as a single walk. History
//! folding and the offline snapshot fallback both lean on this.

use crate::error::OtError;
use crate::operation::{OpComponent, OpCursor, Operation};

/// Compose two sequential operations into one.
///
/// `b` must apply to the document `a` produces (`b.source_len() ==
/// a.target_len()`). The result keeps `a`'s base version and origin and
/// satisfies `compose(a, b).apply(d) == b.apply(&a.apply(d))` for every
/// document `d` that `a` accepts.
pub fn compose(a: &Operation, b: &Operation) -> Result<Operation, OtError> {
    if a.target_len() != b.source_len() {
        return Err(OtError::LengthMismatch {
            expected: a.target_len(),
            got: b.source_len(),
        });
    }

    let mut ca = OpCursor::new(a);
    let mut cb = OpCursor::new(b);
    let mut out = Operation::new(a.base_version, a.origin);

    loop {
        // a's deletes remove source chars b never saw.
        if matches!(ca.peek(), Some(OpComponent::Delete(_))) {
            if let Some(OpComponent::Delete(n)) = ca.pop() {
                out = out.delete(n);
            }
            continue;
        }
        // b's inserts land whatever a produced around them.
        if matches!(cb.peek(), Some(OpComponent::Insert(_))) {
            if let Some(OpComponent::Insert(s)) = cb.pop() {
                out = out.insert(s);
            }
            continue;
        }

        let step = match (ca.peek(), cb.peek()) {
            (None, None) => break,
            (Some(x), Some(y)) => x.len().min(y.len()),
            // a produced chars b does not account for, or vice versa; the
            // length precheck makes this unreachable for well-formed input.
            _ => {
                return Err(OtError::LengthMismatch {
                    expected: a.target_len(),
                    got: b.source_len(),
                })
            }
        };

        match (ca.pop_at_most(step), cb.pop_at_most(step)) {
            (Some(OpComponent::Retain(_)), Some(OpComponent::Retain(_))) => {
                out = out.retain(step);
            }
            (Some(OpComponent::Retain(_)), Some(OpComponent::Delete(_))) => {
                out = out.delete(step);
            }
            (Some(OpComponent::Insert(s)), Some(OpComponent::Retain(_))) => {
                out = out.insert(s);
            }
            // a inserted text b deleted again; it never existed downstream.
            (Some(OpComponent::Insert(_)), Some(OpComponent::Delete(_))) => {}
            _ => {
                return Err(OtError::LengthMismatch {
                    expected: a.target_len(),
                    got: b.source_len(),
                })
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn origin() -> Uuid {
        Uuid::from_u128(42)
    }

    #[test]
    fn test_compose_insert_then_delete_elsewhere() {
        let base = "hello world";
        let a = Operation::new(0, origin()).retain(5).insert(",").retain(6);
        let b = Operation::new(1, origin()).retain(7).delete(5).insert("there");

        let composed = compose(&a, &b).unwrap();
        let direct = b.apply(&a.apply(base).unwrap()).unwrap();
        assert_eq!(composed.apply(base).unwrap(), direct);
        assert_eq!(direct, "hello, there");
    }

    #[test]
    fn test_compose_cancels_insert_deleted_by_b() {
        let base = "abc";
        let a = Operation::new(0, origin()).retain(1).insert("XY").retain(2);
        let b = Operation::new(1, origin()).retain(1).delete(2).retain(2);

        let composed = compose(&a, &b).unwrap();
        assert!(composed.is_identity());
        assert_eq!(composed.apply(base).unwrap(), base);
    }

    #[test]
    fn test_compose_adjacent_deletes_merge() {
        let base = "0123456789";
        let a = Operation::new(0, origin()).retain(2).delete(3).retain(5);
        let b = Operation::new(1, origin()).retain(2).delete(2).retain(3);

        let composed = compose(&a, &b).unwrap();
        assert_eq!(
            composed.components(),
            &[
                OpComponent::Retain(2),
                OpComponent::Delete(5),
                OpComponent::Retain(3),
            ]
        );
        assert_eq!(composed.apply(base).unwrap(), "01789");
    }

    #[test]
    fn test_compose_length_mismatch() {
        let a = Operation::new(0, origin()).retain(3);
        let b = Operation::new(1, origin()).retain(5);
        assert!(compose(&a, &b).is_err());
    }

    #[test]
    fn test_compose_keeps_first_operand_metadata() {
        let a = Operation::new(9, Uuid::from_u128(1)).insert("x");
        let b = Operation::new(10, Uuid::from_u128(2)).retain(1).insert("y");

        let composed = compose(&a, &b).unwrap();
        assert_eq!(composed.base_version, 9);
        assert_eq!(composed.origin, Uuid::from_u128(1));
        assert_eq!(composed.apply("").unwrap(), "xy");
    }

    #[test]
    fn test_compose_associative() {
        let base = "collaborate";
        let a = Operation::new(0, origin()).retain(3).insert("!").retain(8);
        let b = Operation::new(1, origin()).retain(5).delete(2).retain(5);
        let c = Operation::new(2, origin()).delete(1).insert("C").retain(9);

        let left = compose(&compose(&a, &b).unwrap(), &c).unwrap();
        let right = compose(&a, &compose(&b, &c).unwrap()).unwrap();

        assert_eq!(left.apply(base).unwrap(), right.apply(base).unwrap());
        assert_eq!(left.components(), right.components());
    }

    #[test]
    fn test_compose_multibyte() {
        let base = "käse";
        let a = Operation::new(0, origin()).retain(1).delete(1).insert("a").retain(2);
        let b = Operation::new(1, origin()).retain(4).insert("!");

        let composed = compose(&a, &b).unwrap();
        assert_eq!(composed.apply(base).unwrap(), "kase!");
    }
}
