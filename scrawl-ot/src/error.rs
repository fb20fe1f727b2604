//! Algebra errors.

/// Errors produced by the operation algebra.
///
/// Every function that consumes document content or pairs two operations
/// checks length agreement first and refuses to produce partial results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtError {
    /// An operation's source length disagrees with what it is paired with:
    /// the document it is applied to, or the other operand of a
    /// compose/transform. Lengths are in chars.
    LengthMismatch { expected: usize, got: usize },
}

impl std::fmt::Display for OtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LengthMismatch { expected, got } => {
                write!(f, "Length mismatch: operation expects {expected} chars, got {got}")
            }
        }
    }
}

impl std::error::Error for OtError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_lengths() {
        let err = OtError::LengthMismatch { expected: 10, got: 7 };
        let msg = err.to_string();
        assert!(msg.contains("10"));
        assert!(msg.contains("7"));
    }
}
