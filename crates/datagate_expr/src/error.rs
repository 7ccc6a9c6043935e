//! Error types for the expression crate.

use thiserror::Error;

/// Result type for parsing.
pub type ExprResult<T> = Result<T, ExprError>;

/// Syntax errors. Every variant carries the byte offset into the source
/// where the problem was found.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExprError {
    /// A character that starts no token.
    #[error("unexpected character {ch:?} at offset {offset}")]
    UnexpectedChar {
        /// Byte offset.
        offset: usize,
        /// The offending character.
        ch: char,
    },

    /// A token that does not fit the grammar here.
    #[error("expected {expected} at offset {offset}, found {found}")]
    UnexpectedToken {
        /// Byte offset.
        offset: usize,
        /// What the parser wanted.
        expected: String,
        /// What it got.
        found: String,
    },

    /// Input ended in the middle of an expression.
    #[error("unexpected end of input at offset {offset}, expected {expected}")]
    UnexpectedEnd {
        /// Byte offset (the input length).
        offset: usize,
        /// What the parser wanted.
        expected: String,
    },

    /// A string literal without its closing quote.
    #[error("unterminated string starting at offset {offset}")]
    UnterminatedString {
        /// Offset of the opening quote.
        offset: usize,
    },

    /// A malformed escape sequence inside a string literal.
    #[error("invalid escape sequence at offset {offset}")]
    InvalidEscape {
        /// Offset of the backslash.
        offset: usize,
    },

    /// A numeric literal that does not fit the target type.
    #[error("invalid number {text:?} at offset {offset}")]
    InvalidNumber {
        /// Offset of the literal.
        offset: usize,
        /// The literal text.
        text: String,
    },
}

impl ExprError {
    /// Byte offset into the source where the error was detected.
    #[must_use]
    pub fn offset(&self) -> usize {
        match self {
            Self::UnexpectedChar { offset, .. }
            | Self::UnexpectedToken { offset, .. }
            | Self::UnexpectedEnd { offset, .. }
            | Self::UnterminatedString { offset }
            | Self::InvalidEscape { offset }
            | Self::InvalidNumber { offset, .. } => *offset,
        }
    }

    pub(crate) fn unexpected(offset: usize, expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::UnexpectedToken {
            offset,
            expected: expected.into(),
            found: found.into(),
        }
    }
}
