//! Subject rules shared by clients and brokers.
//!
//! Subjects are `.`-delimited token lists. Patterns may additionally use the
//! wildcards `*` (exactly one token) and `>` (one or more trailing tokens).

use thiserror::Error;

/// Single-token wildcard
pub const SINGLE_WILDCARD: &str = "*";

/// Trailing multi-token wildcard
pub const FULL_WILDCARD: &str = ">";

/// Validation error for subjects and subject patterns
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SubjectError {
    /// Subject or pattern is empty
    #[error("must not be empty")]
    Empty,

    /// Consecutive, leading or trailing delimiters
    #[error("empty tokens (consecutive dots) not allowed")]
    EmptyToken,

    /// Whitespace would break the wire protocol
    #[error("whitespace is not allowed")]
    Whitespace,

    /// A concrete subject contained a wildcard character
    #[error("wildcards are not allowed in a concrete subject")]
    Wildcard,

    /// `>` appeared somewhere other than the final token
    #[error("'>' wildcard can only appear as the last token")]
    MisplacedFullWildcard,
}

/// Validate a concrete (publishable) subject.
///
/// # Errors
///
/// Returns [`SubjectError`] when the subject is empty, has an empty token,
/// contains whitespace or contains a wildcard character.
pub fn validate_subject(subject: &str) -> Result<(), SubjectError> {
    check_common(subject)?;

    if subject.contains('*') || subject.contains('>') {
        return Err(SubjectError::Wildcard);
    }

    Ok(())
}

/// Validate a subscription pattern.
///
/// # Errors
///
/// Returns [`SubjectError`] when the pattern is empty, has an empty token,
/// contains whitespace or uses `>` before the last token.
pub fn validate_pattern(pattern: &str) -> Result<(), SubjectError> {
    check_common(pattern)?;

    let tokens: Vec<&str> = pattern.split('.').collect();
    let last = tokens.len() - 1;
    if tokens
        .iter()
        .enumerate()
        .any(|(i, token)| *token == FULL_WILDCARD && i != last)
    {
        return Err(SubjectError::MisplacedFullWildcard);
    }

    Ok(())
}

fn check_common(value: &str) -> Result<(), SubjectError> {
    if value.is_empty() {
        return Err(SubjectError::Empty);
    }

    if value.chars().any(char::is_whitespace) {
        return Err(SubjectError::Whitespace);
    }

    if value.split('.').any(str::is_empty) {
        return Err(SubjectError::EmptyToken);
    }

    Ok(())
}

/// Check if a concrete subject matches a pattern.
///
/// Matching is case-sensitive and token based:
/// - `*` matches exactly one token
/// - a trailing `>` matches one or more remaining tokens
/// - any other token matches literally
#[must_use]
pub fn subject_matches_pattern(subject: &str, pattern: &str) -> bool {
    if subject == pattern {
        return true;
    }

    let mut subject_tokens = subject.split('.');
    let mut pattern_tokens = pattern.split('.').peekable();

    while let Some(pattern_token) = pattern_tokens.next() {
        if pattern_token == FULL_WILDCARD && pattern_tokens.peek().is_none() {
            return subject_tokens.next().is_some();
        }

        match subject_tokens.next() {
            Some(subject_token)
                if pattern_token == SINGLE_WILDCARD || pattern_token == subject_token => {}
            _ => return false,
        }
    }

    subject_tokens.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(subject_matches_pattern("orders.new", "orders.new"));
        assert!(!subject_matches_pattern("orders.new", "orders.old"));
        assert!(!subject_matches_pattern("Orders.new", "orders.new"));
    }

    #[test]
    fn test_single_wildcard() {
        assert!(subject_matches_pattern("a.b.c", "a.*.c"));
        assert!(!subject_matches_pattern("a.b.c.d", "a.*.c"));
        assert!(subject_matches_pattern("orders.new", "orders.*"));
        assert!(!subject_matches_pattern("orders", "orders.*"));
        assert!(!subject_matches_pattern("orders.new.item", "orders.*"));
    }

    #[test]
    fn test_full_wildcard() {
        assert!(subject_matches_pattern("a.b", "a.>"));
        assert!(subject_matches_pattern("a.b.c", "a.>"));
        assert!(!subject_matches_pattern("a", "a.>"));
        assert!(!subject_matches_pattern("b.c", "a.>"));
        assert!(subject_matches_pattern("anything.at.all", ">"));
    }

    #[test]
    fn test_combined_wildcards() {
        assert!(subject_matches_pattern("orders.us.new", "orders.*.>"));
        assert!(subject_matches_pattern("orders.us.new.item", "orders.*.>"));
        assert!(!subject_matches_pattern("orders.new", "orders.*.>"));
    }

    #[test]
    fn test_validate_pattern() {
        assert_eq!(validate_pattern(""), Err(SubjectError::Empty));
        assert_eq!(validate_pattern("a..b"), Err(SubjectError::EmptyToken));
        assert_eq!(validate_pattern(".a"), Err(SubjectError::EmptyToken));
        assert_eq!(validate_pattern("a."), Err(SubjectError::EmptyToken));
        assert_eq!(
            validate_pattern("a.>.b"),
            Err(SubjectError::MisplacedFullWildcard)
        );
        assert_eq!(validate_pattern("a b"), Err(SubjectError::Whitespace));
        assert!(validate_pattern("a.*.>").is_ok());
        assert!(validate_pattern(">").is_ok());
    }

    #[test]
    fn test_validate_subject() {
        assert!(validate_subject("orders.new").is_ok());
        assert_eq!(validate_subject("orders.*"), Err(SubjectError::Wildcard));
        assert_eq!(validate_subject("orders.>"), Err(SubjectError::Wildcard));
        assert_eq!(validate_subject(""), Err(SubjectError::Empty));
        assert_eq!(validate_subject("a..b"), Err(SubjectError::EmptyToken));
    }
}
