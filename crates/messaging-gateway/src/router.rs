//! Subject router
//!
//! Patterns are stored in a token trie so indexing and removal cost is
//! proportional to the pattern length. Matching walks the literal branch and
//! the `*` branch for every token and collects `>` entries on the way down.

use std::collections::{BTreeSet, HashMap};

use proven_transport::subject::{FULL_WILDCARD, SINGLE_WILDCARD, validate_pattern};
use tracing::trace;

use crate::error::{GatewayError, GatewayResult};
use crate::message::SubscriptionId;

#[derive(Debug, Default)]
struct Node {
    literals: HashMap<String, Node>,
    single: Option<Box<Node>>,
    /// Patterns ending in `>` at this depth
    full: BTreeSet<SubscriptionId>,
    /// Patterns ending exactly at this depth
    terminal: BTreeSet<SubscriptionId>,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.literals.is_empty()
            && self.single.is_none()
            && self.full.is_empty()
            && self.terminal.is_empty()
    }

    fn insert(&mut self, tokens: &[&str], id: SubscriptionId) {
        match tokens.split_first() {
            None => {
                self.terminal.insert(id);
            }
            Some((&FULL_WILDCARD, [])) => {
                self.full.insert(id);
            }
            Some((&SINGLE_WILDCARD, rest)) => {
                self.single.get_or_insert_with(Box::default).insert(rest, id);
            }
            Some((token, rest)) => {
                self.literals
                    .entry((*token).to_string())
                    .or_default()
                    .insert(rest, id);
            }
        }
    }

    /// Remove `id` along the pattern path, pruning branches left empty.
    fn remove(&mut self, tokens: &[&str], id: SubscriptionId) -> bool {
        match tokens.split_first() {
            None => self.terminal.remove(&id),
            Some((&FULL_WILDCARD, [])) => self.full.remove(&id),
            Some((&SINGLE_WILDCARD, rest)) => {
                let Some(child) = self.single.as_mut() else {
                    return false;
                };
                let removed = child.remove(rest, id);
                if child.is_empty() {
                    self.single = None;
                }
                removed
            }
            Some((token, rest)) => {
                let Some(child) = self.literals.get_mut(*token) else {
                    return false;
                };
                let removed = child.remove(rest, id);
                if child.is_empty() {
                    self.literals.remove(*token);
                }
                removed
            }
        }
    }

    fn collect(&self, tokens: &[&str], out: &mut Vec<SubscriptionId>) {
        let Some((token, rest)) = tokens.split_first() else {
            out.extend(self.terminal.iter().copied());
            return;
        };

        // At least one token remains, which is all `>` needs
        out.extend(self.full.iter().copied());

        if let Some(child) = self.literals.get(*token) {
            child.collect(rest, out);
        }
        if let Some(child) = &self.single {
            child.collect(rest, out);
        }
    }
}

/// Maps concrete subjects to the subscriptions whose patterns match them
#[derive(Debug, Default)]
pub struct SubjectRouter {
    root: Node,
    patterns: HashMap<SubscriptionId, String>,
}

impl SubjectRouter {
    /// Create an empty router
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Index `id` under `pattern`, replacing any pattern `id` had before.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidPattern`] if the pattern is empty, has
    /// an empty token or a `>` before the last token.
    pub fn index(&mut self, id: SubscriptionId, pattern: &str) -> GatewayResult<()> {
        validate_pattern(pattern).map_err(|e| GatewayError::invalid_pattern(pattern, e))?;

        self.deindex(id);

        let tokens: Vec<&str> = pattern.split('.').collect();
        self.root.insert(&tokens, id);
        self.patterns.insert(id, pattern.to_string());

        trace!("Indexed subscription {} under '{}'", id, pattern);
        Ok(())
    }

    /// Remove `id` from the index. Returns whether it was indexed.
    pub fn deindex(&mut self, id: SubscriptionId) -> bool {
        let Some(pattern) = self.patterns.remove(&id) else {
            return false;
        };

        let tokens: Vec<&str> = pattern.split('.').collect();
        let removed = self.root.remove(&tokens, id);

        trace!("Deindexed subscription {} from '{}'", id, pattern);
        removed
    }

    /// Subscriptions whose pattern matches `subject`, in registration order.
    #[must_use]
    pub fn matches(&self, subject: &str) -> Vec<SubscriptionId> {
        let tokens: Vec<&str> = subject.split('.').collect();
        let mut out = Vec::new();
        self.root.collect(&tokens, &mut out);

        // Identifiers are allocated monotonically, so id order is registration order
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Number of indexed subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Whether nothing is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.root = Node::default();
        self.patterns.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proven_transport::subject::subject_matches_pattern;

    fn id(n: u64) -> SubscriptionId {
        SubscriptionId::new(n)
    }

    fn router_with(patterns: &[&str]) -> SubjectRouter {
        let mut router = SubjectRouter::new();
        for (i, pattern) in patterns.iter().enumerate() {
            router.index(id(i as u64 + 1), pattern).unwrap();
        }
        router
    }

    #[test]
    fn test_single_wildcard() {
        let router = router_with(&["a.*.c"]);
        assert_eq!(router.matches("a.b.c"), vec![id(1)]);
        assert!(router.matches("a.b.c.d").is_empty());
        assert!(router.matches("a.c").is_empty());
    }

    #[test]
    fn test_full_wildcard() {
        let router = router_with(&["a.>"]);
        assert_eq!(router.matches("a.b"), vec![id(1)]);
        assert_eq!(router.matches("a.b.c"), vec![id(1)]);
        assert!(router.matches("a").is_empty());

        let everything = router_with(&[">"]);
        assert_eq!(everything.matches("x"), vec![id(1)]);
        assert_eq!(everything.matches("x.y.z"), vec![id(1)]);
    }

    #[test]
    fn test_case_sensitive() {
        let router = router_with(&["Orders.new"]);
        assert!(router.matches("orders.new").is_empty());
        assert_eq!(router.matches("Orders.new"), vec![id(1)]);
    }

    #[test]
    fn test_registration_order() {
        let router = router_with(&["orders.>", "orders.*", "orders.new", "*.new"]);
        assert_eq!(
            router.matches("orders.new"),
            vec![id(1), id(2), id(3), id(4)]
        );
    }

    #[test]
    fn test_deindex_leaves_no_trace() {
        let mut router = router_with(&["a.*", "a.>", "a.b", ">"]);
        for n in 1..=4 {
            assert!(router.deindex(id(n)));
            for subject in ["a", "a.b", "a.b.c", "x"] {
                assert!(!router.matches(subject).contains(&id(n)));
            }
        }
        assert!(router.is_empty());
        assert!(router.root.is_empty());
    }

    #[test]
    fn test_deindex_is_idempotent() {
        let mut router = router_with(&["a"]);
        assert!(router.deindex(id(1)));
        assert!(!router.deindex(id(1)));
        assert!(!router.deindex(id(99)));
    }

    #[test]
    fn test_prunes_only_empty_branches() {
        let mut router = router_with(&["a.b.c", "a.b"]);
        router.deindex(id(1));
        assert_eq!(router.matches("a.b"), vec![id(2)]);
        assert!(router.matches("a.b.c").is_empty());
    }

    #[test]
    fn test_reindex_replaces_pattern() {
        let mut router = router_with(&["a"]);
        router.index(id(1), "b").unwrap();
        assert!(router.matches("a").is_empty());
        assert_eq!(router.matches("b"), vec![id(1)]);
        assert_eq!(router.len(), 1);
    }

    #[test]
    fn test_rejects_invalid_patterns() {
        let mut router = SubjectRouter::new();
        for pattern in ["", "a..b", ".a", "a.", "a.>.b", "a b"] {
            assert!(matches!(
                router.index(id(1), pattern),
                Err(GatewayError::InvalidPattern { .. })
            ));
        }
        assert!(router.is_empty());
    }

    #[test]
    fn test_agrees_with_pairwise_matcher() {
        let patterns = [
            "a", "a.b", "a.*", "*.b", "a.>", ">", "*.*", "a.*.c", "*.b.>", "x.y.z",
        ];
        let subjects = ["a", "b", "a.b", "a.c", "x.b", "a.b.c", "a.x.c", "x.y.z", "a.b.c.d"];
        let router = router_with(&patterns);

        for subject in subjects {
            let expected: Vec<SubscriptionId> = patterns
                .iter()
                .enumerate()
                .filter(|(_, pattern)| subject_matches_pattern(subject, pattern))
                .map(|(i, _)| id(i as u64 + 1))
                .collect();
            assert_eq!(router.matches(subject), expected, "subject {subject}");
        }
    }
}
