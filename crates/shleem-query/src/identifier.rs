//! Dotted hierarchical identifiers
//!
//! Every node in the source tree is named by its parent's identifier followed
//! by a local part: a plain name for servers, databases and collections, or a
//! content digest for queries and aggregations created without an explicit
//! identifier.

pub const IDENTIFIER_SEPARATOR: char = '.';

/// Join a parent identifier and a local part
pub fn compose(parent: &str, local: &str) -> String {
    let mut id = String::with_capacity(parent.len() + local.len() + 1);
    id.push_str(parent);
    id.push(IDENTIFIER_SEPARATOR);
    id.push_str(local);
    id
}

/// Split a dotted path into its segments
///
/// Empty segments (leading, trailing or doubled separators) are kept so the
/// caller can reject them.
pub fn split_path(path: &str) -> Vec<&str> {
    path.split(IDENTIFIER_SEPARATOR).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose() {
        assert_eq!(compose("primary", "shop"), "primary.shop");
        assert_eq!(compose("primary.shop", "orders"), "primary.shop.orders");
    }

    #[test]
    fn test_compose_does_not_validate() {
        assert_eq!(compose("a", ""), "a.");
        assert_eq!(compose("a", "b.c"), "a.b.c");
    }

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("primary.shop.orders"), vec!["primary", "shop", "orders"]);
        assert_eq!(split_path("primary"), vec!["primary"]);
        assert_eq!(split_path("primary..orders"), vec!["primary", "", "orders"]);
    }
}
