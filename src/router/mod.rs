//! # Resource Router
//!
//! Compiles registered [`Pattern`]s into a segment tree and resolves inbound
//! resource names against it.
//!
//! ## Matching rules
//!
//! At every segment the router tries, in order:
//!
//! 1. the literal child with the same text,
//! 2. the placeholder child (capturing the segment),
//! 3. a trailing wildcard registered at this node.
//!
//! A failed branch backtracks to the next option, so the route with the longest
//! literal prefix wins. With `book.featured` and `book.$id` both registered,
//! `book.featured` resolves to the literal route and `book.7` to the placeholder
//! route with `id = "7"`.
//!
//! ## Ambiguity
//!
//! Placeholder names do not affect structure: `a.$x` and `a.$y` compile to the
//! same path, and registering the second one fails with
//! [`FrameworkError::DuplicatePattern`]. The table is built once, before traffic
//! is served, and is read-only afterwards.

pub mod pattern;

pub use pattern::{GroupTemplate, Pattern, Token};

use crate::error::FrameworkError;
use crate::handler::HandlerSet;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

struct Route {
    pattern: Pattern,
    handlers: Arc<HandlerSet>,
    group: Option<GroupTemplate>,
}

#[derive(Default)]
struct Node {
    literals: HashMap<String, Node>,
    placeholder: Option<Box<Node>>,
    wildcard: Option<Arc<Route>>,
    route: Option<Arc<Route>>,
}

impl Node {
    fn insert(&mut self, tokens: &[Token], route: Arc<Route>) -> Result<(), FrameworkError> {
        let Some((head, rest)) = tokens.split_first() else {
            if self.route.is_some() {
                return Err(FrameworkError::DuplicatePattern(route.pattern.to_string()));
            }
            self.route = Some(route);
            return Ok(());
        };

        match head {
            Token::Literal(text) => self
                .literals
                .entry(text.clone())
                .or_default()
                .insert(rest, route),
            Token::Placeholder(_) => self
                .placeholder
                .get_or_insert_with(Default::default)
                .insert(rest, route),
            Token::Wildcard => {
                if self.wildcard.is_some() {
                    return Err(FrameworkError::DuplicatePattern(route.pattern.to_string()));
                }
                self.wildcard = Some(route);
                Ok(())
            }
        }
    }

    fn search(&self, segments: &[&str]) -> Option<&Arc<Route>> {
        let Some((head, rest)) = segments.split_first() else {
            return self.route.as_ref();
        };

        if let Some(route) = self.literals.get(*head).and_then(|child| child.search(rest)) {
            return Some(route);
        }
        if let Some(route) = self.placeholder.as_ref().and_then(|child| child.search(rest)) {
            return Some(route);
        }
        self.wildcard.as_ref()
    }
}

/// The outcome of a successful [`Router::resolve`].
#[derive(Clone)]
pub struct Resolved {
    pub handlers: Arc<HandlerSet>,
    pub pattern: String,
    pub path_params: HashMap<String, String>,
    pub group: String,
}

impl std::fmt::Debug for Resolved {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolved")
            .field("pattern", &self.pattern)
            .field("path_params", &self.path_params)
            .field("group", &self.group)
            .finish()
    }
}

/// Pattern table mapping resource names to handler sets.
#[derive(Default)]
pub struct Router {
    root: Node,
    len: usize,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiles `pattern` and binds it to `handlers`.
    pub fn register(&mut self, pattern: &str, handlers: HandlerSet) -> Result<(), FrameworkError> {
        let pattern = Pattern::parse(pattern)?;
        handlers.validate(pattern.as_str())?;

        let group = match handlers.group_template() {
            Some(template) => {
                let template = GroupTemplate::parse(template)?;
                let known: Vec<&str> = pattern.placeholders().map(|(_, name)| name).collect();
                if template.params().any(|name| !known.contains(&name)) {
                    return Err(FrameworkError::InvalidPattern {
                        pattern: pattern.to_string(),
                        reason: "group references unknown placeholder",
                    });
                }
                Some(template)
            }
            None => None,
        };

        let tokens = pattern.tokens().to_vec();
        let route = Arc::new(Route {
            pattern,
            handlers: Arc::new(handlers),
            group,
        });
        self.root.insert(&tokens, route.clone())?;
        self.len += 1;
        debug!(pattern = %route.pattern, "Registered");
        Ok(())
    }

    /// Resolves a resource name (without query) to its handler set.
    pub fn resolve(&self, name: &str) -> Result<Resolved, FrameworkError> {
        let not_found = || FrameworkError::NotFound(name.to_string());
        if name.is_empty() {
            return Err(not_found());
        }
        let segments: Vec<&str> = name.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(not_found());
        }

        let route = self.root.search(&segments).ok_or_else(not_found)?;
        let path_params: HashMap<String, String> = route
            .pattern
            .placeholders()
            .map(|(i, param)| (param.to_string(), segments[i].to_string()))
            .collect();
        let group = match &route.group {
            Some(template) => template.render(&path_params),
            None => name.to_string(),
        };

        Ok(Resolved {
            handlers: route.handlers.clone(),
            pattern: route.pattern.to_string(),
            path_params,
            group,
        })
    }

    /// Number of registered patterns.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::ResourceKind;

    fn router(patterns: &[&str]) -> Router {
        let mut router = Router::new();
        for p in patterns {
            router.register(p, HandlerSet::new()).unwrap();
        }
        router
    }

    #[test]
    fn test_literal_outranks_placeholder() {
        let router = router(&["a.b", "a.$x"]);

        let exact = router.resolve("a.b").unwrap();
        assert_eq!(exact.pattern, "a.b");
        assert!(exact.path_params.is_empty());

        let generic = router.resolve("a.c").unwrap();
        assert_eq!(generic.pattern, "a.$x");
        assert_eq!(generic.path_params.get("x").map(String::as_str), Some("c"));
    }

    #[test]
    fn test_backtracks_out_of_a_dead_literal_branch() {
        let router = router(&["book.featured.list", "book.$id.list", "book.$id"]);
        assert_eq!(router.resolve("book.featured.list").unwrap().pattern, "book.featured.list");
        assert_eq!(router.resolve("book.featured").unwrap().pattern, "book.$id");
        assert_eq!(router.resolve("book.9.list").unwrap().pattern, "book.$id.list");
    }

    #[test]
    fn test_structurally_equal_placeholders_collide() {
        let mut router = router(&["a.$x"]);
        let err = router.register("a.$y", HandlerSet::new()).unwrap_err();
        assert!(matches!(err, FrameworkError::DuplicatePattern(p) if p == "a.$y"));
        assert!(router.register("a.$y.z", HandlerSet::new()).is_ok());
    }

    #[test]
    fn test_wildcard_matches_remaining_segments() {
        let router = router(&["files.>", "files.readme"]);
        assert_eq!(router.resolve("files.readme").unwrap().pattern, "files.readme");
        assert_eq!(router.resolve("files.a.b.c").unwrap().pattern, "files.>");
        assert!(router.resolve("files").is_err());
    }

    #[test]
    fn test_unknown_and_malformed_names_are_not_found() {
        let router = router(&["a.b"]);
        for name in ["a", "a.b.c", "", "a..b", "x.b"] {
            assert!(matches!(router.resolve(name), Err(FrameworkError::NotFound(_))));
        }
    }

    #[test]
    fn test_group_defaults_to_resource_name_or_renders_template() {
        let mut router = Router::new();
        router
            .register("library.book.$id", HandlerSet::new().group("library.books"))
            .unwrap();
        router
            .register("library.shelf.$shelf.$id", HandlerSet::new().group("shelf.${shelf}"))
            .unwrap();
        router.register("library.info", HandlerSet::new()).unwrap();

        assert_eq!(router.resolve("library.book.3").unwrap().group, "library.books");
        assert_eq!(router.resolve("library.shelf.scifi.7").unwrap().group, "shelf.scifi");
        assert_eq!(router.resolve("library.info").unwrap().group, "library.info");
    }

    #[test]
    fn test_group_with_unknown_tag_is_rejected() {
        let mut router = Router::new();
        let err = router
            .register("book.$id", HandlerSet::new().group("${shelf}"))
            .unwrap_err();
        assert!(matches!(err, FrameworkError::InvalidPattern { .. }));
    }

    #[test]
    fn test_resolved_handler_set_keeps_its_kind() {
        let mut router = Router::new();
        router
            .register("books", HandlerSet::new().kind(ResourceKind::Collection))
            .unwrap();
        assert_eq!(router.resolve("books").unwrap().handlers.resource_kind(), ResourceKind::Collection);
        assert_eq!(router.len(), 1);
    }
}
