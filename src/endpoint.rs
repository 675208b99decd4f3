//! Endpoint definitions and the tag vocabulary.
//!
//! An [`Api`] is a registry of named endpoints. Query endpoints *provide*
//! tags describing the entities their results contain; mutation endpoints
//! *invalidate* tags, which is what connects a write to the cached reads it
//! makes stale. Tags are resolved either from a static list or from a
//! closure over the result and original arguments.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An entity type plus an optional id, e.g. `Post` or `Post/3`.
///
/// A tag without an id is a wildcard: it is provided into (and invalidated
/// against) the type's wildcard bucket rather than a specific id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub kind: String,
    pub id: Option<String>,
}

impl Tag {
    /// A tag covering the whole entity type.
    pub fn of(kind: impl Into<String>) -> Self {
        Self { kind: kind.into(), id: None }
    }

    /// A tag scoped to one entity id.
    pub fn with_id(kind: impl Into<String>, id: impl ToString) -> Self {
        Self {
            kind: kind.into(),
            id: Some(id.to_string()),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}/{id}", self.kind),
            None => f.write_str(&self.kind),
        }
    }
}

/// Whether an endpoint reads (query) or writes (mutation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Query,
    Mutation,
}

/// How an endpoint's tags are computed on fulfillment.
#[derive(Clone, Default)]
pub enum TagResolver {
    /// The endpoint declares no tags.
    #[default]
    None,
    /// A fixed list, independent of the result.
    Static(Vec<Tag>),
    /// Computed from `(result, original_args)`.
    Dynamic(Arc<dyn Fn(&Value, &Value) -> Vec<Tag> + Send + Sync>),
}

impl TagResolver {
    pub fn resolve(&self, result: &Value, args: &Value) -> Vec<Tag> {
        match self {
            Self::None => Vec::new(),
            Self::Static(tags) => tags.clone(),
            Self::Dynamic(f) => f(result, args),
        }
    }
}

impl fmt::Debug for TagResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("TagResolver::None"),
            Self::Static(tags) => f.debug_tuple("TagResolver::Static").field(tags).finish(),
            Self::Dynamic(_) => f.write_str("TagResolver::Dynamic(..)"),
        }
    }
}

impl From<Vec<Tag>> for TagResolver {
    fn from(tags: Vec<Tag>) -> Self {
        Self::Static(tags)
    }
}

impl<const N: usize> From<[Tag; N]> for TagResolver {
    fn from(tags: [Tag; N]) -> Self {
        Self::Static(tags.to_vec())
    }
}

/// One named operation on the [`Api`].
#[derive(Debug, Clone)]
pub struct Endpoint {
    name: String,
    kind: EndpointKind,
    tags: TagResolver,
}

impl Endpoint {
    /// Defines a query endpoint.
    pub fn query(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EndpointKind::Query,
            tags: TagResolver::None,
        }
    }

    /// Defines a mutation endpoint.
    pub fn mutation(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EndpointKind::Mutation,
            tags: TagResolver::None,
        }
    }

    /// Declares the tags a query provides on fulfillment.
    pub fn provides(mut self, tags: impl Into<TagResolver>) -> Self {
        self.tags = tags.into();
        self
    }

    /// Declares provided tags computed from the result and arguments.
    pub fn provides_fn(
        mut self,
        f: impl Fn(&Value, &Value) -> Vec<Tag> + Send + Sync + 'static,
    ) -> Self {
        self.tags = TagResolver::Dynamic(Arc::new(f));
        self
    }

    /// Declares the tags a mutation invalidates on fulfillment.
    pub fn invalidates(mut self, tags: impl Into<TagResolver>) -> Self {
        self.tags = tags.into();
        self
    }

    /// Declares invalidated tags computed from the result and arguments.
    pub fn invalidates_fn(
        mut self,
        f: impl Fn(&Value, &Value) -> Vec<Tag> + Send + Sync + 'static,
    ) -> Self {
        self.tags = TagResolver::Dynamic(Arc::new(f));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn kind(&self) -> EndpointKind {
        self.kind
    }

    pub(crate) fn resolve_tags(&self, result: &Value, args: &Value) -> Vec<Tag> {
        self.tags.resolve(result, args)
    }
}

/// Registry of endpoint definitions, shared by the engine and its handles.
#[derive(Debug, Clone, Default)]
pub struct Api {
    endpoints: HashMap<String, Endpoint>,
}

impl Api {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an endpoint, replacing any previous definition of the name.
    #[must_use]
    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoints.insert(endpoint.name.clone(), endpoint);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Endpoint> {
        self.endpoints.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tag_display() {
        assert_eq!(Tag::of("Post").to_string(), "Post");
        assert_eq!(Tag::with_id("Post", 3).to_string(), "Post/3");
    }

    #[test]
    fn test_static_resolver() {
        let endpoint = Endpoint::query("getPosts").provides([Tag::of("Post")]);
        let tags = endpoint.resolve_tags(&json!([]), &Value::Null);
        assert_eq!(tags, vec![Tag::of("Post")]);
    }

    #[test]
    fn test_dynamic_resolver_sees_result_and_args() {
        let endpoint = Endpoint::query("getPost").provides_fn(|result, args| {
            let id = result
                .get("id")
                .and_then(Value::as_str)
                .or_else(|| args.as_str())
                .unwrap_or("unknown");
            vec![Tag::with_id("Post", id)]
        });

        let tags = endpoint.resolve_tags(&json!({"id": "3"}), &json!("3"));
        assert_eq!(tags, vec![Tag::with_id("Post", "3")]);

        let tags = endpoint.resolve_tags(&Value::Null, &json!("4"));
        assert_eq!(tags, vec![Tag::with_id("Post", "4")]);
    }

    #[test]
    fn test_api_lookup() {
        let api = Api::new()
            .endpoint(Endpoint::query("getPost"))
            .endpoint(Endpoint::mutation("updatePost"));

        assert_eq!(api.get("getPost").unwrap().kind(), EndpointKind::Query);
        assert_eq!(api.get("updatePost").unwrap().kind(), EndpointKind::Mutation);
        assert!(api.get("missing").is_none());
    }
}
