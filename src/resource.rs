//! # Resources
//!
//! [`Resource`] is the context a handler works in: the resolved resource name,
//! its query and path parameters, the declared kind, the group key, and the
//! event helpers. Every [`Request`](crate::request::Request) carries one, and
//! `ServiceHandle::with_resource` hands one to code running outside a request.

use crate::error::{FrameworkError, HandlerResult};
use crate::event::Event;
use crate::handler::ResourceKind;
use crate::transport::{publish_logged, Transport};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::error;

pub use crate::event::delete_action;

/// A reference to a resource, encoded as `{"rid": "<resource id>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ref {
    rid: String,
}

impl Ref {
    pub fn new(rid: impl Into<String>) -> Self {
        Self { rid: rid.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.rid
    }

    /// A resource id is valid when it is printable ASCII without `*` or `>`,
    /// has no empty dot-separated parts, and any `?` query follows a
    /// non-empty name.
    pub fn is_valid(&self) -> bool {
        let mut start = true;
        for c in self.rid.chars() {
            if c == '?' {
                return !start;
            }
            if !c.is_ascii_graphic() || c == '*' || c == '>' {
                return false;
            }
            if c == '.' {
                if start {
                    return false;
                }
                start = true;
            } else {
                start = false;
            }
        }
        !start
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rid)
    }
}

impl From<&str> for Ref {
    fn from(rid: &str) -> Self {
        Ref::new(rid)
    }
}

impl From<String> for Ref {
    fn from(rid: String) -> Self {
        Ref::new(rid)
    }
}

struct Inner {
    name: String,
    query: String,
    path_params: HashMap<String, String>,
    kind: ResourceKind,
    group: String,
    transport: Arc<dyn Transport>,
}

/// A resolved resource and its event helpers.
#[derive(Clone)]
pub struct Resource {
    inner: Arc<Inner>,
}

impl Resource {
    pub(crate) fn new(
        name: String,
        query: String,
        path_params: HashMap<String, String>,
        kind: ResourceKind,
        group: String,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                query,
                path_params,
                kind,
                group,
                transport,
            }),
        }
    }

    /// The resource name, without query.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The query part of the resource id, without the `?`. Empty if none.
    pub fn query(&self) -> &str {
        &self.inner.query
    }

    /// Decodes the query as `application/x-www-form-urlencoded` pairs.
    pub fn parse_query(&self) -> Vec<(String, String)> {
        url::form_urlencoded::parse(self.inner.query.as_bytes())
            .into_owned()
            .collect()
    }

    pub fn path_params(&self) -> &HashMap<String, String> {
        &self.inner.path_params
    }

    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.inner.path_params.get(name).map(String::as_str)
    }

    pub fn kind(&self) -> ResourceKind {
        self.inner.kind
    }

    pub fn group(&self) -> &str {
        &self.inner.group
    }

    /// Sends a custom event. Reserved names (`change`, `add`, `remove`,
    /// `reaccess`, `unsubscribe`) must use their dedicated helpers.
    pub fn event(&self, name: &str, payload: impl Serialize) -> HandlerResult {
        let payload = serde_json::to_value(payload)?;
        let event = Event::custom(name, payload).map_err(|e| self.misuse(e))?;
        self.emit(event)
    }

    /// Sends a change event with the changed properties and their new values.
    /// Nothing is sent if `props` is empty. Faults unless the resource is a model.
    pub fn change_event(&self, props: &Map<String, Value>) -> HandlerResult {
        self.emit(Event::Change(props.clone()))
    }

    /// Sends an add event for `value` inserted at `idx`. Collections only.
    pub fn add_event(&self, value: impl Serialize, idx: usize) -> HandlerResult {
        let value = serde_json::to_value(value)?;
        self.emit(Event::Add { value, idx })
    }

    /// Sends a remove event for the value at `idx`. Collections only.
    pub fn remove_event(&self, idx: usize) -> HandlerResult {
        self.emit(Event::Remove { idx })
    }

    /// Signals that earlier access responses for this resource are stale.
    pub fn reaccess_event(&self) -> HandlerResult {
        self.emit(Event::Reaccess)
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.inner.transport.as_ref()
    }

    fn emit(&self, event: Event) -> HandlerResult {
        match event.encode(&self.inner.name, self.inner.kind) {
            Ok(Some(msg)) => {
                publish_logged(self.transport(), &msg.subject, &msg.payload);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => Err(self.misuse(e)),
        }
    }

    fn misuse(&self, e: FrameworkError) -> FrameworkError {
        error!(rid = %self.inner.name, error = %e, "Invalid event");
        e
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("name", &self.inner.name)
            .field("query", &self.inner.query)
            .field("path_params", &self.inner.path_params)
            .field("kind", &self.inner.kind)
            .field("group", &self.inner.group)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use serde_json::json;

    fn resource(kind: ResourceKind, transport: Arc<MockTransport>) -> Resource {
        Resource::new(
            "library.books".into(),
            "start=0&limit=2&q=a%20b".into(),
            HashMap::new(),
            kind,
            "library.books".into(),
            transport,
        )
    }

    #[test]
    fn test_ref_validity() {
        for ok in ["library.book.1", "a", "library.books?start=10", "a.b?x.."] {
            assert!(Ref::new(ok).is_valid(), "{ok:?}");
        }
        for bad in ["", ".a", "a.", "a..b", "a.*", "a.>", "a b", "?q", "a.?q"] {
            assert!(!Ref::new(bad).is_valid(), "{bad:?}");
        }
    }

    #[test]
    fn test_ref_encodes_as_rid_object() {
        let json = serde_json::to_string(&Ref::new("library.book.1")).unwrap();
        assert_eq!(json, r#"{"rid":"library.book.1"}"#);
    }

    #[test]
    fn test_parse_query_decodes_pairs() {
        let r = resource(ResourceKind::Collection, MockTransport::new());
        assert_eq!(
            r.parse_query(),
            vec![
                ("start".to_string(), "0".to_string()),
                ("limit".to_string(), "2".to_string()),
                ("q".to_string(), "a b".to_string()),
            ]
        );
    }

    #[test]
    fn test_add_on_model_faults_before_publishing() {
        let transport = MockTransport::new();
        let r = resource(ResourceKind::Model, transport.clone());
        assert!(matches!(
            r.add_event(json!("x"), 0),
            Err(FrameworkError::WrongResourceKind { .. })
        ));
        assert!(matches!(r.remove_event(0), Err(FrameworkError::WrongResourceKind { .. })));
        assert!(transport.messages().is_empty());
    }

    #[test]
    fn test_empty_change_publishes_nothing() {
        let transport = MockTransport::new();
        let r = resource(ResourceKind::Model, transport.clone());
        r.change_event(&Map::new()).unwrap();
        assert!(transport.messages().is_empty());
    }

    #[test]
    fn test_custom_event_with_reserved_name_faults() {
        let transport = MockTransport::new();
        let r = resource(ResourceKind::Collection, transport.clone());
        assert!(matches!(r.event("add", json!({})), Err(FrameworkError::ReservedEvent(_))));
        r.event("rebuilt", json!({"count": 3})).unwrap();
        let sent = transport.messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "event.library.books.rebuilt");
    }
}
