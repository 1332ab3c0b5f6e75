//! # Events
//!
//! Validation and wire encoding for outbound resource events. An [`Event`] is
//! checked against the kind of the resource it is emitted on, then encoded as
//! a publish on `event.<rid>.<name>`:
//!
//! | Event | Allowed on | Payload |
//! |-------|------------|---------|
//! | `change` | models | changed properties map (nothing sent if empty) |
//! | `add` | collections | `{"value": .., "idx": ..}` |
//! | `remove` | collections | `{"idx": ..}` |
//! | `reaccess` | any | `{}` |
//! | custom | any | caller's payload |
//!
//! Events are notifications, not mutations. Encoding never waits on the
//! transport and never takes a group lock.

use crate::error::FrameworkError;
use crate::handler::ResourceKind;
use crate::transport::OutboundMessage;
use serde::Serialize;
use serde_json::{json, Map, Value};

/// Event names with dedicated helpers; the custom-event path refuses them.
pub const RESERVED_EVENTS: [&str; 5] = ["change", "add", "remove", "reaccess", "unsubscribe"];

pub fn is_reserved(name: &str) -> bool {
    RESERVED_EVENTS.contains(&name)
}

/// Value of a change event property that deletes it from the model.
pub fn delete_action() -> Value {
    json!({ "action": "delete" })
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Change(Map<String, Value>),
    Add { value: Value, idx: usize },
    Remove { idx: usize },
    Reaccess,
    Custom { name: String, payload: Value },
}

#[derive(Serialize)]
struct AddPayload<'a> {
    value: &'a Value,
    idx: usize,
}

#[derive(Serialize)]
struct RemovePayload {
    idx: usize,
}

impl Event {
    /// A custom event. Reserved and malformed names are rejected.
    pub fn custom(name: impl Into<String>, payload: Value) -> Result<Self, FrameworkError> {
        let name = name.into();
        if is_reserved(&name) {
            return Err(FrameworkError::ReservedEvent(name));
        }
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_graphic() && !matches!(c, '.' | '*' | '>' | '?'));
        if !valid {
            return Err(FrameworkError::InvalidEventName(name));
        }
        Ok(Event::Custom { name, payload })
    }

    pub fn name(&self) -> &str {
        match self {
            Event::Change(_) => "change",
            Event::Add { .. } => "add",
            Event::Remove { .. } => "remove",
            Event::Reaccess => "reaccess",
            Event::Custom { name, .. } => name,
        }
    }

    /// Checks the event may be emitted on a resource of `kind`.
    pub fn check_kind(&self, kind: ResourceKind) -> Result<(), FrameworkError> {
        let required = match self {
            Event::Change(_) => ResourceKind::Model,
            Event::Add { .. } | Event::Remove { .. } => ResourceKind::Collection,
            Event::Reaccess | Event::Custom { .. } => return Ok(()),
        };
        if kind != required {
            return Err(FrameworkError::WrongResourceKind {
                operation: match required {
                    ResourceKind::Model => "change event",
                    _ => "add/remove event",
                },
                kind: kind.as_str(),
            });
        }
        Ok(())
    }

    /// Validates and encodes the event for resource `rid`.
    ///
    /// Returns `Ok(None)` when there is nothing to publish (an empty change).
    pub fn encode(
        &self,
        rid: &str,
        kind: ResourceKind,
    ) -> Result<Option<OutboundMessage>, FrameworkError> {
        self.check_kind(kind)?;
        let payload = match self {
            Event::Change(props) if props.is_empty() => return Ok(None),
            Event::Change(props) => serde_json::to_vec(props)?,
            Event::Add { value, idx } => serde_json::to_vec(&AddPayload { value, idx: *idx })?,
            Event::Remove { idx } => serde_json::to_vec(&RemovePayload { idx: *idx })?,
            Event::Reaccess => b"{}".to_vec(),
            Event::Custom { payload, .. } => serde_json::to_vec(payload)?,
        };
        Ok(Some(OutboundMessage::new(
            format!("event.{}.{}", rid, self.name()),
            payload,
        )))
    }
}

/// Encodes a token event for connection `cid`.
pub fn token_event(cid: &str, token: &Value) -> Result<OutboundMessage, FrameworkError> {
    let payload = serde_json::to_vec(&json!({ "token": token }))?;
    Ok(OutboundMessage::new(format!("conn.{cid}.token"), payload))
}

#[derive(Serialize)]
struct ResetPayload<'a> {
    #[serde(skip_serializing_if = "is_empty")]
    resources: &'a [String],
    #[serde(skip_serializing_if = "is_empty")]
    access: &'a [String],
}

fn is_empty(list: &&[String]) -> bool {
    list.is_empty()
}

/// Encodes a `system.reset` event, or nothing if both lists are empty.
pub fn system_reset(
    resources: &[String],
    access: &[String],
) -> Result<Option<OutboundMessage>, FrameworkError> {
    if resources.is_empty() && access.is_empty() {
        return Ok(None);
    }
    let payload = serde_json::to_vec(&ResetPayload { resources, access })?;
    Ok(Some(OutboundMessage::new("system.reset", payload)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(msg: &OutboundMessage) -> &str {
        std::str::from_utf8(&msg.payload).unwrap()
    }

    #[test]
    fn test_add_and_remove_encode_on_collections() {
        let add = Event::Add { value: json!("library.book.4"), idx: 3 }
            .encode("library.books", ResourceKind::Collection)
            .unwrap()
            .unwrap();
        assert_eq!(add.subject, "event.library.books.add");
        assert_eq!(payload(&add), r#"{"value":"library.book.4","idx":3}"#);

        let remove = Event::Remove { idx: 0 }
            .encode("library.books", ResourceKind::Collection)
            .unwrap()
            .unwrap();
        assert_eq!(remove.subject, "event.library.books.remove");
        assert_eq!(payload(&remove), r#"{"idx":0}"#);
    }

    #[test]
    fn test_collection_events_fault_on_models() {
        for event in [Event::Add { value: json!(1), idx: 0 }, Event::Remove { idx: 0 }] {
            assert!(matches!(
                event.encode("library.book.1", ResourceKind::Model),
                Err(FrameworkError::WrongResourceKind { .. })
            ));
        }
    }

    #[test]
    fn test_change_faults_on_collection_even_when_empty() {
        let err = Event::Change(Map::new()).encode("library.books", ResourceKind::Collection);
        assert!(matches!(err, Err(FrameworkError::WrongResourceKind { .. })));
    }

    #[test]
    fn test_empty_change_encodes_nothing() {
        let out = Event::Change(Map::new()).encode("library.book.1", ResourceKind::Model).unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn test_change_carries_properties() {
        let mut props = Map::new();
        props.insert("title".into(), json!("Dune"));
        props.insert("author".into(), delete_action());
        let out = Event::Change(props)
            .encode("library.book.1", ResourceKind::Model)
            .unwrap()
            .unwrap();
        assert_eq!(out.subject, "event.library.book.1.change");
        assert_eq!(payload(&out), r#"{"author":{"action":"delete"},"title":"Dune"}"#);
    }

    #[test]
    fn test_reaccess_is_kind_agnostic() {
        for kind in [ResourceKind::Unset, ResourceKind::Model, ResourceKind::Collection] {
            let out = Event::Reaccess.encode("a.b", kind).unwrap().unwrap();
            assert_eq!(out.subject, "event.a.b.reaccess");
            assert_eq!(payload(&out), "{}");
        }
    }

    #[test]
    fn test_custom_rejects_reserved_and_malformed_names() {
        for name in RESERVED_EVENTS {
            assert!(matches!(Event::custom(name, Value::Null), Err(FrameworkError::ReservedEvent(_))));
        }
        for name in ["", "a.b", "a b", "x*"] {
            assert!(matches!(Event::custom(name, Value::Null), Err(FrameworkError::InvalidEventName(_))));
        }
        let ok = Event::custom("lent", json!({"to": "ann"})).unwrap();
        let out = ok.encode("library.book.1", ResourceKind::Model).unwrap().unwrap();
        assert_eq!(out.subject, "event.library.book.1.lent");
    }

    #[test]
    fn test_system_reset_omits_empty_lists() {
        assert!(system_reset(&[], &[]).unwrap().is_none());
        let out = system_reset(&["library.>".to_string()], &[]).unwrap().unwrap();
        assert_eq!(out.subject, "system.reset");
        assert_eq!(payload(&out), r#"{"resources":["library.>"]}"#);
    }

    #[test]
    fn test_token_event_targets_connection() {
        let out = token_event("c1", &json!({"user": "ann"})).unwrap();
        assert_eq!(out.subject, "conn.c1.token");
        assert_eq!(payload(&out), r#"{"token":{"user":"ann"}}"#);
    }
}
