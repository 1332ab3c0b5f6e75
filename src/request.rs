//! # Requests
//!
//! One [`Request`] exists per inbound message. It carries the decoded envelope
//! (type, method, connection id, raw params and token), the resolved
//! [`Resource`], and the reply-once state.
//!
//! ## Reply-once
//!
//! Every reply method funnels through a single private `reply`, which flips
//! the `replied` flag atomically before publishing. A second reply never
//! reaches the transport; it fails with [`FrameworkError::AlreadyReplied`].
//!
//! ## Capabilities
//!
//! There is one request type for access, get, call and auth requests. Each
//! reply method checks the request type it is called on and fails with
//! [`FrameworkError::UnsupportedOperation`] when it does not apply:
//!
//! | Method | access | get | call | auth |
//! |--------|:------:|:---:|:----:|:----:|
//! | `error`, `not_found` | ✓ | ✓ | ✓ | ✓ |
//! | `access`, `access_granted`, `access_denied` | ✓ | | | |
//! | `model`, `query_model`, `collection`, `query_collection` | | ✓ | | |
//! | `ok`, `method_not_found`, `invalid_params`, `parse_params` | | | ✓ | ✓ |
//! | `new_resource` | | | `new` | |
//! | `timeout` | ✓ | ✓ | ✓ | ✓ |
//! | `token_event` | | | | ✓ |
//!
//! Misuse is reported to the log where it happens, so the fault is visible
//! even when a handler discards the returned error.

use crate::error::{FrameworkError, HandlerResult, ResError};
use crate::event;
use crate::handler::ResourceKind;
use crate::resource::{Ref, Resource};
use crate::timer::Deadlines;
use crate::transport::publish_logged;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

pub(crate) const RESPONSE_ACCESS_DENIED: &[u8] =
    br#"{"error":{"code":"system.accessDenied","message":"Access denied"}}"#;
pub(crate) const RESPONSE_INTERNAL_ERROR: &[u8] =
    br#"{"error":{"code":"system.internalError","message":"Internal error"}}"#;
pub(crate) const RESPONSE_NOT_FOUND: &[u8] =
    br#"{"error":{"code":"system.notFound","message":"Not found"}}"#;
pub(crate) const RESPONSE_METHOD_NOT_FOUND: &[u8] =
    br#"{"error":{"code":"system.methodNotFound","message":"Method not found"}}"#;
pub(crate) const RESPONSE_INVALID_PARAMS: &[u8] =
    br#"{"error":{"code":"system.invalidParams","message":"Invalid parameters"}}"#;
pub(crate) const RESPONSE_MISSING_RESPONSE: &[u8] =
    br#"{"error":{"code":"system.internalError","message":"Internal error: missing response"}}"#;
pub(crate) const RESPONSE_ACCESS_GRANTED: &[u8] = br#"{"result":{"get":true,"call":"*"}}"#;

/// The four RES request types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    Access,
    Get,
    Call,
    Auth,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Access => "access",
            RequestType::Get => "get",
            RequestType::Call => "call",
            RequestType::Auth => "auth",
        }
    }

    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s {
            "access" => Some(RequestType::Access),
            "get" => Some(RequestType::Get),
            "call" => Some(RequestType::Call),
            "auth" => Some(RequestType::Auth),
            _ => None,
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of an inbound request message.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub(crate) struct RequestPayload {
    pub cid: String,
    pub params: Option<Box<RawValue>>,
    pub token: Option<Box<RawValue>>,
    pub header: HashMap<String, Vec<String>>,
    pub host: String,
    pub remote_addr: String,
    pub uri: String,
    pub query: String,
}

/// Where a request came from and where its reply goes.
pub(crate) struct Envelope {
    pub id: u64,
    pub subject: String,
    pub reply_to: Option<String>,
    pub rtype: RequestType,
    pub method: String,
}

struct Inner {
    envelope: Envelope,
    payload: RequestPayload,
    resource: Resource,
    replied: AtomicBool,
    deadlines: Arc<Deadlines>,
}

#[derive(Serialize)]
struct Success<'a, T> {
    result: &'a T,
}

#[derive(Serialize)]
struct Failure<'a> {
    error: &'a ResError,
}

#[derive(Serialize)]
struct AccessResult<'a> {
    #[serde(skip_serializing_if = "is_false")]
    get: bool,
    #[serde(skip_serializing_if = "str::is_empty")]
    call: &'a str,
}

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(Serialize)]
struct ModelResult<'a, T> {
    model: &'a T,
    #[serde(skip_serializing_if = "str::is_empty")]
    query: &'a str,
}

#[derive(Serialize)]
struct CollectionResult<'a, T> {
    collection: &'a T,
    #[serde(skip_serializing_if = "str::is_empty")]
    query: &'a str,
}

/// A request being handled. Cheap to clone; clones share the reply state.
#[derive(Clone)]
pub struct Request {
    inner: Arc<Inner>,
}

impl Request {
    pub(crate) fn new(
        envelope: Envelope,
        payload: RequestPayload,
        resource: Resource,
        deadlines: Arc<Deadlines>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                envelope,
                payload,
                resource,
                replied: AtomicBool::new(false),
                deadlines,
            }),
        }
    }

    pub fn request_type(&self) -> RequestType {
        self.inner.envelope.rtype
    }

    /// The call or auth method. Empty for access and get requests.
    pub fn method(&self) -> &str {
        &self.inner.envelope.method
    }

    /// The inbound message subject.
    pub fn subject(&self) -> &str {
        &self.inner.envelope.subject
    }

    /// Connection id of the requesting client. Empty for get requests.
    pub fn cid(&self) -> &str {
        &self.inner.payload.cid
    }

    /// The JSON encoded method parameters, if the request had any.
    pub fn raw_params(&self) -> Option<&str> {
        self.inner.payload.params.as_deref().map(RawValue::get)
    }

    /// The JSON encoded access token, if the request had one.
    pub fn raw_token(&self) -> Option<&str> {
        self.inner.payload.token.as_deref().map(RawValue::get)
    }

    /// HTTP headers of the connection. Auth requests only; empty otherwise.
    pub fn header(&self) -> &HashMap<String, Vec<String>> {
        &self.inner.payload.header
    }

    pub fn host(&self) -> &str {
        &self.inner.payload.host
    }

    pub fn remote_addr(&self) -> &str {
        &self.inner.payload.remote_addr
    }

    pub fn uri(&self) -> &str {
        &self.inner.payload.uri
    }

    pub fn resource(&self) -> &Resource {
        &self.inner.resource
    }

    pub fn resource_name(&self) -> &str {
        self.inner.resource.name()
    }

    pub fn path_params(&self) -> &HashMap<String, String> {
        self.inner.resource.path_params()
    }

    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.inner.resource.path_param(name)
    }

    pub fn query(&self) -> &str {
        self.inner.resource.query()
    }

    pub fn is_replied(&self) -> bool {
        self.inner.replied.load(Ordering::Acquire)
    }

    /// Decodes the call or auth parameters into `T`. A missing params field
    /// decodes as `null`. Decode failures become `system.invalidParams`.
    pub fn parse_params<T: DeserializeOwned>(&self) -> Result<T, FrameworkError> {
        self.require("parse_params", &[RequestType::Call, RequestType::Auth])?;
        let raw = self.raw_params().unwrap_or("null");
        serde_json::from_str(raw).map_err(|e| ResError::invalid_params(e.to_string()).into())
    }

    /// Decodes the access token into `T`. A missing token decodes as `null`.
    /// Decode failures become `system.internalError`.
    pub fn parse_token<T: DeserializeOwned>(&self) -> Result<T, FrameworkError> {
        self.require(
            "parse_token",
            &[RequestType::Access, RequestType::Call, RequestType::Auth],
        )?;
        let raw = self.raw_token().unwrap_or("null");
        serde_json::from_str(raw)
            .map_err(|e| ResError::new(crate::error::CODE_INTERNAL_ERROR, e.to_string()).into())
    }

    /// Sends a successful call or auth response. `result` may be `()` or
    /// `None` for a `null` result.
    pub fn ok(&self, result: impl Serialize) -> HandlerResult {
        self.require("ok", &[RequestType::Call, RequestType::Auth])?;
        self.success(&result)
    }

    /// Sends an error response.
    pub fn error(&self, err: ResError) -> HandlerResult {
        match serde_json::to_vec(&Failure { error: &err }) {
            Ok(payload) => self.reply(&payload),
            Err(e) => {
                self.reply(RESPONSE_INTERNAL_ERROR)?;
                Err(e.into())
            }
        }
    }

    pub fn not_found(&self) -> HandlerResult {
        self.reply(RESPONSE_NOT_FOUND)
    }

    pub fn method_not_found(&self) -> HandlerResult {
        self.require("method_not_found", &[RequestType::Call, RequestType::Auth])?;
        self.reply(RESPONSE_METHOD_NOT_FOUND)
    }

    /// Sends `system.invalidParams`. An empty message becomes "Invalid parameters".
    pub fn invalid_params(&self, message: &str) -> HandlerResult {
        self.require("invalid_params", &[RequestType::Call, RequestType::Auth])?;
        if message.is_empty() {
            self.reply(RESPONSE_INVALID_PARAMS)
        } else {
            self.error(ResError::invalid_params(message))
        }
    }

    /// Sends an access response. `call` is a comma separated list of callable
    /// methods, `*` for all. No get access and no calls is an access denied.
    pub fn access(&self, get: bool, call: &str) -> HandlerResult {
        self.require("access", &[RequestType::Access])?;
        if !get && call.is_empty() {
            self.reply(RESPONSE_ACCESS_DENIED)
        } else {
            self.success(&AccessResult { get, call })
        }
    }

    /// Same as `access(true, "*")`.
    pub fn access_granted(&self) -> HandlerResult {
        self.require("access_granted", &[RequestType::Access])?;
        self.reply(RESPONSE_ACCESS_GRANTED)
    }

    pub fn access_denied(&self) -> HandlerResult {
        self.require("access_denied", &[RequestType::Access])?;
        self.reply(RESPONSE_ACCESS_DENIED)
    }

    /// Sends a model response. `model` must serialize to a JSON object;
    /// anything else faults with [`FrameworkError::InvalidResult`].
    pub fn model(&self, model: impl Serialize) -> HandlerResult {
        self.query_model(model, "")
    }

    /// Sends a model response for a query request, with the normalized query.
    pub fn query_model(&self, model: impl Serialize, query: &str) -> HandlerResult {
        let operation = if query.is_empty() { "model" } else { "query_model" };
        self.get_reply(operation, ResourceKind::Model, query)?;
        let model = self.result_value(operation, &model, Value::is_object, "object")?;
        self.success(&ModelResult { model: &model, query })
    }

    /// Sends a collection response. `collection` must serialize to a JSON
    /// array; anything else faults with [`FrameworkError::InvalidResult`].
    pub fn collection(&self, collection: impl Serialize) -> HandlerResult {
        self.query_collection(collection, "")
    }

    /// Sends a collection response for a query request, with the normalized query.
    pub fn query_collection(&self, collection: impl Serialize, query: &str) -> HandlerResult {
        let operation = if query.is_empty() { "collection" } else { "query_collection" };
        self.get_reply(operation, ResourceKind::Collection, query)?;
        let collection = self.result_value(operation, &collection, Value::is_array, "array")?;
        self.success(&CollectionResult {
            collection: &collection,
            query,
        })
    }

    /// Replies to a `new` call with a reference to the created resource.
    pub fn new_resource(&self, rid: impl Into<Ref>) -> HandlerResult {
        self.require("new_resource", &[RequestType::Call])?;
        if self.method() != "new" {
            return Err(self.fault(FrameworkError::UnsupportedOperation {
                operation: "new_resource",
                rtype: "non-new call",
            }));
        }
        let rid = rid.into();
        if !rid.is_valid() {
            return Err(self.fault(FrameworkError::InvalidReference(rid.to_string())));
        }
        self.success(&rid)
    }

    /// Asks the requester to wait `duration` for the reply. See [`timeout_ms`](Self::timeout_ms).
    pub fn timeout(&self, duration: Duration) -> HandlerResult {
        self.timeout_ms(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
    }

    /// Sends `timeout:"<millis>"` to the reply address and moves the request
    /// deadline. The latest call wins. Negative values fault and leave the
    /// current deadline as it is. Does nothing once the request is replied.
    pub fn timeout_ms(&self, millis: i64) -> HandlerResult {
        if millis < 0 {
            return Err(self.fault(FrameworkError::NegativeTimeout(millis)));
        }
        if self.is_replied() {
            return Ok(());
        }
        let envelope = &self.inner.envelope;
        self.inner
            .deadlines
            .extend(envelope.id, &envelope.subject, millis)
            .map_err(|e| self.fault(e))?;
        if let Some(reply_to) = &envelope.reply_to {
            let payload = format!("timeout:\"{millis}\"");
            publish_logged(self.inner.resource.transport(), reply_to, payload.as_bytes());
        }
        Ok(())
    }

    /// Publishes a token event for the requesting connection, replacing its
    /// access token. Auth requests only.
    pub fn token_event(&self, token: impl Serialize) -> HandlerResult {
        self.require("token_event", &[RequestType::Auth])?;
        let token = serde_json::to_value(token)?;
        let msg = event::token_event(self.cid(), &token)?;
        publish_logged(self.inner.resource.transport(), &msg.subject, &msg.payload);
        Ok(())
    }

    pub fn event(&self, name: &str, payload: impl Serialize) -> HandlerResult {
        self.inner.resource.event(name, payload)
    }

    pub fn change_event(&self, props: &Map<String, Value>) -> HandlerResult {
        self.inner.resource.change_event(props)
    }

    pub fn add_event(&self, value: impl Serialize, idx: usize) -> HandlerResult {
        self.inner.resource.add_event(value, idx)
    }

    pub fn remove_event(&self, idx: usize) -> HandlerResult {
        self.inner.resource.remove_event(idx)
    }

    pub fn reaccess_event(&self) -> HandlerResult {
        self.inner.resource.reaccess_event()
    }

    /// Sends the fixed "missing response" error if nothing was replied.
    pub(crate) fn reply_missing(&self) {
        if !self.is_replied() {
            let _ = self.reply(RESPONSE_MISSING_RESPONSE);
        }
    }

    /// Sends a generic internal error if nothing was replied.
    pub(crate) fn reply_internal(&self) {
        if !self.is_replied() {
            let _ = self.reply(RESPONSE_INTERNAL_ERROR);
        }
    }

    pub(crate) fn reply_raw(&self, payload: &[u8]) -> HandlerResult {
        self.reply(payload)
    }

    fn get_reply(&self, operation: &'static str, kind: ResourceKind, query: &str) -> HandlerResult {
        self.require(operation, &[RequestType::Get])?;
        if !query.is_empty() && self.query().is_empty() {
            return Err(self.fault(FrameworkError::QueryOnNonQueryRequest));
        }
        let actual = self.inner.resource.kind();
        if actual != kind {
            return Err(self.fault(FrameworkError::WrongResourceKind {
                operation,
                kind: actual.as_str(),
            }));
        }
        Ok(())
    }

    fn result_value<T: Serialize>(
        &self,
        operation: &'static str,
        result: &T,
        shaped: fn(&Value) -> bool,
        expected: &'static str,
    ) -> Result<Value, FrameworkError> {
        let value = match serde_json::to_value(result) {
            Ok(value) => value,
            Err(e) => {
                error!(subject = %self.subject(), error = %e, "Failed to encode result");
                self.reply(RESPONSE_INTERNAL_ERROR)?;
                return Err(e.into());
            }
        };
        if !shaped(&value) {
            return Err(self.fault(FrameworkError::InvalidResult { operation, expected }));
        }
        Ok(value)
    }

    fn success<T: Serialize>(&self, result: &T) -> HandlerResult {
        match serde_json::to_vec(&Success { result }) {
            Ok(payload) => self.reply(&payload),
            Err(e) => {
                error!(subject = %self.subject(), error = %e, "Failed to encode result");
                self.reply(RESPONSE_INTERNAL_ERROR)?;
                Err(e.into())
            }
        }
    }

    fn reply(&self, payload: &[u8]) -> HandlerResult {
        if self.inner.replied.swap(true, Ordering::AcqRel) {
            return Err(self.fault(FrameworkError::AlreadyReplied));
        }
        let envelope = &self.inner.envelope;
        self.inner.deadlines.clear(envelope.id);
        match &envelope.reply_to {
            Some(reply_to) => publish_logged(self.inner.resource.transport(), reply_to, payload),
            None => debug!(subject = %envelope.subject, "No reply address, response dropped"),
        }
        Ok(())
    }

    fn require(&self, operation: &'static str, allowed: &[RequestType]) -> HandlerResult {
        if allowed.contains(&self.inner.envelope.rtype) {
            return Ok(());
        }
        Err(self.fault(FrameworkError::UnsupportedOperation {
            operation,
            rtype: self.inner.envelope.rtype.as_str(),
        }))
    }

    fn fault(&self, e: FrameworkError) -> FrameworkError {
        error!(subject = %self.subject(), error = %e, "Request misuse");
        e
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("type", &self.inner.envelope.rtype)
            .field("subject", &self.inner.envelope.subject)
            .field("method", &self.inner.envelope.method)
            .field("resource", &self.inner.resource)
            .field("replied", &self.is_replied())
            .finish()
    }
}
