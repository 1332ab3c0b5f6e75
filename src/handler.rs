//! # Handler Sets
//!
//! A [`HandlerSet`] bundles the handlers registered for one resource pattern:
//! access, get (model or collection), named call methods, the `new` call, and
//! named auth methods. It is built with chained methods and becomes immutable
//! once registered with a service.
//!
//! ```rust,ignore
//! service.handle(
//!     "book.$id",
//!     HandlerSet::new()
//!         .access(access_granted)
//!         .get_model(get_book)
//!         .call("set", set_book)
//!         .group("library.books"),
//! )?;
//! ```
//!
//! Handlers are async functions (or closures) taking the [`Request`] by value
//! and returning a [`HandlerResult`].

use crate::error::{FrameworkError, HandlerResult};
use crate::request::Request;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Type-erased handler stored in a [`HandlerSet`].
pub type HandlerFn = Arc<dyn Fn(Request) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// The shape a resource declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResourceKind {
    #[default]
    Unset,
    Model,
    Collection,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Unset => "unset",
            ResourceKind::Model => "model",
            ResourceKind::Collection => "collection",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn erase<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |req| f(req).boxed())
}

/// Handlers bound to one resource pattern.
#[derive(Clone, Default)]
pub struct HandlerSet {
    kind: ResourceKind,
    kind_conflict: bool,
    access: Option<HandlerFn>,
    get: Option<HandlerFn>,
    call: HashMap<String, HandlerFn>,
    new: Option<HandlerFn>,
    auth: HashMap<String, HandlerFn>,
    group: Option<String>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares the resource kind without registering a get handler.
    pub fn kind(mut self, kind: ResourceKind) -> Self {
        self.set_kind(kind);
        self
    }

    pub fn access<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.access = Some(erase(f));
        self
    }

    /// Registers the get handler and marks the resource as a model.
    pub fn get_model<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.set_kind(ResourceKind::Model);
        self.get = Some(erase(f));
        self
    }

    /// Registers the get handler and marks the resource as a collection.
    pub fn get_collection<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.set_kind(ResourceKind::Collection);
        self.get = Some(erase(f));
        self
    }

    /// Registers a call method handler. The method `new` goes to the
    /// [`new_resource`](Self::new_resource) slot.
    pub fn call<F, Fut>(mut self, method: impl Into<String>, f: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let method = method.into();
        if method == "new" {
            self.new = Some(erase(f));
        } else {
            self.call.insert(method, erase(f));
        }
        self
    }

    /// Shorthand for `call("set", f)`.
    pub fn set<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.call("set", f)
    }

    /// Registers the handler for `new` calls, which reply with a resource reference.
    pub fn new_resource<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.new = Some(erase(f));
        self
    }

    pub fn auth<F, Fut>(mut self, method: impl Into<String>, f: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.auth.insert(method.into(), erase(f));
        self
    }

    /// Sets the group key template. `${name}` tags are replaced with path
    /// parameters. Without a group, the resource name is the group.
    pub fn group(mut self, template: impl Into<String>) -> Self {
        self.group = Some(template.into());
        self
    }

    pub fn resource_kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn group_template(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub(crate) fn access_handler(&self) -> Option<&HandlerFn> {
        self.access.as_ref()
    }

    pub(crate) fn get_handler(&self) -> Option<&HandlerFn> {
        self.get.as_ref()
    }

    pub(crate) fn call_handler(&self, method: &str) -> Option<&HandlerFn> {
        if method == "new" {
            self.new.as_ref()
        } else {
            self.call.get(method)
        }
    }

    pub(crate) fn auth_handler(&self, method: &str) -> Option<&HandlerFn> {
        self.auth.get(method)
    }

    /// Checks the set is consistent before it is bound to `pattern`.
    pub(crate) fn validate(&self, pattern: &str) -> Result<(), FrameworkError> {
        if self.kind_conflict {
            return Err(FrameworkError::KindConflict(pattern.to_string()));
        }
        Ok(())
    }

    fn set_kind(&mut self, kind: ResourceKind) {
        if self.kind != ResourceKind::Unset && self.kind != kind {
            self.kind_conflict = true;
        }
        self.kind = kind;
    }
}

impl fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut call: Vec<&str> = self.call.keys().map(String::as_str).collect();
        call.sort_unstable();
        let mut auth: Vec<&str> = self.auth.keys().map(String::as_str).collect();
        auth.sort_unstable();
        f.debug_struct("HandlerSet")
            .field("kind", &self.kind)
            .field("access", &self.access.is_some())
            .field("get", &self.get.is_some())
            .field("call", &call)
            .field("new", &self.new.is_some())
            .field("auth", &auth)
            .field("group", &self.group)
            .finish()
    }
}

/// Access handler granting full get and call access.
pub async fn access_granted(r: Request) -> HandlerResult {
    r.access_granted()
}

/// Access handler replying with `system.accessDenied`.
pub async fn access_denied(r: Request) -> HandlerResult {
    r.access_denied()
}
