//! # Service
//!
//! [`Service`] collects handler registrations under a service name. Calling
//! [`Service::start`] freezes the routing table and returns a
//! [`ServiceHandle`], the running dispatcher.
//!
//! ## Dispatch
//!
//! For every inbound message the dispatcher:
//!
//! 1. parses the subject (`get.<rid>`, `access.<rid>`, `call.<rid>.<method>`,
//!    `auth.<rid>.<method>`) and the JSON payload,
//! 2. resolves the resource name to its handler set, path parameters and group,
//! 3. queues the handler on the group, so handlers of one group run one at a
//!    time in arrival order,
//! 4. turns whatever the handler did into exactly one reply.
//!
//! | Handler outcome | Reply |
//! |-----------------|-------|
//! | replied, returned `Ok` | the handler's reply |
//! | returned `Ok` without replying | `system.internalError` "Internal error: missing response" |
//! | returned a [`ResError`](crate::error::ResError) | that error |
//! | returned any other error, or panicked | `system.internalError`, cause logged |
//!
//! An error or panic after the handler already replied is only logged. A
//! subject that is not a request subject gets `system.notFound` when it
//! carries a reply address.
//!
//! Each queued handler runs inside a `request` span carrying the request id,
//! subject and group, so log lines from handler code are attributed to the
//! request that produced them.

use crate::config::ServiceConfig;
use crate::error::{FrameworkError, HandlerResult};
use crate::event;
use crate::group::queue::panic_message;
use crate::group::{GroupLock, TaskQueue};
use crate::handler::{HandlerFn, HandlerSet, ResourceKind};
use crate::request::{
    Envelope, Request, RequestPayload, RequestType, RESPONSE_INTERNAL_ERROR,
    RESPONSE_METHOD_NOT_FOUND, RESPONSE_NOT_FOUND,
};
use crate::resource::Resource;
use crate::router::Router;
use crate::timer::Deadlines;
use crate::transport::{publish_logged, InboundMessage, Transport};
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, instrument, trace, warn, Instrument};

/// A RES service under construction.
pub struct Service {
    name: String,
    router: Router,
    config: ServiceConfig,
}

impl Service {
    /// Creates a service. Patterns are registered relative to `name`; an empty
    /// name registers them as given.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            router: Router::new(),
            config: ServiceConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers `handlers` for `pattern`. An empty pattern addresses the
    /// service name itself.
    ///
    /// Fails if the pattern is malformed or collides with one registered
    /// earlier.
    pub fn handle(&mut self, pattern: &str, handlers: HandlerSet) -> Result<(), FrameworkError> {
        let full = match (self.name.is_empty(), pattern.is_empty()) {
            (true, _) => pattern.to_string(),
            (false, true) => self.name.clone(),
            (false, false) => format!("{}.{}", self.name, pattern),
        };
        self.router.register(&full, handlers)
    }

    /// Starts the dispatcher on `transport`. Must be called within a tokio runtime.
    pub fn start(self, transport: Arc<dyn Transport>) -> ServiceHandle {
        let (stop, stop_rx) = watch::channel(false);
        let deadlines = Arc::new(Deadlines::default());
        let timer = tokio::spawn({
            let deadlines = deadlines.clone();
            async move { deadlines.run(stop_rx).await }
        });

        info!(
            service = %self.name,
            patterns = self.router.len(),
            workers = self.config.workers,
            "Service started"
        );

        ServiceHandle {
            core: Arc::new(Core {
                name: self.name,
                router: self.router,
                transport,
                queue: TaskQueue::new(GroupLock::new(), self.config.workers),
                deadlines,
                next_id: AtomicU64::new(1),
                inbound_buffer: self.config.inbound_buffer,
                stop,
                timer: Mutex::new(Some(timer)),
            }),
        }
    }
}

struct Core {
    name: String,
    router: Router,
    transport: Arc<dyn Transport>,
    queue: TaskQueue,
    deadlines: Arc<Deadlines>,
    next_id: AtomicU64,
    inbound_buffer: usize,
    stop: watch::Sender<bool>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running service. Cheap to clone.
#[derive(Clone)]
pub struct ServiceHandle {
    core: Arc<Core>,
}

impl ServiceHandle {
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Subjects the transport must subscribe to for this service.
    pub fn subscriptions(&self) -> Vec<String> {
        ["get", "call", "auth", "access"]
            .iter()
            .map(|rtype| {
                if self.core.name.is_empty() {
                    format!("{rtype}.>")
                } else {
                    format!("{rtype}.{}.>", self.core.name)
                }
            })
            .collect()
    }

    /// Dispatches one inbound message. Returns once the handler is queued.
    pub fn dispatch(&self, msg: InboundMessage) {
        trace!(subject = %msg.subject, payload = %String::from_utf8_lossy(&msg.payload), "==>");
        let Some((rtype, rid, method)) = parse_subject(&msg.subject) else {
            warn!(subject = %msg.subject, "Unknown request subject");
            self.reply_to(&msg, RESPONSE_NOT_FOUND);
            return;
        };

        let payload: RequestPayload = if msg.payload.is_empty() {
            RequestPayload::default()
        } else {
            match serde_json::from_slice(&msg.payload) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(subject = %msg.subject, error = %e, "Invalid request payload");
                    self.reply_to(&msg, RESPONSE_INTERNAL_ERROR);
                    return;
                }
            }
        };

        let resolved = match self.core.router.resolve(rid) {
            Ok(resolved) => resolved,
            Err(e) => {
                debug!(subject = %msg.subject, error = %e, "No matching resource");
                self.reply_to(&msg, RESPONSE_NOT_FOUND);
                return;
            }
        };

        let resource = Resource::new(
            rid.to_string(),
            payload.query.clone(),
            resolved.path_params,
            resolved.handlers.resource_kind(),
            resolved.group.clone(),
            self.core.transport.clone(),
        );
        let id = self.core.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = Envelope {
            id,
            subject: msg.subject.clone(),
            reply_to: msg.reply.clone(),
            rtype,
            method: method.to_string(),
        };
        let req = Request::new(envelope, payload, resource, self.core.deadlines.clone());
        let span = info_span!("request", id, subject = %msg.subject, group = %resolved.group);

        if let Err(e) = self.core.queue.enqueue(
            resolved.group.clone(),
            execute(resolved.handlers, req.clone()).instrument(span),
        ) {
            warn!(subject = %msg.subject, group = %resolved.group, error = %e, "Request refused");
            req.reply_internal();
        }
    }

    /// Dispatches every message received on `rx` until the channel closes.
    #[instrument(skip_all, fields(service = %self.core.name))]
    pub async fn serve(&self, mut rx: mpsc::Receiver<InboundMessage>) {
        info!("Serving");
        while let Some(msg) = rx.recv().await {
            self.dispatch(msg);
        }
        info!("Inbound channel closed");
    }

    /// Returns a sender feeding a background [`serve`](Self::serve) loop.
    pub fn inbound(&self) -> mpsc::Sender<InboundMessage> {
        let (tx, rx) = mpsc::channel(self.core.inbound_buffer);
        let handle = self.clone();
        tokio::spawn(async move { handle.serve(rx).await });
        tx
    }

    /// Resolves `rid` and runs `f` with its resource on the resource's group,
    /// after every handler already queued on that group.
    pub fn with_resource<F, Fut>(&self, rid: &str, f: F) -> Result<(), FrameworkError>
    where
        F: FnOnce(Resource) -> Fut + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let (name, query) = rid.split_once('?').unwrap_or((rid, ""));
        let resolved = self.core.router.resolve(name)?;
        let resource = Resource::new(
            name.to_string(),
            query.to_string(),
            resolved.path_params,
            resolved.handlers.resource_kind(),
            resolved.group.clone(),
            self.core.transport.clone(),
        );
        let span = info_span!("resource_task", rid = %name, group = %resolved.group);
        let task = async move {
            if let Err(e) = f(resource).await {
                error!(error = %e, "Resource task failed");
            }
        };
        self.core.queue.enqueue(resolved.group, task.instrument(span))
    }

    /// Runs `task` on `group`, serialized with the handlers of that group.
    pub fn with_group<Fut>(&self, group: &str, task: Fut) -> Result<(), FrameworkError>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let span = info_span!("group_task", group = %group);
        self.core.queue.enqueue(group, task.instrument(span))
    }

    /// Publishes a `system.reset` for the given resource and access patterns.
    pub fn reset(&self, resources: &[String], access: &[String]) -> Result<(), FrameworkError> {
        if let Some(msg) = event::system_reset(resources, access)? {
            publish_logged(self.core.transport.as_ref(), &msg.subject, &msg.payload);
        }
        Ok(())
    }

    /// Stops taking new groups, waits for queued handlers, then stops the
    /// timer driver.
    #[instrument(skip(self), fields(service = %self.core.name))]
    pub async fn shutdown(&self) {
        info!("Shutting down");
        self.core.queue.shutdown().await;
        let pending = self.core.deadlines.len();
        if pending > 0 {
            debug!(pending, "Dropping unexpired request deadlines");
        }
        let _ = self.core.stop.send(true);
        let timer = self.core.timer.lock().take();
        if let Some(timer) = timer {
            if let Err(e) = timer.await {
                error!(error = %e, "Timer driver failed");
            }
        }
        info!("Shutdown complete");
    }

    fn reply_to(&self, msg: &InboundMessage, payload: &[u8]) {
        if let Some(reply) = &msg.reply {
            publish_logged(self.core.transport.as_ref(), reply, payload);
        }
    }
}

/// Splits a request subject into type, resource id and method.
fn parse_subject(subject: &str) -> Option<(RequestType, &str, &str)> {
    let (kind, rest) = subject.split_once('.')?;
    let rtype = RequestType::parse(kind)?;
    match rtype {
        RequestType::Access | RequestType::Get => Some((rtype, rest, "")),
        RequestType::Call | RequestType::Auth => {
            let (rid, method) = rest.rsplit_once('.')?;
            if method.is_empty() {
                return None;
            }
            Some((rtype, rid, method))
        }
    }
}

/// What the dispatcher does with a request before any handler runs.
enum Route {
    Run(HandlerFn),
    Reply(&'static [u8]),
    Ignore,
}

fn route(handlers: &HandlerSet, req: &Request) -> Route {
    let found = |h: Option<&HandlerFn>, missing| h.cloned().map_or(Route::Reply(missing), Route::Run);
    match req.request_type() {
        // Without an access handler, access is assumed to be answered elsewhere.
        RequestType::Access => handlers.access_handler().cloned().map_or(Route::Ignore, Route::Run),
        RequestType::Get if handlers.resource_kind() == ResourceKind::Unset => {
            Route::Reply(RESPONSE_NOT_FOUND)
        }
        RequestType::Get => found(handlers.get_handler(), RESPONSE_NOT_FOUND),
        RequestType::Call => found(handlers.call_handler(req.method()), RESPONSE_METHOD_NOT_FOUND),
        RequestType::Auth => found(handlers.auth_handler(req.method()), RESPONSE_METHOD_NOT_FOUND),
    }
}

async fn execute(handlers: Arc<HandlerSet>, req: Request) {
    let handler = match route(&handlers, &req) {
        Route::Run(handler) => handler,
        Route::Reply(payload) => {
            let _ = req.reply_raw(payload);
            return;
        }
        Route::Ignore => {
            debug!("No access handler");
            return;
        }
    };

    let call = req.clone();
    let outcome = AssertUnwindSafe(async move { handler(call).await })
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(())) => req.reply_missing(),
        Ok(Err(FrameworkError::Protocol(e))) => {
            if req.is_replied() {
                error!(error = %e, "Error returned after reply");
            } else {
                let _ = req.error(e);
            }
        }
        Ok(Err(e)) => {
            if !e.is_programming_error() {
                error!(error = %e, "Handler failed");
            }
            req.reply_internal();
        }
        Err(panic) => {
            error!(cause = %panic_message(panic.as_ref()), "Handler panicked");
            req.reply_internal();
        }
    }
}
