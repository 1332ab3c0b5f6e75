//! # RES Service
//!
//! > **Serve models and collections over a publish/subscribe transport.**
//!
//! This crate implements the service side of the RES protocol. Clients send
//! `access`, `get`, `call` and `auth` requests against dotted resource names;
//! the service routes each one to an application handler, makes sure exactly
//! one reply goes back, and lets handlers announce changes as events.
//!
//! ## 🏗️ Design
//!
//! ### Resources and groups
//! Every resource name resolves to a [`HandlerSet`] and a *group*. Handlers
//! of one group never overlap and run in arrival order; handlers of
//! different groups run in parallel. Put every resource that touches the same
//! piece of state in the same group and that state needs no further locking.
//!
//! ### Reply-once
//! A [`Request`] can be answered once. A second reply is refused with
//! [`FrameworkError::AlreadyReplied`] and never reaches the wire. A handler
//! that returns without replying gets the fixed "missing response" error sent
//! on its behalf.
//!
//! ### Errors as values
//! Handlers return [`HandlerResult`]. Returning a [`ResError`] (directly or
//! with `?`) sends it to the client. Any other error, or a panic, becomes a
//! generic internal error for the client and an `error` log line for the
//! operator.
//!
//! ## 🗺️ Module Tour
//!
//! - [`router`]: compiles `library.book.$id` style patterns and resolves names.
//! - [`group`]: the keyed lock and per-group task queue.
//! - [`timer`]: request deadline bookkeeping for timeout extensions.
//! - [`request`] and [`resource`]: what a handler sees.
//! - [`event`]: event validation and encoding.
//! - [`service`]: registration, dispatch, and the running handle.
//! - [`transport`] and [`mock`]: the broker boundary and an in-memory stand-in.
//!
//! ## 🚀 Quick Start
//!
//! ```ignore
//! use res_service::{handler::access_granted, HandlerSet, Request, HandlerResult, Service};
//!
//! async fn get_book(r: Request) -> HandlerResult {
//!     r.model(serde_json::json!({ "title": "Dune" }))
//! }
//!
//! let mut service = Service::new("library");
//! service.handle(
//!     "book.$id",
//!     HandlerSet::new().access(access_granted).get_model(get_book),
//! )?;
//! let handle = service.start(transport);
//! handle.serve(inbound).await;
//! ```
//!
//! Run with `RUST_LOG=res_service=trace` to see every message in and out.

pub mod config;
pub mod error;
pub mod event;
pub mod group;
pub mod handler;
pub mod mock;
pub mod request;
pub mod resource;
pub mod router;
pub mod service;
pub mod timer;
pub mod tracing;
pub mod transport;

pub use config::ServiceConfig;
pub use error::{FrameworkError, HandlerResult, ResError};
pub use event::delete_action;
pub use handler::{HandlerSet, ResourceKind};
pub use request::{Request, RequestType};
pub use resource::{Ref, Resource};
pub use service::{Service, ServiceHandle};
pub use transport::{InboundMessage, OutboundMessage, Transport};
