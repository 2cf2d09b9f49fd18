//! # applyd
//!
//! The RPC frontend of the infra apply approval workflow. Every call passes
//! through one fixed interceptor chain before it reaches a handler.
//!
//! ## The contract
//!
//! The chain owns the cross-cutting work, so handlers don't have to:
//!
//! - **Recovery**: a panic anywhere becomes an `Internal` reply, never a crash
//! - **Session**: deadline, trace id, and bearer-token identity
//! - **Access log**: one structured record per call, success or failure
//!
//! Handlers decode a request, talk to the [`store`], and return a reply or a
//! [`Status`]. The subject id is already on the [`CallContext`].
//!
//! ## Transport
//!
//! Calls are HTTP `POST`s to `/<package>.<Service>/<Method>` with a JSON body.
//! Request headers become call [`Metadata`]; `grpc-timeout` sets the deadline.
//! Replies carry the [`Code`] in the HTTP status, in `grpc-status`, and in a
//! `{code, message}` body on failure.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use applyd::auth::TokenAuthenticator;
//! use applyd::middleware::{SessionConfig, SessionStage};
//! use applyd::service::InfraApplyService;
//! use applyd::store::MemoryStore;
//! use applyd::{Chain, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), applyd::Error> {
//!     let session = SessionStage::new(TokenAuthenticator::new(b"secret"), SessionConfig::default());
//!     let store = Arc::new(MemoryStore::new());
//!     let router = InfraApplyService::new(store.clone()).into_router();
//!
//!     Server::new(Chain::standard(session), router)
//!         .with_store(store)
//!         .start("0.0.0.0:5000")
//!         .await
//! }
//! ```

mod call;
mod chain;
mod code;
mod context;
mod error;
mod handler;
mod metadata;
mod reply;
mod router;
mod server;
mod status;

pub mod auth;
pub mod config;
pub mod logging;
pub mod middleware;
pub mod profiling;
pub mod service;
pub mod store;

pub use call::{Call, Reply};
pub use chain::{Chain, ChainBuilder, MAX_STAGES, Next, Stage};
pub use code::Code;
pub use context::CallContext;
pub use error::Error;
pub use handler::Handler;
pub use metadata::{AUTHORIZATION, Metadata, TIMEOUT, TOKEN, TRACE_ID, UID};
pub use router::Router;
pub use server::{Server, ServerState, StopHandle};
pub use status::Status;
