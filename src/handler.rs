//! Handler trait and type erasure.
//!
//! # How async handlers are stored
//!
//! The router holds handlers of *different* types in one `matchit` tree, so
//! each is erased behind `dyn ErasedHandler`. The typed reply is serialized to
//! JSON at the erasure boundary, which lets every stage of the chain work on a
//! single [`Reply`] type.
//!
//! ```text
//! async fn list(call: Call) -> Result<ListReply, Status>   ← user writes this
//!        ↓ router.route(path, list)
//! list.into_boxed_handler()                                 ← Handler blanket impl
//!        ↓
//! Arc::new(FnHandler(list))                                 ← stored as BoxedHandler
//!        ↓
//! handler.call(call) at request time                        ← one vtable dispatch
//! ```

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;

use crate::call::{Call, Reply};
use crate::status::Status;

/// Internal dispatch interface.
///
/// `#[doc(hidden)] pub` rather than `pub(crate)` because it appears in the
/// return type of the public `Handler` trait's `into_boxed_handler` method.
#[doc(hidden)]
pub trait ErasedHandler {
    fn call(&self, call: Call) -> BoxFuture<'static, Reply>;
}

/// A type-erased handler shared across concurrent calls.
#[doc(hidden)]
pub type BoxedHandler = Arc<dyn ErasedHandler + Send + Sync + 'static>;

/// Implemented for every valid RPC handler.
///
/// Satisfied automatically by any function or closure with the shape
///
/// ```text
/// Fn(Call) -> impl Future<Output = Result<T, Status>>   where T: Serialize
/// ```
///
/// The trait is sealed: only the blanket impl below can satisfy it.
pub trait Handler: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_handler(self) -> BoxedHandler;
}

mod private {
    pub trait Sealed {}
}

impl<F, Fut, T> private::Sealed for F
where
    F: Fn(Call) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, Status>> + Send + 'static,
    T: Serialize + Send + 'static,
{
}

impl<F, Fut, T> Handler for F
where
    F: Fn(Call) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, Status>> + Send + 'static,
    T: Serialize + Send + 'static,
{
    fn into_boxed_handler(self) -> BoxedHandler {
        Arc::new(FnHandler(self))
    }
}

/// Bridges a concrete handler `F` to [`ErasedHandler`].
struct FnHandler<F>(F);

impl<F, Fut, T> ErasedHandler for FnHandler<F>
where
    F: Fn(Call) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, Status>> + Send + 'static,
    T: Serialize + Send + 'static,
{
    fn call(&self, call: Call) -> BoxFuture<'static, Reply> {
        let fut = (self.0)(call);
        Box::pin(async move {
            let reply = fut.await?;
            serde_json::to_value(reply)
                .map_err(|e| Status::internal("failed to encode reply").with_detail(e.to_string()))
        })
    }
}
