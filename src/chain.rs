//! Interceptor chain.
//!
//! A [`Chain`] is an ordered list of [`Stage`]s composed once at startup and
//! shared read-only by every call. Each call walks it with a [`Next`] cursor:
//! a borrowed view of the chain plus the index of the stage to run. The cursor
//! lives on the call's own stack, so the chain itself holds no per-call state.
//!
//! ```text
//! Next { index: 0 } ── Recovery ── next.run ──▶ Next { index: 1 } ── Session ── ...
//!                                                   ... ──▶ Next { index: n } ── handler
//! ```

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::call::{Call, Reply};
use crate::error::Error;
use crate::handler::{BoxedHandler, ErasedHandler};
use crate::middleware::{AccessLogStage, RecoveryStage, SessionStage};
use crate::status::Status;

/// Registering this many stages or more fails chain construction.
pub const MAX_STAGES: usize = (i8::MAX / 2) as usize;

/// One link in the chain.
///
/// A stage receives the call and a [`Next`] continuation. It may inspect or
/// extend the call, run `next`, observe the reply, or short-circuit with its
/// own [`Status`] without running `next` at all.
pub trait Stage: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn call<'a>(&'a self, call: Call, next: Next<'a>) -> BoxFuture<'a, Reply>;
}

/// Invocation-local continuation into the rest of the chain.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    stages: &'a [Arc<dyn Stage>],
    index: usize,
    handler: &'a (dyn ErasedHandler + Send + Sync),
}

impl<'a> Next<'a> {
    /// Runs the remaining stages and then the handler.
    pub fn run(self, call: Call) -> BoxFuture<'a, Reply> {
        // `Next` is `Copy`: the stage gets its own cursor one step further on,
        // so nothing about this call is ever written back to the chain.
        match self.stages.get(self.index) {
            Some(stage) => stage.call(call, Next { index: self.index + 1, ..self }),
            None => terminal(self.handler, call),
        }
    }
}

/// The final hop: dispatch to the handler under the call's deadline.
///
/// When the deadline passes first the handler future is dropped, which
/// cancels whatever it was waiting on. The timer goes with it on every path.
fn terminal<'a>(handler: &'a (dyn ErasedHandler + Send + Sync), call: Call) -> BoxFuture<'a, Reply> {
    // Read the deadline before the call moves into the handler.
    let deadline = call.context().deadline();
    let fut = handler.call(call);
    Box::pin(async move {
        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, fut)
                .await
                .unwrap_or_else(|_| Err(Status::deadline_exceeded("context deadline exceeded"))),
            None => fut.await,
        }
    })
}

/// The fixed, ordered composition of stages applied to every call.
pub struct Chain {
    stages: Vec<Arc<dyn Stage>>,
}

impl Chain {
    /// Composes `stages` in order. Fails if there are [`MAX_STAGES`] or more.
    pub fn new(stages: Vec<Arc<dyn Stage>>) -> Result<Self, Error> {
        if stages.len() >= MAX_STAGES {
            return Err(Error::TooManyStages { requested: stages.len(), max: MAX_STAGES - 1 });
        }
        Ok(Self { stages })
    }

    pub fn builder() -> ChainBuilder {
        ChainBuilder { stages: Vec::new() }
    }

    /// The production pipeline: recovery outermost, then session, then access log.
    pub fn standard(session: SessionStage) -> Self {
        Self {
            stages: vec![
                Arc::new(RecoveryStage::new()),
                Arc::new(session),
                Arc::new(AccessLogStage::new()),
            ],
        }
    }

    /// Stage names in invocation order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize { self.stages.len() }
    pub fn is_empty(&self) -> bool { self.stages.is_empty() }

    /// Runs `call` through every stage and into `handler`.
    pub fn invoke<'a>(&'a self, call: Call, handler: &'a BoxedHandler) -> BoxFuture<'a, Reply> {
        // No stages: skip the cursor and go straight to the handler.
        if self.stages.is_empty() {
            return terminal(handler.as_ref(), call);
        }
        Next { stages: &self.stages, index: 0, handler: handler.as_ref() }.run(call)
    }
}

/// Collects stages before composing a [`Chain`].
pub struct ChainBuilder {
    stages: Vec<Arc<dyn Stage>>,
}

impl ChainBuilder {
    pub fn stage(mut self, stage: impl Stage) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn build(self) -> Result<Chain, Error> {
        Chain::new(self.stages)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::handler::Handler;
    use crate::{CallContext, Code};

    /// Appends its name to a call-local trail carried in the call extensions.
    struct Mark(&'static str);

    #[derive(Clone, Default)]
    struct Trail(Vec<&'static str>);

    impl Stage for Mark {
        fn name(&self) -> &'static str { self.0 }

        fn call<'a>(&'a self, mut call: Call, next: Next<'a>) -> BoxFuture<'a, Reply> {
            call.extensions_mut().get_or_insert_default::<Trail>().0.push(self.0);
            next.run(call)
        }
    }

    async fn trail(call: Call) -> Result<Vec<&'static str>, Status> {
        Ok(call.extensions().get::<Trail>().cloned().unwrap_or_default().0)
    }

    fn call() -> Call {
        Call::new("/t/Trail", serde_json::Value::Null)
    }

    #[tokio::test]
    async fn stages_run_in_registration_order_once_each() {
        let chain = Chain::builder().stage(Mark("a")).stage(Mark("b")).stage(Mark("c")).build().unwrap();
        let handler = trail.into_boxed_handler();
        let reply = chain.invoke(call(), &handler).await.unwrap();
        assert_eq!(reply, serde_json::json!(["a", "b", "c"]));
    }

    #[tokio::test]
    async fn empty_chain_calls_handler_directly() {
        let chain = Chain::new(Vec::new()).unwrap();
        let handler = trail.into_boxed_handler();
        let reply = chain.invoke(call(), &handler).await.unwrap();
        assert_eq!(reply, serde_json::json!([]));
    }

    #[test]
    fn too_many_stages_fails_construction() {
        let stages: Vec<Arc<dyn Stage>> = (0..MAX_STAGES).map(|_| Arc::new(Mark("x")) as Arc<dyn Stage>).collect();
        assert!(matches!(Chain::new(stages), Err(Error::TooManyStages { .. })));

        let stages: Vec<Arc<dyn Stage>> = (0..MAX_STAGES - 1).map(|_| Arc::new(Mark("x")) as Arc<dyn Stage>).collect();
        assert!(Chain::new(stages).is_ok());
    }

    #[tokio::test]
    async fn concurrent_calls_keep_separate_cursors() {
        let chain = Arc::new(Chain::builder().stage(Mark("a")).stage(Mark("b")).build().unwrap());
        let handler = trail.into_boxed_handler();
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..16 {
            let chain = Arc::clone(&chain);
            let handler = Arc::clone(&handler);
            tasks.spawn(async move { chain.invoke(call(), &handler).await });
        }
        while let Some(reply) = tasks.join_next().await {
            assert_eq!(reply.unwrap().unwrap(), serde_json::json!(["a", "b"]));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn expired_deadline_surfaces_as_deadline_exceeded() {
        let started = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&started);
        let slow = move |_call: Call| {
            let flag = Arc::clone(&flag);
            async move {
                *flag.lock().unwrap() = true;
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, Status>(())
            }
        };
        let handler = slow.into_boxed_handler();
        let chain = Chain::new(Vec::new()).unwrap();
        let call = call().with_context(CallContext::with_timeout(Duration::from_millis(50)));

        let err = chain.invoke(call, &handler).await.unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);
        assert!(*started.lock().unwrap());
    }
}
