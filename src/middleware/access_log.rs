use std::panic::AssertUnwindSafe;
use std::time::Instant;

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::debug;

use crate::call::{Call, Reply};
use crate::chain::{Next, Stage};
use crate::metadata::TRACE_ID;
use crate::middleware::panic_message;
use crate::status::Status;

/// The fields of one access-log record, captured at call start.
pub(crate) struct AccessRecord {
    peer: String,
    method: String,
    request: String,
    timeout_quota: f64,
    started: Instant,
}

impl AccessRecord {
    pub(crate) fn new(call: &Call, started: Instant) -> Self {
        Self {
            peer: call.peer().map(|p| p.to_string()).unwrap_or_default(),
            method: call.method().to_owned(),
            request: call.payload().to_string(),
            timeout_quota: call.context().remaining().map_or(0.0, |d| d.as_secs_f64()),
            started,
        }
    }

    pub(crate) fn success(&self) {
        debug!(
            target: "applyd::access",
            peer = %self.peer,
            method = %self.method,
            elapsed_seconds = self.started.elapsed().as_secs_f64(),
            timeout_quota_seconds = self.timeout_quota,
            request = %self.request,
            "rpc request"
        );
    }

    pub(crate) fn failure(&self, trace_id: &str, status: &Status) {
        debug!(
            target: "applyd::access",
            peer = %self.peer,
            method = %self.method,
            elapsed_seconds = self.started.elapsed().as_secs_f64(),
            timeout_quota_seconds = self.timeout_quota,
            request = %self.request,
            trace_id,
            code = %status.code(),
            error = %status.message(),
            detail = status.detail().unwrap_or_default(),
            "rpc request"
        );
    }
}

/// Records one structured log entry per call.
///
/// Pure observer: the reply it returns is the reply it received. A panic from
/// downstream is recorded as the `Internal` failure recovery will turn it into,
/// then the unwind continues outward.
#[derive(Debug, Default)]
pub struct AccessLogStage(());

impl AccessLogStage {
    pub fn new() -> Self {
        Self(())
    }
}

impl Stage for AccessLogStage {
    fn name(&self) -> &'static str { "access_log" }

    fn call<'a>(&'a self, call: Call, next: Next<'a>) -> BoxFuture<'a, Reply> {
        let record = AccessRecord::new(&call, Instant::now());
        // `None` when the metadata disappeared after the session stage.
        let trace_id = call.metadata().map(|md| md.get(TRACE_ID).unwrap_or_default().to_owned());
        let downstream = AssertUnwindSafe(async move { next.run(call).await });

        Box::pin(async move {
            let reply = match downstream.catch_unwind().await {
                Ok(reply) => reply,
                Err(payload) => {
                    let status = Status::internal(panic_message(&*payload));
                    record.failure(trace_id.as_deref().unwrap_or_default(), &status);
                    std::panic::resume_unwind(payload);
                }
            };

            match (&reply, trace_id) {
                (Ok(_), _) => record.success(),
                (Err(status), Some(trace_id)) => record.failure(&trace_id, status),
                (Err(status), None) => {
                    record.failure("", status);
                    return Err(Status::invalid_argument("empty metadata"));
                }
            }
            reply
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use tracing::field::{Field, Visit};
    use tracing_subscriber::Layer;
    use tracing_subscriber::layer::{Context, SubscriberExt};

    use super::*;
    use crate::chain::Chain;
    use crate::handler::Handler;
    use crate::metadata::Metadata;
    use crate::{CallContext, Code};

    /// Fields of every access record emitted on this thread.
    #[derive(Clone, Default)]
    struct Records(Arc<Mutex<Vec<Recorded>>>);

    #[derive(Clone, Debug, Default)]
    struct Recorded {
        quota: f64,
        code: Option<String>,
    }

    impl Visit for Recorded {
        fn record_f64(&mut self, field: &Field, value: f64) {
            if field.name() == "timeout_quota_seconds" {
                self.quota = value;
            }
        }

        fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
            if field.name() == "code" {
                self.code = Some(format!("{value:?}"));
            }
        }
    }

    impl<S: tracing::Subscriber> Layer<S> for Records {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            if event.metadata().target() == "applyd::access" {
                let mut recorded = Recorded::default();
                event.record(&mut recorded);
                self.0.lock().unwrap().push(recorded);
            }
        }
    }

    /// Drops the call metadata before handing the call on.
    struct Strip;

    impl Stage for Strip {
        fn name(&self) -> &'static str { "strip" }

        fn call<'a>(&'a self, mut call: Call, next: Next<'a>) -> BoxFuture<'a, Reply> {
            call.take_metadata();
            next.run(call)
        }
    }

    /// Uses up part of the deadline before the access log sees the call.
    struct Delay(Duration);

    impl Stage for Delay {
        fn name(&self) -> &'static str { "delay" }

        fn call<'a>(&'a self, call: Call, next: Next<'a>) -> BoxFuture<'a, Reply> {
            Box::pin(async move {
                tokio::time::sleep(self.0).await;
                next.run(call).await
            })
        }
    }

    async fn missing(_call: Call) -> Result<(), Status> {
        Err(Status::not_found("no record found for id 7"))
    }

    async fn found(_call: Call) -> Result<serde_json::Value, Status> {
        Ok(serde_json::json!({ "id": 7 }))
    }

    fn call() -> Call {
        Call::new("/t/Get", serde_json::json!({ "id": 7 })).with_metadata(Metadata::new().with(TRACE_ID, "t-7"))
    }

    #[tokio::test]
    async fn vanished_metadata_fails_closed() {
        let chain = Chain::builder().stage(Strip).stage(AccessLogStage::new()).build().unwrap();
        let handler = missing.into_boxed_handler();
        let err = chain.invoke(call(), &handler).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert_eq!(err.message(), "empty metadata");
    }

    #[tokio::test]
    async fn replies_pass_through_unchanged() {
        let chain = Chain::builder().stage(AccessLogStage::new()).build().unwrap();

        let ok = chain.invoke(call(), &found.into_boxed_handler()).await.unwrap();
        assert_eq!(ok, serde_json::json!({ "id": 7 }));

        let err = chain.invoke(call(), &missing.into_boxed_handler()).await.unwrap_err();
        assert_eq!(err, Status::not_found("no record found for id 7"));

        let stripped = Chain::builder().stage(Strip).stage(AccessLogStage::new()).build().unwrap();
        let ok = stripped.invoke(call(), &found.into_boxed_handler()).await.unwrap();
        assert_eq!(ok, serde_json::json!({ "id": 7 }));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_quota_is_measured_at_stage_entry() {
        let records = Records::default();
        let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(records.clone()));

        let chain = Chain::builder()
            .stage(Delay(Duration::from_secs(1)))
            .stage(AccessLogStage::new())
            .build()
            .unwrap();
        let slow = |_call: Call| async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Err::<(), _>(Status::not_found("gone"))
        };
        let call = call().with_context(CallContext::with_timeout(Duration::from_secs(3)));
        chain.invoke(call, &slow.into_boxed_handler()).await.unwrap_err();

        let records = records.0.lock().unwrap().clone();
        assert_eq!(records.len(), 1);
        assert!((records[0].quota - 2.0).abs() < 1e-3, "quota {}", records[0].quota);
        assert_eq!(records[0].code.as_deref(), Some("not_found"));
    }
}
