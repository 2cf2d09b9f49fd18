use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tracing::debug;
use uuid::Uuid;

use crate::auth::{BEARER, TokenAuthenticator};
use crate::call::{Call, Reply};
use crate::chain::{Next, Stage};
use crate::metadata::{AUTHORIZATION, Metadata, TOKEN, TRACE_ID, UID};
use crate::middleware::AccessRecord;
use crate::status::Status;

/// Session policy.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Upper bound on how long any call may run.
    pub timeout: Duration,
    /// Reject calls that carry no `authorization` entry. Off by default:
    /// anonymous calls proceed with an empty subject id.
    pub require_auth: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(10), require_auth: false }
    }
}

/// Values established for one call.
struct Session {
    trace_id: String,
    token: String,
    subject_id: String,
}

/// Establishes deadline, trace id and identity for every call.
///
/// Rejections made here never reach the access log stage, so they are
/// recorded here in the same shape.
#[derive(Debug)]
pub struct SessionStage {
    authenticator: TokenAuthenticator,
    config: SessionConfig,
}

impl SessionStage {
    pub fn new(authenticator: TokenAuthenticator, config: SessionConfig) -> Self {
        Self { authenticator, config }
    }

    /// Reads and extends the metadata. On failure returns the trace id known
    /// so far alongside the status.
    fn establish(&self, md: &mut Metadata) -> Result<Session, (String, Status)> {
        let trace_id = match md.get(TRACE_ID) {
            Some(id) => id.to_owned(),
            None => {
                let id = Uuid::new_v4().to_string();
                md.append(TRACE_ID, id.clone());
                id
            }
        };

        let (token, subject_id) = match md.get(AUTHORIZATION) {
            Some(header) => {
                let token = match header.split_once(' ') {
                    Some((BEARER, token)) if !token.is_empty() => token.to_owned(),
                    _ => return Err((trace_id, Status::unauthenticated("bad authorization string"))),
                };
                let identity = self.authenticator.authenticate(header).map_err(|e| {
                    debug!(%trace_id, error = %e, "bearer token rejected");
                    let status = Status::unauthenticated("parse token failed").with_detail(e.to_string());
                    (trace_id.clone(), status)
                })?;
                (token, identity.subject_id)
            }
            None if self.config.require_auth => {
                return Err((trace_id, Status::unauthenticated("missing authorization")));
            }
            None => (String::new(), String::new()),
        };

        // Caller-sent entries under these keys must not shadow the session's.
        md.insert(TOKEN, token.clone());
        md.insert(UID, subject_id.clone());
        Ok(Session { trace_id, token, subject_id })
    }
}

impl Stage for SessionStage {
    fn name(&self) -> &'static str { "session" }

    fn call<'a>(&'a self, mut call: Call, next: Next<'a>) -> BoxFuture<'a, Reply> {
        Box::pin(async move {
            let started = Instant::now();
            // A timeout too large to represent leaves the deadline as it is.
            if let Some(cap) = tokio::time::Instant::now().checked_add(self.config.timeout) {
                let bounded = call.context().with_deadline(cap);
                call.replace_context(bounded);
            }

            let established = match call.metadata_mut() {
                Some(md) => self.establish(md),
                None => Err((String::new(), Status::invalid_argument("empty metadata"))),
            };

            match established {
                Ok(session) => {
                    let ctx = call.context().with_session(session.trace_id, session.token, session.subject_id);
                    call.replace_context(ctx);
                    next.run(call).await
                }
                Err((trace_id, status)) => {
                    AccessRecord::new(&call, started).failure(&trace_id, &status);
                    Err(status)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;
    use crate::auth::Identity;
    use crate::chain::Chain;
    use crate::handler::Handler;
    use crate::{CallContext, Code};

    const SECRET: &[u8] = b"session-secret";

    fn stage(config: SessionConfig) -> SessionStage {
        SessionStage::new(TokenAuthenticator::new(SECRET), config)
    }

    fn unix_now() -> i64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64
    }

    async fn whoami(call: Call) -> Result<serde_json::Value, Status> {
        let md = call.metadata().cloned().unwrap_or_default();
        Ok(serde_json::json!({
            "subject": call.context().subject_id(),
            "trace": call.context().trace_id(),
            "md_trace": md.get(TRACE_ID),
            "md_uid": md.get(UID),
            "md_token": md.get(TOKEN),
            "remaining_ms": call.context().remaining().map(|d| d.as_millis() as u64),
        }))
    }

    async fn run(config: SessionConfig, call: Call) -> Reply {
        let chain = Chain::builder().stage(stage(config)).build().unwrap();
        let handler = whoami.into_boxed_handler();
        chain.invoke(call, &handler).await
    }

    fn call(md: Metadata) -> Call {
        Call::new("/t/WhoAmI", serde_json::Value::Null).with_metadata(md)
    }

    #[tokio::test]
    async fn caller_trace_id_is_reused() {
        let reply = run(SessionConfig::default(), call(Metadata::new().with(TRACE_ID, "caller-trace"))).await.unwrap();
        assert_eq!(reply["trace"], "caller-trace");
        assert_eq!(reply["md_trace"], "caller-trace");
    }

    #[tokio::test]
    async fn missing_trace_id_is_generated() {
        let reply = run(SessionConfig::default(), call(Metadata::new())).await.unwrap();
        let trace = reply["trace"].as_str().unwrap();
        assert!(Uuid::parse_str(trace).is_ok());
        assert_eq!(reply["md_trace"], trace);
    }

    #[tokio::test]
    async fn valid_token_injects_subject() {
        let token = Identity::new("u1", unix_now() + 3600).sign(SECRET).unwrap();
        let md = Metadata::new().with(AUTHORIZATION, format!("Bearer {token}"));
        let reply = run(SessionConfig::default(), call(md)).await.unwrap();
        assert_eq!(reply["subject"], "u1");
        assert_eq!(reply["md_uid"], "u1");
    }

    #[tokio::test]
    async fn wrong_scheme_is_unauthenticated() {
        let md = Metadata::new().with(AUTHORIZATION, "Basic dTE6cHc=");
        let err = run(SessionConfig::default(), call(md)).await.unwrap_err();
        assert_eq!(err.code(), Code::Unauthenticated);
        assert_eq!(err.message(), "bad authorization string");
    }

    #[tokio::test]
    async fn rejection_detail_is_kept_out_of_the_message() {
        let token = Identity::new("u1", unix_now() - 10).sign(SECRET).unwrap();
        let md = Metadata::new().with(AUTHORIZATION, format!("Bearer {token}"));
        let err = run(SessionConfig::default(), call(md)).await.unwrap_err();
        assert_eq!(err.code(), Code::Unauthenticated);
        assert_eq!(err.message(), "parse token failed");
        assert!(err.detail().unwrap().contains("expired"));
    }

    #[tokio::test]
    async fn require_auth_rejects_anonymous_calls() {
        let config = SessionConfig { require_auth: true, ..SessionConfig::default() };
        let err = run(config, call(Metadata::new())).await.unwrap_err();
        assert_eq!(err.code(), Code::Unauthenticated);
    }

    #[tokio::test]
    async fn deadline_is_capped_by_session_timeout() {
        let config = SessionConfig { timeout: Duration::from_secs(1), ..SessionConfig::default() };
        let call = call(Metadata::new()).with_context(CallContext::with_timeout(Duration::from_secs(60)));
        let reply = run(config, call).await.unwrap();
        assert!(reply["remaining_ms"].as_u64().unwrap() <= 1000);
    }

    #[tokio::test]
    async fn caller_cannot_forge_identity_entries() {
        let token = Identity::new("u1", unix_now() + 3600).sign(SECRET).unwrap();
        let md = Metadata::new()
            .with(UID, "admin")
            .with(TOKEN, "forged")
            .with(AUTHORIZATION, format!("Bearer {token}"));
        let reply = run(SessionConfig::default(), call(md)).await.unwrap();
        assert_eq!(reply["md_uid"], "u1");
        assert_eq!(reply["md_token"], token.as_str());
    }

    #[tokio::test]
    async fn anonymous_call_clears_caller_identity_entries() {
        let md = Metadata::new().with(UID, "admin").with(TOKEN, "forged");
        let reply = run(SessionConfig::default(), call(md)).await.unwrap();
        assert_eq!(reply["subject"], "");
        assert_eq!(reply["md_uid"], "");
        assert_eq!(reply["md_token"], "");
    }

    #[tokio::test]
    async fn unrepresentable_timeout_keeps_the_caller_deadline() {
        let config = SessionConfig { timeout: Duration::from_secs(u64::MAX), ..SessionConfig::default() };
        let reply = run(config.clone(), call(Metadata::new())).await.unwrap();
        assert!(reply["remaining_ms"].is_null());

        let bounded = call(Metadata::new()).with_context(CallContext::with_timeout(Duration::from_secs(2)));
        let reply = run(config, bounded).await.unwrap();
        assert!(reply["remaining_ms"].as_u64().unwrap() <= 2000);
    }

    #[tokio::test]
    async fn missing_metadata_is_invalid_argument() {
        let chain = Chain::builder().stage(stage(SessionConfig::default())).build().unwrap();
        let handler = whoami.into_boxed_handler();
        let err = chain.invoke(Call::new("/t/WhoAmI", serde_json::Value::Null), &handler).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }
}
