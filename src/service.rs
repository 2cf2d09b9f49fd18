//! `infra.apply.v1.InfraApply` handlers.
//!
//! Each handler decodes its request, talks to the [`ApplyStore`] and builds
//! the reply. Identity, tracing and logging have already been taken care of
//! by the chain; handlers only read the subject id from the call context.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::call::Call;
use crate::handler::Handler;
use crate::router::Router;
use crate::status::Status;
use crate::store::{ApplyChanges, ApplyStatus, ApplyStore, FindQuery, InfraApply, StoreError};

pub const SERVICE: &str = "infra.apply.v1.InfraApply";
pub const LIST: &str = "/infra.apply.v1.InfraApply/ListInfraApply";
pub const ADD: &str = "/infra.apply.v1.InfraApply/AddInfraApply";
pub const UPDATE: &str = "/infra.apply.v1.InfraApply/UpdateInfraApply";
pub const DELETE: &str = "/infra.apply.v1.InfraApply/DelInfraApply";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ListInfraApplyReq {
    /// 1-based.
    pub page_idx: i32,
    /// `-1` for everything.
    pub page_size: i32,
    /// Pattern matched against the subject name.
    pub search: String,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct DetailInfraApplyReply {
    pub id: i32,
    pub device_code: String,
    pub applyer: String,
    pub status: String,
    pub subject_name: String,
    pub review_id: String,
    pub expire_tm: String,
    pub review_tm: String,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ModelPage {
    pub page_size: i32,
    pub page_idx: i32,
    pub total: i32,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ListInfraApplyReply {
    pub record: Vec<DetailInfraApplyReply>,
    pub page: ModelPage,
    pub exhausted: bool,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AddInfraApplyReq {
    pub device_code: String,
    pub subject_name: String,
    /// Defaults to the authenticated subject.
    pub applyer: String,
    pub expire_tm: String,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct AddInfraApplyReply {
    pub id: i32,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct UpdateInfraApplyReq {
    pub id: i32,
    pub status: Option<String>,
    pub review_id: Option<String>,
    pub review_tm: Option<String>,
    pub expire_tm: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct UpdateInfraApplyReply {}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DelInfraApplyReq {
    pub id: i32,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct DelInfraApplyReply {}

fn store_status(err: StoreError) -> Status {
    match err {
        StoreError::InvalidPageSize(_) | StoreError::NegativeOffset(_) | StoreError::UnknownField { .. } => {
            Status::invalid_argument(err.to_string())
        }
        StoreError::NotFound(_) => Status::not_found(err.to_string()),
        StoreError::Closed => Status::new(crate::Code::Unavailable, "store unavailable"),
        StoreError::Backend(detail) => Status::internal("storage failure").with_detail(detail),
    }
}

fn render_time(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.format(TIME_FORMAT).to_string()).unwrap_or_default()
}

fn parse_time(field: &str, s: &str) -> Result<Option<DateTime<Utc>>, Status> {
    if s.is_empty() {
        return Ok(None);
    }
    NaiveDateTime::parse_from_str(s, TIME_FORMAT)
        .map(|t| Some(t.and_utc()))
        .map_err(|e| Status::invalid_argument(format!("{field}: expected `YYYY-MM-DD HH:MM:SS`: {e}")))
}

fn parse_status(s: &str) -> Result<ApplyStatus, Status> {
    s.parse().map_err(|()| Status::invalid_argument(format!("unknown status `{s}`")))
}

impl From<InfraApply> for DetailInfraApplyReply {
    fn from(r: InfraApply) -> Self {
        Self {
            id: r.id,
            device_code: r.device_code,
            applyer: r.applyer,
            status: r.status.as_str().to_owned(),
            subject_name: r.subject_name,
            review_id: r.review_id,
            expire_tm: render_time(r.expires_at),
            review_tm: render_time(r.reviewed_at),
        }
    }
}

/// The apply workflow service.
pub struct InfraApplyService {
    store: Arc<dyn ApplyStore>,
}

impl InfraApplyService {
    pub fn new(store: Arc<dyn ApplyStore>) -> Self {
        Self { store }
    }

    /// Router with all four methods bound to this service.
    pub fn into_router(self) -> Router {
        let svc = Arc::new(self);
        Router::new()
            .route(LIST, bind(&svc, |s, call| async move { s.list(call).await }))
            .route(ADD, bind(&svc, |s, call| async move { s.add(call).await }))
            .route(UPDATE, bind(&svc, |s, call| async move { s.update(call).await }))
            .route(DELETE, bind(&svc, |s, call| async move { s.delete(call).await }))
    }

    pub async fn list(&self, call: Call) -> Result<ListInfraApplyReply, Status> {
        let req: ListInfraApplyReq = call.decode()?;
        if req.page_idx < 1 {
            return Err(Status::invalid_argument("page_idx starts at 1"));
        }
        let limit = req.page_size;
        let offset = req.page_size.saturating_mul(req.page_idx - 1);

        let mut query = FindQuery::page(limit, offset);
        if !req.search.is_empty() {
            query = query.like("subject_name", req.search);
        }
        let page = self.store.find_like(&query).await.map_err(store_status)?;

        let total = i32::try_from(page.total).unwrap_or(i32::MAX);
        let exhausted = limit < 0 || limit.saturating_add(offset) >= total;
        Ok(ListInfraApplyReply {
            record: page.records.into_iter().map(Into::into).collect(),
            page: ModelPage { page_size: req.page_size, page_idx: req.page_idx, total },
            exhausted,
        })
    }

    pub async fn add(&self, call: Call) -> Result<AddInfraApplyReply, Status> {
        let req: AddInfraApplyReq = call.decode()?;
        if req.subject_name.is_empty() {
            return Err(Status::invalid_argument("subject_name is required"));
        }
        let applyer = if req.applyer.is_empty() {
            call.context().subject_id().to_owned()
        } else {
            req.applyer
        };
        let record = InfraApply {
            device_code: req.device_code,
            applyer,
            subject_name: req.subject_name,
            expires_at: parse_time("expire_tm", &req.expire_tm)?,
            ..InfraApply::default()
        };
        let stored = self.store.add_one(record).await.map_err(store_status)?;
        Ok(AddInfraApplyReply { id: stored.id })
    }

    pub async fn update(&self, call: Call) -> Result<UpdateInfraApplyReply, Status> {
        let req: UpdateInfraApplyReq = call.decode()?;
        let changes = ApplyChanges {
            status: req.status.as_deref().map(parse_status).transpose()?,
            review_id: req.review_id,
            reviewed_at: match req.review_tm.as_deref() {
                Some(s) => parse_time("review_tm", s)?,
                None => None,
            },
            expires_at: match req.expire_tm.as_deref() {
                Some(s) => parse_time("expire_tm", s)?,
                None => None,
            },
        };
        self.store.update_one(req.id, &changes).await.map_err(store_status)?;
        Ok(UpdateInfraApplyReply {})
    }

    pub async fn delete(&self, call: Call) -> Result<DelInfraApplyReply, Status> {
        let req: DelInfraApplyReq = call.decode()?;
        self.store.delete_one(req.id).await.map_err(store_status)?;
        Ok(DelInfraApplyReply {})
    }
}

/// Adapts a service method to the [`Handler`] shape.
fn bind<F, Fut, T>(svc: &Arc<InfraApplyService>, f: F) -> impl Handler
where
    F: Fn(Arc<InfraApplyService>, Call) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, Status>> + Send + 'static,
    T: Serialize + Send + 'static,
{
    let svc = Arc::clone(svc);
    move |call: Call| f(Arc::clone(&svc), call)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::MemoryStore;
    use crate::{CallContext, Code};

    fn service() -> InfraApplyService {
        InfraApplyService::new(Arc::new(MemoryStore::new()))
    }

    fn call(method: &str, payload: serde_json::Value) -> Call {
        Call::new(method, payload)
    }

    async fn seed(svc: &InfraApplyService, subjects: &[&str]) {
        for s in subjects {
            svc.add(call(ADD, json!({ "subject_name": s, "device_code": "d" }))).await.unwrap();
        }
    }

    #[tokio::test]
    async fn list_pages_and_flags_exhaustion() {
        let svc = service();
        seed(&svc, &["a1", "a2", "a3"]).await;

        let first = svc.list(call(LIST, json!({ "page_idx": 1, "page_size": 2 }))).await.unwrap();
        assert_eq!(first.record.len(), 2);
        assert_eq!(first.page.total, 3);
        assert!(!first.exhausted);

        let second = svc.list(call(LIST, json!({ "page_idx": 2, "page_size": 2 }))).await.unwrap();
        assert_eq!(second.record.len(), 1);
        assert!(second.exhausted);
    }

    #[tokio::test]
    async fn unbounded_page_is_exhausted() {
        let svc = service();
        seed(&svc, &["a1", "a2"]).await;
        let all = svc.list(call(LIST, json!({ "page_idx": 1, "page_size": -1 }))).await.unwrap();
        assert_eq!(all.record.len(), 2);
        assert!(all.exhausted);
    }

    #[tokio::test]
    async fn search_matches_subject_name() {
        let svc = service();
        seed(&svc, &["mysql-prod", "redis-prod", "mysql-dev"]).await;
        let found = svc.list(call(LIST, json!({ "page_idx": 1, "page_size": 10, "search": "mysql" }))).await.unwrap();
        assert_eq!(found.page.total, 2);
    }

    #[tokio::test]
    async fn zero_page_index_is_invalid() {
        let err = service().list(call(LIST, json!({ "page_idx": 0, "page_size": 10 }))).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn add_defaults_applyer_to_caller() {
        let svc = service();
        let ctx = CallContext::new().with_session("t", "tok", "u1");
        let add = call(ADD, json!({ "subject_name": "s", "expire_tm": "2030-01-02 03:04:05" })).with_context(ctx);
        svc.add(add).await.unwrap();

        let listed = svc.list(call(LIST, json!({ "page_idx": 1, "page_size": 10 }))).await.unwrap();
        assert_eq!(listed.record[0].applyer, "u1");
        assert_eq!(listed.record[0].expire_tm, "2030-01-02 03:04:05");
        assert_eq!(listed.record[0].status, "init");
    }

    #[tokio::test]
    async fn update_validates_status_and_id() {
        let svc = service();
        seed(&svc, &["s"]).await;

        let bad = svc.update(call(UPDATE, json!({ "id": 1, "status": "审批完成" }))).await.unwrap_err();
        assert_eq!(bad.code(), Code::InvalidArgument);

        let missing = svc.update(call(UPDATE, json!({ "id": 42, "status": "approved" }))).await.unwrap_err();
        assert_eq!(missing.code(), Code::NotFound);

        svc.update(call(UPDATE, json!({ "id": 1, "status": "approved", "review_tm": "2030-01-01 00:00:00" }))).await.unwrap();
        let listed = svc.list(call(LIST, json!({ "page_idx": 1, "page_size": 10 }))).await.unwrap();
        assert_eq!(listed.record[0].status, "approved");
        assert_eq!(listed.record[0].review_tm, "2030-01-01 00:00:00");
    }

    #[tokio::test]
    async fn delete_removes_the_record() {
        let svc = service();
        seed(&svc, &["s"]).await;
        svc.delete(call(DELETE, json!({ "id": 1 }))).await.unwrap();
        let err = svc.delete(call(DELETE, json!({ "id": 1 }))).await.unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
    }

    #[test]
    fn router_registers_all_methods() {
        let router = service().into_router();
        assert_eq!(router.methods(), [LIST, ADD, UPDATE, DELETE].map(str::to_owned));
    }
}
