//! Persistence collaborator for apply records.
//!
//! Handlers talk to an [`ApplyStore`]; how rows are kept is the store's
//! business. Each record type describes its own table through [`Entity`],
//! so the table name and the searchable columns are fixed at compile time.
//!
//! [`MemoryStore`] is the in-process implementation used by the binary and
//! by the tests.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use futures::future::{self, BoxFuture};

/// Largest page a single query may ask for.
pub const PAGE_SIZE: i32 = 1024;

/// Static description of a stored record type.
pub trait Entity {
    const TABLE: &'static str;
    const FIELDS: &'static [&'static str];

    /// Column value rendered as text, for filtering and pattern search.
    fn field(&self, name: &str) -> Option<String>;
}

/// Review state of an apply record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ApplyStatus {
    #[default]
    Init,
    Refused,
    Approved,
    Expired,
}

impl ApplyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init     => "init",
            Self::Refused  => "refused",
            Self::Approved => "approved",
            Self::Expired  => "expired",
        }
    }
}

impl FromStr for ApplyStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init"     => Ok(Self::Init),
            "refused"  => Ok(Self::Refused),
            "approved" => Ok(Self::Approved),
            "expired"  => Ok(Self::Expired),
            _          => Err(()),
        }
    }
}

impl fmt::Display for ApplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One infra apply request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InfraApply {
    pub id: i32,
    pub device_code: String,
    pub applyer: String,
    pub status: ApplyStatus,
    pub subject_name: String,
    pub review_id: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

impl Entity for InfraApply {
    const TABLE: &'static str = "t_subject_apply";
    const FIELDS: &'static [&'static str] =
        &["id", "device_code", "applyer", "status", "subject_name", "review_id", "expires_at", "review_at"];

    fn field(&self, name: &str) -> Option<String> {
        let value = match name {
            "id"           => self.id.to_string(),
            "device_code"  => self.device_code.clone(),
            "applyer"      => self.applyer.clone(),
            "status"       => self.status.as_str().to_owned(),
            "subject_name" => self.subject_name.clone(),
            "review_id"    => self.review_id.clone(),
            "expires_at"   => self.expires_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            "review_at"    => self.reviewed_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            _              => return None,
        };
        Some(value)
    }
}

/// Fields an update may change. `None` leaves the column as it is.
#[derive(Clone, Debug, Default)]
pub struct ApplyChanges {
    pub status: Option<ApplyStatus>,
    pub review_id: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A paged pattern query.
///
/// `filters` must match exactly, `search` entries are `LIKE %value%`; all
/// conditions are AND-ed. `limit == -1` means no limit.
#[derive(Clone, Debug)]
pub struct FindQuery {
    pub filters: Vec<(String, String)>,
    pub search: Vec<(String, String)>,
    pub limit: i32,
    pub offset: i32,
}

impl FindQuery {
    pub fn page(limit: i32, offset: i32) -> Self {
        Self { filters: Vec::new(), search: Vec::new(), limit, offset }
    }

    pub fn like(mut self, field: &str, pattern: impl Into<String>) -> Self {
        self.search.push((field.to_owned(), pattern.into()));
        self
    }

    pub fn filter(mut self, field: &str, value: impl Into<String>) -> Self {
        self.filters.push((field.to_owned(), value.into()));
        self
    }
}

/// One page of results plus the total number of matches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Page<T> {
    pub records: Vec<T>,
    pub total: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid page size {0}")]
    InvalidPageSize(i32),

    #[error("offset cannot be negative: {0}")]
    NegativeOffset(i32),

    #[error("table {table} has no field `{field}`")]
    UnknownField { table: &'static str, field: String },

    #[error("no record found for id {0}")]
    NotFound(i32),

    #[error("store is closed")]
    Closed,

    #[error("store backend: {0}")]
    Backend(String),
}

/// Data access for apply records.
pub trait ApplyStore: Send + Sync + 'static {
    fn find_like<'a>(&'a self, query: &'a FindQuery) -> BoxFuture<'a, Result<Page<InfraApply>, StoreError>>;

    /// Inserts `record` under a fresh id and returns the stored row.
    fn add_one(&self, record: InfraApply) -> BoxFuture<'_, Result<InfraApply, StoreError>>;

    fn update_one<'a>(&'a self, id: i32, changes: &'a ApplyChanges) -> BoxFuture<'a, Result<InfraApply, StoreError>>;

    fn delete_one(&self, id: i32) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Releases the backing connection. Later operations fail with [`StoreError::Closed`].
    fn close(&self);
}

fn check_fields<E: Entity>(pairs: &[(String, String)]) -> Result<(), StoreError> {
    match pairs.iter().find(|(name, _)| !E::FIELDS.contains(&name.as_str())) {
        Some((name, _)) => Err(StoreError::UnknownField { table: E::TABLE, field: name.clone() }),
        None => Ok(()),
    }
}

#[derive(Default)]
struct Rows {
    next_id: i32,
    rows: BTreeMap<i32, InfraApply>,
    closed: bool,
}

/// In-process [`ApplyStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Rows>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&Rows) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let rows = self.inner.read().map_err(|_| StoreError::Backend("lock poisoned".into()))?;
        if rows.closed {
            return Err(StoreError::Closed);
        }
        f(&rows)
    }

    fn write<T>(&self, f: impl FnOnce(&mut Rows) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let mut rows = self.inner.write().map_err(|_| StoreError::Backend("lock poisoned".into()))?;
        if rows.closed {
            return Err(StoreError::Closed);
        }
        f(&mut rows)
    }

    fn find(&self, query: &FindQuery) -> Result<Page<InfraApply>, StoreError> {
        if query.limit < -1 || query.limit == 0 || query.limit > PAGE_SIZE {
            return Err(StoreError::InvalidPageSize(query.limit));
        }
        if query.offset < -1 {
            return Err(StoreError::NegativeOffset(query.offset));
        }
        check_fields::<InfraApply>(&query.filters)?;
        check_fields::<InfraApply>(&query.search)?;

        self.read(|rows| {
            let matched: Vec<&InfraApply> = rows.rows.values()
                .filter(|r| query.filters.iter().all(|(f, v)| r.field(f).as_deref() == Some(v.as_str())))
                .filter(|r| query.search.iter().all(|(f, p)| r.field(f).is_some_and(|v| v.contains(p.as_str()))))
                .collect();
            let skip = usize::try_from(query.offset).unwrap_or(0);
            let take = usize::try_from(query.limit).unwrap_or(usize::MAX);
            Ok(Page {
                total: matched.len(),
                records: matched.into_iter().skip(skip).take(take).cloned().collect(),
            })
        })
    }
}

impl ApplyStore for MemoryStore {
    fn find_like<'a>(&'a self, query: &'a FindQuery) -> BoxFuture<'a, Result<Page<InfraApply>, StoreError>> {
        Box::pin(future::ready(self.find(query)))
    }

    fn add_one(&self, mut record: InfraApply) -> BoxFuture<'_, Result<InfraApply, StoreError>> {
        let result = self.write(|rows| {
            rows.next_id += 1;
            record.id = rows.next_id;
            rows.rows.insert(record.id, record.clone());
            Ok(record)
        });
        Box::pin(future::ready(result))
    }

    fn update_one<'a>(&'a self, id: i32, changes: &'a ApplyChanges) -> BoxFuture<'a, Result<InfraApply, StoreError>> {
        let result = self.write(|rows| {
            let row = rows.rows.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            if let Some(status) = changes.status {
                row.status = status;
            }
            if let Some(review_id) = &changes.review_id {
                row.review_id.clone_from(review_id);
            }
            if changes.reviewed_at.is_some() {
                row.reviewed_at = changes.reviewed_at;
            }
            if changes.expires_at.is_some() {
                row.expires_at = changes.expires_at;
            }
            Ok(row.clone())
        });
        Box::pin(future::ready(result))
    }

    fn delete_one(&self, id: i32) -> BoxFuture<'_, Result<(), StoreError>> {
        let result = self.write(|rows| {
            rows.rows.remove(&id).map(|_| ()).ok_or(StoreError::NotFound(id))
        });
        Box::pin(future::ready(result))
    }

    fn close(&self) {
        if let Ok(mut rows) = self.inner.write() {
            rows.closed = true;
        }
    }
}
