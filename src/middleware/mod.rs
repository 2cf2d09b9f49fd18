//! Built-in interceptor stages.
//!
//! The production chain is always, outermost first:
//!
//! | Stage | Does |
//! |---|---|
//! | [`RecoveryStage`] | turns a panic anywhere downstream into `Internal` |
//! | [`SessionStage`] | deadline, trace id, bearer authentication |
//! | [`AccessLogStage`] | one structured record per call |
//!
//! Recovery must wrap everything else. Session must run before the handler so
//! the trace id and identity exist for it and for the access log.

mod access_log;
mod recovery;
mod session;

pub use access_log::AccessLogStage;
pub use recovery::RecoveryStage;
pub use session::{SessionConfig, SessionStage};

pub(crate) use access_log::AccessRecord;
pub(crate) use recovery::panic_message;
