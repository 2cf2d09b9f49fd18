use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::sync::Once;

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::error;

use crate::call::{Call, Reply};
use crate::chain::{Next, Stage};
use crate::status::Status;

/// Upper bound on the backtrace kept for one panic.
const MAX_BACKTRACE_BYTES: usize = 64 << 10;

thread_local! {
    static PANIC_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

/// Chains a panic hook that stashes the panic-site backtrace for this thread.
///
/// The unwind is caught on the same worker thread that panicked, inside the
/// same poll, so the thread-local is still populated when recovery reads it.
fn install_backtrace_hook() {
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let backtrace = Backtrace::force_capture().to_string();
            PANIC_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(backtrace));
            previous(info);
        }));
    });
}

fn take_backtrace() -> String {
    let backtrace = PANIC_BACKTRACE
        .with(|slot| slot.borrow_mut().take())
        .unwrap_or_else(|| Backtrace::force_capture().to_string());
    truncate(backtrace, MAX_BACKTRACE_BYTES)
}

fn truncate(mut s: String, max: usize) -> String {
    if s.len() > max {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
    }
    s
}

/// Text of a panic payload: the `&str` or `String` passed to `panic!`.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_owned()
    }
}

/// Outermost stage: no unwind gets past it.
///
/// A panic raised anywhere downstream (session, access log, handler) is caught
/// here, logged with its backtrace, and returned as an `Internal` status whose
/// message is the panic text. The backtrace stays in the log and in the
/// status detail; callers never see it.
#[derive(Debug)]
pub struct RecoveryStage(());

impl RecoveryStage {
    pub fn new() -> Self {
        install_backtrace_hook();
        Self(())
    }
}

impl Default for RecoveryStage {
    fn default() -> Self { Self::new() }
}

impl Stage for RecoveryStage {
    fn name(&self) -> &'static str { "recovery" }

    fn call<'a>(&'a self, call: Call, next: Next<'a>) -> BoxFuture<'a, Reply> {
        let method = call.method().to_owned();
        let request = call.payload().to_string();
        // Build the downstream future inside the guarded block so a panic
        // while constructing it is caught too.
        let downstream = AssertUnwindSafe(async move { next.run(call).await });
        Box::pin(async move {
            match downstream.catch_unwind().await {
                Ok(reply) => reply,
                Err(payload) => {
                    let message = panic_message(&*payload);
                    let backtrace = take_backtrace();
                    error!(%method, %request, panic = %message, %backtrace, "rpc server panic");
                    Err(Status::internal(message).with_detail(backtrace))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "é".repeat(10);
        let cut = truncate(s, 5);
        assert_eq!(cut, "éé");
    }

    #[test]
    fn panic_message_reads_both_string_kinds() {
        let a: Box<dyn Any + Send> = Box::new("boom");
        let b: Box<dyn Any + Send> = Box::new(String::from("bang"));
        let c: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(&*a), "boom");
        assert_eq!(panic_message(&*b), "bang");
        assert_eq!(panic_message(&*c), "panic with non-string payload");
    }
}
