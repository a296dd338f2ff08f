//! # Context plumbing (§2, §4.10, §5)
//!
//! A `Context` is a single-threaded cooperative executor plus a periodic
//! scheduler. Every public entry point on [`crate::connection::Connection`],
//! [`crate::server::Server`] and [`crate::client::Client`] requires the
//! caller to be "on" a context, and every callback registered from a
//! context is guaranteed to run on that same context's executor — never
//! inline on the I/O task that discovered the completion.
//!
//! [`TokioContext`] backs this with a dedicated OS thread running a
//! current-thread Tokio runtime. `Handle::spawn` schedules work onto that
//! thread from anywhere; a thread-local marker makes `is_current()` a cheap
//! comparison, the same trick the pack's context-affinity examples use to
//! tag callers.

use crate::error::TransportError;
use std::cell::Cell;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_CONTEXT: Cell<Option<u64>> = Cell::new(None);
}

/// A handle that posts work onto one context's executor.
#[derive(Clone)]
pub struct Executor {
    handle: tokio::runtime::Handle,
}

impl Executor {
    /// Schedule `fut` to run on this executor's thread. The caller need not
    /// be on that thread; the task is always polled there.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(fut);
    }
}

/// A handle to a periodic task scheduled via [`Context::schedule`].
/// Dropping it does not cancel the task; call [`Scheduled::cancel`]
/// explicitly (the reap timer relies on this being guaranteed on close).
pub struct Scheduled {
    handle: tokio::task::JoinHandle<()>,
}

impl Scheduled {
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

/// A single-threaded cooperative context: an executor plus a scheduler.
pub trait Context: Clone + Send + Sync + 'static {
    fn executor(&self) -> &Executor;

    /// Run `task` every `period`, after an initial `initial` delay, on this
    /// context's executor.
    fn schedule<F>(&self, initial: Duration, period: Duration, task: F) -> Scheduled
    where
        F: FnMut() + Send + 'static;

    /// True if the calling thread is this context's owning thread.
    fn is_current(&self) -> bool;

    /// Guard used by every public entry point per §7's `ArgumentError`.
    fn require_current(&self) -> Result<(), TransportError> {
        if self.is_current() {
            Ok(())
        } else {
            Err(TransportError::argument(
                "operation must be called from its owning context",
            ))
        }
    }
}

/// Object-safe sibling of [`Context`]. `Context::schedule` is generic over
/// `F`, which rules out `dyn Context` directly; [`Connection`],
/// [`crate::server::Server`] and [`crate::client::Client`] all hold
/// whatever context their caller happens to be on, and different callers
/// may be on different concrete `Context` impls, so they need a
/// trait-object handle. Every [`Context`] gets this for free via the
/// blanket impl below.
///
/// [`Connection`]: crate::connection::Connection
pub trait DynContext: Send + Sync + 'static {
    fn executor(&self) -> &Executor;
    fn schedule_dyn(&self, initial: Duration, period: Duration, task: Box<dyn FnMut() + Send>) -> Scheduled;
    fn is_current(&self) -> bool;
}

impl<C: Context> DynContext for C {
    fn executor(&self) -> &Executor {
        Context::executor(self)
    }

    fn schedule_dyn(&self, initial: Duration, period: Duration, mut task: Box<dyn FnMut() + Send>) -> Scheduled {
        self.schedule(initial, period, move || task())
    }

    fn is_current(&self) -> bool {
        Context::is_current(self)
    }
}

/// A type-erased handle to whichever context a caller happens to be on.
/// This is what `Connection`/`Server`/`Client` actually store.
pub type AnyContext = Arc<dyn DynContext>;

/// Guard used by every public entry point per §7's `ArgumentError`, for
/// callers holding a type-erased [`AnyContext`] rather than a concrete
/// [`Context`] impl.
pub fn require_current(ctx: &dyn DynContext) -> Result<(), TransportError> {
    if ctx.is_current() {
        Ok(())
    } else {
        Err(TransportError::argument(
            "operation must be called from its owning context",
        ))
    }
}

/// The crate's default [`Context`]: a dedicated OS thread running a
/// current-thread Tokio runtime.
#[derive(Clone)]
pub struct TokioContext {
    id: u64,
    executor: Executor,
    shutdown: Arc<Notify>,
}

impl TokioContext {
    /// Spawn a new owning thread and its runtime. The thread lives until
    /// [`TokioContext::shutdown`] is called or every clone is dropped... in
    /// practice contexts are long-lived for the process lifetime of a
    /// [`crate::transport::Transport`], so no `Drop`-triggered teardown is
    /// implemented here.
    pub fn spawn_new(thread_name: impl Into<String>) -> Self {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        let shutdown = Arc::new(Notify::new());
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();
        let thread_shutdown = shutdown.clone();

        std::thread::Builder::new()
            .name(thread_name.into())
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to build context runtime");
                let _ = handle_tx.send(rt.handle().clone());
                CURRENT_CONTEXT.with(|c| c.set(Some(id)));
                rt.block_on(async move { thread_shutdown.notified().await });
            })
            .expect("failed to spawn context thread");

        let handle = handle_rx
            .recv()
            .expect("context thread failed to start its runtime");

        Self {
            id,
            executor: Executor { handle },
            shutdown,
        }
    }

    /// Signal the owning thread's keep-alive future to resolve, letting the
    /// thread and its runtime wind down once in-flight tasks finish.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

impl Context for TokioContext {
    fn executor(&self) -> &Executor {
        &self.executor
    }

    fn schedule<F>(&self, initial: Duration, period: Duration, mut task: F) -> Scheduled
    where
        F: FnMut() + Send + 'static,
    {
        let handle = self.executor.handle.spawn(async move {
            tokio::time::sleep(initial).await;
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                task();
            }
        });
        Scheduled { handle }
    }

    fn is_current(&self) -> bool {
        CURRENT_CONTEXT.with(|c| c.get() == Some(self.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn is_current_is_false_outside_the_owning_thread() {
        let ctx = TokioContext::spawn_new("ctx-test");
        assert!(!ctx.is_current());
        ctx.shutdown();
    }

    #[tokio::test]
    async fn spawned_work_runs_on_the_owning_thread() {
        let ctx = TokioContext::spawn_new("ctx-test-2");
        let ctx2 = ctx.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        ctx.executor().spawn(async move {
            let _ = tx.send(ctx2.is_current());
        });
        assert!(rx.await.unwrap());
        ctx.shutdown();
    }

    #[test]
    fn any_context_erases_the_concrete_type() {
        let ctx = TokioContext::spawn_new("ctx-test-any");
        let erased: AnyContext = Arc::new(ctx.clone());
        assert!(!erased.is_current());
        assert!(require_current(erased.as_ref()).is_err());
        ctx.shutdown();
    }

    #[tokio::test]
    async fn schedule_fires_periodically() {
        let ctx = TokioContext::spawn_new("ctx-test-3");
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let scheduled = ctx.schedule(Duration::from_millis(5), Duration::from_millis(5), move || {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(40)).await;
        scheduled.cancel();
        assert!(count.load(Ordering::SeqCst) >= 2);
        ctx.shutdown();
    }
}
