//! Shared integration-test helpers: every `Connection`/`Client`/`Server`
//! entry point requires being called from its owning context, so tests
//! need a way to drive a future on a particular [`TokioContext`] and get
//! the result back on the test's own runtime.

use cluster_rpc::{AnyContext, TokioContext};
use std::sync::Arc;

/// Installs a `tracing` subscriber for the duration of the test binary, the
/// same `tracing_subscriber::fmt` layer the teacher's binary builds in
/// `src/main.rs`, minus its dual-output layering. Safe to call from every
/// test function: only the first call actually installs anything.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn any_ctx(ctx: &TokioContext) -> AnyContext {
    Arc::new(ctx.clone())
}

/// Spawn `fut` onto `ctx`'s executor and await its result here.
pub async fn run_on<T: Send + 'static>(
    ctx: &TokioContext,
    fut: impl std::future::Future<Output = T> + Send + 'static,
) -> T {
    let (tx, rx) = tokio::sync::oneshot::channel();
    ctx.executor().spawn(async move {
        let _ = tx.send(fut.await);
    });
    rx.await.unwrap()
}
