//! Executor glue for the Redis store tests.
//!
//! The store is runtime-agnostic; tests drive it on whichever runtime the
//! enabled Redis feature brings. `redis-tokio` wins when both are on.

use std::{
    future::Future,
    time::{Duration, Instant},
};

#[cfg(feature = "redis-tokio")]
pub(super) fn block_on<F, T>(f: F) -> T
where
    F: Future<Output = T>,
{
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(f)
}

#[cfg(all(feature = "redis-smol", not(feature = "redis-tokio")))]
pub(super) fn block_on<F, T>(f: F) -> T
where
    F: Future<Output = T>,
{
    smol::block_on(f)
}

#[cfg(feature = "redis-tokio")]
pub(super) async fn sleep(d: Duration) {
    tokio::time::sleep(d).await;
}

#[cfg(all(feature = "redis-smol", not(feature = "redis-tokio")))]
pub(super) async fn sleep(d: Duration) {
    smol::Timer::after(d).await;
}

/// Await `f` and report how long it took.
pub(super) async fn timed<F, T>(f: F) -> (T, Duration)
where
    F: Future<Output = T>,
{
    let started = Instant::now();
    let output = f.await;
    (output, started.elapsed())
}

/// Await `f`, or give up after `limit`. `None` means the deadline won.
pub(super) async fn within<F, T>(limit: Duration, f: F) -> Option<T>
where
    F: Future<Output = T>,
{
    let f = std::pin::pin!(f);
    let deadline = std::pin::pin!(sleep(limit));

    match futures::future::select(f, deadline).await {
        futures::future::Either::Left((output, _)) => Some(output),
        futures::future::Either::Right(_) => None,
    }
}
