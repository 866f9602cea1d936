#[cfg(any(feature = "redis-tokio", feature = "redis-smol"))]
mod runtime;

mod test_cleanup_loop;
