use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use clap::{Parser, ValueEnum};
use hdrhistogram::Histogram;

use tokenwall::{
    BucketConfig, Capacity, RateLimitDecision, RateLimiter, RateLimiterOptions, RefillRate,
    TokenwallError,
};

#[derive(Clone, Copy, Debug, PartialEq, ValueEnum)]
enum Provider {
    Local,
    Redis,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KeyDist {
    Hot,
    Uniform,
    Skewed,
}

#[derive(Clone, Copy, Debug, PartialEq, ValueEnum)]
enum Mode {
    Max,
    TargetQps,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "tokenwall-stress",
    about = "Load test harness for tokenwall that also checks no identifier is over-admitted"
)]
struct Args {
    #[arg(long, value_enum, default_value_t = Provider::Local)]
    provider: Provider,

    #[arg(long, value_enum, default_value_t = KeyDist::Hot)]
    key_dist: KeyDist,

    #[arg(long, value_enum, default_value_t = Mode::Max)]
    mode: Mode,

    #[arg(long, default_value_t = 8)]
    threads: usize,

    #[arg(long, default_value_t = 30)]
    duration_s: u64,

    /// Bucket capacity (burst size).
    #[arg(long, default_value_t = 100.0)]
    capacity: f64,

    /// Tokens added per second.
    #[arg(long, default_value_t = 1000.0)]
    refill_rate: f64,

    #[arg(long, default_value_t = 1)]
    tokens: u64,

    #[arg(long, default_value_t = 10_000)]
    key_space: usize,

    #[arg(long, default_value_t = 0.8)]
    hot_fraction: f64,

    #[arg(long, default_value_t = 100)]
    sample_every: u64,

    #[arg(long)]
    target_qps: Option<u64>,

    #[arg(long, default_value = "redis://127.0.0.1:6379/")]
    redis_url: String,

    #[arg(long, default_value = "stress")]
    redis_prefix: String,
}

#[derive(Default)]
struct Counts {
    allowed: AtomicU64,
    rejected: AtomicU64,
    errors: AtomicU64,
}

impl Counts {
    fn record(&self, decision: &Result<RateLimitDecision, TokenwallError>) {
        let counter = match decision {
            Ok(decision) if decision.allowed => &self.allowed,
            Ok(_) => &self.rejected,
            Err(_) => &self.errors,
        };

        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Per-thread results, merged after the run.
struct WorkerReport {
    hist: Histogram<u64>,
    allowed_per_key: Vec<u64>,
}

impl WorkerReport {
    fn new(key_count: usize) -> Self {
        Self {
            hist: new_histogram(),
            allowed_per_key: vec![0; key_count],
        }
    }
}

fn new_histogram() -> Histogram<u64> {
    match Histogram::<u64>::new_with_bounds(1, 60_000_000, 3) {
        Ok(hist) => hist,
        Err(err) => exit_with(format!("invalid histogram bounds: {err}")),
    }
}

fn exit_with(message: String) -> ! {
    eprintln!("{message}");
    std::process::exit(2);
}

fn build_config(args: &Args) -> BucketConfig {
    let capacity = Capacity::try_from(args.capacity).unwrap_or_else(|err| exit_with(err.to_string()));
    let refill_rate =
        RefillRate::try_from(args.refill_rate).unwrap_or_else(|err| exit_with(err.to_string()));

    BucketConfig::new(capacity, refill_rate)
}

fn build_keys(args: &Args) -> Vec<String> {
    let n = match args.key_dist {
        KeyDist::Hot => 1,
        _ => args.key_space.max(1),
    };
    (0..n).map(|i| format!("user_{i}")).collect()
}

fn should_sample(iter: u64, sample_every: u64) -> bool {
    if sample_every <= 1 {
        return true;
    }

    iter.is_multiple_of(sample_every)
}

fn pick_key(args: &Args, key_count: usize, rng: &mut impl FnMut() -> u64) -> usize {
    match args.key_dist {
        KeyDist::Hot => 0,
        KeyDist::Uniform => (rng() as usize) % key_count,
        KeyDist::Skewed => {
            let r = (rng() % 10_000) as f64 / 10_000.0;
            if r < args.hot_fraction {
                0
            } else {
                let tail = key_count.saturating_sub(1).max(1);
                (1 + (rng() as usize) % tail) % key_count
            }
        }
    }
}

fn xorshift(seed: u64) -> impl FnMut() -> u64 {
    let mut seed = seed;
    move || {
        // xorshift64*
        seed ^= seed >> 12;
        seed ^= seed << 25;
        seed ^= seed >> 27;
        seed = seed.wrapping_mul(0x2545_F491_4F6C_DD1D);
        seed
    }
}

/// Time to wait before the next operation when pacing to `--target-qps`.
fn pace(args: &Args, next_deadline: &mut Instant) -> Option<Duration> {
    if args.mode == Mode::Max {
        return None;
    }

    let qps = args.target_qps?;
    let now = Instant::now();
    let wait = next_deadline.checked_duration_since(now);
    *next_deadline = (*next_deadline).max(now) + Duration::from_nanos(1_000_000_000 / qps.max(1));

    wait
}

/// Keys whose admitted count exceeds what one bucket can hand out in `elapsed`.
fn over_admitted(
    config: &BucketConfig,
    tokens: u64,
    elapsed: Duration,
    allowed_per_key: &[u64],
) -> Vec<(usize, u64, f64)> {
    let budget = (*config.capacity + elapsed.as_secs_f64() * *config.refill_rate) / tokens as f64;

    allowed_per_key
        .iter()
        .enumerate()
        .filter(|(_, allowed)| **allowed as f64 > budget.floor())
        .map(|(idx, allowed)| (idx, *allowed, budget))
        .collect()
}

fn print_results(
    args: &Args,
    config: &BucketConfig,
    elapsed: Duration,
    counts: &Counts,
    hist: &Histogram<u64>,
    allowed_per_key: &[u64],
) -> bool {
    let ops = counts.allowed.load(Ordering::Relaxed)
        + counts.rejected.load(Ordering::Relaxed)
        + counts.errors.load(Ordering::Relaxed);

    println!("provider={:?} mode={:?}", args.provider, args.mode);
    println!(
        "threads={} duration_s={} capacity={} refill_rate={} tokens={} key_dist={:?} key_space={}",
        args.threads,
        args.duration_s,
        args.capacity,
        args.refill_rate,
        args.tokens,
        args.key_dist,
        allowed_per_key.len()
    );
    println!(
        "elapsed_s={:.3} ops={} ops_per_s={:.0}",
        elapsed.as_secs_f64(),
        ops,
        ops as f64 / elapsed.as_secs_f64()
    );
    println!(
        "allowed={} rejected={} errors={}",
        counts.allowed.load(Ordering::Relaxed),
        counts.rejected.load(Ordering::Relaxed),
        counts.errors.load(Ordering::Relaxed)
    );

    if !hist.is_empty() {
        println!(
            "lat_us p50={} p95={} p99={} p999={} max={}",
            hist.value_at_quantile(0.50),
            hist.value_at_quantile(0.95),
            hist.value_at_quantile(0.99),
            hist.value_at_quantile(0.999),
            hist.max()
        );
        println!("sample_every={} samples={}", args.sample_every, hist.len());
    } else {
        println!("no latency samples collected");
    }

    let violations = over_admitted(config, args.tokens, elapsed, allowed_per_key);
    for (idx, allowed, budget) in violations.iter().take(10) {
        println!("OVER-ADMITTED key=user_{idx} allowed={allowed} budget={budget:.1}");
    }

    if violations.is_empty() {
        println!("over_admission=none");
    } else {
        println!("over_admission={} keys", violations.len());
    }

    violations.is_empty()
}

fn merge(reports: Vec<WorkerReport>, key_count: usize) -> (Histogram<u64>, Vec<u64>) {
    let mut merged = new_histogram();
    let mut allowed_per_key = vec![0_u64; key_count];

    for report in reports {
        if let Err(err) = merged.add(&report.hist) {
            eprintln!("failed to merge histogram: {err}");
        }
        for (total, allowed) in allowed_per_key.iter_mut().zip(report.allowed_per_key) {
            *total += allowed;
        }
    }

    (merged, allowed_per_key)
}

fn run_local(args: &Args) -> bool {
    let args = Arc::new(args.clone());
    let keys = Arc::new(build_keys(&args));
    let config = build_config(&args);

    let rl = Arc::new(RateLimiter::new(RateLimiterOptions::default()));
    rl.run_cleanup_loop();

    let stop = Arc::new(AtomicBool::new(false));
    let counts = Arc::new(Counts::default());

    let started = Instant::now();

    let handles: Vec<_> = (0..args.threads)
        .map(|t| {
            let rl = Arc::clone(&rl);
            let keys = Arc::clone(&keys);
            let stop = Arc::clone(&stop);
            let counts = Arc::clone(&counts);
            let args = Arc::clone(&args);

            std::thread::spawn(move || {
                let mut report = WorkerReport::new(keys.len());
                let mut rng = xorshift((t as u64 + 1) * 0x9E37_79B9_7F4A_7C15);
                let mut next_deadline = Instant::now();
                let mut i = 0_u64;

                while !stop.load(Ordering::Relaxed) {
                    if let Some(wait) = pace(&args, &mut next_deadline) {
                        std::thread::sleep(wait);
                    }

                    i = i.wrapping_add(1);
                    let idx = pick_key(&args, keys.len(), &mut rng);
                    let t0 = should_sample(i, args.sample_every).then(Instant::now);

                    let decision = rl.local().check_limit(&keys[idx], &config, args.tokens);

                    if let Some(t0) = t0 {
                        let _ = report.hist.record((t0.elapsed().as_micros() as u64).max(1));
                    }

                    if matches!(decision, Ok(RateLimitDecision { allowed: true, .. })) {
                        report.allowed_per_key[idx] += 1;
                    }
                    counts.record(&decision);
                }

                report
            })
        })
        .collect();

    std::thread::sleep(Duration::from_secs(args.duration_s));
    stop.store(true, Ordering::Relaxed);

    let reports: Vec<WorkerReport> = handles
        .into_iter()
        .filter_map(|handle| handle.join().ok())
        .collect();
    let elapsed = started.elapsed();
    rl.stop_cleanup_loop();

    let (hist, allowed_per_key) = merge(reports, keys.len());
    print_results(&args, &config, elapsed, &counts, &hist, &allowed_per_key)
}

#[cfg(feature = "redis-tokio")]
fn run_redis(args: &Args) -> bool {
    use tokenwall::RedisBucketStoreOptions;
    use tokenwall::redis::{FailurePolicy, RedisKey};

    let args = Arc::new(args.clone());
    let keys = Arc::new(build_keys(&args));
    let config = build_config(&args);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads.max(2))
        .build()
        .unwrap_or_else(|err| exit_with(format!("failed to build runtime: {err}")));

    rt.block_on(async move {
        let client = redis::Client::open(args.redis_url.as_str())
            .unwrap_or_else(|err| exit_with(format!("invalid redis url: {err}")));
        let prefix = RedisKey::try_from(args.redis_prefix.clone())
            .unwrap_or_else(|err| exit_with(err.to_string()));

        let rl = Arc::new(RateLimiter::new(RateLimiterOptions {
            redis: Some(RedisBucketStoreOptions {
                prefix: Some(prefix),
                connection_count: tokenwall::redis::ConnectionCount::try_from(args.threads.max(1))
                    .unwrap_or_default(),
                // Errors are counted instead of admitted, so they cannot hide over-admission.
                failure_policy: FailurePolicy::Closed,
                ..RedisBucketStoreOptions::new(client)
            }),
            ..RateLimiterOptions::default()
        }));

        let Some(store) = rl.redis() else {
            exit_with("redis store missing".to_string());
        };
        if let Err(err) = store.connect().await {
            exit_with(format!("failed to connect to redis: {err}"));
        }
        // Leftover buckets from an earlier run would skew the budget.
        if let Err(err) = store.reset_all().await {
            exit_with(format!("failed to clear prefix: {err}"));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let counts = Arc::new(Counts::default());

        let started = Instant::now();

        let handles: Vec<_> = (0..args.threads)
            .map(|t| {
                let rl = Arc::clone(&rl);
                let keys = Arc::clone(&keys);
                let stop = Arc::clone(&stop);
                let counts = Arc::clone(&counts);
                let args = Arc::clone(&args);

                tokio::spawn(async move {
                    let mut report = WorkerReport::new(keys.len());
                    let mut rng = xorshift((t as u64 + 1) * 0xD134_2543_DE82_EF95);
                    let mut next_deadline = Instant::now();
                    let mut i = 0_u64;

                    let Some(store) = rl.redis() else {
                        return report;
                    };

                    while !stop.load(Ordering::Relaxed) {
                        if let Some(wait) = pace(&args, &mut next_deadline) {
                            tokio::time::sleep(wait).await;
                        }

                        i = i.wrapping_add(1);
                        let idx = pick_key(&args, keys.len(), &mut rng);
                        let t0 = should_sample(i, args.sample_every).then(Instant::now);

                        let decision = store.check_limit(&keys[idx], &config, args.tokens).await;

                        if let Some(t0) = t0 {
                            let _ = report.hist.record((t0.elapsed().as_micros() as u64).max(1));
                        }

                        if matches!(decision, Ok(RateLimitDecision { allowed: true, .. })) {
                            report.allowed_per_key[idx] += 1;
                        }
                        counts.record(&decision);
                    }

                    report
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_secs(args.duration_s)).await;
        stop.store(true, Ordering::Relaxed);

        let mut reports = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(report) => reports.push(report),
                Err(err) => eprintln!("worker failed: {err}"),
            }
        }
        let elapsed = started.elapsed();

        let (hist, allowed_per_key) = merge(reports, keys.len());
        let ok = print_results(&args, &config, elapsed, &counts, &hist, &allowed_per_key);

        if let Err(err) = store.reset_all().await {
            eprintln!("failed to clean up prefix: {err}");
        }
        store.disconnect();

        ok
    })
}

#[cfg(not(feature = "redis-tokio"))]
fn run_redis(_: &Args) -> bool {
    exit_with(
        "redis provider requires: cargo run -p tokenwall-stress --features redis-tokio -- ..."
            .to_string(),
    );
}

fn main() {
    let args = Args::parse();

    let ok = match args.provider {
        Provider::Local => run_local(&args),
        Provider::Redis => run_redis(&args),
    };

    if !ok {
        std::process::exit(1);
    }
}
