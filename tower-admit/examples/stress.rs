use std::num::NonZeroU32;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use admit_limit::ConcurrencyLimiter;
use admit_limit::FixedRate;
use admit_limit::KeyedRegistry;
use admit_limit::Quota;
use admit_limit::TokenBucket;
use clap::Parser;
use hdrhistogram::Histogram;
use tokio::sync::Barrier;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tower::BoxError;
use tower::Layer;
use tower::Service;
use tower::ServiceBuilder;
use tower::ServiceExt;
use tower::service_fn;
use tower_admit::AdmitError;
use tower_admit::ConcurrencyLimitLayer;
use tower_admit::KeyedRateLimitLayer;
use tower_admit::RateLimitLayer;

#[derive(Parser, Debug)]
struct Args {
    /// Requests fired at each limiter
    #[arg(short, long, default_value_t = 50_000)]
    requests: usize,

    /// Permits per second for the rate limiters
    #[arg(long, default_value_t = 10_000)]
    rate: u32,

    /// Simulated handler latency
    #[arg(long, default_value = "500ms", value_parser = humantime::parse_duration)]
    latency: humantime::Duration,

    /// Wait budget for the waiting rate limiters
    #[arg(long, default_value = "550ms", value_parser = humantime::parse_duration)]
    max_wait: humantime::Duration,

    /// Distinct clients for the keyed limiter
    #[arg(long, default_value_t = 100)]
    clients: usize,
}

#[derive(Default)]
struct RejectionCounter {
    rate_limited: usize,
    timeouts: usize,
    sheds: usize,
    unknown: usize,
}

async fn run_load_test<S>(name: &str, svc: S, total_reqs: usize)
where
    S: Service<usize, Response = (), Error = BoxError> + Clone + Send + 'static,
    S::Future: Send,
{
    let mut hist_elapsed = Histogram::<u64>::new_with_bounds(1, 60_000_000, 3).unwrap();
    let mut hist_ready = Histogram::<u64>::new_with_bounds(1, 60_000_000_000, 3).unwrap();

    let mut tasks = JoinSet::new();
    let mut rejections = RejectionCounter::default();

    let start = Instant::now();

    let barrier = Arc::new(Barrier::new(total_reqs));

    for id in 0..total_reqs {
        let mut local_svc = svc.clone();
        let bar = barrier.clone();
        tasks.spawn(async move {
            bar.wait().await;
            let req_start = Instant::now();
            let ready_res = local_svc.ready().await;
            let ready = req_start.elapsed();

            match ready_res {
                Ok(ready_svc) => {
                    let res = ready_svc.call(id).await;
                    (res, ready, req_start.elapsed())
                }
                Err(e) => (Err(e), ready, req_start.elapsed()),
            }
        });
    }

    let mut success_count = 0;

    while let Some(task) = tasks.join_next().await {
        let (res, ready, elapsed) = task.expect("Task panicked");
        match res {
            Ok(()) => {
                success_count += 1;
                hist_ready.record(ready.as_nanos() as u64).unwrap();
                hist_elapsed.record(elapsed.as_micros() as u64).unwrap();
            }
            Err(e) => match e.downcast_ref::<AdmitError>() {
                Some(AdmitError::RateLimited { .. }) => rejections.rate_limited += 1,
                Some(AdmitError::Timeout) => rejections.timeouts += 1,
                Some(AdmitError::Overloaded) => rejections.sheds += 1,
                _ if e.is::<tower::load_shed::error::Overloaded>() => rejections.sheds += 1,
                _ if e.is::<tower::timeout::error::Elapsed>() => rejections.timeouts += 1,
                _ => rejections.unknown += 1,
            },
        }
    }

    let total_duration = start.elapsed();
    let throughput = total_reqs as f64 / total_duration.as_secs_f64();
    let goodput = success_count as f64 / total_duration.as_secs_f64();

    println!("--- {} ---", name);
    println!("Total Duration:  {:.2?}", total_duration);
    println!("Success/Total:   {}/{}", success_count, total_reqs);
    println!("Total Rate:      {:.2} req/sec", throughput);
    println!("Success Rate:    {:.2} req/sec (Goodput)", goodput);

    if success_count > 0 {
        println!("P50 (Elapsed):   {}µs", hist_elapsed.value_at_quantile(0.5));
        println!(
            "P99 (Elapsed):   {}µs",
            hist_elapsed.value_at_quantile(0.99)
        );
        println!("P50 (Ready):     {}ns", hist_ready.value_at_quantile(0.5));
        println!("P99 (Ready):     {}ns", hist_ready.value_at_quantile(0.99));
    }

    let total_errors =
        rejections.rate_limited + rejections.timeouts + rejections.sheds + rejections.unknown;
    println!("Errors:          {}", total_errors);
    if total_errors > 0 {
        println!("  └─ Limited:    {}", rejections.rate_limited);
        println!("  └─ Timeouts:   {}", rejections.timeouts);
        println!("  └─ Sheds:      {}", rejections.sheds);
        if rejections.unknown > 0 {
            println!("  └─ Unknown:    {}", rejections.unknown);
        }
    }
    println!();
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();
    let latency: Duration = args.latency.into();
    let max_wait: Duration = args.max_wait.into();
    let total_reqs = args.requests;

    let rate = NonZeroU32::new(args.rate).ok_or("rate must be greater than zero")?;
    let capacity = NonZeroUsize::try_from(rate)?;
    let interval = Duration::from_secs(1) / rate.get();
    let quota = Quota::new(f64::from(rate.get()), rate)?;

    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mock_db_call = {
        let in_flight = Arc::clone(&in_flight);
        let peak = Arc::clone(&peak);
        move |_req: usize| {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                // Simulate real-world work
                sleep(latency).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, BoxError>(())
            }
        }
    };

    // 1.a. Fail-fast Token Bucket
    let bucket = Arc::new(TokenBucket::new(capacity, interval)?);
    let svc = RateLimitLayer::fail_fast(bucket).layer(service_fn(mock_db_call.clone()));
    run_load_test("Fail-fast Token Bucket", svc, total_reqs).await;

    // 1.b. Waiting Token Bucket
    let bucket = Arc::new(TokenBucket::new(capacity, interval)?);
    let svc = RateLimitLayer::waiting(bucket)
        .with_max_wait(max_wait)
        .layer(service_fn(mock_db_call.clone()));
    run_load_test("Waiting Token Bucket", svc, total_reqs).await;

    // 2.a. Fail-fast Fixed Rate
    let fixed = Arc::new(FixedRate::new(quota));
    let svc = RateLimitLayer::fail_fast(fixed).layer(service_fn(mock_db_call.clone()));
    run_load_test("Fail-fast Fixed Rate", svc, total_reqs).await;

    // 2.b. Waiting Fixed Rate
    let fixed = Arc::new(FixedRate::new(quota));
    let svc = RateLimitLayer::waiting(fixed)
        .with_max_wait(max_wait)
        .layer(service_fn(mock_db_call.clone()));
    run_load_test("Waiting Fixed Rate", svc, total_reqs).await;

    // 3. Keyed, spread over a fixed client population
    let clients = args.clients.max(1);
    let per_client = NonZeroU32::new(rate.get() / clients as u32).unwrap_or(NonZeroU32::MIN);
    let client_quota = Quota::new(f64::from(per_client.get()), per_client)?;
    let registry = Arc::new(KeyedRegistry::new(Duration::from_secs(60))?);
    let svc = KeyedRateLimitLayer::new(
        Arc::clone(&registry),
        move |id: &usize| format!("client-{}", id % clients),
        move |_: &usize| client_quota,
    )
    .layer(service_fn(mock_db_call.clone()));
    run_load_test("Keyed Fixed Rate", svc, total_reqs).await;
    println!("Keyed registry entries: {}\n", registry.len());

    // 4. Concurrency limit
    peak.store(0, Ordering::SeqCst);
    let limiter = Arc::new(ConcurrencyLimiter::new(capacity));
    let svc = ConcurrencyLimitLayer::new(limiter).layer(service_fn(mock_db_call.clone()));
    run_load_test("Concurrency Limit", svc, total_reqs).await;
    println!(
        "Peak in flight:  {} (limit {})\n",
        peak.load(Ordering::SeqCst),
        capacity
    );

    // 5. Tower Built-in (with timeout and load shedding)
    let tower_svc = ServiceBuilder::new()
        .buffer(capacity.get())
        .timeout(max_wait)
        .load_shed()
        .rate_limit(u64::from(rate.get()), Duration::from_secs(1))
        .service(service_fn(mock_db_call));
    run_load_test("Tower RateLimit", tower_svc, total_reqs).await;

    Ok(())
}
