use std::num::NonZeroU32;
use std::num::NonZeroUsize;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::Barrier;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use criterion::BenchmarkId;
use criterion::Criterion;
use criterion::black_box;
use criterion::criterion_group;
use criterion::criterion_main;

use governor::RateLimiter;
use governor::clock::Clock;
use governor::clock::QuantaClock;
use governor::state::InMemoryState;
use governor::state::direct::NotKeyed;

use admit_limit::FixedRate;
use admit_limit::KeyedRegistry;
use admit_limit::Quota;
use admit_limit::Reason;
use admit_limit::Strategy;
use admit_limit::TokenBucket;

// Wrapper to bridge Governor into the admit-limit Strategy trait
#[derive(Debug)]
struct GovernorStrategy {
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, QuantaClock>>,
    clock: QuantaClock,
}

impl Strategy for GovernorStrategy {
    fn process(&self) -> ControlFlow<Reason> {
        match self.limiter.check() {
            Ok(_) => ControlFlow::Continue(()),
            Err(negative) => {
                let now = self.clock.now();
                let wait: Duration = negative.wait_time_from(now);
                ControlFlow::Break(Reason::Overloaded { retry_after: wait })
            }
        }
    }
}

fn bench_strategy<S: Strategy + Send + Sync + 'static>(
    group_name: &str,
    c: &mut Criterion,
    strategy: Arc<S>,
) {
    let mut group = c.benchmark_group(group_name);

    group.bench_function("single-threaded", |b| {
        b.iter(|| {
            let _ = black_box(strategy.as_ref()).process();
        })
    });

    for threads in [2, 4, 8] {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{threads}-threads")),
            &threads,
            |b, &n| {
                b.iter_custom(|iters| {
                    let barrier = Arc::new(Barrier::new(n + 1));
                    let handles: Vec<_> = (0..n)
                        .map(|_| {
                            let s = Arc::clone(&strategy);
                            let bar = Arc::clone(&barrier);
                            let per_thread = iters / n as u64;
                            thread::spawn(move || {
                                bar.wait();
                                for _ in 0..per_thread {
                                    let _ = black_box(s.process());
                                }
                            })
                        })
                        .collect();

                    barrier.wait();
                    let start = Instant::now();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    start.elapsed()
                });
            },
        );
    }

    group.finish();
}

fn bench_keyed(c: &mut Criterion) {
    let mut group = c.benchmark_group("KeyedRegistry");
    let quota = Quota::new(1_000_000.0, NonZeroU32::new(1_000).unwrap()).unwrap();
    let registry = KeyedRegistry::new(Duration::from_secs(300)).unwrap();
    let keys: Vec<String> = (0..1024).map(|i| format!("10.0.{}.{}", i / 256, i % 256)).collect();

    group.bench_function("resolve-hit", |b| {
        let _ = registry.resolve(&keys[0], || quota);
        b.iter(|| black_box(registry.resolve(black_box(&keys[0]), || quota)).allow())
    });

    group.bench_function("resolve-spread-1024", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % keys.len();
            black_box(registry.resolve(&keys[i], || quota)).allow()
        })
    });

    group.finish();
}

fn run_all_benches(c: &mut Criterion) {
    let limit_val = 1_000_000;
    let period = Duration::from_secs(60);
    let capacity = NonZeroUsize::new(limit_val).unwrap();
    let burst = NonZeroU32::new(limit_val as u32).unwrap();

    let tb = Arc::new(TokenBucket::new(capacity, period / limit_val as u32).unwrap());
    bench_strategy("TokenBucket", c, tb);

    let quota = Quota::new(limit_val as f64 / period.as_secs_f64(), burst).unwrap();
    let fixed = Arc::new(FixedRate::new(quota));
    bench_strategy("FixedRate", c, fixed);

    let gov_quota = governor::Quota::per_minute(burst);
    let gov_clock = QuantaClock::default();
    let gov_limiter = Arc::new(RateLimiter::direct_with_clock(gov_quota, gov_clock.clone()));
    let gov = Arc::new(GovernorStrategy {
        limiter: gov_limiter,
        clock: gov_clock,
    });
    bench_strategy("Governor", c, gov);

    bench_keyed(c);
}

criterion_group!(benches, run_all_benches);
criterion_main!(benches);
