//! Event bus and reactive write benchmark.
//!
//! Measures dispatch latency against listener count, and the cost of a
//! changing reactive write through a built container.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use soa_core::{Annotate, Config, Container, EventBus, Properties, Reactive, Registry, Service};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

fn bench_dispatch(c: &mut Criterion) {
    let listener_counts: &[usize] = &[0, 1, 8, 64, 512];

    let mut group = c.benchmark_group("dispatch");
    for &count in listener_counts {
        let bus: EventBus<u64> = EventBus::new();
        let hits = Arc::new(AtomicU64::new(0));
        let subs: Vec<_> = (0..count)
            .map(|_| {
                let hits = Arc::clone(&hits);
                bus.listen(move |n: &u64| {
                    hits.fetch_add(*n, Ordering::Relaxed);
                })
            })
            .collect();

        group.bench_with_input(BenchmarkId::from_parameter(count), &bus, |b, bus| {
            b.iter(|| bus.dispatch(black_box(&1)));
        });

        for sub in &subs {
            sub.unsubscribe();
        }
    }
    group.finish();
}

#[derive(Default)]
struct Gauge {
    level: Reactive<u64>,
}

impl Service for Gauge {
    fn describe(meta: &mut Annotate<'_, Self>) {
        meta.observable("level");
    }

    fn properties<'a>(&'a self, props: &mut Properties<'a>) {
        props.add("level", &self.level);
    }
}

fn bench_reactive_write(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let _guard = rt.enter();

    let mut registry = Registry::new();
    registry.register::<Gauge>().unwrap();
    let container = Container::build(&registry.freeze(), Config::default()).unwrap();
    let gauge = container.pick::<Gauge>().unwrap();
    let _sub = container.updates().listen(|u| {
        black_box(u);
    });

    let mut next = 0u64;
    c.bench_function("reactive_write", |b| {
        b.iter(|| {
            next += 1;
            gauge.level.set(black_box(next))
        });
    });
}

criterion_group!(benches, bench_dispatch, bench_reactive_write);
criterion_main!(benches);
