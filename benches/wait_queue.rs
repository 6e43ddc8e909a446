use criterion::{black_box, criterion_group, criterion_main, Criterion};
use taskloom::TaskQueue;

fn offer_and_drain(n: usize) {
    let queue = TaskQueue::new();
    for i in 0..n {
        queue.add(
            (i % 8) as i64,
            None,
            Box::new(move || {
                black_box(i);
                false
            }),
        );
    }
    while queue.process(0) {}
}

fn bench_offer_and_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("task_queue_offer_drain");
    for size in [64usize, 1024, 8192] {
        group.bench_function(format!("n={size}"), |b| {
            b.iter(|| offer_and_drain(black_box(size)));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_offer_and_drain);
criterion_main!(benches);
