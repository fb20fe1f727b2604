use criterion::{black_box, criterion_group, criterion_main, Criterion};
use scrawl_ot::{compose, diff, transform, Operation};
use uuid::Uuid;

fn document(len: usize) -> String {
    let pattern = "the quick brown fox jumps over the lazy dog ";
    let mut doc = String::new();
    while doc.len() < len {
        doc.push_str(pattern);
    }
    doc.truncate(len);
    doc
}

fn bench_apply_small_edit_64kb(c: &mut Criterion) {
    let doc = document(65536);
    let op = Operation::new(0, Uuid::from_u128(1))
        .retain(1000)
        .insert("edit")
        .retain(doc.chars().count() - 1000);

    c.bench_function("apply_small_edit_64KB", |b| {
        b.iter(|| {
            black_box(black_box(&op).apply(black_box(&doc)).unwrap());
        })
    });
}

fn bench_transform_typical_pair(c: &mut Criterion) {
    let a = Operation::new(0, Uuid::from_u128(1))
        .retain(120)
        .insert("hello")
        .retain(380);
    let b = Operation::new(0, Uuid::from_u128(2))
        .retain(300)
        .delete(20)
        .retain(180);

    c.bench_function("transform_typical_pair", |bench| {
        bench.iter(|| {
            black_box(transform(black_box(&a), black_box(&b)).unwrap());
        })
    });
}

fn bench_transform_fragmented_ops(c: &mut Criterion) {
    // 100 small components per side, worst case for the lockstep walk.
    let mut a = Operation::new(0, Uuid::from_u128(1));
    let mut b = Operation::new(0, Uuid::from_u128(2));
    for i in 0..100usize {
        a = a.retain(7).insert("x").delete(3);
        b = if i % 2 == 0 {
            b.retain(2).delete(5).retain(3)
        } else {
            b.insert("yy").retain(10)
        };
    }

    c.bench_function("transform_100_components", |bench| {
        bench.iter(|| {
            black_box(transform(black_box(&a), black_box(&b)).unwrap());
        })
    });
}

fn bench_compose_typical_pair(c: &mut Criterion) {
    let a = Operation::new(0, Uuid::from_u128(1))
        .retain(200)
        .insert("first")
        .retain(300);
    let b = Operation::new(1, Uuid::from_u128(1))
        .retain(400)
        .delete(50)
        .insert("second")
        .retain(55);

    c.bench_function("compose_typical_pair", |bench| {
        bench.iter(|| {
            black_box(compose(black_box(&a), black_box(&b)).unwrap());
        })
    });
}

fn bench_compose_chain_100(c: &mut Criterion) {
    // Fold a typing burst of 100 single-char inserts into one operation.
    let ops: Vec<Operation> = (0..100u64)
        .map(|i| {
            Operation::new(i, Uuid::from_u128(1))
                .retain(i as usize)
                .insert("k")
        })
        .collect();

    c.bench_function("compose_chain_100_inserts", |bench| {
        bench.iter(|| {
            let mut folded = ops[0].clone();
            for op in &ops[1..] {
                folded = compose(&folded, op).unwrap();
            }
            black_box(folded);
        })
    });
}

fn bench_invert_64kb(c: &mut Criterion) {
    let doc = document(65536);
    let len = doc.chars().count();
    let op = Operation::new(0, Uuid::from_u128(1))
        .retain(5000)
        .delete(200)
        .insert("replacement")
        .retain(len - 5200);

    c.bench_function("invert_64KB", |b| {
        b.iter(|| {
            black_box(black_box(&op).invert(black_box(&doc)).unwrap());
        })
    });
}

fn bench_diff_64kb_small_change(c: &mut Criterion) {
    let before = document(65536);
    let mut after = before.clone();
    after.replace_range(30000..30010, "CHANGEDXYZ");

    c.bench_function("diff_64KB_small_change", |b| {
        b.iter(|| {
            black_box(diff(
                black_box(&before),
                black_box(&after),
                0,
                Uuid::from_u128(1),
            ));
        })
    });
}

criterion_group!(
    benches,
    bench_apply_small_edit_64kb,
    bench_transform_typical_pair,
    bench_transform_fragmented_ops,
    bench_compose_typical_pair,
    bench_compose_chain_100,
    bench_invert_64kb,
    bench_diff_64kb_small_change,
);
criterion_main!(benches);
