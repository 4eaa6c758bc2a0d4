//! Resolution benchmarks
//!
//! Toyota Way: Genchi Genbutsu (measure, don't guess)
//!
//! Run with: cargo bench --bench choose

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::Rng;
use serde_json::json;
use trueno_ab::bucket::Bucket;
use trueno_ab::experiment::Experiment;
use trueno_ab::index::Stickiness;
use trueno_ab::{Assignment, Engine, Subject};

const SUBJECTS: usize = 1_000;

fn subjects(n: usize) -> Vec<Subject> {
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|_| Subject::from([("id".to_string(), json!(rng.gen::<u64>()))]))
        .collect()
}

fn engine(experiments: usize, stickiness: Stickiness) -> Engine {
    Engine::builder()
        .stickiness(stickiness)
        .experiments((0..experiments).map(|i| {
            Experiment::builder(format!("exp-{i}"))
                .subject_attributes(["id"])
                .independent_variables(["arm"])
                .eligibility(move |s| {
                    let id = s["id"].as_u64().unwrap_or(0);
                    Ok(id % (experiments as u64) == i as u64)
                })
                .grouping(|x, s| {
                    let arm = x.uniform_choice(&["control", "treatment"], &x.key(s)).copied();
                    Ok(Assignment::from([("arm".to_string(), json!(arm))]))
                })
        }))
        .defaults(Assignment::from([("arm".to_string(), json!("control"))]))
        .build()
        .expect("benchmark engine builds")
}

/// Benchmark raw salted hashing
fn bench_bucket(c: &mut Criterion) {
    let bucket = Bucket::new("checkout-button");
    c.bench_function("bucket_lucky_number", |b| {
        b.iter(|| bucket.lucky_number(black_box("user-1234567890")));
    });
}

/// Benchmark `choose` against growing catalogs
fn bench_choose(c: &mut Criterion) {
    let mut group = c.benchmark_group("choose");
    let subjects = subjects(SUBJECTS);

    for experiments in [1, 10, 100] {
        let engine = engine(experiments, Stickiness::Subject);
        group.bench_with_input(
            BenchmarkId::new("subject_stickiness", experiments),
            &subjects,
            |b, subjects| {
                b.iter(|| {
                    for subject in subjects {
                        black_box(engine.choose_now("arm", subject));
                    }
                });
            },
        );
    }

    let engine = engine(10, Stickiness::Pool);
    group.bench_with_input(BenchmarkId::new("pool_stickiness", 10), &subjects, |b, subjects| {
        b.iter(|| {
            for subject in subjects {
                black_box(engine.choose_now("arm", subject));
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_bucket, bench_choose);
criterion_main!(benches);
