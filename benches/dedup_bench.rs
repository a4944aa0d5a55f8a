use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use jobgrid::dedup::Deduplicator;
use jobgrid::models::Job;

fn job(n: usize) -> Job {
    Job {
        url: format!("https://jobs.example.com/vagas/{n}"),
        title: format!("Role number {n} for team {}", n % 37),
        company: format!("Company{}", n % 211),
        location: "Remote".to_string(),
        work_mode: Default::default(),
        level: Default::default(),
        salary_min: Some(4_000 + (n as u32 % 50) * 100),
        salary_max: Some(9_000),
        description: "Operate and extend the ingestion pipeline.".repeat(3),
        technologies: vec!["rust".to_string(), "kafka".to_string()],
        benefits: Vec::new(),
        posted_at: None,
        collected_at: Utc::now(),
        source_fingerprint: format!("fp-{n}"),
        anomalies: Vec::new(),
    }
}

fn bench_dedupe_distinct(c: &mut Criterion) {
    let mut group = c.benchmark_group("dedupe_distinct");
    for size in [100, 1_000, 5_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let jobs: Vec<Job> = (0..size).map(job).collect();
            b.iter(|| {
                let mut dedup = Deduplicator::default();
                black_box(dedup.dedupe(jobs.clone()))
            });
        });
    }
    group.finish();
}

fn bench_dedupe_half_duplicates(c: &mut Criterion) {
    c.bench_function("dedupe_half_duplicates_1000", |b| {
        let mut jobs: Vec<Job> = (0..500).map(job).collect();
        jobs.extend((0..500).map(job));
        b.iter(|| {
            let mut dedup = Deduplicator::default();
            black_box(dedup.dedupe(jobs.clone()))
        });
    });
}

criterion_group!(benches, bench_dedupe_distinct, bench_dedupe_half_duplicates);
criterion_main!(benches);
