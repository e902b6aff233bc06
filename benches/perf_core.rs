use bughunt::catalog::PatternCatalog;
use bughunt::chamber::arbiter::{arbitrate, Candidate};
use bughunt::diff::parse_patch;
use bughunt::store::SessionStore;
use bughunt::{Analyzer, CodeUnit, Config};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::path::PathBuf;
use std::sync::Arc;

fn synthetic_ruby(method_count: usize) -> String {
    let mut source = String::new();
    for i in 0..method_count {
        source.push_str(&format!(
            "def handler_{i}(params)\n  user = User.find_by(id: params[:id])\n  total = user.orders.sum / params[:count]\n  # TODO: cache lookup {i}\n  user.name\nend\n\n"
        ));
    }
    source
}

fn unit(method_count: usize) -> CodeUnit {
    let config = Config::default();
    CodeUnit::new(
        synthetic_ruby(method_count),
        Some(PathBuf::from("app/handlers.rb")),
        config.max_input_bytes,
    )
    .expect("synthetic unit fits")
}

fn bench_catalog_scan(c: &mut Criterion) {
    let catalog = PatternCatalog::new();
    let unit = unit(120);
    c.bench_function("catalog_scan", |b| {
        b.iter(|| black_box(catalog.scan(black_box(&unit)).len()));
    });
}

fn bench_pipeline(c: &mut Criterion) {
    let analyzer = Analyzer::with_config(Arc::new(Config::default()));
    let unit = unit(120);

    c.bench_function("pipeline_shallow", |b| {
        let clean = CodeUnit::new("def hello; puts 'hi'; end", None, 1024).expect("unit");
        b.iter(|| black_box(analyzer.analyze(&clean, false).expect("analysis")));
    });
    c.bench_function("pipeline_deep", |b| {
        b.iter(|| black_box(analyzer.analyze(&unit, true).expect("analysis")));
    });
}

fn bench_arbitration(c: &mut Criterion) {
    let patches: Vec<String> = (0..8)
        .map(|p| {
            (0..40)
                .map(|h| {
                    let line = h * 10 + (p % 3) + 1;
                    format!("@@ -{line},1 +{line},2 @@\n+guard_{p}_{h}\n line_{line}\n")
                })
                .fold("--- a/f.rb\n+++ b/f.rb\n".to_string(), |acc, hunk| acc + &hunk)
        })
        .collect();
    let ids: Vec<String> = (0..8).map(|p| format!("p{p}")).collect();
    let candidates: Vec<Candidate<'_>> = patches
        .iter()
        .zip(&ids)
        .enumerate()
        .map(|(p, (patch, id))| Candidate {
            participant_id: id,
            priority: p as u32,
            cited: p % 4,
            diffs: parse_patch(patch).expect("synthetic patch parses"),
        })
        .collect();

    c.bench_function("arbitrate_8x40", |b| {
        b.iter(|| black_box(arbitrate(black_box(&candidates)).winners.len()));
    });
}

fn bench_session_save(c: &mut Criterion) {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = SessionStore::open(temp.path()).expect("store");
    let analyzer = Analyzer::with_config(Arc::new(Config::default()));
    let report = analyzer.analyze(&unit(20), true).expect("analysis");

    c.bench_function("session_save", |b| {
        b.iter(|| black_box(store.save_session(&report).expect("save").id));
    });
}

criterion_group!(
    perf_core,
    bench_catalog_scan,
    bench_pipeline,
    bench_arbitration,
    bench_session_save
);
criterion_main!(perf_core);
