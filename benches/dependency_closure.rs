//! Performance benchmarks for dependency tracking and page assembly
//!
//! - Transitive closure over a large include graph
//! - Bulk tracker updates
//! - Full assembly of a page with many includes on a shared pool
//!
//! Run with: cargo bench

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use http::{header, HeaderMap, HeaderValue};
use transclude_core::{
    config::EngineConfig,
    deptracker::DependencyTracker,
    engine::Transcluder,
    page::PageManager,
    resource::{RequestContext, ResourceKey, Response},
    TranscludeError,
};

fn key(i: usize) -> ResourceKey {
    ResourceKey::new(format!("http://bench.test/{i}"), "")
}

// Each node includes its two children, plus a back edge every tenth node.
fn tree(size: usize) -> Vec<(ResourceKey, Vec<ResourceKey>)> {
    (0..size)
        .map(|i| {
            let mut deps: Vec<ResourceKey> = [2 * i + 1, 2 * i + 2]
                .into_iter()
                .filter(|c| *c < size)
                .map(key)
                .collect();
            if i % 10 == 9 {
                deps.push(key(i / 2));
            }
            (key(i), deps)
        })
        .collect()
}

fn bench_get_all_deps(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_all_deps");
    for size in [100, 1_000, 10_000] {
        let tracker = DependencyTracker::new();
        tracker.update(tree(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| tracker.get_all_deps(&key(0)).len());
        });
    }
    group.finish();
}

fn bench_tracker_update(c: &mut Criterion) {
    let edges = tree(1_000);
    c.bench_function("tracker_update_1000", |b| {
        b.iter(|| {
            let tracker = DependencyTracker::with_capacity(500).unwrap();
            tracker.update(edges.clone());
            tracker.len()
        });
    });
}

fn page_fetcher(url: &str, _ctx: &RequestContext) -> Result<Response<Vec<String>>, TranscludeError> {
    let includes = if url == "http://bench.test/" {
        (0..64).map(|i| format!("http://bench.test/part/{i}")).collect()
    } else {
        Vec::new()
    };
    Ok(Response::ok(url.as_bytes().to_vec(), Some(includes))
        .with_header(header::ETAG, HeaderValue::from_static("\"v1\"")))
}

#[allow(clippy::ptr_arg)]
fn page_finder(doc: &Vec<String>, _url: &str) -> Vec<String> {
    doc.clone()
}

fn bench_assemble(c: &mut Criterion) {
    let engine = Transcluder::new(EngineConfig {
        pool_size: 8,
        ..EngineConfig::default()
    })
    .unwrap();

    c.bench_function("assemble_64_includes", |b| {
        b.iter(|| {
            let context = RequestContext::new("http://bench.test/", HeaderMap::new());
            engine
                .assemble(
                    "http://bench.test/",
                    context,
                    page_finder,
                    page_fetcher,
                    |page: &PageManager<Vec<String>>, root: Response<Vec<String>>| {
                        for include in root.parsed.clone().unwrap_or_default() {
                            page.fetch(&include)?;
                        }
                        Ok(root)
                    },
                )
                .unwrap()
        });
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default()
        .sample_size(50)
        .measurement_time(std::time::Duration::from_secs(5));
    targets =
        bench_get_all_deps,
        bench_tracker_update,
        bench_assemble
}

criterion_main!(benches);
