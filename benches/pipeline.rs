//! Performance benchmarks for request compilation and execution
//!
//! Run with: cargo bench

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use fxagg::aggregate::{Request, RequestKind};
use fxagg::index::types::{FieldSpec, FieldType, IndexSpec};
use fxagg::index::{self, IndexHandle, MemoryIndex};
use fxagg::pipeline::Value;
use fxagg::query::{ParseOptions, parse_query};
use fxagg::utils::EngineConfig;

const COLORS: &[&str] = &["red", "green", "blue", "black", "white"];
const WORDS: &[&str] = &["running", "shoes", "hat", "scarf", "jacket", "wool", "cotton"];

/// Build an index of `n` synthetic products
fn create_benchmark_index(n: usize) -> IndexHandle {
    let mut price = FieldSpec::new("price", FieldType::Numeric);
    price.sortable = true;
    let mut idx = MemoryIndex::new(IndexSpec::new(
        "bench",
        vec![
            FieldSpec::new("title", FieldType::Text),
            FieldSpec::new("color", FieldType::Tag),
            price,
        ],
    ));
    for i in 0..n {
        let title = format!(
            "{} {} {}",
            WORDS[i % WORDS.len()],
            WORDS[(i / 3) % WORDS.len()],
            COLORS[i % COLORS.len()]
        );
        idx.add_hash_document(
            &format!("product:{}", i),
            vec![
                ("title".into(), Value::from(title)),
                ("color".into(), Value::from(COLORS[(i * 7) % COLORS.len()])),
                ("price".into(), Value::from((i % 500) as f64 + 0.5)),
            ],
            1.0,
        );
    }
    index::shared(idx)
}

fn args(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

fn bench_query_parsing(c: &mut Criterion) {
    let queries = vec![
        "simple",
        "two words",
        "\"exact phrase\"",
        "@title:(running shoes) -hat",
        "@price:[10 (200] @color:{red | blue}",
        "(wool | cotton) jack*",
    ];
    let opts = ParseOptions {
        dialect: 2,
        ..ParseOptions::default()
    };

    let mut group = c.benchmark_group("query_parsing");
    for query in queries {
        group.bench_with_input(BenchmarkId::from_parameter(query), &query, |b, &q| {
            b.iter(|| parse_query(black_box(q), &opts))
        });
    }
    group.finish();
}

fn bench_compile(c: &mut Criterion) {
    let config = EngineConfig::default();
    let v = args(&[
        "*", "LOAD", "2", "@price", "@color", "APPLY", "@price * 2", "AS", "double", "GROUPBY",
        "1", "@color", "REDUCE", "AVG", "1", "@double", "AS", "avg", "SORTBY", "2", "@avg",
        "DESC", "LIMIT", "0", "3",
    ]);

    c.bench_function("compile_aggregate", |b| {
        b.iter(|| {
            let mut req = Request::new(RequestKind::Aggregate, &config);
            req.compile(black_box(&v))
        })
    });
}

fn bench_execute(c: &mut Criterion) {
    let handle = create_benchmark_index(10_000);
    let config = EngineConfig::default();

    let cases: Vec<(&str, RequestKind, Vec<String>)> = vec![
        (
            "search_term",
            RequestKind::Search,
            args(&["shoes", "LIMIT", "0", "20"]),
        ),
        (
            "search_sortby",
            RequestKind::Search,
            args(&["*", "SORTBY", "price", "DESC", "RETURN", "1", "price"]),
        ),
        (
            "group_count",
            RequestKind::Aggregate,
            args(&["*", "GROUPBY", "1", "@color", "REDUCE", "COUNT", "0", "AS", "n"]),
        ),
        (
            "apply_filter_sort",
            RequestKind::Aggregate,
            args(&[
                "*", "LOAD", "1", "@price", "APPLY", "@price * 1.2", "AS", "gross", "FILTER",
                "@gross > 100", "SORTBY", "2", "@gross", "ASC", "LIMIT", "0", "50",
            ]),
        ),
    ];

    let mut group = c.benchmark_group("execute");
    for (name, kind, v) in &cases {
        group.bench_function(*name, |b| {
            b.iter(|| {
                let mut req = Request::prepare(*kind, v, handle.clone(), &config)
                    .expect("benchmark request builds");
                black_box(req.execute())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_query_parsing, bench_compile, bench_execute);
criterion_main!(benches);
