#![no_main]

use arbitrary::Arbitrary;
use fxagg::aggregate::{Request, RequestKind};
use fxagg::index::types::{FieldSpec, FieldType, IndexSpec};
use fxagg::index::{self, MemoryIndex};
use fxagg::pipeline::Value;
use fxagg::utils::EngineConfig;
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    aggregate: bool,
    args: Vec<String>,
}

fn small_index() -> MemoryIndex {
    let mut idx = MemoryIndex::new(IndexSpec::new(
        "fuzz",
        vec![
            FieldSpec::new("title", FieldType::Text),
            FieldSpec::new("n", FieldType::Numeric),
            FieldSpec::new("tag", FieldType::Tag),
        ],
    ));
    for i in 0..8 {
        idx.add_hash_document(
            &format!("doc:{}", i),
            vec![
                ("title".into(), Value::from(format!("word{} common", i % 3))),
                ("n".into(), Value::from(i as f64)),
                ("tag".into(), Value::from(if i % 2 == 0 { "even" } else { "odd" })),
            ],
            1.0,
        );
    }
    idx
}

fuzz_target!(|input: Input| {
    let kind = if input.aggregate {
        RequestKind::Aggregate
    } else {
        RequestKind::Search
    };
    let handle = index::shared(small_index());
    // Compilation, binding and execution must never panic
    if let Ok(mut req) = Request::prepare(kind, &input.args, handle, &EngineConfig::default()) {
        let _ = req.execute();
    }
});
