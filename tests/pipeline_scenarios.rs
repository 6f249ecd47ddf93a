//! End-to-end request scenarios against the fixture indexes in `tests/fixtures`.

use fxagg::aggregate::request::ValueFormat;
use fxagg::aggregate::{CursorList, Request, RequestKind};
use fxagg::error::{QueryError, QueryErrorCode};
use fxagg::index::{self, IndexHandle, MemoryIndex};
use fxagg::output::{self, ExecutionResult};
use fxagg::pipeline::Value;
use fxagg::utils::EngineConfig;
use std::path::PathBuf;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn open(name: &str) -> IndexHandle {
    index::shared(MemoryIndex::from_json_file(&fixture(name)).expect("fixture index loads"))
}

fn args(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

fn prepare(kind: RequestKind, v: &[&str]) -> Result<Request, QueryError> {
    Request::prepare(kind, &args(v), open("products.json"), &EngineConfig::default())
}

fn run(kind: RequestKind, v: &[&str]) -> Result<ExecutionResult, QueryError> {
    prepare(kind, v)?.execute()
}

fn aggregate(v: &[&str]) -> ExecutionResult {
    run(RequestKind::Aggregate, v).unwrap_or_else(|e| panic!("{:?} failed: {}", v, e))
}

fn search(v: &[&str]) -> ExecutionResult {
    run(RequestKind::Search, v).unwrap_or_else(|e| panic!("{:?} failed: {}", v, e))
}

fn column(result: &ExecutionResult, name: &str) -> Vec<Value> {
    result
        .rows
        .iter()
        .map(|r| r.get(name).cloned().unwrap_or_default())
        .collect()
}

fn numbers(values: &[f64]) -> Vec<Value> {
    values.iter().map(|n| Value::from(*n)).collect()
}

fn sorted_keys(result: &ExecutionResult) -> Vec<String> {
    let mut keys: Vec<String> = result.rows.iter().filter_map(|r| r.key.clone()).collect();
    keys.sort();
    keys
}

#[test]
fn test_group_count_sorted_desc() {
    let result = aggregate(&[
        "*", "GROUPBY", "1", "@color", "REDUCE", "COUNT", "0", "AS", "n", "SORTBY", "2", "@n",
        "DESC",
    ]);
    assert_eq!(
        column(&result, "color"),
        vec![Value::from("red"), Value::from("blue"), Value::from("green")]
    );
    assert_eq!(column(&result, "n"), numbers(&[3.0, 1.0, 1.0]));
    // Aggregate rows carry no document key
    assert!(result.rows.iter().all(|r| r.key.is_none()));
}

#[test]
fn test_group_reducers_over_loaded_field() {
    let result = aggregate(&[
        "*", "GROUPBY", "1", "@color", "REDUCE", "SUM", "1", "@price", "AS", "total", "REDUCE",
        "MAX", "1", "@price", "AS", "top", "SORTBY", "2", "@total", "DESC",
    ]);
    assert_eq!(column(&result, "total"), numbers(&[70.0, 50.0, 20.0]));
    assert_eq!(column(&result, "top"), numbers(&[30.0, 50.0, 20.0]));
}

#[test]
fn test_generated_reducer_alias() {
    let result = aggregate(&["*", "GROUPBY", "1", "@color", "REDUCE", "COUNT", "0"]);
    assert_eq!(result.rows.len(), 3);
    assert!(result.rows[0].get("__generated_aliascount").is_some());
}

#[test]
fn test_limit_zero_counts_only() {
    let result = search(&["*", "LIMIT", "0", "0"]);
    assert_eq!(result.total_results, 5);
    assert!(result.rows.is_empty());

    let result = search(&["@price:[20 30]", "LIMIT", "0", "0"]);
    assert_eq!(result.total_results, 3);
    assert!(result.rows.is_empty());
}

#[test]
fn test_limit_zero_after_group_counts_matches() {
    let result = aggregate(&[
        "*", "GROUPBY", "1", "@color", "REDUCE", "COUNT", "0", "AS", "n", "LIMIT", "0", "0",
    ]);
    assert!(result.rows.is_empty());
    // Five documents matched even though they fold into three groups
    assert_eq!(result.total_results, 5);
}

#[test]
fn test_multiple_sortby_in_one_segment() {
    let err = run(
        RequestKind::Aggregate,
        &["*", "LOAD", "1", "@price", "SORTBY", "1", "@price", "SORTBY", "1", "@price"],
    )
    .unwrap_err();
    assert_eq!(err.code, QueryErrorCode::ParseArgs);
    assert_eq!(
        err.message,
        "Multiple SORTBY steps are not allowed. Sort multiple fields in a single step"
    );

    // A GROUPBY starts a new segment, so a second SORTBY is fine there
    let result = aggregate(&[
        "*", "SORTBY", "2", "@price", "ASC", "GROUPBY", "1", "@color", "REDUCE", "COUNT", "0",
        "AS", "n", "SORTBY", "2", "@n", "ASC",
    ]);
    assert_eq!(column(&result, "n"), numbers(&[1.0, 1.0, 3.0]));
}

#[test]
fn test_sort_offset_and_limit() {
    let result = aggregate(&["*", "LOAD", "1", "@price", "SORTBY", "2", "@price", "ASC", "LIMIT", "1", "2"]);
    assert_eq!(column(&result, "price"), numbers(&[20.0, 25.0]));

    let result = aggregate(&["*", "LOAD", "1", "@price", "SORTBY", "2", "@price", "DESC", "MAX", "2"]);
    assert_eq!(column(&result, "price"), numbers(&[50.0, 30.0]));
}

#[test]
fn test_load_after_apply_rejected() {
    let err = run(
        RequestKind::Aggregate,
        &["*", "LOAD", "1", "@price", "APPLY", "@price * 2", "AS", "double", "LOAD", "1", "@color"],
    )
    .unwrap_err();
    assert_eq!(err.code, QueryErrorCode::Inval);
    assert_eq!(err.message, "LOAD cannot be applied after projectors or reducers");
}

#[test]
fn test_apply_overrides_loaded_key() {
    let result = aggregate(&[
        "*", "LOAD", "1", "@price", "APPLY", "@price * 2", "AS", "price", "SORTBY", "2", "@price",
        "ASC",
    ]);
    assert_eq!(column(&result, "price"), numbers(&[30.0, 40.0, 50.0, 60.0, 100.0]));
    // The alias reuses the loaded key instead of adding a second column
    assert!(result.rows.iter().all(|r| r.fields.len() == 1));
}

#[test]
fn test_filter_after_apply() {
    let result = aggregate(&[
        "*", "LOAD", "1", "@price", "APPLY", "@price * 2", "AS", "double", "FILTER",
        "@double > 50", "SORTBY", "2", "@double", "ASC",
    ]);
    assert_eq!(column(&result, "double"), numbers(&[60.0, 100.0]));
}

#[test]
fn test_filter_needs_loaded_property() {
    let err = run(RequestKind::Aggregate, &["*", "FILTER", "@price > 10"]).unwrap_err();
    assert_eq!(err.code, QueryErrorCode::NoPropKey);
}

#[test]
fn test_cursor_resumes_where_it_stopped() {
    let cursors = CursorList::new(8);
    let req = prepare(
        RequestKind::Aggregate,
        &["*", "LOAD", "1", "@price", "SORTBY", "2", "@price", "ASC", "WITHCURSOR", "COUNT", "2"],
    )
    .unwrap();

    let first = cursors.execute(req).unwrap();
    assert_eq!(column(&first, "price"), numbers(&[15.0, 20.0]));
    let id = first.cursor_id.expect("cursor stays open");

    let second = cursors.read(id, None).unwrap();
    assert_eq!(column(&second, "price"), numbers(&[25.0, 30.0]));

    let last = cursors.read(id, None).unwrap();
    assert_eq!(column(&last, "price"), numbers(&[50.0]));
    assert_eq!(last.cursor_id, None);
    assert!(cursors.is_empty());
}

#[test]
fn test_legacy_filter_on_unknown_field() {
    // Dialect 1 turns a bad legacy filter into an empty result
    let result = search(&["*", "FILTER", "missing", "0", "10"]);
    assert_eq!(result.total_results, 0);
    assert!(result.rows.is_empty());

    let err = run(
        RequestKind::Search,
        &["*", "FILTER", "missing", "0", "10", "DIALECT", "2"],
    )
    .unwrap_err();
    assert_eq!(err.code, QueryErrorCode::Inval);
    assert_eq!(err.message, "Unknown Field 'missing'");
}

#[test]
fn test_legacy_numeric_and_geo_filters() {
    let result = search(&["*", "FILTER", "price", "(20", "50"]);
    assert_eq!(sorted_keys(&result), vec!["product:1", "product:2", "product:5"]);

    let result = search(&["*", "GEOFILTER", "store", "-73.99", "40.73", "5", "km"]);
    assert_eq!(sorted_keys(&result), vec!["product:1", "product:3"]);
}

#[test]
fn test_search_return_and_highlight() {
    let result = search(&["shoes", "RETURN", "1", "title", "HIGHLIGHT", "FIELDS", "1", "title"]);
    assert_eq!(sorted_keys(&result), vec!["product:1", "product:2"]);
    for row in &result.rows {
        assert_eq!(row.fields.len(), 1);
        let title = row.get("title").and_then(Value::as_str).unwrap_or_default();
        assert!(title.contains("<b>shoes</b>"), "not highlighted: {}", title);
    }
}

#[test]
fn test_search_return_alias() {
    let result = search(&["red", "RETURN", "3", "price", "AS", "cost", "SORTBY", "price", "ASC"]);
    assert_eq!(column(&result, "cost"), numbers(&[15.0, 25.0, 30.0]));
    assert!(result.rows.iter().all(|r| r.get("price").is_none()));
}

#[test]
fn test_search_loads_whole_document() {
    let result = search(&["hat"]);
    assert_eq!(result.rows.len(), 1);
    let row = &result.rows[0];
    assert_eq!(row.key.as_deref(), Some("product:3"));
    assert_eq!(row.get("color"), Some(&Value::from("red")));
    assert_eq!(row.get("price"), Some(&Value::from(15.0)));
}

#[test]
fn test_search_nocontent_and_scores() {
    let result = search(&["scarf", "NOCONTENT", "WITHSCORES"]);
    assert_eq!(sorted_keys(&result), vec!["product:4", "product:5"]);
    for row in &result.rows {
        assert!(row.fields.is_empty());
        assert!(row.score.is_some_and(|s| s > 0.0));
    }
}

#[test]
fn test_search_default_page() {
    let result = search(&["*", "LIMIT", "3", "2"]);
    assert_eq!(result.total_results, 5);
    assert_eq!(result.rows.len(), 2);
}

#[test]
fn test_params_substitution() {
    let result = search(&[
        "@price:[$lo $hi]", "PARAMS", "4", "lo", "20", "hi", "25", "DIALECT", "2", "NOCONTENT",
    ]);
    assert_eq!(sorted_keys(&result), vec!["product:4", "product:5"]);
}

#[test]
fn test_index_prefix_mismatch() {
    let err = run(RequestKind::Search, &["*", "_INDEX_PREFIXES", "1", "other:"]).unwrap_err();
    assert_eq!(err.code, QueryErrorCode::Mismatch);
    assert!(run(RequestKind::Search, &["*", "_INDEX_PREFIXES", "1", "product:"]).is_ok());
}

#[test]
fn test_request_errors() {
    let cases: &[(RequestKind, &[&str], QueryErrorCode, &str)] = &[
        (
            RequestKind::Search,
            &["*", "GROUPBY", "1", "@color"],
            QueryErrorCode::ParseArgs,
            "option `GROUPBY` is mutually exclusive with simple (i.e. search) options",
        ),
        (
            RequestKind::Aggregate,
            &["*", "RETURN", "1", "title"],
            QueryErrorCode::ParseArgs,
            "RETURN is not supported on FT.AGGREGATE",
        ),
        (
            RequestKind::Aggregate,
            &["*", "GROUPBY", "1", "@color", "REDUCE", "COUNT", "0", "AS", "n", "GROUPBY", "1", "@price"],
            QueryErrorCode::NoPropKey,
            "No such property `price`",
        ),
        (
            RequestKind::Aggregate,
            &["*", "SORTBY", "1", "@nosuch"],
            QueryErrorCode::NoPropKey,
            "Property `nosuch` not loaded nor in schema",
        ),
        (
            RequestKind::Search,
            &["*", "SCORER", "NOPE"],
            QueryErrorCode::Inval,
            "No such scorer NOPE",
        ),
        (
            RequestKind::Search,
            &["*", "LIMIT", "2", "0"],
            QueryErrorCode::Limit,
            "The `offset` of the LIMIT must be 0 when `num` is 0",
        ),
    ];

    for (kind, v, code, message) in cases {
        let err = run(*kind, v).unwrap_err();
        assert_eq!(err.code, *code, "{:?}", v);
        assert_eq!(err.message, *message, "{:?}", v);
    }

    let err = run(RequestKind::Aggregate, &["*", "BOGUS"]).unwrap_err();
    assert_eq!(err.code, QueryErrorCode::ParseArgs);
    assert!(err.message.starts_with("Unknown argument `BOGUS`"), "{}", err.message);
}

#[test]
fn test_json_index_loads_by_schema_path() {
    let handle = open("catalog.json");
    let mut req = Request::prepare(
        RequestKind::Aggregate,
        &args(&["*", "LOAD", "1", "@stock", "SORTBY", "2", "@stock", "DESC"]),
        handle,
        &EngineConfig::default(),
    )
    .unwrap();
    let result = req.execute().unwrap();
    assert_eq!(column(&result, "stock"), numbers(&[4.0, 0.0]));
}

#[test]
fn test_json_expand_needs_structured_reply() {
    let config = EngineConfig::default();
    let v = args(&["lamp", "FORMAT", "EXPAND"]);

    let mut req = Request::new(RequestKind::Search, &config);
    req.compile(&v).unwrap();
    let err = req.apply_context(open("catalog.json")).unwrap_err();
    assert_eq!(err.message, "EXPAND format is only supported with RESP3");

    let mut req = Request::new(RequestKind::Search, &config);
    req.set_structured_reply(true);
    req.compile(&v).unwrap();
    req.apply_context(open("catalog.json")).unwrap();
    req.build_pipeline().unwrap();
    assert_eq!(req.value_format(), ValueFormat::Expand);

    let result = req.execute().unwrap();
    assert_eq!(result.rows.len(), 2);
    let json = output::to_json(&result, true);
    let stocks: Vec<i64> = (0..2)
        .filter_map(|i| json["results"][i]["extra_attributes"]["$"]["inventory"]["stock"].as_i64())
        .collect();
    assert_eq!(stocks.len(), 2);
}

#[test]
fn test_highlight_rejected_on_json() {
    let err = Request::prepare(
        RequestKind::Search,
        &args(&["lamp", "HIGHLIGHT"]),
        open("catalog.json"),
        &EngineConfig::default(),
    )
    .err()
    .expect("highlight on JSON fails");
    assert_eq!(err.message, "HIGHLIGHT/SUMMARIZE is not supported with JSON indexes");
}

#[test]
fn test_group_count_over_inline_index() {
    let idx = MemoryIndex::from_json_str(
        r#"{
            "schema": [{ "name": "cat", "type": "TAG" }],
            "documents": [
                { "key": "a1", "fields": { "cat": "a" } },
                { "key": "a2", "fields": { "cat": "a" } },
                { "key": "b1", "fields": { "cat": "b" } }
            ]
        }"#,
    )
    .unwrap();
    let mut req = Request::prepare(
        RequestKind::Aggregate,
        &args(&[
            "*", "GROUPBY", "1", "@cat", "REDUCE", "COUNT", "0", "AS", "n", "SORTBY", "2", "@n",
            "DESC", "LIMIT", "0", "5",
        ]),
        index::shared(idx),
        &EngineConfig::default(),
    )
    .unwrap();
    assert_eq!(req.output_keys(), vec!["cat", "n"]);

    let first = req.next_row().unwrap().unwrap();
    assert_eq!(first.fields, vec![("cat".to_string(), Value::from("a")), ("n".to_string(), Value::from(2.0))]);
    let second = req.next_row().unwrap().unwrap();
    assert_eq!(second.fields, vec![("cat".to_string(), Value::from("b")), ("n".to_string(), Value::from(1.0))]);
    assert!(req.next_row().unwrap().is_none());
}

#[test]
fn test_addscores_collides_with_schema_field() {
    let idx = MemoryIndex::from_json_str(
        r#"{
            "schema": [{ "name": "__score", "type": "NUMERIC" }],
            "documents": [{ "key": "d1", "fields": { "__score": 1 } }]
        }"#,
    )
    .unwrap();
    let err = Request::prepare(
        RequestKind::Aggregate,
        &args(&["*", "ADDSCORES"]),
        index::shared(idx),
        &EngineConfig::default(),
    )
    .err()
    .expect("score field clashes with the schema");
    assert_eq!(err.code, QueryErrorCode::IndexExists);
    assert_eq!(err.message, "Property `__score` already exists in schema");

    assert!(prepare(RequestKind::Aggregate, &["*", "ADDSCORES"]).is_ok());
}
