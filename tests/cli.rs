//! Integration tests driving the fxagg binary.

use std::path::PathBuf;
use std::process::Command;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

/// Run fxagg with an isolated (missing) config file
fn run_fxagg(args: &[&str]) -> (String, String, bool) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let config = dir.path().join("config.json");
    let output = Command::new(env!("CARGO_BIN_EXE_fxagg"))
        .arg("--config")
        .arg(&config)
        .args(args)
        .env("NO_COLOR", "1")
        .output()
        .expect("Failed to run fxagg");
    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

fn parse_replies(stdout: &str) -> Vec<serde_json::Value> {
    serde_json::Deserializer::from_str(stdout)
        .into_iter::<serde_json::Value>()
        .collect::<Result<_, _>>()
        .expect("stdout is a stream of JSON replies")
}

#[test]
fn test_aggregate_json_reply() {
    let index = fixture("products.json");
    let (stdout, stderr, ok) = run_fxagg(&[
        "--json",
        "aggregate",
        "--index",
        index.to_str().unwrap(),
        "*",
        "GROUPBY",
        "1",
        "@color",
        "REDUCE",
        "COUNT",
        "0",
        "AS",
        "n",
        "SORTBY",
        "2",
        "@n",
        "DESC",
        "LIMIT",
        "0",
        "1",
    ]);
    assert!(ok, "fxagg failed: {}", stderr);

    let replies = parse_replies(&stdout);
    assert_eq!(replies.len(), 1);
    let first = &replies[0]["results"][0]["extra_attributes"];
    assert_eq!(first["color"], "red");
    assert_eq!(first["n"], 3.0);
    assert!(replies[0]["results"][0].get("id").is_none());
}

#[test]
fn test_search_text_output() {
    let index = fixture("products.json");
    let (stdout, stderr, ok) = run_fxagg(&[
        "--no-color",
        "search",
        "--index",
        index.to_str().unwrap(),
        "hat",
    ]);
    assert!(ok, "fxagg failed: {}", stderr);
    assert!(stdout.starts_with("1 result(s)"), "unexpected output: {}", stdout);
    assert!(stdout.contains("product:3"));
}

#[test]
fn test_cursor_drained_in_chunks() {
    let index = fixture("products.json");
    let (stdout, stderr, ok) = run_fxagg(&[
        "--json",
        "aggregate",
        "--index",
        index.to_str().unwrap(),
        "*",
        "LOAD",
        "1",
        "@price",
        "WITHCURSOR",
        "COUNT",
        "2",
    ]);
    assert!(ok, "fxagg failed: {}", stderr);

    let replies = parse_replies(&stdout);
    let sizes: Vec<usize> = replies
        .iter()
        .map(|r| r["results"].as_array().map_or(0, |a| a.len()))
        .collect();
    assert_eq!(sizes, vec![2, 2, 1]);
    assert!(replies[0].get("cursor").is_some());
    assert!(replies[2].get("cursor").is_none());
}

#[test]
fn test_schema_listing() {
    let index = fixture("products.json");
    let (stdout, _, ok) = run_fxagg(&["schema", "--index", index.to_str().unwrap()]);
    assert!(ok);
    assert!(stdout.contains("products"));
    assert!(stdout.contains("price NUMERIC SORTABLE"));
    assert!(stdout.contains("color TAG"));
}

#[test]
fn test_request_error_exits_nonzero() {
    let index = fixture("products.json");
    let (_, stderr, ok) = run_fxagg(&[
        "aggregate",
        "--index",
        index.to_str().unwrap(),
        "*",
        "SORTBY",
        "1",
        "@nosuch",
    ]);
    assert!(!ok);
    assert!(stderr.contains("Property `nosuch` not loaded nor in schema"), "{}", stderr);
}

#[test]
fn test_missing_index_file() {
    let (_, stderr, ok) = run_fxagg(&["search", "--index", "/nonexistent/docs.json", "*"]);
    assert!(!ok);
    assert!(stderr.contains("Failed to load index"), "{}", stderr);
}
