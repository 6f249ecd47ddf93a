#![no_main]

use fxagg::query::{ParseOptions, parse_query};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|input: (u8, &str)| {
    let (dialect, query) = input;
    let opts = ParseOptions {
        dialect: u32::from(dialect % 4) + 1,
        ..ParseOptions::default()
    };
    // Any input must parse or fail cleanly
    let _ = parse_query(query, &opts);
});
