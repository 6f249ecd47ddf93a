#![no_main]

use fxagg::pipeline::Lookup;
use fxagg::query::expr;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    let Ok(mut parsed) = expr::parse(data) else {
        return;
    };
    let mut lookup = Lookup::new();
    let _ = parsed.collect_keys(&mut lookup);
});
