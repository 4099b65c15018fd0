#![no_main]
use libfuzzer_sys::fuzz_target;
use tradegate_rs::{InstrumentFilter, InstrumentPattern};

// Pattern compilation must accept or reject, never panic; compiled
// patterns must match arbitrary keys without panicking.
fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Some((pattern, key)) = text.split_once('\n') else {
        return;
    };

    if let Ok(compiled) = InstrumentPattern::compile(pattern) {
        let _ = compiled.matches(key);
    }

    // The lenient load path skips malformed entries instead of failing
    let raw: Vec<String> = pattern.split(',').map(str::to_string).collect();
    let filter = InstrumentFilter::compile_lenient(&raw);
    let _ = filter.matches(key);
});
