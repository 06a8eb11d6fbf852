#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data)
        && let Ok(filter) = airbnb_madrid::domain::filter::Filter::from_json(text)
    {
        let _ = filter.to_document();
    }
});
